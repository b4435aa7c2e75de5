use crate::code::{BranchSite, Label, OffsetsContext, ResolvedOffsets};
use crate::descriptor::{parse_field_descriptor, parse_method_descriptor};
use crate::errors::Error;
use crate::pool::ConstantPool;
use crate::verifier::{FrameContext, Snapshot, VerificationType};
use std::collections::{HashMap, HashSet};

/// Loadable constant, in source form.
///
/// Pool interning happens during preprocessing so the `ldc` width is known
/// before branch offsets are resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
}

impl Const {
    /// Intern into the pool, reporting whether this is an 8-byte constant
    /// (which must use `ldc2_w` regardless of index)
    fn intern(&self, pool: &mut ConstantPool) -> Result<(u16, bool), Error> {
        match self {
            Const::Int(value) => Ok((pool.integer(*value)?, false)),
            Const::Float(value) => Ok((pool.float(*value)?, false)),
            Const::Long(value) => Ok((pool.long(*value)?, true)),
            Const::Double(value) => Ok((pool.double(*value)?, true)),
            Const::String(text) => Ok((pool.string(text)?, false)),
            Const::Class(name) => Ok((pool.class(name)?, false)),
        }
    }

    fn loaded_type(&self) -> VerificationType {
        match self {
            Const::Int(_) => VerificationType::Integer,
            Const::Float(_) => VerificationType::Float,
            Const::Long(_) => VerificationType::Long,
            Const::Double(_) => VerificationType::Double,
            Const::String(_) => VerificationType::Object("java/lang/String".to_owned()),
            Const::Class(_) => VerificationType::Object("java/lang/Class".to_owned()),
        }
    }
}

/// Symbolic field or method reference, interned on encode
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(class: &str, name: &str, descriptor: &str) -> MemberRef {
        MemberRef {
            class: class.to_owned(),
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
        }
    }
}

/// Condition of a conditional branch. `If*` variants test one int against
/// zero, `ICmp*` compare two ints, `ACmp*` compare two references.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    ICmpEq,
    ICmpNe,
    ICmpLt,
    ICmpGe,
    ICmpGt,
    ICmpLe,
    ACmpEq,
    ACmpNe,
    IsNull,
    IsNonNull,
}

impl Cond {
    pub fn opcode(&self) -> u8 {
        match self {
            Cond::Eq => 0x99,
            Cond::Ne => 0x9a,
            Cond::Lt => 0x9b,
            Cond::Ge => 0x9c,
            Cond::Gt => 0x9d,
            Cond::Le => 0x9e,
            Cond::ICmpEq => 0x9f,
            Cond::ICmpNe => 0xa0,
            Cond::ICmpLt => 0xa1,
            Cond::ICmpGe => 0xa2,
            Cond::ICmpGt => 0xa3,
            Cond::ICmpLe => 0xa4,
            Cond::ACmpEq => 0xa5,
            Cond::ACmpNe => 0xa6,
            Cond::IsNull => 0xc6,
            Cond::IsNonNull => 0xc7,
        }
    }

    /// Condition that holds exactly when `self` does not
    pub fn negate(&self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::ICmpEq => Cond::ICmpNe,
            Cond::ICmpNe => Cond::ICmpEq,
            Cond::ICmpLt => Cond::ICmpGe,
            Cond::ICmpGe => Cond::ICmpLt,
            Cond::ICmpGt => Cond::ICmpLe,
            Cond::ICmpLe => Cond::ICmpGt,
            Cond::ACmpEq => Cond::ACmpNe,
            Cond::ACmpNe => Cond::ACmpEq,
            Cond::IsNull => Cond::IsNonNull,
            Cond::IsNonNull => Cond::IsNull,
        }
    }

    /// Pop the operands the branch instruction consumes
    fn interpret(&self, frame: &mut FrameContext) -> Result<(), Error> {
        match self {
            Cond::Eq | Cond::Ne | Cond::Lt | Cond::Ge | Cond::Gt | Cond::Le => {
                frame.pop_expecting(VerificationType::Integer)?;
            }
            Cond::ICmpEq
            | Cond::ICmpNe
            | Cond::ICmpLt
            | Cond::ICmpGe
            | Cond::ICmpGt
            | Cond::ICmpLe => {
                frame.pop_expecting(VerificationType::Integer)?;
                frame.pop_expecting(VerificationType::Integer)?;
            }
            Cond::ACmpEq | Cond::ACmpNe => {
                frame.pop_reference()?;
                frame.pop_reference()?;
            }
            Cond::IsNull | Cond::IsNonNull => {
                frame.pop_reference()?;
            }
        }
        Ok(())
    }
}

/// Single bytecode operation.
///
/// Loads, stores, and constants pick their own shortest encoding; member
/// and type references are symbolic and only hit the constant pool when the
/// operation is encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,
    AConstNull,
    IConst(i32),
    LConst(i64),
    FConst(f32),
    DConst(f64),
    Ldc(Const),

    ILoad(u16),
    LLoad(u16),
    FLoad(u16),
    DLoad(u16),
    ALoad(u16),
    IStore(u16),
    LStore(u16),
    FStore(u16),
    DStore(u16),
    AStore(u16),

    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Swap,

    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    INeg,
    IShl,
    IShr,
    IUshr,
    IAnd,
    IOr,
    IXor,
    LAdd,
    LSub,
    LMul,
    LDiv,
    LRem,
    LNeg,
    LShl,
    LShr,
    LUshr,
    LAnd,
    LOr,
    LXor,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
    FNeg,
    DAdd,
    DSub,
    DMul,
    DDiv,
    DRem,
    DNeg,
    IInc { index: u16, delta: i16 },

    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,

    LCmp,
    FCmpL,
    FCmpG,
    DCmpL,
    DCmpG,

    Goto(Label),
    If(Cond, Label),
    Jsr(Label),
    Ret(u16),
    TableSwitch {
        low: i32,
        targets: Vec<Label>,
        default: Label,
    },
    LookupSwitch {
        pairs: Vec<(i32, Label)>,
        default: Label,
    },
    Return,
    IReturn,
    LReturn,
    FReturn,
    DReturn,
    AReturn,
    AThrow,

    MonitorEnter,
    MonitorExit,

    New(String),
    CheckCast(String),
    InstanceOf(String),
    ANewArray(String),
    ArrayLength,
    AALoad,
    AAStore,
    GetStatic(MemberRef),
    PutStatic(MemberRef),
    GetField(MemberRef),
    PutField(MemberRef),
    InvokeVirtual(MemberRef),
    InvokeSpecial(MemberRef),
    InvokeStatic(MemberRef),
    InvokeInterface(MemberRef),
    InvokeDynamic {
        bootstrap_method: u16,
        name: String,
        descriptor: String,
    },
}

impl Op {
    /// Fixed one-byte encoding, for operations that have one
    fn simple_opcode(&self) -> Option<u8> {
        let opcode = match self {
            Op::Nop => 0x00,
            Op::AConstNull => 0x01,
            Op::Pop => 0x57,
            Op::Pop2 => 0x58,
            Op::Dup => 0x59,
            Op::DupX1 => 0x5a,
            Op::DupX2 => 0x5b,
            Op::Dup2 => 0x5c,
            Op::Swap => 0x5f,
            Op::IAdd => 0x60,
            Op::LAdd => 0x61,
            Op::FAdd => 0x62,
            Op::DAdd => 0x63,
            Op::ISub => 0x64,
            Op::LSub => 0x65,
            Op::FSub => 0x66,
            Op::DSub => 0x67,
            Op::IMul => 0x68,
            Op::LMul => 0x69,
            Op::FMul => 0x6a,
            Op::DMul => 0x6b,
            Op::IDiv => 0x6c,
            Op::LDiv => 0x6d,
            Op::FDiv => 0x6e,
            Op::DDiv => 0x6f,
            Op::IRem => 0x70,
            Op::LRem => 0x71,
            Op::FRem => 0x72,
            Op::DRem => 0x73,
            Op::INeg => 0x74,
            Op::LNeg => 0x75,
            Op::FNeg => 0x76,
            Op::DNeg => 0x77,
            Op::IShl => 0x78,
            Op::LShl => 0x79,
            Op::IShr => 0x7a,
            Op::LShr => 0x7b,
            Op::IUshr => 0x7c,
            Op::LUshr => 0x7d,
            Op::IAnd => 0x7e,
            Op::LAnd => 0x7f,
            Op::IOr => 0x80,
            Op::LOr => 0x81,
            Op::IXor => 0x82,
            Op::LXor => 0x83,
            Op::I2L => 0x85,
            Op::I2F => 0x86,
            Op::I2D => 0x87,
            Op::L2I => 0x88,
            Op::L2F => 0x89,
            Op::L2D => 0x8a,
            Op::F2I => 0x8b,
            Op::F2L => 0x8c,
            Op::F2D => 0x8d,
            Op::D2I => 0x8e,
            Op::D2L => 0x8f,
            Op::D2F => 0x90,
            Op::I2B => 0x91,
            Op::I2C => 0x92,
            Op::I2S => 0x93,
            Op::LCmp => 0x94,
            Op::FCmpL => 0x95,
            Op::FCmpG => 0x96,
            Op::DCmpL => 0x97,
            Op::DCmpG => 0x98,
            Op::IReturn => 0xac,
            Op::LReturn => 0xad,
            Op::FReturn => 0xae,
            Op::DReturn => 0xaf,
            Op::AReturn => 0xb0,
            Op::Return => 0xb1,
            Op::ArrayLength => 0xbe,
            Op::AThrow => 0xbf,
            Op::MonitorEnter => 0xc2,
            Op::MonitorExit => 0xc3,
            Op::AALoad => 0x32,
            Op::AAStore => 0x53,
            _ => return None,
        };
        Some(opcode)
    }
}

/// Structured method body.
///
/// `If` encodes its condition in the positive sense: `then` runs when the
/// condition holds. Free-form control flow (loops, shared join points) goes
/// through `Mark` plus explicit branch operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    Op(Op),
    Seq(Vec<Insn>),
    If {
        cond: Cond,
        then: Vec<Insn>,
        orelse: Vec<Insn>,
    },
    /// Out-of-line `jsr` subroutine body; fallthrough jumps over it
    Subroutine { entry: Label, body: Vec<Insn> },
    /// Bind a label here. Becomes a stack map frame when something branches
    /// to it.
    Mark(Label),
    /// Bind an exception handler entry here: the operand stack collapses to
    /// just the caught exception
    CatchMark { label: Label, class: String },
}

/// Per-method state threaded through the preprocessing walk: the abstract
/// interpreter frame, the provisional layout, and the frames recorded for
/// branch targets.
pub struct MethodContext {
    pub frame: FrameContext,
    pub offsets: OffsetsContext,
    this_class: Option<String>,

    /// Latest known frame for each label
    known: HashMap<Label, Snapshot>,
    /// Labels something branches to (only these get stack map frames)
    targets: HashSet<Label>,
    /// Labels in binding order, which is also final-offset order
    bound: Vec<Label>,
    /// Handler entry label to the start of its covered range, for deriving
    /// the handler frame
    handler_starts: HashMap<Label, Label>,
    /// Per `If` node with an else block: whether the end-of-then `goto` was
    /// emitted. Replayed during encode, which has no frame state.
    if_gotos: Vec<bool>,
}

impl MethodContext {
    pub fn new(locals: Vec<VerificationType>, this_class: Option<String>) -> MethodContext {
        MethodContext {
            frame: FrameContext::new(locals),
            offsets: OffsetsContext::new(),
            this_class,
            known: HashMap::new(),
            targets: HashSet::new(),
            bound: Vec::new(),
            handler_starts: HashMap::new(),
            if_gotos: Vec::new(),
        }
    }

    pub fn fresh_label(&mut self) -> Label {
        self.offsets.fresh_label()
    }

    /// Tell the context that `handler` covers code starting at `start`, so
    /// the handler entry frame can be based on the frame there
    pub fn register_handler(&mut self, handler: Label, start: Label) {
        self.handler_starts.insert(handler, start);
    }

    /// Record a branch from the current frame to `label`
    fn branch_to(&mut self, label: Label) -> Result<(), Error> {
        self.targets.insert(label);
        let snapshot = self.frame.snapshot();
        match self.known.get(&label) {
            None => {
                self.known.insert(label, snapshot);
            }
            Some(existing) => {
                let mut merged = FrameContext::new(Vec::new());
                merged.restore(existing);
                merged.merge(&snapshot)?;
                self.known.insert(label, merged.snapshot());
            }
        }
        Ok(())
    }

    /// Bind `label` at the current position, reconciling the fallthrough
    /// frame with any frame recorded by earlier branches
    fn mark(&mut self, label: Label) -> Result<(), Error> {
        self.offsets.record_label(label);
        self.bound.push(label);
        match self.known.get(&label).cloned() {
            Some(snapshot) => {
                if self.frame.reachable {
                    self.frame.merge(&snapshot)?;
                } else {
                    self.frame.restore(&snapshot);
                }
                self.known.insert(label, self.frame.snapshot());
            }
            None => {
                if self.frame.reachable {
                    self.known.insert(label, self.frame.snapshot());
                }
            }
        }
        Ok(())
    }

    /// Bind an exception handler entry: same locals, stack holding only the
    /// caught exception.
    ///
    /// The preceding code must not fall through here. The handler frame
    /// replaces the operand stack, so a fallthrough path would execute
    /// against a frame it does not match.
    fn catch_mark(&mut self, label: Label, class: &str) -> Result<(), Error> {
        if self.frame.reachable {
            return Err(Error::UnsupportedConstruct(
                "fallthrough into an exception handler",
            ));
        }
        self.offsets.record_label(label);
        self.bound.push(label);
        self.targets.insert(label);
        let basis = match self.known.get(&label) {
            Some(snapshot) => Some(snapshot.clone()),
            None => self
                .handler_starts
                .get(&label)
                .and_then(|start| self.known.get(start))
                .cloned(),
        };
        match basis {
            Some(snapshot) => self.frame.restore(&snapshot),
            None => {
                return Err(Error::UnsupportedConstruct(
                    "exception handler with no known entry frame",
                ))
            }
        }
        self.frame
            .stack_to_top(VerificationType::Object(class.to_owned()));
        self.known.insert(label, self.frame.snapshot());
        Ok(())
    }

    fn ensure_reachable(&self) -> Result<(), Error> {
        if self.frame.reachable {
            Ok(())
        } else {
            Err(Error::UnsupportedConstruct("instruction in unreachable code"))
        }
    }

    /// Close the preprocessing pass: run the widening fixed point and keep
    /// only what the encode pass and attribute assembly still need
    pub fn finish(self) -> Result<Preprocessed, Error> {
        let max_stack = self.frame.max_stack();
        let max_locals = self.frame.max_locals();
        let frames = self
            .bound
            .iter()
            .filter(|label| self.targets.contains(*label))
            .filter_map(|label| {
                self.known
                    .get(label)
                    .map(|snapshot| (*label, snapshot.clone()))
            })
            .collect();
        Ok(Preprocessed {
            resolved: self.offsets.normalize()?,
            max_stack,
            max_locals,
            frames,
            if_gotos: self.if_gotos,
        })
    }
}

/// Output of the preprocessing pass, layout already final
pub struct Preprocessed {
    pub resolved: ResolvedOffsets,
    pub max_stack: u16,
    pub max_locals: u16,

    /// Branch-target frames in binding order, which is final-offset order
    pub frames: Vec<(Label, Snapshot)>,

    if_gotos: Vec<bool>,
}

impl Preprocessed {
    pub fn encoder(&self) -> EncodeContext<'_> {
        EncodeContext {
            resolved: &self.resolved,
            if_gotos: self.if_gotos.clone().into_iter(),
            branch_i: 0,
            pad_i: 0,
            pc: 0,
            ops: Vec::new(),
        }
    }
}

impl Insn {
    /// First pass: interpret frame effects and lay out provisional offsets.
    /// No bytes are produced; pool entries are interned only where sizing
    /// depends on the index (`ldc` and friends).
    pub fn preprocess(
        &self,
        ctx: &mut MethodContext,
        pool: &mut ConstantPool,
    ) -> Result<(), Error> {
        match self {
            Insn::Op(op) => {
                ctx.ensure_reachable()?;
                preprocess_op(op, ctx, pool)
            }
            Insn::Seq(insns) => {
                for insn in insns {
                    insn.preprocess(ctx, pool)?;
                }
                Ok(())
            }
            Insn::If { cond, then, orelse } => {
                ctx.ensure_reachable()?;
                cond.interpret(&mut ctx.frame)?;
                if orelse.is_empty() {
                    let end = ctx.fresh_label();
                    ctx.branch_to(end)?;
                    ctx.offsets.record_conditional(end);
                    for insn in then {
                        insn.preprocess(ctx, pool)?;
                    }
                    ctx.mark(end)
                } else {
                    let els = ctx.fresh_label();
                    let end = ctx.fresh_label();
                    ctx.branch_to(els)?;
                    ctx.offsets.record_conditional(els);
                    for insn in then {
                        insn.preprocess(ctx, pool)?;
                    }
                    let fell_through = ctx.frame.reachable;
                    ctx.if_gotos.push(fell_through);
                    if fell_through {
                        ctx.branch_to(end)?;
                        ctx.offsets.record_jump(end);
                        ctx.frame.reachable = false;
                    }
                    ctx.mark(els)?;
                    for insn in orelse {
                        insn.preprocess(ctx, pool)?;
                    }
                    ctx.mark(end)
                }
            }
            Insn::Subroutine { entry, body } => {
                ctx.ensure_reachable()?;
                let outer = ctx.frame.snapshot();
                let skip = ctx.fresh_label();
                ctx.branch_to(skip)?;
                ctx.offsets.record_jump(skip);

                // subroutine entry holds the caller frame plus the return
                // address; no stack map frames are recorded inside
                ctx.offsets.record_subroutine(*entry);
                ctx.frame.restore(&outer);
                ctx.frame.push(VerificationType::Top);
                for insn in body {
                    insn.preprocess(ctx, pool)?;
                }
                ctx.frame.reachable = false;
                ctx.mark(skip)
            }
            Insn::Mark(label) => ctx.mark(*label),
            Insn::CatchMark { label, class } => ctx.catch_mark(*label, class),
        }
    }

    /// Second pass: produce the size-finalized operations under the layout
    /// `normalize` settled on. Purely mechanical byte emission comes after.
    pub fn encode(&self, ctx: &mut EncodeContext<'_>, pool: &mut ConstantPool) -> Result<(), Error> {
        match self {
            Insn::Op(op) => encode_op(op, ctx, pool),
            Insn::Seq(insns) => {
                for insn in insns {
                    insn.encode(ctx, pool)?;
                }
                Ok(())
            }
            Insn::If { cond, then, orelse } => {
                let site = ctx.next_branch()?;
                ctx.push_branch(cond.negate().opcode(), site)?;
                for insn in then {
                    insn.encode(ctx, pool)?;
                }
                if !orelse.is_empty() {
                    if ctx.next_if_goto() {
                        let site = ctx.next_branch()?;
                        ctx.push_jump(site)?;
                    }
                    for insn in orelse {
                        insn.encode(ctx, pool)?;
                    }
                }
                Ok(())
            }
            Insn::Subroutine { body, .. } => {
                let site = ctx.next_branch()?;
                ctx.push_jump(site)?;
                for insn in body {
                    insn.encode(ctx, pool)?;
                }
                Ok(())
            }
            Insn::Mark(_) | Insn::CatchMark { .. } => Ok(()),
        }
    }
}

fn preprocess_op(op: &Op, ctx: &mut MethodContext, pool: &mut ConstantPool) -> Result<(), Error> {
    use VerificationType as VT;

    if op.simple_opcode().is_some() {
        interpret_simple(op, &mut ctx.frame)?;
        ctx.offsets.advance(1);
        if matches!(
            op,
            Op::Return
                | Op::IReturn
                | Op::LReturn
                | Op::FReturn
                | Op::DReturn
                | Op::AReturn
                | Op::AThrow
        ) {
            ctx.frame.reachable = false;
        }
        return Ok(());
    }

    match op {
        Op::IConst(value) => {
            ctx.frame.push(VT::Integer);
            ctx.offsets.advance(iconst_size(*value, pool)? as u32);
        }
        Op::LConst(value) => {
            ctx.frame.push(VT::Long);
            if *value == 0 || *value == 1 {
                ctx.offsets.advance(1);
            } else {
                pool.long(*value)?;
                ctx.offsets.advance(3);
            }
        }
        Op::FConst(value) => {
            ctx.frame.push(VT::Float);
            // bit compare so -0.0 goes through the pool
            if value.to_bits() == 0.0f32.to_bits() || *value == 1.0 || *value == 2.0 {
                ctx.offsets.advance(1);
            } else {
                let idx = pool.float(*value)?;
                ctx.offsets.advance(if idx <= 255 { 2 } else { 3 });
            }
        }
        Op::DConst(value) => {
            ctx.frame.push(VT::Double);
            if value.to_bits() == 0.0f64.to_bits() || *value == 1.0 {
                ctx.offsets.advance(1);
            } else {
                pool.double(*value)?;
                ctx.offsets.advance(3);
            }
        }
        Op::Ldc(constant) => {
            let (idx, wide) = constant.intern(pool)?;
            ctx.frame.push(constant.loaded_type());
            ctx.offsets
                .advance(if wide || idx > 255 { 3 } else { 2 });
        }

        Op::ILoad(idx) | Op::LLoad(idx) | Op::FLoad(idx) | Op::DLoad(idx) | Op::ALoad(idx) => {
            let loaded = match op {
                Op::ILoad(_) => {
                    ctx.frame.locals_expect(*idx, VT::Integer)?;
                    VT::Integer
                }
                Op::LLoad(_) => {
                    ctx.frame.locals_expect(*idx, VT::Long)?;
                    VT::Long
                }
                Op::FLoad(_) => {
                    ctx.frame.locals_expect(*idx, VT::Float)?;
                    VT::Float
                }
                Op::DLoad(_) => {
                    ctx.frame.locals_expect(*idx, VT::Double)?;
                    VT::Double
                }
                _ => ctx.frame.locals_get_reference(*idx)?,
            };
            ctx.frame.push(loaded);
            ctx.offsets.advance(load_store_size(*idx) as u32);
        }
        Op::IStore(idx) | Op::LStore(idx) | Op::FStore(idx) | Op::DStore(idx) | Op::AStore(idx) => {
            let stored = match op {
                Op::IStore(_) => ctx.frame.pop_expecting(VT::Integer)?,
                Op::LStore(_) => ctx.frame.pop_expecting(VT::Long)?,
                Op::FStore(_) => ctx.frame.pop_expecting(VT::Float)?,
                Op::DStore(_) => ctx.frame.pop_expecting(VT::Double)?,
                // astore also accepts a return address (modeled as Top)
                _ => match ctx.frame.pop()? {
                    VT::Top => VT::Top,
                    VT::Object(name) => VT::Object(name),
                    VT::Null => VT::Null,
                    VT::UninitializedThis => VT::UninitializedThis,
                    uninit @ VT::Uninitialized { .. } => uninit,
                    found => {
                        return Err(Error::InvalidType {
                            expected: VT::Object("java/lang/Object".to_owned()),
                            found,
                        })
                    }
                },
            };
            ctx.frame.locals_set(*idx, stored);
            ctx.offsets.advance(load_store_size(*idx) as u32);
        }
        Op::IInc { index, delta } => {
            ctx.frame.locals_expect(*index, VT::Integer)?;
            let narrow = *index <= 255 && i8::try_from(*delta).is_ok();
            ctx.offsets.advance(if narrow { 3 } else { 6 });
        }

        Op::Goto(target) => {
            ctx.branch_to(*target)?;
            ctx.offsets.record_jump(*target);
            ctx.frame.reachable = false;
        }
        Op::If(cond, target) => {
            cond.interpret(&mut ctx.frame)?;
            ctx.branch_to(*target)?;
            ctx.offsets.record_conditional(*target);
        }
        Op::Jsr(target) => {
            // the subroutine consumes the pushed return address itself, so
            // the caller frame is net unchanged and no frame is recorded
            ctx.offsets.record_jump(*target);
        }
        Op::Ret(index) => {
            ctx.frame.locals_get(*index)?;
            ctx.offsets.advance(if *index <= 255 { 2 } else { 4 });
            ctx.frame.reachable = false;
        }
        Op::TableSwitch {
            low: _,
            targets,
            default,
        } => {
            if targets.is_empty() {
                return Err(Error::UnsupportedConstruct("tableswitch with no targets"));
            }
            ctx.frame.pop_expecting(VT::Integer)?;
            for target in targets.iter().chain(std::iter::once(default)) {
                ctx.branch_to(*target)?;
            }
            ctx.offsets.advance(1);
            ctx.offsets.record_padding();
            ctx.offsets.advance(12 + 4 * targets.len() as u32);
            ctx.frame.reachable = false;
        }
        Op::LookupSwitch { pairs, default } => {
            ctx.frame.pop_expecting(VT::Integer)?;
            for (_, target) in pairs {
                ctx.branch_to(*target)?;
            }
            ctx.branch_to(*default)?;
            ctx.offsets.advance(1);
            ctx.offsets.record_padding();
            ctx.offsets.advance(8 + 8 * pairs.len() as u32);
            ctx.frame.reachable = false;
        }

        Op::New(class) => {
            let new_site = ctx.fresh_label();
            ctx.offsets.record_label(new_site);
            ctx.frame.push(VT::Uninitialized {
                class: class.clone(),
                new_site,
            });
            ctx.offsets.advance(3);
        }
        Op::CheckCast(class) => {
            ctx.frame.pop_reference()?;
            ctx.frame.push(VT::Object(class.clone()));
            ctx.offsets.advance(3);
        }
        Op::InstanceOf(_) => {
            ctx.frame.pop_reference()?;
            ctx.frame.push(VT::Integer);
            ctx.offsets.advance(3);
        }
        Op::ANewArray(class) => {
            ctx.frame.pop_expecting(VT::Integer)?;
            ctx.frame.push(VT::Object(array_of(class)));
            ctx.offsets.advance(3);
        }

        Op::GetStatic(member) => {
            ctx.frame.push(parse_field_descriptor(&member.descriptor)?);
            ctx.offsets.advance(3);
        }
        Op::PutStatic(member) => {
            ctx.frame
                .pop_expecting(parse_field_descriptor(&member.descriptor)?)?;
            ctx.offsets.advance(3);
        }
        Op::GetField(member) => {
            ctx.frame.pop_reference()?;
            ctx.frame.push(parse_field_descriptor(&member.descriptor)?);
            ctx.offsets.advance(3);
        }
        Op::PutField(member) => {
            ctx.frame
                .pop_expecting(parse_field_descriptor(&member.descriptor)?)?;
            ctx.frame.pop_reference()?;
            ctx.offsets.advance(3);
        }

        Op::InvokeVirtual(member) | Op::InvokeStatic(member) => {
            let parsed = parse_method_descriptor(&member.descriptor)?;
            for argument in parsed.arguments.iter().rev() {
                ctx.frame.pop_expecting(argument.clone())?;
            }
            if matches!(op, Op::InvokeVirtual(_)) {
                ctx.frame.pop_reference()?;
            }
            if let Some(ret) = parsed.ret {
                ctx.frame.push(ret);
            }
            ctx.offsets.advance(3);
        }
        Op::InvokeSpecial(member) => {
            let parsed = parse_method_descriptor(&member.descriptor)?;
            for argument in parsed.arguments.iter().rev() {
                ctx.frame.pop_expecting(argument.clone())?;
            }
            let receiver = ctx.frame.pop_reference()?;
            if member.name == "<init>" {
                let initialized = match &receiver {
                    VT::Uninitialized { class, .. } => VT::Object(class.clone()),
                    VT::UninitializedThis => match &ctx.this_class {
                        Some(this_class) => VT::Object(this_class.clone()),
                        None => {
                            return Err(Error::UnsupportedConstruct(
                                "uninitializedThis outside a constructor",
                            ))
                        }
                    },
                    found => {
                        return Err(Error::InvalidType {
                            expected: VT::UninitializedThis,
                            found: found.clone(),
                        })
                    }
                };
                ctx.frame.replace_all(&receiver, initialized);
            }
            if let Some(ret) = parsed.ret {
                ctx.frame.push(ret);
            }
            ctx.offsets.advance(3);
        }
        Op::InvokeInterface(member) => {
            let parsed = parse_method_descriptor(&member.descriptor)?;
            for argument in parsed.arguments.iter().rev() {
                ctx.frame.pop_expecting(argument.clone())?;
            }
            ctx.frame.pop_reference()?;
            if let Some(ret) = parsed.ret {
                ctx.frame.push(ret);
            }
            ctx.offsets.advance(5);
        }
        Op::InvokeDynamic { descriptor, .. } => {
            let parsed = parse_method_descriptor(descriptor)?;
            for argument in parsed.arguments.iter().rev() {
                ctx.frame.pop_expecting(argument.clone())?;
            }
            if let Some(ret) = parsed.ret {
                ctx.frame.push(ret);
            }
            ctx.offsets.advance(5);
        }

        // one-byte operations are handled above
        _ => {
            return Err(Error::UnsupportedConstruct(
                "operation without a layout rule",
            ))
        }
    }
    Ok(())
}

/// Frame effects of the fixed one-byte operations
fn interpret_simple(op: &Op, frame: &mut FrameContext) -> Result<(), Error> {
    use VerificationType as VT;

    let binary = |frame: &mut FrameContext, operand: VT, result: VT| -> Result<(), Error> {
        frame.pop_expecting(operand.clone())?;
        frame.pop_expecting(operand)?;
        frame.push(result);
        Ok(())
    };
    let unary = |frame: &mut FrameContext, operand: VT, result: VT| -> Result<(), Error> {
        frame.pop_expecting(operand)?;
        frame.push(result);
        Ok(())
    };

    match op {
        Op::Nop => Ok(()),
        Op::AConstNull => {
            frame.push(VT::Null);
            Ok(())
        }

        Op::Pop => {
            one_word(frame.pop()?)?;
            Ok(())
        }
        Op::Pop2 => {
            let top = frame.pop()?;
            if top.width() == 1 {
                one_word(frame.pop()?)?;
            }
            Ok(())
        }
        Op::Dup => {
            let value = one_word(frame.pop()?)?;
            frame.push(value.clone());
            frame.push(value);
            Ok(())
        }
        Op::DupX1 => {
            let value = one_word(frame.pop()?)?;
            let under = one_word(frame.pop()?)?;
            frame.push(value.clone());
            frame.push(under);
            frame.push(value);
            Ok(())
        }
        Op::DupX2 => {
            let value = one_word(frame.pop()?)?;
            let under = frame.pop()?;
            if under.width() == 2 {
                frame.push(value.clone());
                frame.push(under);
                frame.push(value);
            } else {
                let deeper = one_word(frame.pop()?)?;
                frame.push(value.clone());
                frame.push(deeper);
                frame.push(under);
                frame.push(value);
            }
            Ok(())
        }
        Op::Dup2 => {
            let top = frame.pop()?;
            if top.width() == 2 {
                frame.push(top.clone());
                frame.push(top);
            } else {
                let under = one_word(frame.pop()?)?;
                frame.push(under.clone());
                frame.push(top.clone());
                frame.push(under);
                frame.push(top);
            }
            Ok(())
        }
        Op::Swap => {
            let value = one_word(frame.pop()?)?;
            let under = one_word(frame.pop()?)?;
            frame.push(value);
            frame.push(under);
            Ok(())
        }

        Op::IAdd
        | Op::ISub
        | Op::IMul
        | Op::IDiv
        | Op::IRem
        | Op::IShl
        | Op::IShr
        | Op::IUshr
        | Op::IAnd
        | Op::IOr
        | Op::IXor => binary(frame, VT::Integer, VT::Integer),
        Op::LAdd | Op::LSub | Op::LMul | Op::LDiv | Op::LRem | Op::LAnd | Op::LOr | Op::LXor => {
            binary(frame, VT::Long, VT::Long)
        }
        Op::LShl | Op::LShr | Op::LUshr => {
            frame.pop_expecting(VT::Integer)?;
            unary(frame, VT::Long, VT::Long)
        }
        Op::FAdd | Op::FSub | Op::FMul | Op::FDiv | Op::FRem => binary(frame, VT::Float, VT::Float),
        Op::DAdd | Op::DSub | Op::DMul | Op::DDiv | Op::DRem => {
            binary(frame, VT::Double, VT::Double)
        }
        Op::INeg => unary(frame, VT::Integer, VT::Integer),
        Op::LNeg => unary(frame, VT::Long, VT::Long),
        Op::FNeg => unary(frame, VT::Float, VT::Float),
        Op::DNeg => unary(frame, VT::Double, VT::Double),

        Op::I2L => unary(frame, VT::Integer, VT::Long),
        Op::I2F => unary(frame, VT::Integer, VT::Float),
        Op::I2D => unary(frame, VT::Integer, VT::Double),
        Op::L2I => unary(frame, VT::Long, VT::Integer),
        Op::L2F => unary(frame, VT::Long, VT::Float),
        Op::L2D => unary(frame, VT::Long, VT::Double),
        Op::F2I => unary(frame, VT::Float, VT::Integer),
        Op::F2L => unary(frame, VT::Float, VT::Long),
        Op::F2D => unary(frame, VT::Float, VT::Double),
        Op::D2I => unary(frame, VT::Double, VT::Integer),
        Op::D2L => unary(frame, VT::Double, VT::Long),
        Op::D2F => unary(frame, VT::Double, VT::Float),
        Op::I2B | Op::I2C | Op::I2S => unary(frame, VT::Integer, VT::Integer),

        Op::LCmp => binary(frame, VT::Long, VT::Integer),
        Op::FCmpL | Op::FCmpG => binary(frame, VT::Float, VT::Integer),
        Op::DCmpL | Op::DCmpG => binary(frame, VT::Double, VT::Integer),

        Op::Return => Ok(()),
        Op::IReturn => {
            frame.pop_expecting(VT::Integer)?;
            Ok(())
        }
        Op::LReturn => {
            frame.pop_expecting(VT::Long)?;
            Ok(())
        }
        Op::FReturn => {
            frame.pop_expecting(VT::Float)?;
            Ok(())
        }
        Op::DReturn => {
            frame.pop_expecting(VT::Double)?;
            Ok(())
        }
        Op::AReturn | Op::AThrow | Op::MonitorEnter | Op::MonitorExit => {
            frame.pop_reference()?;
            Ok(())
        }

        Op::ArrayLength => {
            frame.pop_reference()?;
            frame.push(VT::Integer);
            Ok(())
        }
        Op::AALoad => {
            frame.pop_expecting(VT::Integer)?;
            let array = frame.pop_reference()?;
            frame.push(array_element(&array)?);
            Ok(())
        }
        Op::AAStore => {
            frame.pop_reference()?;
            frame.pop_expecting(VT::Integer)?;
            frame.pop_reference()?;
            Ok(())
        }

        _ => Err(Error::UnsupportedConstruct("operation without a frame rule")),
    }
}

fn encode_op(op: &Op, ctx: &mut EncodeContext<'_>, pool: &mut ConstantPool) -> Result<(), Error> {
    if let Some(opcode) = op.simple_opcode() {
        ctx.push(EncodedOp::plain(opcode));
        return Ok(());
    }

    match op {
        Op::IConst(value) => match value {
            -1..=5 => ctx.push(EncodedOp::plain((*value + 3) as u8)),
            _ if i8::try_from(*value).is_ok() => {
                ctx.push(EncodedOp::with_operands(0x10, vec![*value as u8]))
            }
            _ if i16::try_from(*value).is_ok() => {
                ctx.push(EncodedOp::with_operands(0x11, (*value as i16).to_be_bytes().to_vec()))
            }
            _ => ctx.push(ldc_of(pool.integer(*value)?, false)),
        },
        Op::LConst(value) => match value {
            0 => ctx.push(EncodedOp::plain(0x09)),
            1 => ctx.push(EncodedOp::plain(0x0a)),
            _ => ctx.push(ldc_of(pool.long(*value)?, true)),
        },
        Op::FConst(value) if value.to_bits() == 0.0f32.to_bits() => {
            ctx.push(EncodedOp::plain(0x0b))
        }
        Op::FConst(value) if *value == 1.0 => ctx.push(EncodedOp::plain(0x0c)),
        Op::FConst(value) if *value == 2.0 => ctx.push(EncodedOp::plain(0x0d)),
        Op::FConst(value) => ctx.push(ldc_of(pool.float(*value)?, false)),
        Op::DConst(value) if value.to_bits() == 0.0f64.to_bits() => {
            ctx.push(EncodedOp::plain(0x0e))
        }
        Op::DConst(value) if *value == 1.0 => ctx.push(EncodedOp::plain(0x0f)),
        Op::DConst(value) => ctx.push(ldc_of(pool.double(*value)?, true)),
        Op::Ldc(constant) => {
            let (idx, wide) = constant.intern(pool)?;
            ctx.push(ldc_of(idx, wide));
        }

        Op::ILoad(idx) => ctx.push(load_store_op(0x15, 0x1a, *idx)),
        Op::LLoad(idx) => ctx.push(load_store_op(0x16, 0x1e, *idx)),
        Op::FLoad(idx) => ctx.push(load_store_op(0x17, 0x22, *idx)),
        Op::DLoad(idx) => ctx.push(load_store_op(0x18, 0x26, *idx)),
        Op::ALoad(idx) => ctx.push(load_store_op(0x19, 0x2a, *idx)),
        Op::IStore(idx) => ctx.push(load_store_op(0x36, 0x3b, *idx)),
        Op::LStore(idx) => ctx.push(load_store_op(0x37, 0x3f, *idx)),
        Op::FStore(idx) => ctx.push(load_store_op(0x38, 0x43, *idx)),
        Op::DStore(idx) => ctx.push(load_store_op(0x39, 0x47, *idx)),
        Op::AStore(idx) => ctx.push(load_store_op(0x3a, 0x4b, *idx)),
        Op::IInc { index, delta } => {
            if *index <= 255 && i8::try_from(*delta).is_ok() {
                ctx.push(EncodedOp::with_operands(
                    0x84,
                    vec![*index as u8, *delta as u8],
                ));
            } else {
                let mut operands = vec![0x84];
                operands.extend(index.to_be_bytes());
                operands.extend(delta.to_be_bytes());
                ctx.push(EncodedOp::with_operands(0xc4, operands));
            }
        }

        Op::Goto(_) => {
            let site = ctx.next_branch()?;
            ctx.push_jump(site)?;
        }
        Op::If(cond, _) => {
            let site = ctx.next_branch()?;
            ctx.push_branch(cond.opcode(), site)?;
        }
        Op::Jsr(_) => {
            let site = ctx.next_branch()?;
            ctx.push_jsr(site)?;
        }
        Op::Ret(index) => {
            if *index <= 255 {
                ctx.push(EncodedOp::with_operands(0xa9, vec![*index as u8]));
            } else {
                let mut operands = vec![0xa9];
                operands.extend(index.to_be_bytes());
                ctx.push(EncodedOp::with_operands(0xc4, operands));
            }
        }
        Op::TableSwitch {
            low,
            targets,
            default,
        } => {
            let at = ctx.pc;
            let pad = ctx.next_padding()?;
            let mut operands = vec![0u8; pad as usize];
            operands.extend(ctx.switch_offset(at, *default)?.to_be_bytes());
            operands.extend(low.to_be_bytes());
            let high = low + targets.len() as i32 - 1;
            operands.extend(high.to_be_bytes());
            for target in targets {
                operands.extend(ctx.switch_offset(at, *target)?.to_be_bytes());
            }
            ctx.push(EncodedOp::with_operands(0xaa, operands));
        }
        Op::LookupSwitch { pairs, default } => {
            let at = ctx.pc;
            let pad = ctx.next_padding()?;
            let mut operands = vec![0u8; pad as usize];
            operands.extend(ctx.switch_offset(at, *default)?.to_be_bytes());
            operands.extend((pairs.len() as i32).to_be_bytes());
            let mut sorted = pairs.clone();
            sorted.sort_by_key(|(key, _)| *key);
            for (key, target) in &sorted {
                operands.extend(key.to_be_bytes());
                operands.extend(ctx.switch_offset(at, *target)?.to_be_bytes());
            }
            ctx.push(EncodedOp::with_operands(0xab, operands));
        }

        Op::New(class) => ctx.push(indexed_op(0xbb, pool.class(class)?)),
        Op::CheckCast(class) => ctx.push(indexed_op(0xc0, pool.class(class)?)),
        Op::InstanceOf(class) => ctx.push(indexed_op(0xc1, pool.class(class)?)),
        Op::ANewArray(class) => ctx.push(indexed_op(0xbd, pool.class(class)?)),

        Op::GetStatic(member) => ctx.push(indexed_op(0xb2, field_ref(pool, member)?)),
        Op::PutStatic(member) => ctx.push(indexed_op(0xb3, field_ref(pool, member)?)),
        Op::GetField(member) => ctx.push(indexed_op(0xb4, field_ref(pool, member)?)),
        Op::PutField(member) => ctx.push(indexed_op(0xb5, field_ref(pool, member)?)),
        Op::InvokeVirtual(member) => {
            let idx = pool.method_ref(&member.class, &member.name, &member.descriptor, false)?;
            ctx.push(indexed_op(0xb6, idx));
        }
        Op::InvokeSpecial(member) => {
            let idx = pool.method_ref(&member.class, &member.name, &member.descriptor, false)?;
            ctx.push(indexed_op(0xb7, idx));
        }
        Op::InvokeStatic(member) => {
            let idx = pool.method_ref(&member.class, &member.name, &member.descriptor, false)?;
            ctx.push(indexed_op(0xb8, idx));
        }
        Op::InvokeInterface(member) => {
            let idx = pool.method_ref(&member.class, &member.name, &member.descriptor, true)?;
            let parsed = parse_method_descriptor(&member.descriptor)?;
            let count: usize = 1 + parsed
                .arguments
                .iter()
                .map(|argument| argument.width())
                .sum::<usize>();
            let mut operands = idx.to_be_bytes().to_vec();
            operands.push(count as u8);
            operands.push(0);
            ctx.push(EncodedOp::with_operands(0xb9, operands));
        }
        Op::InvokeDynamic {
            bootstrap_method,
            name,
            descriptor,
        } => {
            let idx = pool.invoke_dynamic(*bootstrap_method, name, descriptor)?;
            let mut operands = idx.to_be_bytes().to_vec();
            operands.extend([0, 0]);
            ctx.push(EncodedOp::with_operands(0xba, operands));
        }

        // one-byte operations are handled above
        _ => {
            return Err(Error::UnsupportedConstruct(
                "operation without an encoding rule",
            ))
        }
    }
    Ok(())
}

/// One finalized instruction: opcode plus its fully resolved operand bytes
/// (switch alignment padding included)
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedOp {
    pub opcode: u8,
    pub operands: Vec<u8>,
}

impl EncodedOp {
    fn plain(opcode: u8) -> EncodedOp {
        EncodedOp {
            opcode,
            operands: Vec::new(),
        }
    }

    fn with_operands(opcode: u8, operands: Vec<u8>) -> EncodedOp {
        EncodedOp { opcode, operands }
    }

    pub fn byte_len(&self) -> u32 {
        1 + self.operands.len() as u32
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.opcode);
        out.extend_from_slice(&self.operands);
    }
}

/// State of the byte-layout pass: consumes the branch and padding sites the
/// layout fixed, in the order preprocessing recorded them
pub struct EncodeContext<'a> {
    resolved: &'a ResolvedOffsets,
    if_gotos: std::vec::IntoIter<bool>,
    branch_i: usize,
    pad_i: usize,
    pc: u32,
    pub ops: Vec<EncodedOp>,
}

impl<'a> EncodeContext<'a> {
    fn push(&mut self, op: EncodedOp) {
        self.pc += op.byte_len();
        self.ops.push(op);
    }

    fn next_branch(&mut self) -> Result<BranchSite, Error> {
        let site = self
            .resolved
            .branches()
            .get(self.branch_i)
            .copied()
            .ok_or(Error::UnsupportedConstruct("branch without a layout entry"))?;
        self.branch_i += 1;
        Ok(site)
    }

    fn next_padding(&mut self) -> Result<u8, Error> {
        let site = self
            .resolved
            .paddings()
            .get(self.pad_i)
            .copied()
            .ok_or(Error::UnsupportedConstruct("switch without a layout entry"))?;
        self.pad_i += 1;
        Ok(site.pad)
    }

    fn next_if_goto(&mut self) -> bool {
        self.if_gotos.next().unwrap_or(false)
    }

    fn relative(&self, site: BranchSite) -> Result<i64, Error> {
        let target = self.resolved.raw_offset_of(site.target)?;
        Ok(target as i64 - site.at as i64)
    }

    /// Emit a `goto`/`goto_w` for the next jump site
    fn push_jump(&mut self, site: BranchSite) -> Result<(), Error> {
        let relative = self.relative(site)?;
        if site.wide {
            self.push(EncodedOp::with_operands(
                0xc8,
                (relative as i32).to_be_bytes().to_vec(),
            ));
        } else {
            let narrow = self.narrow(site, relative)?;
            self.push(EncodedOp::with_operands(0xa7, narrow.to_be_bytes().to_vec()));
        }
        Ok(())
    }

    fn push_jsr(&mut self, site: BranchSite) -> Result<(), Error> {
        let relative = self.relative(site)?;
        if site.wide {
            self.push(EncodedOp::with_operands(
                0xc9,
                (relative as i32).to_be_bytes().to_vec(),
            ));
        } else {
            let narrow = self.narrow(site, relative)?;
            self.push(EncodedOp::with_operands(0xa8, narrow.to_be_bytes().to_vec()));
        }
        Ok(())
    }

    /// Emit a conditional branch; these have no wide form
    fn push_branch(&mut self, opcode: u8, site: BranchSite) -> Result<(), Error> {
        let relative = self.relative(site)?;
        let narrow = self.narrow(site, relative)?;
        self.push(EncodedOp::with_operands(opcode, narrow.to_be_bytes().to_vec()));
        Ok(())
    }

    fn narrow(&self, site: BranchSite, relative: i64) -> Result<i16, Error> {
        i16::try_from(relative).map_err(|_| Error::BranchOutOfRange {
            at: site.at,
            target: (site.at as i64 + relative) as u32,
        })
    }

    fn switch_offset(&self, at: u32, target: Label) -> Result<i32, Error> {
        let target = self.resolved.raw_offset_of(target)?;
        Ok(target as i32 - at as i32)
    }
}

fn ldc_of(idx: u16, wide_constant: bool) -> EncodedOp {
    if wide_constant {
        EncodedOp::with_operands(0x14, idx.to_be_bytes().to_vec())
    } else if idx <= 255 {
        EncodedOp::with_operands(0x12, vec![idx as u8])
    } else {
        EncodedOp::with_operands(0x13, idx.to_be_bytes().to_vec())
    }
}

fn iconst_size(value: i32, pool: &mut ConstantPool) -> Result<u8, Error> {
    Ok(match value {
        -1..=5 => 1,
        _ if i8::try_from(value).is_ok() => 2,
        _ if i16::try_from(value).is_ok() => 3,
        _ => {
            let idx = pool.integer(value)?;
            if idx <= 255 {
                2
            } else {
                3
            }
        }
    })
}

fn load_store_size(idx: u16) -> u8 {
    match idx {
        0..=3 => 1,
        4..=255 => 2,
        _ => 4,
    }
}

fn load_store_op(base: u8, short_base: u8, idx: u16) -> EncodedOp {
    match idx {
        0..=3 => EncodedOp::plain(short_base + idx as u8),
        4..=255 => EncodedOp::with_operands(base, vec![idx as u8]),
        _ => {
            let mut operands = vec![base];
            operands.extend(idx.to_be_bytes());
            EncodedOp::with_operands(0xc4, operands)
        }
    }
}

fn indexed_op(opcode: u8, idx: u16) -> EncodedOp {
    EncodedOp::with_operands(opcode, idx.to_be_bytes().to_vec())
}

fn field_ref(pool: &mut ConstantPool, member: &MemberRef) -> Result<u16, Error> {
    pool.field_ref(&member.class, &member.name, &member.descriptor)
}

fn one_word(value: VerificationType) -> Result<VerificationType, Error> {
    if value.width() == 1 {
        Ok(value)
    } else {
        Err(Error::WideValueMissingTop)
    }
}

/// Array type over `class` (which may itself be an array descriptor)
fn array_of(class: &str) -> String {
    if class.starts_with('[') {
        format!("[{}", class)
    } else {
        format!("[L{};", class)
    }
}

/// Element type of an array reference, for `aaload`
fn array_element(array: &VerificationType) -> Result<VerificationType, Error> {
    match array {
        // a null array reference loads only nulls
        VerificationType::Null => Ok(VerificationType::Null),
        VerificationType::Object(name) if name.starts_with('[') => {
            parse_field_descriptor(&name[1..])
        }
        found => Err(Error::InvalidType {
            expected: VerificationType::Object("[Ljava/lang/Object;".to_owned()),
            found: found.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocess_and_encode(body: &Insn, locals: Vec<VerificationType>) -> Vec<u8> {
        let mut pool = ConstantPool::new();
        let mut ctx = MethodContext::new(locals, None);
        body.preprocess(&mut ctx, &mut pool).unwrap();
        let preprocessed = ctx.finish().unwrap();
        let mut encode = preprocessed.encoder();
        body.encode(&mut encode, &mut pool).unwrap();
        let mut bytes = Vec::new();
        for op in &encode.ops {
            op.write_to(&mut bytes);
        }
        bytes
    }

    #[test]
    fn ldc_width_follows_pool_index() {
        let mut pool = ConstantPool::new();
        // burn through indices so the next string lands past 255
        for n in 0..300 {
            pool.integer(n).unwrap();
        }
        let mut ctx = MethodContext::new(Vec::new(), None);
        let body = Insn::Seq(vec![
            Insn::Op(Op::Ldc(Const::Int(5_000_000))),
            Insn::Op(Op::Pop),
        ]);
        body.preprocess(&mut ctx, &mut pool).unwrap();
        // index > 255 means ldc_w: 3 bytes plus 1 for pop
        assert_eq!(ctx.offsets.cursor(), 4);
    }

    #[test]
    fn ldc_widths() {
        let mut pool = ConstantPool::new();
        let (small, _) = Const::Int(42).intern(&mut pool).unwrap();
        assert_eq!(ldc_of(small, false).byte_len(), 2);
        assert_eq!(ldc_of(300, false).byte_len(), 3);
        // 8-byte constants use ldc2_w even at small indices
        let (long_idx, wide) = Const::Long(42).intern(&mut pool).unwrap();
        assert!(wide);
        assert_eq!(ldc_of(long_idx, wide).byte_len(), 3);
        assert_eq!(ldc_of(long_idx, wide).opcode, 0x14);
    }

    #[test]
    fn iconst_picks_shortest_form() {
        let body = Insn::Seq(vec![
            Insn::Op(Op::IConst(3)),
            Insn::Op(Op::IConst(100)),
            Insn::Op(Op::IConst(30_000)),
            Insn::Op(Op::Pop),
            Insn::Op(Op::Pop),
            Insn::Op(Op::Pop),
            Insn::Op(Op::Return),
        ]);
        let bytes = preprocess_and_encode(&body, Vec::new());
        assert_eq!(
            bytes,
            [0x06, 0x10, 100, 0x11, 0x75, 0x30, 0x57, 0x57, 0x57, 0xb1],
        );
    }

    #[test]
    fn loads_pick_short_forms() {
        let body = Insn::Seq(vec![
            Insn::Op(Op::ILoad(0)),
            Insn::Op(Op::ILoad(5)),
            Insn::Op(Op::IAdd),
            Insn::Op(Op::IReturn),
        ]);
        let locals = vec![
            VerificationType::Integer,
            VerificationType::Top,
            VerificationType::Top,
            VerificationType::Top,
            VerificationType::Top,
            VerificationType::Integer,
        ];
        let bytes = preprocess_and_encode(&body, locals);
        assert_eq!(bytes, [0x1a, 0x15, 5, 0x60, 0xac]);
    }

    #[test]
    fn if_else_emits_branch_goto_shape() {
        let body = Insn::Seq(vec![
            Insn::Op(Op::ILoad(0)),
            Insn::If {
                cond: Cond::Eq,
                then: vec![Insn::Op(Op::IConst(1))],
                orelse: vec![Insn::Op(Op::IConst(2))],
            },
            Insn::Op(Op::IReturn),
        ]);
        let bytes = preprocess_and_encode(&body, vec![VerificationType::Integer]);
        // iload_0; ifne +7 (to iconst_2); iconst_1; goto +4; iconst_2; ireturn
        assert_eq!(
            bytes,
            [0x1a, 0x9a, 0, 7, 0x04, 0xa7, 0, 4, 0x05, 0xac],
        );
    }

    #[test]
    fn invokespecial_initializes_new_instances() {
        let mut pool = ConstantPool::new();
        let mut ctx = MethodContext::new(Vec::new(), None);
        let body = Insn::Seq(vec![
            Insn::Op(Op::New("java/lang/Object".to_owned())),
            Insn::Op(Op::Dup),
            Insn::Op(Op::InvokeSpecial(MemberRef::new(
                "java/lang/Object",
                "<init>",
                "()V",
            ))),
        ]);
        body.preprocess(&mut ctx, &mut pool).unwrap();
        assert_eq!(
            ctx.frame.snapshot().stack,
            vec![VerificationType::Object("java/lang/Object".to_owned())],
        );
    }

    #[test]
    fn lookup_switch_encodes_sorted_pairs_with_padding() {
        let mut pool = ConstantPool::new();
        let mut ctx = MethodContext::new(vec![VerificationType::Integer], None);
        let done = ctx.fresh_label();
        let body = Insn::Seq(vec![
            Insn::Op(Op::ILoad(0)),
            Insn::Op(Op::LookupSwitch {
                pairs: vec![(7, done), (3, done)],
                default: done,
            }),
            Insn::Mark(done),
            Insn::Op(Op::Return),
        ]);
        body.preprocess(&mut ctx, &mut pool).unwrap();
        let preprocessed = ctx.finish().unwrap();
        let mut encode = preprocessed.encoder();
        body.encode(&mut encode, &mut pool).unwrap();
        let mut bytes = Vec::new();
        for op in &encode.ops {
            op.write_to(&mut bytes);
        }
        // opcode at 1, so 2 bytes of padding; default and both keys point
        // at offset 28, relative 27; keys come out sorted
        let mut expected = vec![0x1a, 0xab, 0, 0];
        expected.extend(27i32.to_be_bytes());
        expected.extend(2i32.to_be_bytes());
        expected.extend(3i32.to_be_bytes());
        expected.extend(27i32.to_be_bytes());
        expected.extend(7i32.to_be_bytes());
        expected.extend(27i32.to_be_bytes());
        expected.push(0xb1);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn subroutine_jumps_in_and_returns() {
        let mut pool = ConstantPool::new();
        let mut ctx = MethodContext::new(Vec::new(), None);
        let entry = ctx.fresh_label();
        let body = Insn::Seq(vec![
            Insn::Op(Op::Jsr(entry)),
            Insn::Subroutine {
                entry,
                body: vec![Insn::Op(Op::AStore(1)), Insn::Op(Op::Ret(1))],
            },
            Insn::Op(Op::Return),
        ]);
        body.preprocess(&mut ctx, &mut pool).unwrap();
        let preprocessed = ctx.finish().unwrap();
        let mut encode = preprocessed.encoder();
        body.encode(&mut encode, &mut pool).unwrap();
        let mut bytes = Vec::new();
        for op in &encode.ops {
            op.write_to(&mut bytes);
        }
        // jsr +6 (entry at 6); goto +6 over the body (return at 9);
        // astore_1; ret 1
        assert_eq!(
            bytes,
            [0xa8, 0, 6, 0xa7, 0, 6, 0x4c, 0xa9, 1, 0xb1],
        );
        // the stored return address occupies local slot 1
        assert_eq!(preprocessed.max_locals, 2);
    }

    #[test]
    fn table_switch_encodes_range_with_padding() {
        let mut pool = ConstantPool::new();
        let mut ctx = MethodContext::new(vec![VerificationType::Integer], None);
        let done = ctx.fresh_label();
        let body = Insn::Seq(vec![
            Insn::Op(Op::ILoad(0)),
            Insn::Op(Op::TableSwitch {
                low: 0,
                targets: vec![done, done],
                default: done,
            }),
            Insn::Mark(done),
            Insn::Op(Op::Return),
        ]);
        body.preprocess(&mut ctx, &mut pool).unwrap();
        let preprocessed = ctx.finish().unwrap();
        let mut encode = preprocessed.encoder();
        body.encode(&mut encode, &mut pool).unwrap();
        let mut bytes = Vec::new();
        for op in &encode.ops {
            op.write_to(&mut bytes);
        }
        // opcode at 1, so 2 bytes of padding; everything lands at offset 24,
        // relative 23 from the opcode; high = low + targets - 1
        let mut expected = vec![0x1a, 0xaa, 0, 0];
        expected.extend(23i32.to_be_bytes());
        expected.extend(0i32.to_be_bytes());
        expected.extend(1i32.to_be_bytes());
        expected.extend(23i32.to_be_bytes());
        expected.extend(23i32.to_be_bytes());
        expected.push(0xb1);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn table_switch_without_targets_is_rejected() {
        let mut pool = ConstantPool::new();
        let mut ctx = MethodContext::new(vec![VerificationType::Integer], None);
        let done = ctx.fresh_label();
        let body = Insn::Seq(vec![
            Insn::Op(Op::ILoad(0)),
            Insn::Op(Op::TableSwitch {
                low: 0,
                targets: vec![],
                default: done,
            }),
            Insn::Mark(done),
            Insn::Op(Op::Return),
        ]);
        match body.preprocess(&mut ctx, &mut pool) {
            Err(Error::UnsupportedConstruct(_)) => (),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn fallthrough_into_handler_entry_is_rejected() {
        let mut pool = ConstantPool::new();
        let mut ctx = MethodContext::new(Vec::new(), None);
        let handler = ctx.fresh_label();
        let body = Insn::Seq(vec![
            Insn::Op(Op::Nop),
            Insn::CatchMark {
                label: handler,
                class: "java/lang/Exception".to_owned(),
            },
            Insn::Op(Op::Pop),
            Insn::Op(Op::Return),
        ]);
        match body.preprocess(&mut ctx, &mut pool) {
            Err(Error::UnsupportedConstruct(_)) => (),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn unreachable_code_is_rejected() {
        let mut pool = ConstantPool::new();
        let mut ctx = MethodContext::new(Vec::new(), None);
        let body = Insn::Seq(vec![Insn::Op(Op::Return), Insn::Op(Op::Nop)]);
        match body.preprocess(&mut ctx, &mut pool) {
            Err(Error::UnsupportedConstruct(_)) => (),
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}
