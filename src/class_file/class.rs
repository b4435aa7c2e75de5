use crate::class_file::{
    Attribute, AttributeLike, ClassAccessFlags, Code, ExceptionHandler, FieldAccessFlags,
    MethodAccessFlags, Serialize, StackMapTable,
};
use crate::code::{Insn, Label, MethodContext};
use crate::errors::Error;
use crate::pool::ConstantPool;
use crate::verifier::{ResolvedFrame, Snapshot, VerificationType};
use byteorder::WriteBytesExt;
use log::debug;
use std::fs;
use std::path::Path;

/// Class file version
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Version {
    pub minor: u16,
    pub major: u16,
}

impl Version {
    pub const JAVA8: Version = Version { minor: 0, major: 52 };
    pub const JAVA11: Version = Version { minor: 0, major: 55 };
    pub const JAVA17: Version = Version { minor: 0, major: 61 };
}

impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.minor.serialize(writer)?;
        self.major.serialize(writer)?;
        Ok(())
    }
}

/// Representation of the [`class` file format of the JVM][0]
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html
pub struct ClassFile {
    pub version: Version,
    pub constants: ConstantPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Magic header bytes that go at the front of the serialized class file
    const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

    /// Start a class. The pool is taken over because class and member names
    /// intern into it from here on.
    pub fn new(
        version: Version,
        mut constants: ConstantPool,
        access_flags: ClassAccessFlags,
        this_class: &str,
        super_class: &str,
    ) -> Result<ClassFile, Error> {
        let this_class = constants.class(this_class)?;
        let super_class = constants.class(super_class)?;
        Ok(ClassFile {
            version,
            constants,
            access_flags,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub fn add_interface(&mut self, name: &str) -> Result<(), Error> {
        let idx = self.constants.class(name)?;
        self.interfaces.push(idx);
        Ok(())
    }

    /// Finish the class and serialize it. Consumes the class because the
    /// `BootstrapMethods` attribute, if any, is folded in here.
    pub fn write<W: WriteBytesExt>(mut self, writer: &mut W) -> Result<(), Error> {
        if let Some(bootstrap) = self.constants.bootstrap_attribute()? {
            self.attributes.push(bootstrap);
        }
        debug!(
            "writing class (pool entries: {}, methods: {})",
            self.constants.len(),
            self.methods.len()
        );
        self.serialize(writer)?;
        Ok(())
    }

    /// Finish the class and save it to disk
    pub fn save_to_path<P: AsRef<Path>>(
        self,
        path: P,
        create_missing_directories: bool,
    ) -> Result<(), Error> {
        let path = path.as_ref();
        if create_missing_directories {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut class_file = fs::File::create(path)?;
        self.write(&mut class_file)
    }
}

impl Serialize for ClassFile {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&ClassFile::MAGIC)?;
        self.version.serialize(writer)?;
        self.constants.serialize(writer)?;
        self.access_flags.serialize(writer)?;
        self.this_class.serialize(writer)?;
        self.super_class.serialize(writer)?;
        self.interfaces.serialize(writer)?;
        self.fields.serialize(writer)?;
        self.methods.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

/// Field declared by a class or interface
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.5
#[derive(Debug)]
pub struct Field {
    pub access_flags: FieldAccessFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl Field {
    pub fn new(
        pool: &mut ConstantPool,
        access_flags: FieldAccessFlags,
        name: &str,
        descriptor: &str,
    ) -> Result<Field, Error> {
        Ok(Field {
            access_flags,
            name_index: pool.utf8(name)?,
            descriptor_index: pool.utf8(descriptor)?,
            attributes: Vec::new(),
        })
    }
}

impl Serialize for Field {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.access_flags.serialize(writer)?;
        self.name_index.serialize(writer)?;
        self.descriptor_index.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

/// Method declared by a class or interface
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.6
#[derive(Debug)]
pub struct Method {
    pub access_flags: MethodAccessFlags,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl Method {
    pub fn new(
        pool: &mut ConstantPool,
        access_flags: MethodAccessFlags,
        name: &str,
        descriptor: &str,
        code: Option<Code>,
    ) -> Result<Method, Error> {
        let name_index = pool.utf8(name)?;
        let descriptor_index = pool.utf8(descriptor)?;
        let mut attributes = Vec::new();
        if let Some(code) = code {
            attributes.push(pool.attribute(code)?);
        }
        Ok(Method {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }
}

impl Serialize for Method {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.access_flags.serialize(writer)?;
        self.name_index.serialize(writer)?;
        self.descriptor_index.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

struct HandlerSpec {
    start: Label,
    end: Label,
    handler: Label,
    catch_class: Option<String>,
}

/// Drives one method body through the whole pipeline: preprocessing (frame
/// interpretation plus provisional layout), offset normalization, encoding,
/// and stack map frame synthesis, yielding a finished `Code` attribute.
pub struct MethodAssembler<'a> {
    pool: &'a mut ConstantPool,
    ctx: MethodContext,
    initial: Snapshot,
    handlers: Vec<HandlerSpec>,
}

impl<'a> MethodAssembler<'a> {
    /// Start assembling a method whose entry locals are `locals` (receiver
    /// first for instance methods, two slots per wide argument).
    /// `this_class` is required for constructors so `uninitializedThis` can
    /// be initialized.
    pub fn new(
        pool: &'a mut ConstantPool,
        locals: Vec<VerificationType>,
        this_class: Option<&str>,
    ) -> Result<MethodAssembler<'a>, Error> {
        // interned up front: every assembled method ends up as a "Code"
        // attribute
        pool.utf8(Code::NAME)?;
        let initial = Snapshot {
            locals: locals.clone(),
            stack: Vec::new(),
        };
        Ok(MethodAssembler {
            pool,
            ctx: MethodContext::new(locals, this_class.map(str::to_owned)),
            initial,
            handlers: Vec::new(),
        })
    }

    pub fn fresh_label(&mut self) -> Label {
        self.ctx.fresh_label()
    }

    /// Cover `start..end` with a handler entered at `handler`. `None`
    /// catches everything. The handler entry must be bound with a
    /// `CatchMark` in the body.
    pub fn add_exception_handler(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_class: Option<&str>,
    ) {
        self.ctx.register_handler(handler, start);
        self.handlers.push(HandlerSpec {
            start,
            end,
            handler,
            catch_class: catch_class.map(str::to_owned),
        });
    }

    pub fn assemble(mut self, body: &Insn) -> Result<Code, Error> {
        body.preprocess(&mut self.ctx, self.pool)?;
        let preprocessed = self.ctx.finish()?;

        let code_len = preprocessed.resolved.code_len();
        if code_len > u16::MAX as u32 {
            return Err(Error::CodeSizeOverflow(code_len));
        }

        let mut encoder = preprocessed.encoder();
        body.encode(&mut encoder, self.pool)?;
        let mut bytecode = Vec::with_capacity(code_len as usize);
        for op in &encoder.ops {
            op.write_to(&mut bytecode);
        }
        debug_assert_eq!(bytecode.len() as u32, code_len);

        // frames for branch targets, deduped per offset
        let mut frames: Vec<ResolvedFrame> = Vec::new();
        for (label, snapshot) in &preprocessed.frames {
            let offset = preprocessed.resolved.offset_of(*label)?;
            let frame =
                ResolvedFrame::from_snapshot(snapshot, offset, self.pool, &preprocessed.resolved)?;
            match frames.last() {
                Some(last) if last.offset == offset => {
                    if *last != frame {
                        return Err(Error::ConflictingFrames { offset });
                    }
                }
                _ => frames.push(frame),
            }
        }

        let mut attributes = Vec::new();
        if !frames.is_empty() {
            let implicit =
                ResolvedFrame::from_snapshot(&self.initial, 0, self.pool, &preprocessed.resolved)?;
            let mut wire = Vec::with_capacity(frames.len());
            let mut previous: Option<&ResolvedFrame> = None;
            for frame in &frames {
                let offset_delta = frame.offset_delta(previous)?;
                wire.push(frame.stack_map_frame(offset_delta, previous.unwrap_or(&implicit)));
                previous = Some(frame);
            }
            attributes.push(self.pool.attribute(StackMapTable(wire))?);
        }

        let mut exception_table = Vec::with_capacity(self.handlers.len());
        for spec in &self.handlers {
            let catch_type = match &spec.catch_class {
                Some(class) => self.pool.class(class)?,
                None => 0,
            };
            exception_table.push(ExceptionHandler {
                start_pc: preprocessed.resolved.offset_of(spec.start)?,
                end_pc: preprocessed.resolved.offset_of(spec.end)?,
                handler_pc: preprocessed.resolved.offset_of(spec.handler)?,
                catch_type,
            });
        }

        Ok(Code {
            max_stack: preprocessed.max_stack,
            max_locals: preprocessed.max_locals,
            bytecode,
            exception_table,
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Cond, Insn, Op};

    #[test]
    fn version_serializes_minor_then_major() {
        let mut out = Vec::new();
        Version::JAVA8.serialize(&mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 52]);
    }

    #[test]
    fn straight_line_method_has_no_stack_map_table() {
        let mut pool = ConstantPool::new();
        let assembler = MethodAssembler::new(&mut pool, Vec::new(), None).unwrap();
        let code = assembler.assemble(&Insn::Op(Op::Return)).unwrap();
        assert_eq!(code.bytecode, [0xb1]);
        assert_eq!(code.max_stack, 0);
        assert_eq!(code.max_locals, 0);
        assert!(code.attributes.is_empty());
    }

    #[test]
    fn branching_method_gets_stack_map_frames() {
        let mut pool = ConstantPool::new();
        let assembler = MethodAssembler::new(
            &mut pool,
            vec![VerificationType::Integer],
            None,
        )
        .unwrap();
        let body = Insn::Seq(vec![
            Insn::Op(Op::ILoad(0)),
            Insn::If {
                cond: Cond::Eq,
                then: vec![Insn::Op(Op::IConst(1)), Insn::Op(Op::IReturn)],
                orelse: vec![],
            },
            Insn::Op(Op::IConst(2)),
            Insn::Op(Op::IReturn),
        ]);
        let code = assembler.assemble(&body).unwrap();
        // iload_0; ifne +6; iconst_1; ireturn; iconst_2; ireturn
        assert_eq!(code.bytecode, [0x1a, 0x9a, 0, 5, 0x04, 0xac, 0x05, 0xac]);
        // one frame, at the branch target: same locals, empty stack, delta 6
        let table = &code.attributes[0];
        assert_eq!(table.info, [0, 1, 6]);
    }

    #[test]
    fn exception_handler_offsets_and_catch_type() {
        let mut pool = ConstantPool::new();
        let mut assembler = MethodAssembler::new(&mut pool, Vec::new(), None).unwrap();
        let start = assembler.fresh_label();
        let end = assembler.fresh_label();
        let handler = assembler.fresh_label();
        assembler.add_exception_handler(start, end, handler, Some("java/lang/Exception"));
        let body = Insn::Seq(vec![
            Insn::Mark(start),
            Insn::Op(Op::Nop),
            Insn::Mark(end),
            Insn::Op(Op::Return),
            Insn::CatchMark {
                label: handler,
                class: "java/lang/Exception".to_owned(),
            },
            Insn::Op(Op::Pop),
            Insn::Op(Op::Return),
        ]);
        let code = assembler.assemble(&body).unwrap();
        assert_eq!(code.bytecode, [0x00, 0xb1, 0x57, 0xb1]);
        let table = &code.exception_table[0];
        assert_eq!(
            (table.start_pc, table.end_pc, table.handler_pc),
            (0, 1, 2),
        );
        assert_ne!(table.catch_type, 0);
        // handler entry needs a frame: one stack item, the exception
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.attributes.len(), 1);
    }

    #[test]
    fn oversized_method_is_rejected() {
        let mut pool = ConstantPool::new();
        let assembler = MethodAssembler::new(&mut pool, Vec::new(), None).unwrap();
        let mut insns = vec![Insn::Op(Op::Nop); 70_000];
        insns.push(Insn::Op(Op::Return));
        match assembler.assemble(&Insn::Seq(insns)) {
            Err(Error::CodeSizeOverflow(70_001)) => (),
            other => panic!("expected overflow, got {:?}", other.map(|_| ())),
        }
    }
}
