use crate::class_file::{StackMapFrame, TypeInfo};
use crate::code::ResolvedOffsets;
use crate::errors::Error;
use crate::pool::ConstantPool;
use crate::verifier::VerificationType;

/// Mutable state of the abstract interpreter: an operand stack and indexed
/// locals, both in slot form (two-word values hold their slot plus a `Top`
/// companion right above or after it), plus running high-water marks.
#[derive(Debug, Clone)]
pub struct FrameContext {
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
    max_stack: u16,
    max_locals: u16,

    /// Cleared after an unconditional jump or return, set again when a
    /// branch target frame is restored
    pub reachable: bool,
}

impl FrameContext {
    pub fn new(locals: Vec<VerificationType>) -> FrameContext {
        let max_locals = locals.len() as u16;
        FrameContext {
            locals,
            stack: Vec::new(),
            max_stack: 0,
            max_locals,
            reachable: true,
        }
    }

    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Push a value, adding the `Top` companion slot for two-word types
    pub fn push(&mut self, ty: VerificationType) {
        let wide = ty.width() == 2;
        self.stack.push(ty);
        if wide {
            self.stack.push(VerificationType::Top);
        }
        if self.stack.len() as u16 > self.max_stack {
            self.max_stack = self.stack.len() as u16;
        }
    }

    /// Pop one value. A two-word value is popped together with its companion
    /// slot; finding the wide slot without the companion above it is fatal.
    pub fn pop(&mut self) -> Result<VerificationType, Error> {
        match self.stack.pop() {
            None => Err(Error::StackUnderflow),
            Some(VerificationType::Long | VerificationType::Double) => {
                Err(Error::WideValueMissingTop)
            }
            Some(VerificationType::Top) => match self.stack.last() {
                Some(VerificationType::Long | VerificationType::Double) => {
                    let wide = self.stack.pop();
                    Ok(wide.unwrap_or(VerificationType::Top))
                }
                _ => Ok(VerificationType::Top),
            },
            Some(ty) => Ok(ty),
        }
    }

    /// Pop a value and check it can stand in for `expected`
    pub fn pop_expecting(&mut self, expected: VerificationType) -> Result<VerificationType, Error> {
        let found = self.pop()?;
        if found.is_assignable_to(&expected) {
            Ok(found)
        } else {
            Err(Error::InvalidType { expected, found })
        }
    }

    /// Pop any single reference-shaped value (object, null, or an
    /// uninitialized instance)
    pub fn pop_reference(&mut self) -> Result<VerificationType, Error> {
        let found = self.pop()?;
        match found {
            VerificationType::Object(_)
            | VerificationType::Null
            | VerificationType::Uninitialized { .. }
            | VerificationType::UninitializedThis => Ok(found),
            found => Err(Error::InvalidType {
                expected: VerificationType::Object("java/lang/Object".to_owned()),
                found,
            }),
        }
    }

    /// Write a local slot, growing the table with `Top` as needed
    pub fn locals_set(&mut self, index: u16, ty: VerificationType) {
        let wide = ty.width() == 2;
        let end = index as usize + ty.width();
        if self.locals.len() < end {
            self.locals.resize(end, VerificationType::Top);
        }
        self.locals[index as usize] = ty;
        if wide {
            self.locals[index as usize + 1] = VerificationType::Top;
        }
        if self.locals.len() as u16 > self.max_locals {
            self.max_locals = self.locals.len() as u16;
        }
    }

    /// Read a local slot and check it holds the expected type
    pub fn locals_expect(&self, index: u16, expected: VerificationType) -> Result<(), Error> {
        let found = self.locals_get(index)?;
        if found.is_assignable_to(&expected) {
            Ok(())
        } else {
            Err(Error::InvalidType {
                expected,
                found: found.clone(),
            })
        }
    }

    /// Read a local slot holding a reference-shaped value
    pub fn locals_get_reference(&self, index: u16) -> Result<VerificationType, Error> {
        let found = self.locals_get(index)?;
        match found {
            VerificationType::Object(_)
            | VerificationType::Null
            | VerificationType::Uninitialized { .. }
            | VerificationType::UninitializedThis => Ok(found.clone()),
            found => Err(Error::InvalidType {
                expected: VerificationType::Object("java/lang/Object".to_owned()),
                found: found.clone(),
            }),
        }
    }

    pub fn locals_get(&self, index: u16) -> Result<&VerificationType, Error> {
        self.locals
            .get(index as usize)
            .ok_or(Error::LocalOutOfRange {
                index,
                len: self.locals.len() as u16,
            })
    }

    /// Drop the last local slot (the companion slot too, when it closes a
    /// two-word value)
    pub fn locals_pop(&mut self) -> Result<(), Error> {
        match self.locals.pop() {
            None => Err(Error::LocalOutOfRange { index: 0, len: 0 }),
            Some(VerificationType::Top) => {
                if let Some(VerificationType::Long | VerificationType::Double) = self.locals.last()
                {
                    self.locals.pop();
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Collapse the stack to a single surviving item (exception handler
    /// entry: only the thrown object remains)
    pub fn stack_to_top(&mut self, ty: VerificationType) {
        self.stack.clear();
        self.push(ty);
    }

    pub fn stack_clear(&mut self) {
        self.stack.clear();
    }

    /// Replace every occurrence of `from` in locals and stack. Used when
    /// `<init>` runs and the uninitialized instance becomes a real object.
    pub fn replace_all(&mut self, from: &VerificationType, to: VerificationType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if slot == from {
                *slot = to.clone();
            }
        }
    }

    /// Freeze the current state
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            locals: self.locals.clone(),
            stack: self.stack.clone(),
        }
    }

    /// Discard the current state and resume from a snapshot (branch target)
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.locals = snapshot.locals.clone();
        self.stack = snapshot.stack.clone();
        self.reachable = true;
        if self.locals.len() as u16 > self.max_locals {
            self.max_locals = self.locals.len() as u16;
        }
        if self.stack.len() as u16 > self.max_stack {
            self.max_stack = self.stack.len() as u16;
        }
    }

    /// Merge another control-flow edge into the current state.
    ///
    /// Locals unify pairwise (irreconcilable slots degrade to `Top`); stacks
    /// must agree in depth, and irreconcilable stack slots are an error
    /// since a `Top` operand is unusable.
    pub fn merge(&mut self, other: &Snapshot) -> Result<(), Error> {
        if self.stack.len() != other.stack.len() {
            return Err(Error::BranchStackMismatch {
                then_depth: self.stack.len(),
                else_depth: other.stack.len(),
            });
        }
        for (mine, theirs) in self.stack.iter_mut().zip(other.stack.iter()) {
            if mine != theirs {
                let unified = mine.unify(theirs);
                if unified == VerificationType::Top && *mine != VerificationType::Top {
                    return Err(Error::InvalidType {
                        expected: mine.clone(),
                        found: theirs.clone(),
                    });
                }
                *mine = unified;
            }
        }
        let shared = self.locals.len().min(other.locals.len());
        for (mine, theirs) in self.locals.iter_mut().zip(other.locals.iter()).take(shared) {
            if mine != theirs {
                *mine = mine.unify(theirs);
            }
        }
        self.locals.truncate(shared);
        Ok(())
    }
}

/// Immutable copy of interpreter state at one point in the method
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub locals: Vec<VerificationType>,
    pub stack: Vec<VerificationType>,
}

/// Frame with final offsets and wire-form types.
///
/// Locals and stack are in wire units here: a two-word value is one
/// `Long`/`Double` entry, its companion slot dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFrame {
    pub offset: u16,
    pub locals: Vec<TypeInfo>,
    pub stack: Vec<TypeInfo>,
}

impl ResolvedFrame {
    pub fn from_snapshot(
        snapshot: &Snapshot,
        offset: u16,
        pool: &mut ConstantPool,
        offsets: &ResolvedOffsets,
    ) -> Result<ResolvedFrame, Error> {
        Ok(ResolvedFrame {
            offset,
            locals: collapse_slots(&snapshot.locals, pool, offsets)?,
            stack: collapse_slots(&snapshot.stack, pool, offsets)?,
        })
    }

    /// Delta to encode relative to the previous explicit frame.
    ///
    /// The first explicit frame is relative to the implicit frame at offset
    /// 0 and uses its raw offset; every later frame is relative to the
    /// instruction after the previous frame, hence the extra -1.
    pub fn offset_delta(&self, previous: Option<&ResolvedFrame>) -> Result<u16, Error> {
        match previous {
            None => Ok(self.offset),
            Some(previous) => {
                if self.offset <= previous.offset {
                    Err(Error::FrameOffsetNotIncreasing {
                        previous: previous.offset,
                        current: self.offset,
                    })
                } else {
                    Ok(self.offset - previous.offset - 1)
                }
            }
        }
    }

    /// Pick the smallest wire variant that captures the diff from the
    /// previous frame
    pub fn stack_map_frame(&self, offset_delta: u16, previous: &ResolvedFrame) -> StackMapFrame {
        match self.stack.len() {
            0 => {
                let this_len = self.locals.len();
                let prev_len = previous.locals.len();

                if this_len <= prev_len {
                    let chopped = prev_len - this_len;
                    if chopped < 4 && self.locals[..] == previous.locals[..this_len] {
                        if chopped == 0 {
                            return StackMapFrame::SameFrame { offset_delta };
                        } else {
                            return StackMapFrame::ChopFrame {
                                offset_delta,
                                chopped_k: chopped as u8,
                            };
                        }
                    }
                } else if this_len - prev_len < 4 && self.locals[..prev_len] == previous.locals[..]
                {
                    return StackMapFrame::AppendFrame {
                        offset_delta,
                        locals: self.locals[prev_len..].to_vec(),
                    };
                }
            }
            1 if self.locals == previous.locals => {
                return StackMapFrame::SameLocalsOneStack {
                    offset_delta,
                    stack: self.stack[0].clone(),
                };
            }
            _ => (),
        }

        StackMapFrame::FullFrame {
            offset_delta,
            locals: self.locals.clone(),
            stack: self.stack.clone(),
        }
    }
}

/// Lower slot-form types to wire units, dropping companion slots
fn collapse_slots(
    slots: &[VerificationType],
    pool: &mut ConstantPool,
    offsets: &ResolvedOffsets,
) -> Result<Vec<TypeInfo>, Error> {
    let mut out = Vec::with_capacity(slots.len());
    let mut iter = slots.iter().peekable();
    while let Some(slot) = iter.next() {
        out.push(slot.resolve(pool, offsets)?);
        if slot.width() == 2 {
            iter.next();
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str) -> VerificationType {
        VerificationType::Object(name.to_owned())
    }

    fn resolved(offset: u16, locals: Vec<TypeInfo>, stack: Vec<TypeInfo>) -> ResolvedFrame {
        ResolvedFrame {
            offset,
            locals,
            stack,
        }
    }

    #[test]
    fn wide_push_takes_two_slots() {
        let mut frame = FrameContext::new(vec![]);
        frame.push(VerificationType::Long);
        assert_eq!(frame.stack_depth(), 2);
        assert_eq!(frame.max_stack(), 2);
        assert_eq!(frame.pop().unwrap(), VerificationType::Long);
        assert_eq!(frame.stack_depth(), 0);
    }

    #[test]
    fn wide_pop_without_companion_is_fatal() {
        // a wide slot exposed without its companion only arises from a
        // malformed snapshot, but it must still fail loudly
        let mut frame = FrameContext::new(vec![]);
        frame.restore(&Snapshot {
            locals: vec![],
            stack: vec![VerificationType::Long],
        });
        match frame.pop() {
            Err(Error::WideValueMissingTop) => (),
            other => panic!("expected missing top, got {:?}", other),
        }
    }

    #[test]
    fn popping_below_a_wide_value_consumes_both_slots() {
        let mut frame = FrameContext::new(vec![]);
        frame.push(VerificationType::Long);
        frame.push(VerificationType::Integer);
        assert_eq!(frame.pop().unwrap(), VerificationType::Integer);
        assert_eq!(frame.pop().unwrap(), VerificationType::Long);
        match frame.pop() {
            Err(Error::StackUnderflow) => (),
            other => panic!("expected underflow, got {:?}", other),
        }
    }

    #[test]
    fn pop_from_empty_stack_is_fatal() {
        let mut frame = FrameContext::new(vec![]);
        match frame.pop() {
            Err(Error::StackUnderflow) => (),
            other => panic!("expected underflow, got {:?}", other),
        }
    }

    #[test]
    fn locals_grow_and_track_high_water() {
        let mut frame = FrameContext::new(vec![object("Main")]);
        frame.locals_set(2, VerificationType::Double);
        assert_eq!(frame.max_locals(), 4);
        assert_eq!(*frame.locals_get(1).unwrap(), VerificationType::Top);
        assert_eq!(*frame.locals_get(2).unwrap(), VerificationType::Double);
        match frame.locals_get(9) {
            Err(Error::LocalOutOfRange { index: 9, len: 4 }) => (),
            other => panic!("expected out of range, got {:?}", other),
        }
    }

    #[test]
    fn merge_unifies_locals_but_rejects_stack_conflicts() {
        let mut frame = FrameContext::new(vec![object("java/lang/String")]);
        frame.push(VerificationType::Integer);
        let mut other = frame.snapshot();
        other.locals[0] = object("java/io/PrintStream");
        frame.merge(&other).unwrap();
        assert_eq!(*frame.locals_get(0).unwrap(), object("java/lang/Object"));

        let mut bad = frame.snapshot();
        bad.stack[0] = VerificationType::Float;
        match frame.merge(&bad) {
            Err(Error::InvalidType { .. }) => (),
            other => panic!("expected type conflict, got {:?}", other),
        }
    }

    #[test]
    fn merge_rejects_depth_mismatch() {
        let mut frame = FrameContext::new(vec![]);
        frame.push(VerificationType::Integer);
        let deeper = Snapshot {
            locals: vec![],
            stack: vec![VerificationType::Integer, VerificationType::Integer],
        };
        match frame.merge(&deeper) {
            Err(Error::BranchStackMismatch {
                then_depth: 1,
                else_depth: 2,
            }) => (),
            other => panic!("expected depth mismatch, got {:?}", other),
        }
    }

    #[test]
    fn delta_is_raw_then_off_by_one() {
        let first = resolved(10, vec![], vec![]);
        let second = resolved(70, vec![], vec![]);
        assert_eq!(first.offset_delta(None).unwrap(), 10);
        assert_eq!(second.offset_delta(Some(&first)).unwrap(), 59);
        match first.offset_delta(Some(&second)) {
            Err(Error::FrameOffsetNotIncreasing {
                previous: 70,
                current: 10,
            }) => (),
            other => panic!("expected ordering error, got {:?}", other),
        }
    }

    #[test]
    fn cascade_picks_same_frame() {
        let prev = resolved(0, vec![TypeInfo::Integer], vec![]);
        let cur = resolved(11, vec![TypeInfo::Integer], vec![]);
        assert_eq!(
            cur.stack_map_frame(10, &prev),
            StackMapFrame::SameFrame { offset_delta: 10 },
        );
    }

    #[test]
    fn cascade_picks_one_stack_item() {
        let prev = resolved(0, vec![TypeInfo::Integer], vec![]);
        let cur = resolved(71, vec![TypeInfo::Integer], vec![TypeInfo::Float]);
        assert_eq!(
            cur.stack_map_frame(70, &prev),
            StackMapFrame::SameLocalsOneStack {
                offset_delta: 70,
                stack: TypeInfo::Float,
            },
        );
    }

    #[test]
    fn cascade_picks_append_and_chop() {
        let prev = resolved(0, vec![TypeInfo::Integer], vec![]);
        let grown = resolved(
            6,
            vec![TypeInfo::Integer, TypeInfo::Long, TypeInfo::Float],
            vec![],
        );
        assert_eq!(
            grown.stack_map_frame(5, &prev),
            StackMapFrame::AppendFrame {
                offset_delta: 5,
                locals: vec![TypeInfo::Long, TypeInfo::Float],
            },
        );
        assert_eq!(
            prev.stack_map_frame(5, &grown),
            StackMapFrame::ChopFrame {
                offset_delta: 5,
                chopped_k: 2,
            },
        );
    }

    #[test]
    fn cascade_falls_back_to_full() {
        let prev = resolved(0, vec![TypeInfo::Integer], vec![]);
        // locals changed in place, not a prefix relationship
        let swapped = resolved(6, vec![TypeInfo::Float], vec![]);
        assert_eq!(
            swapped.stack_map_frame(5, &prev),
            StackMapFrame::FullFrame {
                offset_delta: 5,
                locals: vec![TypeInfo::Float],
                stack: vec![],
            },
        );
        // two stack items never fit the compact variants
        let deep = resolved(
            6,
            vec![TypeInfo::Integer],
            vec![TypeInfo::Integer, TypeInfo::Integer],
        );
        assert_eq!(
            deep.stack_map_frame(5, &prev),
            StackMapFrame::FullFrame {
                offset_delta: 5,
                locals: vec![TypeInfo::Integer],
                stack: vec![TypeInfo::Integer, TypeInfo::Integer],
            },
        );
    }
}
