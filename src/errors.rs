use crate::verifier::VerificationType;
use std::fmt;

/// Errors surfaced while building or serializing a class file.
///
/// Every variant is fatal at the point it is detected: the model is left in
/// an unspecified state and no bytes have been committed to the caller's
/// sink. Nothing here is retried or degraded.
#[derive(Debug)]
pub enum Error {
    /// Popped from an empty operand stack.
    StackUnderflow,

    /// A two-word value was popped but the companion `Top` slot above it was
    /// missing or already consumed.
    WideValueMissingTop,

    /// A stack map frame was recorded at an offset that does not strictly
    /// increase over the previous frame's offset.
    FrameOffsetNotIncreasing { previous: u16, current: u16 },

    /// Two different frames were recorded for the same bytecode offset.
    ConflictingFrames { offset: u16 },

    /// The constant pool has no room left for this entry.
    PoolOverflow { entry: crate::pool::Entry },

    /// A construct was reached that has no binary rendering in this crate.
    UnsupportedConstruct(&'static str),

    /// A branch kept its narrow encoding but its final relative offset does
    /// not fit in a signed 16-bit operand.
    BranchOutOfRange { at: u32, target: u32 },

    /// Method code grew past the 65535-byte ceiling of the `Code` attribute.
    CodeSizeOverflow(u32),

    /// A local variable slot was read or written out of bounds.
    LocalOutOfRange { index: u16, len: u16 },

    /// The abstract interpreter found a value of the wrong verification type.
    InvalidType {
        expected: VerificationType,
        found: VerificationType,
    },

    /// The two arms of a branch left operand stacks of different depths.
    BranchStackMismatch {
        then_depth: usize,
        else_depth: usize,
    },

    /// A field or method descriptor could not be parsed.
    BadDescriptor(String),

    IoError(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StackUnderflow => write!(f, "pop from an empty operand stack"),
            Error::WideValueMissingTop => {
                write!(f, "two-word value popped without its companion top slot")
            }
            Error::FrameOffsetNotIncreasing { previous, current } => write!(
                f,
                "stack map frame at offset {} does not increase over previous offset {}",
                current, previous
            ),
            Error::ConflictingFrames { offset } => {
                write!(f, "conflicting stack map frames at offset {}", offset)
            }
            Error::PoolOverflow { entry } => {
                write!(f, "constant pool overflow while adding {:?}", entry)
            }
            Error::UnsupportedConstruct(what) => write!(f, "unsupported construct: {}", what),
            Error::BranchOutOfRange { at, target } => write!(
                f,
                "narrow branch at offset {} cannot reach target offset {}",
                at, target
            ),
            Error::CodeSizeOverflow(len) => {
                write!(f, "method code is {} bytes, over the 65535 limit", len)
            }
            Error::LocalOutOfRange { index, len } => {
                write!(f, "local slot {} out of range (frame has {})", index, len)
            }
            Error::InvalidType { expected, found } => {
                write!(f, "expected type {:?} but found {:?}", expected, found)
            }
            Error::BranchStackMismatch {
                then_depth,
                else_depth,
            } => write!(
                f,
                "branch arms left stacks of depth {} and {}",
                then_depth, else_depth
            ),
            Error::BadDescriptor(descriptor) => write!(f, "bad descriptor {:?}", descriptor),
            Error::IoError(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}
