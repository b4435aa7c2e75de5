use crate::class_file::Serialize;
use byteorder::WriteBytesExt;

/// Attribute in its raw form: an interned name plus an opaque payload.
///
/// Attributes hang off classes, fields, methods, and other attributes, and
/// they all serialize the same way. The typed payloads implement
/// [`AttributeLike`] and are lowered into this form by
/// [`ConstantPool::attribute`](crate::pool::ConstantPool::attribute).
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7
#[derive(Debug)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Serialize for Attribute {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.name_index.serialize(writer)?;

        // Attribute info length is 4 bytes
        (self.info.len() as u32).serialize(writer)?;
        writer.write_all(&self.info)?;

        Ok(())
    }
}

/// Typed payload of an attribute
pub trait AttributeLike: Serialize {
    /// Name of the attribute
    const NAME: &'static str;
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7.2
pub struct ConstantValue(pub u16);

impl Serialize for ConstantValue {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl AttributeLike for ConstantValue {
    const NAME: &'static str = "ConstantValue";
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7.10
pub struct SourceFile(pub u16);

impl Serialize for SourceFile {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl AttributeLike for SourceFile {
    const NAME: &'static str = "SourceFile";
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7.3
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
}

impl Serialize for Code {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.max_stack.serialize(writer)?;
        self.max_locals.serialize(writer)?;

        // Code length, unlike other sequences, is 4 bytes
        (self.bytecode.len() as u32).serialize(writer)?;
        writer.write_all(&self.bytecode)?;

        self.exception_table.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

impl AttributeLike for Code {
    const NAME: &'static str = "Code";
}

pub struct ExceptionHandler {
    /// Start of the covered range (inclusive)
    pub start_pc: u16,

    /// End of the covered range (exclusive)
    pub end_pc: u16,

    /// Entry point of the handler
    pub handler_pc: u16,

    /// Class entry of the caught type, or 0 to catch everything
    pub catch_type: u16,
}

impl Serialize for ExceptionHandler {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.start_pc.serialize(writer)?;
        self.end_pc.serialize(writer)?;
        self.handler_pc.serialize(writer)?;
        self.catch_type.serialize(writer)?;
        Ok(())
    }
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7.4
pub struct StackMapTable(pub Vec<StackMapFrame>);

impl AttributeLike for StackMapTable {
    const NAME: &'static str = "StackMapTable";
}

impl Serialize for StackMapTable {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

/// Wire form of a verification type, as it appears inside stack map frames.
///
/// Object types are constant pool class indices and uninitialized types are
/// bytecode offsets of their `new` instruction, so this form only exists
/// once pool interning and offset resolution are done.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(u16),
}

impl Serialize for TypeInfo {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            TypeInfo::Top => 0u8.serialize(writer)?,
            TypeInfo::Integer => 1u8.serialize(writer)?,
            TypeInfo::Float => 2u8.serialize(writer)?,
            TypeInfo::Double => 3u8.serialize(writer)?,
            TypeInfo::Long => 4u8.serialize(writer)?,
            TypeInfo::Null => 5u8.serialize(writer)?,
            TypeInfo::UninitializedThis => 6u8.serialize(writer)?,
            TypeInfo::Object(class) => {
                7u8.serialize(writer)?;
                class.serialize(writer)?;
            }
            TypeInfo::Uninitialized(offset) => {
                8u8.serialize(writer)?;
                offset.serialize(writer)?;
            }
        }
        Ok(())
    }
}

/// One frame of the `StackMapTable`, already diffed against its predecessor
#[derive(Debug, Clone, PartialEq)]
pub enum StackMapFrame {
    /// Same locals as the previous frame, empty stack
    /// Tags: 0-63 and 251
    SameFrame { offset_delta: u16 },

    /// Same locals as the previous frame, exactly one stack item
    /// Tags: 64-127 and 247
    SameLocalsOneStack { offset_delta: u16, stack: TypeInfo },

    /// Previous frame's locals with the last `chopped_k` dropped, empty stack
    /// Tags: 248-250
    ChopFrame { offset_delta: u16, chopped_k: u8 },

    /// Previous frame's locals plus 1-3 extra, empty stack
    /// Tags: 252-254
    AppendFrame {
        offset_delta: u16,
        locals: Vec<TypeInfo>,
    },

    /// Frame has exactly the locals and stack specified
    /// Tag: 255
    FullFrame {
        offset_delta: u16,
        locals: Vec<TypeInfo>,
        stack: Vec<TypeInfo>,
    },
}

impl Serialize for StackMapFrame {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            // `same_frame` and `same_frame_extended`
            StackMapFrame::SameFrame { offset_delta } => {
                if *offset_delta <= 63 {
                    (*offset_delta as u8).serialize(writer)?;
                } else {
                    251u8.serialize(writer)?;
                    offset_delta.serialize(writer)?;
                }
            }

            // `same_locals_1_stack_item_frame` and its extended form
            StackMapFrame::SameLocalsOneStack {
                offset_delta,
                stack,
            } => {
                if *offset_delta <= 63 {
                    (*offset_delta as u8 + 64).serialize(writer)?;
                } else {
                    247u8.serialize(writer)?;
                    offset_delta.serialize(writer)?;
                }
                stack.serialize(writer)?;
            }

            // `chop_frame`
            StackMapFrame::ChopFrame {
                offset_delta,
                chopped_k,
            } => {
                debug_assert!(
                    0 < *chopped_k && *chopped_k < 4,
                    "chop_frame drops 1-3 locals"
                );
                (251 - chopped_k).serialize(writer)?;
                offset_delta.serialize(writer)?;
            }

            // `append_frame`
            StackMapFrame::AppendFrame {
                offset_delta,
                locals,
            } => {
                let added_k = locals.len();
                debug_assert!(0 < added_k && added_k < 4, "append_frame adds 1-3 locals");
                (251 + added_k as u8).serialize(writer)?;
                offset_delta.serialize(writer)?;
                for local in locals {
                    local.serialize(writer)?;
                }
            }

            // `full_frame`
            StackMapFrame::FullFrame {
                offset_delta,
                locals,
                stack,
            } => {
                255u8.serialize(writer)?;
                offset_delta.serialize(writer)?;
                locals.serialize(writer)?;
                stack.serialize(writer)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of<S: Serialize>(value: &S) -> Vec<u8> {
        let mut out = Vec::new();
        value.serialize(&mut out).unwrap();
        out
    }

    #[test]
    fn same_frame_tags() {
        assert_eq!(bytes_of(&StackMapFrame::SameFrame { offset_delta: 10 }), [10]);
        assert_eq!(
            bytes_of(&StackMapFrame::SameFrame { offset_delta: 70 }),
            [251, 0, 70],
        );
    }

    #[test]
    fn one_stack_item_tags() {
        assert_eq!(
            bytes_of(&StackMapFrame::SameLocalsOneStack {
                offset_delta: 10,
                stack: TypeInfo::Integer,
            }),
            [74, 1],
        );
        assert_eq!(
            bytes_of(&StackMapFrame::SameLocalsOneStack {
                offset_delta: 70,
                stack: TypeInfo::Object(3),
            }),
            [247, 0, 70, 7, 0, 3],
        );
    }

    #[test]
    fn chop_and_append_tags() {
        assert_eq!(
            bytes_of(&StackMapFrame::ChopFrame {
                offset_delta: 5,
                chopped_k: 1,
            }),
            [250, 0, 5],
        );
        assert_eq!(
            bytes_of(&StackMapFrame::AppendFrame {
                offset_delta: 5,
                locals: vec![TypeInfo::Long, TypeInfo::Float],
            }),
            [253, 0, 5, 4, 2],
        );
    }

    #[test]
    fn full_frame_layout() {
        assert_eq!(
            bytes_of(&StackMapFrame::FullFrame {
                offset_delta: 9,
                locals: vec![TypeInfo::Integer],
                stack: vec![TypeInfo::Uninitialized(4)],
            }),
            [255, 0, 9, 0, 1, 1, 0, 1, 8, 0, 4],
        );
    }

    #[test]
    fn attribute_length_is_four_bytes() {
        let attribute = Attribute {
            name_index: 7,
            info: vec![1, 2, 3],
        };
        assert_eq!(bytes_of(&attribute), [0, 7, 0, 0, 0, 3, 1, 2, 3]);
    }
}
