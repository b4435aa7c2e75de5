//! Emit JVM class files from a structured program description.
//!
//! The interesting work is the metadata the format demands but callers never
//! write by hand: an interning constant pool, `StackMapTable` frames derived
//! by abstract interpretation of the operand stack and locals, and branch
//! offsets resolved by a fixed-point widening pass (`goto`/`jsr` sizing and
//! switch padding depend on each other).
//!
//! A method body is an [`code::Insn`] tree fed through
//! [`class_file::MethodAssembler`]; the finished [`class_file::ClassFile`]
//! serializes to the exact class-file byte layout.

pub mod class_file;
pub mod code;
pub mod descriptor;
pub mod errors;
pub mod pool;
pub mod verifier;
