mod insn;
mod offsets;

pub use insn::*;
pub use offsets::*;
