mod access_flags;
mod attribute;
mod class;
mod serialize;

pub use access_flags::*;
pub use attribute::*;
pub use class::*;
pub use serialize::*;
