mod frame;
mod types;

pub use frame::*;
pub use types::*;
