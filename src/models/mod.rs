pub mod batch;
pub mod block;

pub use batch::*;
pub use block::*;
