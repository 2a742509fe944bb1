pub mod extract;
pub mod transform;

pub use extract::ExtractStage;
pub use transform::TransformStage;
