pub mod labels;
pub mod model;
pub mod onnx;
pub mod preprocess;
#[cfg(feature = "libtorch")]
pub mod torch;

pub use labels::ClassLabels;
pub use model::{Classifier, InferenceError, ModelHolder};
