use ndarray::Array4;
use std::path::Path;
use std::sync::Mutex;
use tract_onnx::prelude::*;

use super::model::{Classifier, InferenceError, LoadError};
use super::preprocess::{INPUT_CHANNELS, INPUT_SIZE};

type OnnxPlan = TypedRunnableModel<TypedModel>;

/// ONNX model executed with tract. The input fact is pinned to the NHWC
/// shape produced by the preprocessor so the graph can be fully optimized.
pub struct OnnxClassifier {
    plan: Mutex<OnnxPlan>,
}

impl OnnxClassifier {
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let side = INPUT_SIZE as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, side, side, INPUT_CHANNELS)),
                )
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| LoadError::Backend(format!("{e:#}")))?;

        Ok(Self {
            plan: Mutex::new(plan),
        })
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let data = input
            .as_slice()
            .ok_or_else(|| InferenceError::Model("input batch is not contiguous".into()))?;
        let tensor = Tensor::from_shape(input.shape(), data)
            .map_err(|e| InferenceError::Model(format!("{e:#}")))?;

        let plan = self.plan.lock().map_err(|_| InferenceError::Poisoned)?;
        let outputs = plan
            .run(tvec!(tensor.into()))
            .map_err(|e| InferenceError::Model(format!("{e:#}")))?;

        let scores = outputs
            .first()
            .ok_or_else(|| InferenceError::Model("model produced no outputs".into()))?
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::Model(format!("{e:#}")))?;

        Ok(scores.iter().copied().collect())
    }
}
