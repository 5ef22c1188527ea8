use ndarray::Array4;
use std::path::Path;
use std::sync::Mutex;
use tch::{CModule, Device, Kind, Tensor, nn::ModuleT};

use super::model::{Classifier, InferenceError, LoadError};

/// TorchScript model executed through libtorch. Only built with the
/// `libtorch` feature.
pub struct TorchClassifier {
    module: Mutex<CModule>,
    device: Device,
}

impl TorchClassifier {
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(path, device)
            .map_err(|e| LoadError::Backend(e.to_string()))?;
        log::info!("TorchScript model placed on {:?}", device);
        Ok(Self {
            module: Mutex::new(module),
            device,
        })
    }
}

impl Classifier for TorchClassifier {
    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let data = input
            .as_slice()
            .ok_or_else(|| InferenceError::Model("input batch is not contiguous".into()))?;
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let tensor = Tensor::from_slice(data).view(shape.as_slice()).to_device(self.device);

        let output = {
            let module = self.module.lock().map_err(|_| InferenceError::Poisoned)?;
            module.forward_t(&tensor, false)
        };

        let output_flat = output.to_kind(Kind::Float).to_device(Device::Cpu).view([-1]);
        let num_elements = output_flat.size()[0] as usize;
        let mut scores = vec![0.0f32; num_elements];
        output_flat.copy_data(&mut scores, num_elements);
        Ok(scores)
    }
}
