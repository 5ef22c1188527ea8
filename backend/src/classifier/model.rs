use ndarray::Array4;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::onnx::OnnxClassifier;

/// Tolerance used to decide whether a score vector is already a probability
/// distribution.
const DISTRIBUTION_EPSILON: f32 = 1e-3;

/// A loaded model that maps a `[1, 30, 30, 3]` batch to one score per class.
pub trait Classifier: Send + Sync {
    fn predict(&self, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Model file not found: {0}")]
    NotFound(PathBuf),
    #[error("Unsupported model format '{0}', expected .onnx or .pt")]
    UnsupportedFormat(String),
    #[error("TorchScript models require building with the `libtorch` feature")]
    TorchUnavailable,
    #[error("Failed to load model: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model error: {0}")]
    Model(String),
    #[error("Model returned {got} scores, expected {expected}")]
    OutputShape { expected: usize, got: usize },
    #[error("Model returned no finite scores")]
    NonFiniteOutput,
    #[error("Model lock poisoned")]
    Poisoned,
    #[error("Inference task was cancelled")]
    Cancelled,
}

pub enum ModelState {
    Loaded(Arc<dyn Classifier>),
    NotLoaded(LoadError),
}

impl std::fmt::Debug for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelState::Loaded(_) => f.write_str("Loaded"),
            ModelState::NotLoaded(e) => f.debug_tuple("NotLoaded").field(e).finish(),
        }
    }
}

/// Owns the single model of the process. Built once during startup and
/// shared read-only with the handlers afterwards; there is no reload.
#[derive(Debug)]
pub struct ModelHolder {
    path: PathBuf,
    state: ModelState,
}

impl ModelHolder {
    /// Loads the artifact at `path`. Never fails: a missing or broken artifact
    /// leaves the holder in `NotLoaded` and the service runs degraded.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match load_classifier(&path) {
            Ok(classifier) => {
                log::info!("Model loaded from {}", path.display());
                ModelState::Loaded(classifier)
            }
            Err(e) => {
                log::error!("Model unavailable ({}): {}", path.display(), e);
                ModelState::NotLoaded(e)
            }
        };
        Self { path, state }
    }

    #[cfg(test)]
    pub fn with_state(path: impl Into<PathBuf>, state: ModelState) -> Self {
        Self {
            path: path.into(),
            state,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, ModelState::Loaded(_))
    }

    pub fn load_error(&self) -> Option<&LoadError> {
        match &self.state {
            ModelState::Loaded(_) => None,
            ModelState::NotLoaded(e) => Some(e),
        }
    }

    pub fn classifier(&self) -> Result<Arc<dyn Classifier>, &LoadError> {
        match &self.state {
            ModelState::Loaded(classifier) => Ok(Arc::clone(classifier)),
            ModelState::NotLoaded(e) => Err(e),
        }
    }
}

fn load_classifier(path: &Path) -> Result<Arc<dyn Classifier>, LoadError> {
    if !path.is_file() {
        return Err(LoadError::NotFound(path.to_path_buf()));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "onnx" => Ok(Arc::new(OnnxClassifier::load(path)?)),
        "pt" | "ts" => load_torchscript(path),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

#[cfg(feature = "libtorch")]
fn load_torchscript(path: &Path) -> Result<Arc<dyn Classifier>, LoadError> {
    Ok(Arc::new(super::torch::TorchClassifier::load(path)?))
}

#[cfg(not(feature = "libtorch"))]
fn load_torchscript(_path: &Path) -> Result<Arc<dyn Classifier>, LoadError> {
    Err(LoadError::TorchUnavailable)
}

/// Returns the scores as probabilities. Outputs that already form a
/// distribution (a softmax head) pass through untouched, anything else is
/// treated as logits. Infinite logits share the whole mass evenly.
pub fn as_probabilities(scores: Vec<f32>) -> Vec<f32> {
    let sum: f32 = scores.iter().sum();
    let is_distribution = scores.iter().all(|s| (0.0..=1.0).contains(s))
        && (sum - 1.0).abs() <= DISTRIBUTION_EPSILON;
    if is_distribution {
        return scores;
    }

    let infinite = scores.iter().filter(|&&s| s == f32::INFINITY).count();
    if infinite > 0 {
        let share = 1.0 / infinite as f32;
        return scores
            .iter()
            .map(|&s| if s == f32::INFINITY { share } else { 0.0 })
            .collect();
    }

    let max = scores
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return scores;
    }
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f32 = exps.iter().filter(|e| e.is_finite()).sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Picks the winning class. Ties resolve to the lowest class id and
/// non-finite scores never win.
pub fn top_class(probabilities: &[f32], num_classes: usize) -> Result<(usize, f32), InferenceError> {
    if probabilities.len() != num_classes {
        return Err(InferenceError::OutputShape {
            expected: num_classes,
            got: probabilities.len(),
        });
    }

    let mut best: Option<(usize, f32)> = None;
    for (class_id, &p) in probabilities.iter().enumerate() {
        if !p.is_finite() {
            continue;
        }
        match best {
            Some((_, best_p)) if p <= best_p => {}
            _ => best = Some((class_id, p)),
        }
    }

    let (class_id, confidence) = best.ok_or(InferenceError::NonFiniteOutput)?;
    Ok((class_id, confidence.clamp(0.0, 1.0)))
}
