use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PredictionResponse {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub processing_time_ms: f64,
    /// First 8 hex characters of the SHA-256 of the uploaded bytes.
    pub file_hash: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthReport {
    pub status: ServiceStatus,
    pub model_loaded: bool,
    pub model_error: Option<String>,
    pub supported_formats: Vec<String>,
    pub max_file_size: usize,
    pub max_file_size_mb: f64,
    pub timestamp: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: details.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}
