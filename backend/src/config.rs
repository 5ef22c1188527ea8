use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::limiter::RateLimit;
use crate::upload::UploadLimits;

/// Names an optional YAML file with any subset of the settings.
pub const CONFIG_FILE_ENV: &str = "SIGNLENS_CONFIG";

const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub max_file_size: usize,
    pub allowed_extensions: Vec<String>,
    /// `*` allows any origin.
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimit,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("model/traffic_sign_model.onnx"),
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: ["png", "jpg", "jpeg", "webp"].map(String::from).to_vec(),
            allowed_origins: vec!["*".to_string()],
            rate_limit: RateLimit::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the YAML file named by `SIGNLENS_CONFIG`, then
    /// environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_FILE_ENV) {
            Ok(path) => Self::from_yaml_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse_value("PORT", &port)?;
        }
        if let Some(size) = lookup("MAX_FILE_SIZE") {
            self.max_file_size = parse_value("MAX_FILE_SIZE", &size)?;
        }
        if let Some(extensions) = lookup("ALLOWED_EXTENSIONS") {
            self.allowed_extensions = split_list(&extensions);
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.allowed_origins = split_list(&origins);
        }
        if let Some(limit) = lookup("RATE_LIMIT") {
            self.rate_limit = parse_value("RATE_LIMIT", &limit)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.allowed_extensions = self
            .allowed_extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self.allowed_extensions.sort();
        self.allowed_extensions.dedup();

        if self.allowed_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ALLOWED_EXTENSIONS",
                value: String::new(),
            });
        }
        if self.max_file_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_FILE_SIZE",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits::new(self.max_file_size, self.allowed_extensions.iter().cloned())
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
