use std::env;
use std::str::FromStr;

use anyhow::Context;

use crate::preprocess::{InputLayout, InputScaling};

const DEFAULT_LABELS_URL: &str =
    "https://storage.googleapis.com/download.tensorflow.org/data/imagenet_class_index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn from_env() -> Self {
        Self::parse(&env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()))
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub bind_address: String,
    pub allowed_origin: String,
    pub model_path: String,
    pub model_url: Option<String>,
    pub labels_path: String,
    pub labels_url: Option<String>,
    pub input_size: u32,
    pub input_layout: InputLayout,
    pub input_scaling: InputScaling,
    pub apply_softmax: bool,
    pub top_k: usize,
    pub max_upload_bytes: usize,
    pub workers: Option<usize>,
}

impl AppConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// A variable that is set but cannot be parsed is an error rather than
    /// falling back to the default.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            environment: Environment::from_env(),
            bind_address: var_or("BIND_ADDRESS", "127.0.0.1:5000"),
            allowed_origin: var_or("ALLOWED_ORIGIN", "http://localhost:5173"),
            model_path: var_or("MODEL_PATH", "models/mobilenet_v3_large.onnx"),
            model_url: non_empty_var("MODEL_URL"),
            labels_path: var_or("LABELS_PATH", "models/imagenet_class_index.json"),
            labels_url: match env::var("LABELS_URL") {
                Ok(url) if url.is_empty() => None,
                Ok(url) => Some(url),
                Err(_) => Some(DEFAULT_LABELS_URL.to_string()),
            },
            input_size: parse_var("INPUT_SIZE", 224)?,
            input_layout: parse_var("INPUT_LAYOUT", InputLayout::Nhwc)?,
            input_scaling: parse_var("INPUT_SCALING", InputScaling::Raw)?,
            apply_softmax: parse_var("APPLY_SOFTMAX", false)?,
            top_k: parse_var("TOP_K", 5)?,
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", 16 * 1024 * 1024)?,
            workers: non_empty_var("WORKERS")
                .map(|s| s.parse().context("invalid WORKERS"))
                .transpose()?,
        })
    }

    /// Create default configuration for testing
    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            environment: Environment::Development,
            bind_address: "127.0.0.1:0".to_string(),
            allowed_origin: "http://localhost:5173".to_string(),
            model_path: "models/model.onnx".to_string(),
            model_url: None,
            labels_path: "models/labels.json".to_string(),
            labels_url: None,
            input_size: 224,
            input_layout: InputLayout::Nhwc,
            input_scaling: InputScaling::Raw,
            apply_softmax: false,
            top_k: 5,
            max_upload_bytes: 16 * 1024 * 1024,
            workers: None,
        }
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
        None => Ok(default),
    }
}
