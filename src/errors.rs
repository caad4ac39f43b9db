//! Central error types for weightsmith.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeightsmithError {
    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Refusing to load `{module}.{name}`: only tensor data may be deserialized")]
    UnsafeGlobal { module: String, name: String },

    #[error("Non-tensor values in state dict ({total} total): {}", .sample.join("; "))]
    NonTensorEntries { sample: Vec<String>, total: usize },

    #[error("Unsupported tensor dtype: {0}")]
    UnsupportedDtype(String),

    #[error("{}: Git LFS pointer instead of real payload", .0.display())]
    LfsPointer(PathBuf),

    #[error("No file matching `{pattern}` in repository {repo}")]
    NoMatchingFile { repo: String, pattern: String },

    #[error("Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
