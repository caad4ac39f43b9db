//! # weightsmith
//!
//! Fetch pretrained model weights and convert legacy PyTorch checkpoints
//! into the safetensors container format.
//!
//! ## Architecture
//!
//! - **checkpoint**: restricted loader for the torch ZIP container — an
//!   allowlisted pickle machine over stored archive entries; unsafe globals
//!   fail the load instead of executing
//! - **tensor**: element types and owned row-major tensor payloads
//! - **convert**: tensor-only validation, safetensors writing (temp file +
//!   rename), batch flow with per-file recovery, gated cleanup of originals
//! - **fetch**: Hugging Face Hub retrieval with Git LFS pointer detection

pub mod checkpoint;
pub mod convert;
pub mod errors;
pub mod fetch;
pub mod tensor;

pub use checkpoint::{load_checkpoint, Checkpoint, Entry};
pub use convert::{
    confirm_deletion, convert_dir, convert_file, convert_paths, delete_originals,
    scan_checkpoints, validate, write_safetensors, BatchReport, ConvertOutcome, DeleteOutcome,
    FileFailure,
};
pub use errors::WeightsmithError;
pub use fetch::{build_api, fetch_file_matching, fetch_snapshot, list_repo_files, verify_payload};
pub use tensor::{contiguous_strides, Dtype, TensorData};
