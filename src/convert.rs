//! Checkpoint to safetensors conversion: validation, single-file and batch
//! flows, and the post-batch cleanup pass.

use crate::checkpoint::{load_checkpoint, Checkpoint, Entry};
use crate::errors::WeightsmithError;
use safetensors::tensor::TensorView;
use serde::Serialize;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Extension of the container this tool emits.
pub const SAFETENSORS_EXT: &str = "safetensors";
/// Extension batch mode scans for.
pub const CHECKPOINT_EXT: &str = "pth";
/// How many schema violations an error message spells out.
const VIOLATION_SAMPLE: usize = 3;

/// A successful per-file conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertOutcome {
    pub input: PathBuf,
    pub output: PathBuf,
    pub tensor_count: usize,
    pub bytes_written: u64,
}

/// A per-file failure, with the rendered reason.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of a batch run. One bad file never aborts the batch; it lands in
/// `failed` and the loop continues.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub converted: Vec<ConvertOutcome>,
    pub failed: Vec<FileFailure>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.converted.len() + self.failed.len()
    }
}

/// Outcome of the cleanup pass.
#[derive(Debug, Default, Serialize)]
pub struct DeleteOutcome {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<FileFailure>,
}

/// Every state-dict value must be a tensor. Violations are collected, not
/// raised on first hit, so one run reports every offending key (bounded
/// sample in the message, full count alongside).
pub fn validate(checkpoint: &Checkpoint) -> Result<(), WeightsmithError> {
    let mut sample = Vec::new();
    let mut total = 0usize;
    for (key, entry) in &checkpoint.entries {
        if let Entry::Other(type_name) = entry {
            total += 1;
            if sample.len() < VIOLATION_SAMPLE {
                sample.push(format!("`{}`: {}", key, type_name));
            }
        }
    }
    if total > 0 {
        return Err(WeightsmithError::NonTensorEntries { sample, total });
    }
    Ok(())
}

fn temp_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    output.with_file_name(name)
}

/// Serialize a validated checkpoint to `output`. Writes a temporary sibling
/// first and renames into place, so the output is either complete or absent.
pub fn write_safetensors(checkpoint: &Checkpoint, output: &Path) -> Result<(), WeightsmithError> {
    let mut views = Vec::with_capacity(checkpoint.len());
    for (key, tensor) in checkpoint.tensors() {
        views.push((
            key,
            TensorView::new(
                tensor.dtype.to_safetensors(),
                tensor.shape.clone(),
                &tensor.data,
            )?,
        ));
    }
    let tmp = temp_path(output);
    if let Err(err) = safetensors::serialize_to_file(views, &None, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    fs::rename(&tmp, output)?;
    Ok(())
}

/// Convert one checkpoint to a sibling safetensors file.
///
/// Fails without leaving a partial output; success means the output exists
/// and is non-empty.
pub fn convert_file(input: &Path) -> Result<ConvertOutcome, WeightsmithError> {
    let checkpoint = load_checkpoint(input)?;
    validate(&checkpoint)?;
    let output = input.with_extension(SAFETENSORS_EXT);
    write_safetensors(&checkpoint, &output)?;
    let written = fs::metadata(&output)?.len();
    if written == 0 {
        let _ = fs::remove_file(&output);
        return Err(WeightsmithError::InvalidFormat(format!(
            "{}: wrote an empty container",
            output.display()
        )));
    }
    Ok(ConvertOutcome {
        input: input.to_path_buf(),
        output,
        tensor_count: checkpoint.len(),
        bytes_written: written,
    })
}

/// `.pth` files directly inside `dir`, sorted for reproducible ordering.
pub fn scan_checkpoints(dir: &Path) -> Result<Vec<PathBuf>, WeightsmithError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == CHECKPOINT_EXT) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Convert a set of checkpoints, recovering per file.
pub fn convert_paths(files: &[PathBuf]) -> BatchReport {
    let mut report = BatchReport::default();
    for file in files {
        info!("processing {}", file.display());
        match convert_file(file) {
            Ok(outcome) => {
                info!(
                    "converted {} -> {} ({} tensors, {} bytes)",
                    outcome.input.display(),
                    outcome.output.display(),
                    outcome.tensor_count,
                    outcome.bytes_written
                );
                report.converted.push(outcome);
            }
            Err(err) => {
                warn!("skipping {}: {}", file.display(), err);
                report.failed.push(FileFailure {
                    path: file.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    report
}

/// Scan `dir` and convert everything found.
pub fn convert_dir(dir: &Path) -> Result<BatchReport, WeightsmithError> {
    Ok(convert_paths(&scan_checkpoints(dir)?))
}

/// Delete originals of successful conversions. Runs only over `converted`
/// entries, and re-checks that each output is still present and non-empty
/// before touching the input. Failures are collected; the loop continues.
pub fn delete_originals(report: &BatchReport) -> DeleteOutcome {
    let mut outcome = DeleteOutcome::default();
    for converted in &report.converted {
        match fs::metadata(&converted.output) {
            Ok(meta) if meta.len() > 0 => match fs::remove_file(&converted.input) {
                Ok(()) => outcome.deleted.push(converted.input.clone()),
                Err(err) => outcome.failed.push(FileFailure {
                    path: converted.input.clone(),
                    reason: err.to_string(),
                }),
            },
            _ => outcome.failed.push(FileFailure {
                path: converted.input.clone(),
                reason: format!(
                    "output {} missing or empty, keeping original",
                    converted.output.display()
                ),
            }),
        }
    }
    outcome
}

/// Interactive deletion gate: accepts only `y` or `n`, re-prompts otherwise.
/// A closed input stream cancels the run.
pub fn confirm_deletion(input: &mut impl BufRead) -> Result<bool, WeightsmithError> {
    loop {
        print!("Delete original .{} files? (y/n): ", CHECKPOINT_EXT);
        std::io::stdout().flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(WeightsmithError::Cancelled);
        }
        match line.trim().to_lowercase().as_str() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => println!("Please enter 'y' or 'n'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Dtype, TensorData};
    use std::io::Cursor;

    fn tensor_entry(n: usize) -> Entry {
        Entry::Tensor(TensorData::new(Dtype::F32, vec![n], vec![0u8; n * 4]).unwrap())
    }

    #[test]
    fn validate_accepts_all_tensors() {
        let checkpoint = Checkpoint {
            entries: vec![
                ("a".to_string(), tensor_entry(2)),
                ("b".to_string(), tensor_entry(3)),
            ],
        };
        assert!(validate(&checkpoint).is_ok());
    }

    #[test]
    fn validate_reports_bounded_sample() {
        let mut entries = vec![("w".to_string(), tensor_entry(1))];
        for i in 0..5 {
            entries.push((format!("meta{}", i), Entry::Other("int")));
        }
        let err = validate(&Checkpoint { entries }).unwrap_err();
        let WeightsmithError::NonTensorEntries { sample, total } = err else {
            panic!("expected NonTensorEntries");
        };
        assert_eq!(total, 5);
        assert_eq!(sample.len(), 3);
        assert!(sample[0].contains("meta0"));
    }

    #[test]
    fn temp_path_is_sibling() {
        let tmp = temp_path(Path::new("models/checkpoints/model.safetensors"));
        assert_eq!(
            tmp,
            Path::new("models/checkpoints/model.safetensors.tmp")
        );
    }

    #[test]
    fn write_and_reload_container() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("weights.safetensors");
        let payload: Vec<u8> = (0..16u8).collect();
        let checkpoint = Checkpoint {
            entries: vec![(
                "layer.weight".to_string(),
                Entry::Tensor(TensorData::new(Dtype::F32, vec![2, 2], payload.clone()).unwrap()),
            )],
        };
        write_safetensors(&checkpoint, &out).unwrap();

        let bytes = fs::read(&out).unwrap();
        let loaded = safetensors::SafeTensors::deserialize(&bytes).unwrap();
        let view = loaded.tensor("layer.weight").unwrap();
        assert_eq!(view.dtype(), safetensors::Dtype::F32);
        assert_eq!(view.shape(), &[2, 2]);
        assert_eq!(view.data(), payload.as_slice());
    }

    #[test]
    fn scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.pth"), b"x").unwrap();
        fs::write(dir.path().join("a.pth"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let files = scan_checkpoints(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.pth", "b.pth"]);
    }

    #[test]
    fn empty_dir_scans_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_checkpoints(dir.path()).unwrap().is_empty());
        let report = convert_dir(dir.path()).unwrap();
        assert_eq!(report.total(), 0);
    }

    #[test]
    fn delete_skips_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("model.pth");
        fs::write(&input, b"original").unwrap();
        let report = BatchReport {
            converted: vec![ConvertOutcome {
                input: input.clone(),
                output: dir.path().join("model.safetensors"), // never written
                tensor_count: 1,
                bytes_written: 10,
            }],
            failed: Vec::new(),
        };
        let outcome = delete_originals(&report);
        assert!(outcome.deleted.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert!(input.exists(), "original must survive a missing output");
    }

    #[test]
    fn confirm_accepts_only_y_or_n() {
        assert!(confirm_deletion(&mut Cursor::new(b"y\n".to_vec())).unwrap());
        assert!(!confirm_deletion(&mut Cursor::new(b"N\n".to_vec())).unwrap());
        // re-prompts past garbage until a clean answer
        assert!(confirm_deletion(&mut Cursor::new(b"maybe\nyes\ny\n".to_vec())).unwrap());
    }

    #[test]
    fn confirm_eof_cancels() {
        let err = confirm_deletion(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, WeightsmithError::Cancelled));
    }
}
