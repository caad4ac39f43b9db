//! Legacy torch checkpoint loading behind a restricted deserializer.
//!
//! A `.pth` checkpoint is a ZIP archive holding a pickle stream (`data.pkl`)
//! plus one raw blob per tensor storage (`data/<key>`). Loading sniffs the
//! container, runs the allowlisted pickle machine, extracts the state dict,
//! and resolves every tensor against its storage blob with bounds checks.

pub mod archive;
pub mod pickle;

use self::archive::Archive;
use self::pickle::{Object, TensorSpec};
use crate::errors::WeightsmithError;
use crate::tensor::{contiguous_strides, TensorData};
use std::fs;
use std::path::Path;

/// Key under which training checkpoints conventionally nest their weights.
pub const STATE_DICT_KEY: &str = "state_dict";
const PICKLE_NAME: &str = "data.pkl";
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const PICKLE_PROTO_OPCODE: u8 = 0x80;

/// One state-dict entry: a resolved tensor, or anything else (kept only as a
/// type name so validation can report it).
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Tensor(TensorData),
    Other(&'static str),
}

/// A loaded checkpoint: insertion-ordered state-dict entries.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub entries: Vec<(String, Entry)>,
}

impl Checkpoint {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tensor entries only, in insertion order.
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &TensorData)> {
        self.entries.iter().filter_map(|(key, entry)| match entry {
            Entry::Tensor(tensor) => Some((key.as_str(), tensor)),
            Entry::Other(_) => None,
        })
    }
}

/// Load a `.pth` checkpoint. Only tensor data can come out of this: unsafe
/// pickle globals fail the load, and non-tensor values survive only as type
/// names for the validation report.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint, WeightsmithError> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    if data.len() < ZIP_MAGIC.len() {
        return Err(WeightsmithError::InvalidFormat(format!(
            "{}: file too short to be a checkpoint",
            path.display()
        )));
    }
    if data[..ZIP_MAGIC.len()] != ZIP_MAGIC {
        if data[0] == PICKLE_PROTO_OPCODE {
            return Err(WeightsmithError::InvalidFormat(format!(
                "{}: legacy (pre-1.6) torch stream; re-save the checkpoint with a current torch",
                path.display()
            )));
        }
        return Err(WeightsmithError::InvalidFormat(format!(
            "{}: not a torch checkpoint archive",
            path.display()
        )));
    }

    let archive = Archive::from_bytes(data)?;
    let pickle_entry = archive
        .find_suffix(PICKLE_NAME)
        .ok_or_else(|| {
            WeightsmithError::InvalidFormat(format!(
                "{}: archive holds no {}",
                path.display(),
                PICKLE_NAME
            ))
        })?
        .clone();
    // Storage blobs live next to the pickle: `<root>data/<key>`.
    let root = pickle_entry.name[..pickle_entry.name.len() - PICKLE_NAME.len()].to_string();

    let object = pickle::read_pickle(archive.read(&pickle_entry)?)?;
    let pairs = extract_state_dict(object)?;

    let mut entries = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let key = match key {
            Object::Str(key) => key,
            other => {
                return Err(WeightsmithError::InvalidFormat(format!(
                    "state dict key is {}, expected str",
                    other.type_name()
                )))
            }
        };
        let entry = match value {
            Object::Tensor(spec) => Entry::Tensor(resolve_tensor(&archive, &root, &key, spec)?),
            other => Entry::Other(other.type_name()),
        };
        entries.push((key, entry));
    }
    Ok(Checkpoint { entries })
}

/// The mapping to convert: a nested dict under `"state_dict"` when present,
/// otherwise the root dict itself.
fn extract_state_dict(object: Object) -> Result<Vec<(Object, Object)>, WeightsmithError> {
    let mut pairs = match object {
        Object::Dict(pairs) => pairs,
        other => {
            return Err(WeightsmithError::InvalidFormat(format!(
                "checkpoint root is {}, expected a mapping",
                other.type_name()
            )))
        }
    };
    let nested = pairs.iter().position(|(key, value)| {
        matches!((key, value), (Object::Str(s), Object::Dict(_)) if s == STATE_DICT_KEY)
    });
    if let Some(idx) = nested {
        match pairs.swap_remove(idx).1 {
            Object::Dict(inner) => Ok(inner),
            _ => unreachable!("position matched a dict value"),
        }
    } else {
        Ok(pairs)
    }
}

/// Materialize a tensor spec into contiguous row-major bytes.
fn resolve_tensor(
    archive: &Archive,
    root: &str,
    key: &str,
    spec: TensorSpec,
) -> Result<TensorData, WeightsmithError> {
    let dtype = spec.storage.dtype.ok_or_else(|| {
        WeightsmithError::UnsupportedDtype(format!("tensor {} uses an untyped storage", key))
    })?;
    let elem = dtype.size();
    let storage = archive.read_by_name(&format!("{}data/{}", root, spec.storage.key))?;
    let storage_elems = storage.len() / elem;
    let numel: usize = spec.shape.iter().product();

    if numel == 0 {
        return TensorData::new(dtype, spec.shape, Vec::new());
    }

    let offset = usize::try_from(spec.storage_offset).map_err(|_| {
        WeightsmithError::InvalidFormat(format!("tensor {}: storage offset overflow", key))
    })?;

    if spec.stride == contiguous_strides(&spec.shape) || numel == 1 {
        let end = offset.checked_add(numel).filter(|&end| end <= storage_elems);
        let Some(end) = end else {
            return Err(WeightsmithError::InvalidFormat(format!(
                "tensor {}: view of {} elements at offset {} exceeds storage of {}",
                key, numel, offset, storage_elems
            )));
        };
        return TensorData::new(dtype, spec.shape, storage[offset * elem..end * elem].to_vec());
    }

    // Non-contiguous view: gather element by element into row-major order.
    let mut data = Vec::with_capacity(numel * elem);
    let mut index = vec![0usize; spec.shape.len()];
    for _ in 0..numel {
        let src: usize = index
            .iter()
            .zip(&spec.stride)
            .map(|(i, s)| i * s)
            .sum::<usize>()
            + offset;
        if src >= storage_elems {
            return Err(WeightsmithError::InvalidFormat(format!(
                "tensor {}: strided element {} exceeds storage of {}",
                key, src, storage_elems
            )));
        }
        data.extend_from_slice(&storage[src * elem..(src + 1) * elem]);
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < spec.shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    TensorData::new(dtype, spec.shape, data)
}
