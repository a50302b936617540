//! Tensor persistence for layer-wise quantization.
//!
//! `SafetensorsStore` reads only the SafeTensors header up front and pulls one
//! tensor's byte range from disk per `load`, so a model never has to be
//! resident as a whole. Packed layers go to a workspace directory, one
//! SafeTensors file per layer.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use safetensors::Dtype;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pack::PackedLayer;

/// Named tensor source plus a sink for packed layers.
pub trait TensorStore: Send + Sync {
    /// All tensor names, sorted.
    fn names(&self) -> Vec<String>;

    fn shape(&self, name: &str) -> Result<Vec<usize>>;

    /// Read one tensor onto `device` in its stored dtype.
    fn load(&self, name: &str, device: &Device) -> Result<Tensor>;

    /// Persist a packed layer; returns where it went.
    fn save_packed(&self, layer: &str, packed: &PackedLayer) -> Result<PathBuf>;

    /// Write named tensors to the workspace file `{file_stem}.safetensors`.
    fn save_tensors(&self, file_stem: &str, tensors: &HashMap<String, Tensor>) -> Result<PathBuf>;

    fn load_packed(&self, layer: &str, device: &Device) -> Result<PackedLayer>;

    fn contains(&self, name: &str) -> bool {
        self.shape(name).is_ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TensorEntry {
    dtype: Dtype,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

/// Lazily read SafeTensors file with a per-layer output workspace.
#[derive(Debug)]
pub struct SafetensorsStore {
    path: PathBuf,
    data_start: u64,
    entries: BTreeMap<String, TensorEntry>,
    workspace: PathBuf,
}

impl SafetensorsStore {
    /// Parse the header of `path`; packed layers are written under `workspace`.
    pub fn open(path: impl AsRef<Path>, workspace: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let header_len = u64::from_le_bytes(len_bytes);
        if header_len > file_len.saturating_sub(8) {
            return Err(Error::InvalidFormat {
                reason: format!("header length {header_len} exceeds file size {file_len}"),
            });
        }
        let header_bytes: usize = header_len.try_into().map_err(|_| Error::InvalidFormat {
            reason: format!("header length {header_len} does not fit in memory"),
        })?;

        let mut header = vec![0u8; header_bytes];
        file.read_exact(&mut header)?;
        let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&header)?;

        let mut entries = BTreeMap::new();
        for (name, value) in raw {
            if name == "__metadata__" {
                continue;
            }
            let entry: TensorEntry = serde_json::from_value(value)?;
            entries.insert(name, entry);
        }

        debug!(path = %path.display(), tensors = entries.len(), "opened tensor store");
        Ok(Self {
            path,
            data_start: 8 + header_len,
            entries,
            workspace: workspace.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn entry(&self, name: &str) -> Result<&TensorEntry> {
        self.entries.get(name).ok_or_else(|| Error::MissingTensor {
            name: name.to_string(),
        })
    }

    fn workspace_file(&self, stem: &str) -> PathBuf {
        self.workspace.join(format!("{stem}.safetensors"))
    }
}

impl TensorStore for SafetensorsStore {
    fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.entry(name)?.shape.clone())
    }

    fn load(&self, name: &str, device: &Device) -> Result<Tensor> {
        let entry = self.entry(name)?;
        let dtype = candle_dtype(entry.dtype)?;
        let (start, end) = entry.data_offsets;
        let count: usize = entry.shape.iter().product();
        let expected = count * dtype.size_in_bytes();
        if end < start || end - start != expected {
            return Err(Error::ShapeMismatch {
                what: format!("{name} bytes"),
                expected: vec![expected],
                got: vec![end.saturating_sub(start)],
            });
        }

        let mut data = vec![0u8; expected];
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.data_start + start as u64))?;
        file.read_exact(&mut data)?;

        Ok(Tensor::from_raw_buffer(&data, dtype, entry.shape.as_slice(), device)?)
    }

    fn save_packed(&self, layer: &str, packed: &PackedLayer) -> Result<PathBuf> {
        let path = self.save_tensors(layer, &packed.to_tensors(layer)?)?;
        debug!(layer, path = %path.display(), "saved packed layer");
        Ok(path)
    }

    fn save_tensors(&self, file_stem: &str, tensors: &HashMap<String, Tensor>) -> Result<PathBuf> {
        fs::create_dir_all(&self.workspace)?;
        let path = self.workspace_file(file_stem);
        candle_core::safetensors::save(tensors, &path)?;
        Ok(path)
    }

    fn load_packed(&self, layer: &str, device: &Device) -> Result<PackedLayer> {
        let path = self.workspace_file(layer);
        let tensors = candle_core::safetensors::load(&path, device)?;
        PackedLayer::from_tensors(layer, &tensors)
    }
}

/// Tensor dtype for a SafeTensors dtype.
pub fn candle_dtype(dtype: Dtype) -> Result<DType> {
    Ok(match dtype {
        Dtype::F32 => DType::F32,
        Dtype::F16 => DType::F16,
        Dtype::BF16 => DType::BF16,
        Dtype::F64 => DType::F64,
        Dtype::U8 => DType::U8,
        Dtype::U32 => DType::U32,
        Dtype::I64 => DType::I64,
        other => {
            return Err(Error::Unsupported {
                reason: format!("tensor dtype {other:?}"),
            })
        }
    })
}
