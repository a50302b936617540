//! Common utilities shared between the quantize and inspect commands.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use gptq_engine::CalibrationSample;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Calibration tensor holding the stacked model inputs.
pub const CALIBRATION_INPUT: &str = "input";
/// Prefix of per-sample auxiliary calibration tensors.
pub const CALIBRATION_AUX_PREFIX: &str = "aux.";

/// Require a `.safetensors` file.
pub fn require_safetensors_file(path: &Path) -> Result<()> {
    if !path.is_file() {
        anyhow::bail!("Path does not exist: {}", path.display());
    }
    match path.extension().and_then(|s| s.to_str()) {
        Some("safetensors") => Ok(()),
        _ => anyhow::bail!("Expected .safetensors file, got: {}", path.display()),
    }
}

/// Load a JSON config file, requiring it to exist.
pub fn load_config<T: DeserializeOwned>(config_path: Option<&str>, config_name: &str) -> Result<T> {
    let path = config_path.ok_or_else(|| {
        anyhow::anyhow!("--config is required. Use --generate-config to create {}", config_name)
    })?;

    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path))?;

    serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse config: {}", path))
}

/// Default output directory: `<model stem>-gptq` next to the model.
pub fn default_output_dir(model_path: &Path) -> PathBuf {
    let stem = model_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    model_path.with_file_name(format!("{stem}-gptq"))
}

/// Split a calibration file into per-sample inputs.
///
/// `input` is `(n, seq, features)` or `(n, features)`; every `aux.{name}`
/// tensor must also have `n` as its leading dimension and is split alongside.
pub fn load_calibration(path: &Path) -> Result<Vec<CalibrationSample>> {
    require_safetensors_file(path)?;
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("Failed to read calibration file: {}", path.display()))?;
    split_calibration(tensors).with_context(|| format!("Invalid calibration file: {}", path.display()))
}

fn split_calibration(mut tensors: HashMap<String, Tensor>) -> Result<Vec<CalibrationSample>> {
    let input = tensors
        .remove(CALIBRATION_INPUT)
        .ok_or_else(|| anyhow::anyhow!("missing '{}' tensor", CALIBRATION_INPUT))?
        .to_dtype(DType::F32)?;

    let n = match input.rank() {
        2 | 3 => input.dim(0)?,
        rank => anyhow::bail!("'{}' must be 2-D or 3-D, got rank {}", CALIBRATION_INPUT, rank),
    };
    if n == 0 {
        anyhow::bail!("'{}' holds no samples", CALIBRATION_INPUT);
    }

    let mut aux = Vec::new();
    for (name, tensor) in tensors {
        let Some(key) = name.strip_prefix(CALIBRATION_AUX_PREFIX) else {
            continue;
        };
        if tensor.dims().first() != Some(&n) {
            anyhow::bail!("'{}' must have {} samples in its first dimension, got {:?}", name, n, tensor.dims());
        }
        aux.push((key.to_string(), tensor));
    }

    (0..n)
        .map(|i| -> Result<CalibrationSample> {
            // (n, features) keeps a row dimension per sample
            let sample_input = match input.rank() {
                2 => input.narrow(0, i, 1)?,
                _ => input.get(i)?,
            };
            let mut sample = CalibrationSample::new(sample_input);
            for (key, tensor) in &aux {
                sample.aux.insert(key.clone(), tensor.get(i)?);
            }
            Ok(sample)
        })
        .collect()
}
