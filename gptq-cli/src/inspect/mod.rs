//! List packed layers in quantizer output.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use gptq_engine::pack::keys;
use gptq_engine::PackedLayer;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::require_safetensors_file;

/// Packed model file, or a directory of per-layer files.
fn discover_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let mut files: Vec<PathBuf> = fs::read_dir(path)
            .with_context(|| format!("Failed to read directory: {}", path.display()))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("safetensors"))
            .collect();
        if files.is_empty() {
            anyhow::bail!("No .safetensors files found in: {}", path.display());
        }
        files.sort_unstable();
        Ok(files)
    } else {
        require_safetensors_file(path)?;
        Ok(vec![path.to_path_buf()])
    }
}

/// Prefixes of all packed layers in `tensors`, sorted.
fn packed_prefixes(tensors: &HashMap<String, Tensor>) -> Vec<String> {
    let suffix = format!(".{}", keys::QMETA);
    let mut prefixes: Vec<String> = tensors
        .keys()
        .filter_map(|name| name.strip_suffix(suffix.as_str()))
        .map(str::to_string)
        .collect();
    prefixes.sort_unstable();
    prefixes
}

pub fn run(model_path: &str) -> Result<()> {
    let files = discover_files(Path::new(model_path))?;
    println!("Found {} safetensors file(s)", files.len());

    let mut tensors = HashMap::new();
    for file in &files {
        let loaded = candle_core::safetensors::load(file, &Device::Cpu)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        tensors.extend(loaded);
    }

    let prefixes = packed_prefixes(&tensors);
    for prefix in &prefixes {
        let layer = PackedLayer::from_tensors(prefix, &tensors)
            .with_context(|| format!("Malformed packed layer: {}", prefix))?;
        let group_size = layer
            .group_size
            .map_or_else(|| "row".to_string(), |g| g.to_string());
        println!(
            "  - {} [{}x{}] {:?} bits={} group_size={} groups={} sym={} act_order={} bias={}",
            prefix,
            layer.out_features,
            layer.in_features,
            layer.dtype,
            layer.bits,
            group_size,
            layer.n_groups(),
            layer.sym,
            layer.perm.is_some(),
            layer.bias.is_some()
        );
    }

    let packed_tensors = tensors
        .keys()
        .filter(|name| prefixes.iter().any(|p| name.starts_with(&format!("{p}."))))
        .count();
    println!(
        "\n=== {} packed layer(s), {} dense tensor(s) ===",
        prefixes.len(),
        tensors.len() - packed_tensors
    );
    Ok(())
}
