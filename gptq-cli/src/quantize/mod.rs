//! Quantize a stacked SafeTensors model.

use anyhow::{Context, Result};
use candle_core::Device;
use gptq_engine::{GptqRunner, LayerStatus, QuantSummary, SafetensorsStore, StackedModel, StackedModelOptions, TensorStore};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use crate::common::{default_output_dir, load_calibration, load_config, require_safetensors_file};
use crate::config::{QuantizeConfig, QUANTIZE_CONFIG_NAME};

/// Packed model written in resident mode.
pub const MODEL_FILE: &str = "model.safetensors";
/// Per-layer files written in layer-wise mode.
pub const LAYERS_DIR: &str = "layers";
/// Per-layer summary.
pub const SUMMARY_FILE: &str = "quantization.json";

/// Write `quantize_config.json` for the block layers found in the model.
pub fn generate_config_template(model_path: &str) -> Result<()> {
    let path = Path::new(model_path);
    require_safetensors_file(path)?;
    let store = SafetensorsStore::open(path, default_output_dir(path).join(LAYERS_DIR))
        .with_context(|| format!("Failed to read model: {}", model_path))?;

    let names = store.names();
    println!("Found {} tensors", names.len());
    let config = QuantizeConfig::template(names.iter().map(String::as_str));
    for (pattern, layer) in config.run.weight_config.iter() {
        println!("  - {} (dtype: {}, bits: {}, group_size: {})", pattern, layer.dtype, layer.bits, layer.group_size);
    }

    fs::write(QUANTIZE_CONFIG_NAME, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("Failed to write {}", QUANTIZE_CONFIG_NAME))?;

    println!("\n=== Generated {} ===", QUANTIZE_CONFIG_NAME);
    println!("Layer patterns: {}", config.run.weight_config.len());
    println!("\nEdit the config, then run:");
    println!(
        "  gptq quantize --model {} --calibration <calibration.safetensors> --config {}",
        model_path, QUANTIZE_CONFIG_NAME
    );

    Ok(())
}

pub fn run(
    model_path: &str,
    calibration_path: Option<&str>,
    config_path: Option<&str>,
    output_path: Option<&str>,
    layer_wise: bool,
) -> Result<()> {
    let mut config: QuantizeConfig = load_config(config_path, QUANTIZE_CONFIG_NAME)?;
    config.run.layer_wise |= layer_wise;

    let calibration_path = calibration_path
        .ok_or_else(|| anyhow::anyhow!("--calibration is required to quantize"))?;

    let model_file = Path::new(model_path);
    require_safetensors_file(model_file)?;
    let output_dir = output_path
        .map(PathBuf::from)
        .unwrap_or_else(|| default_output_dir(model_file));
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    println!("Output: {}", output_dir.display());
    println!("Mode: {}", if config.run.layer_wise { "layer-wise" } else { "resident" });

    let store = SafetensorsStore::open(model_file, output_dir.join(LAYERS_DIR))
        .with_context(|| format!("Failed to read model: {}", model_path))?;
    let options = StackedModelOptions {
        eager: !config.run.layer_wise,
        ..config.model
    };
    let mut model = StackedModel::from_store(&store, options)
        .with_context(|| format!("Failed to assemble model from {}", model_path))?;
    println!("Blocks: {}", model.blocks().len());

    let samples = load_calibration(Path::new(calibration_path))?;
    println!("Calibration samples: {}", samples.len());

    let start = Instant::now();
    let summary = GptqRunner::new(&mut model, config.run.clone())
        .with_store(&store)
        .run(&samples)
        .context("Quantization failed")?;
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "run complete");

    print_layers(&summary);

    if config.run.layer_wise {
        let dense = export_dense_layers(&store, &summary)?;
        println!("Packed layers: {}", output_dir.join(LAYERS_DIR).display());
        println!("Dense tensor files: {}", dense);
    } else {
        let tensors = model.export_tensors().context("Failed to collect packed tensors")?;
        let model_out = output_dir.join(MODEL_FILE);
        candle_core::safetensors::save(&tensors, &model_out)
            .with_context(|| format!("Failed to write {}", model_out.display()))?;
        println!("Model: {} ({} tensors)", model_out.display(), tensors.len());
    }

    let summary_out = output_dir.join(SUMMARY_FILE);
    fs::write(&summary_out, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write {}", summary_out.display()))?;

    println!(
        "\n=== Quantization Complete: {} quantized, {} fallback, {} skipped ===",
        summary.count(LayerStatus::Quantized),
        summary.count(LayerStatus::Fallback),
        summary.count(LayerStatus::Skipped)
    );
    Ok(())
}

/// Copy every tensor group without a packed file into the layers directory.
///
/// Tensors are grouped by name prefix (`blocks.0.fc2.weight` -> `blocks.0.fc2`)
/// and written one file per group, so at most one layer is resident.
fn export_dense_layers(store: &SafetensorsStore, summary: &QuantSummary) -> Result<usize> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in store.names() {
        let prefix = name.rsplit_once('.').map_or(name.as_str(), |(prefix, _)| prefix).to_string();
        groups.entry(prefix).or_default().push(name);
    }

    let mut written = 0;
    for (prefix, names) in groups {
        let packed = summary
            .layers
            .get(&prefix)
            .is_some_and(|record| record.packed_path.is_some());
        if packed {
            continue;
        }
        let mut tensors = HashMap::with_capacity(names.len());
        for name in names {
            let tensor = store
                .load(&name, &Device::Cpu)
                .with_context(|| format!("Failed to read tensor: {}", name))?;
            tensors.insert(name, tensor);
        }
        store
            .save_tensors(&prefix, &tensors)
            .with_context(|| format!("Failed to write dense tensors for {}", prefix))?;
        written += 1;
    }
    Ok(written)
}

fn print_layers(summary: &QuantSummary) {
    let total = summary.layers.len();
    for (i, (name, record)) in summary.layers.iter().enumerate() {
        match (record.status, record.loss) {
            (LayerStatus::Skipped, _) | (_, None) => println!(
                "[{}/{}] {} -> skipped ({})",
                i + 1,
                total,
                name,
                record.reason.as_deref().unwrap_or("no reason recorded")
            ),
            (status, Some(loss)) => println!(
                "[{}/{}] {} -> {:?} (groups={}, loss={:.6}, {}ms)",
                i + 1,
                total,
                name,
                status,
                record.groups,
                loss,
                record.elapsed_ms
            ),
        }
    }
}
