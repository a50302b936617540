//! Block-by-block driver.
//!
//! Calibration inputs are captured at the first block, then each block is
//! calibrated, quantized, packed and re-run so its (now quantized) outputs
//! become the next block's inputs. Only one block's activations are held.

mod collector;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use candle_core::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{LayerQuantConfig, QuantConfig, WeightConfig};
use crate::error::{Error, Result};
use crate::gptq::{quantize_rtn, GptqOutput, GptqSession};
use crate::hessian::HessianAccumulator;
use crate::model::{find_layers, Block, BlockInput, BlockModel, CalibrationSample, PackedLinear};
use crate::pack::{pack, PackedLayer};
use crate::store::TensorStore;

pub use collector::CalibrationCollector;

/// What to do with a layer whose quantization failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Keep the full-precision layer
    #[default]
    Skip,
    /// Round to nearest without error compensation
    RoundToNearest,
}

/// Settings for a whole-model run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Calibration samples to use (0 = all provided)
    pub nsamples: usize,
    /// Stream block weights from the store and evict after packing
    pub layer_wise: bool,
    /// Quantize the layers of a block concurrently
    pub parallel_layers: bool,
    pub fallback: FallbackPolicy,
    pub weight_config: WeightConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            nsamples: 128,
            layer_wise: false,
            parallel_layers: false,
            fallback: FallbackPolicy::Skip,
            weight_config: WeightConfig::all(LayerQuantConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    Quantized,
    Fallback,
    Skipped,
}

/// Outcome for one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub status: LayerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
    pub groups: usize,
    /// `(out_features, groups)` scales
    pub scale: Vec<Vec<f32>>,
    pub zero: Vec<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perm: Option<Vec<u32>>,
    /// Why the layer was skipped or fell back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Per-layer file written in layer-wise mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packed_path: Option<PathBuf>,
    pub elapsed_ms: u64,
}

impl LayerRecord {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: LayerStatus::Skipped,
            loss: None,
            groups: 0,
            scale: Vec::new(),
            zero: Vec::new(),
            perm: None,
            reason: Some(reason.into()),
            packed_path: None,
            elapsed_ms: 0,
        }
    }
}

/// Per-layer results of a run, keyed by full layer name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantSummary {
    pub blocks: usize,
    pub samples: usize,
    pub layers: BTreeMap<String, LayerRecord>,
}

impl QuantSummary {
    pub fn count(&self, status: LayerStatus) -> usize {
        self.layers.values().filter(|r| r.status == status).count()
    }

    pub fn total_loss(&self) -> f32 {
        self.layers.values().filter_map(|r| r.loss).sum()
    }
}

/// One layer's isolated quantization job.
struct LayerJob {
    name: String,
    config: QuantConfig,
    hessian: HessianAccumulator,
    weight: Tensor,
}

struct LayerResult {
    name: String,
    config: QuantConfig,
    weight: Tensor,
    output: Result<GptqOutput>,
    elapsed_ms: u64,
}

fn run_job(job: LayerJob) -> LayerResult {
    let start = Instant::now();
    let output = GptqSession::new(job.hessian, job.config).quantize(&job.weight);
    LayerResult {
        name: job.name,
        config: job.config,
        weight: job.weight,
        output,
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

fn pack_output(output: &GptqOutput, bias: Option<&Tensor>, config: &QuantConfig) -> Result<PackedLayer> {
    if !output.loss().is_finite() {
        return Err(Error::NonFinite {
            what: "quantization loss".to_string(),
        });
    }
    pack(&output.weight, &output.scale, &output.zero, bias, output.perm.as_deref(), config)
}

/// Group parameters recorded for an installed layer.
type InstalledLayer = (Vec<Vec<f32>>, Vec<Vec<f32>>, Option<PathBuf>);

/// Persist `packed` (when `store` is given) and swap it into `block`.
///
/// On error the block still holds the original layer.
fn install_packed(
    block: &mut dyn Block,
    local: &str,
    full: &str,
    output: &GptqOutput,
    packed: PackedLayer,
    store: Option<&dyn TensorStore>,
) -> Result<InstalledLayer> {
    let scale = output.scale.to_vec2::<f32>()?;
    let zero = output.zero.to_vec2::<f32>()?;
    let packed_path = store.map(|store| store.save_packed(full, &packed)).transpose()?;
    let replacement = PackedLinear::new(full, packed)?;
    block.replace_layer(local, Box::new(replacement))?;
    Ok((scale, zero, packed_path))
}

/// Quantizes a [`BlockModel`] in place.
pub struct GptqRunner<'a> {
    model: &'a mut dyn BlockModel,
    config: RunConfig,
    store: Option<&'a dyn TensorStore>,
}

impl<'a> GptqRunner<'a> {
    pub fn new(model: &'a mut dyn BlockModel, config: RunConfig) -> Self {
        Self {
            model,
            config,
            store: None,
        }
    }

    /// Store used for layer-wise loading and packed-layer output.
    pub fn with_store(mut self, store: &'a dyn TensorStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run(self, samples: &[CalibrationSample]) -> Result<QuantSummary> {
        let GptqRunner { model, config, store } = self;

        if samples.is_empty() {
            return Err(Error::InvalidConfig {
                field: "samples",
                reason: "at least one calibration sample is required".to_string(),
            });
        }
        let store = match (config.layer_wise, store) {
            (true, None) => {
                return Err(Error::InvalidConfig {
                    field: "layer_wise",
                    reason: "layer-wise mode needs a tensor store".to_string(),
                })
            }
            (_, store) => store,
        };
        let used = match config.nsamples {
            0 => samples.len(),
            n => n.min(samples.len()),
        };
        let samples = &samples[..used];

        if let (true, Some(store)) = (config.layer_wise, store) {
            model.materialize_embeddings(store)?;
        }
        let mut inputs = samples
            .iter()
            .map(|sample| model.capture_block_inputs(sample))
            .collect::<Result<Vec<BlockInput>>>()?;
        if config.layer_wise {
            model.evict_embeddings();
        }

        let blocks_name = model.blocks_name().to_string();
        let num_blocks = model.num_blocks();
        let mut summary = QuantSummary {
            blocks: num_blocks,
            samples: used,
            layers: BTreeMap::new(),
        };
        info!(blocks = num_blocks, samples = used, layer_wise = config.layer_wise, "starting quantization");

        for k in 0..num_blocks {
            let block_start = Instant::now();
            let block = model.block_mut(k).ok_or_else(|| Error::UnknownLayer {
                name: format!("{blocks_name}.{k}"),
            })?;
            if let (true, Some(store)) = (config.layer_wise, store) {
                block.materialize(store)?;
            }

            // select layers and open one accumulator each
            let mut collector = CalibrationCollector::new();
            let mut selected: BTreeMap<String, QuantConfig> = BTreeMap::new();
            for local in find_layers(&*block) {
                let full = format!("{blocks_name}.{k}.{local}");
                let Some(layer_config) = config.weight_config.lookup(&full) else {
                    warn!(layer = %full, "no quantization config, keeping full precision");
                    summary.layers.insert(full, LayerRecord::skipped("no matching quantization config"));
                    continue;
                };
                match layer_config.validate() {
                    Ok(quant_config) => {
                        let columns = block.layer(&local).map_or(0, |layer| layer.in_features());
                        collector.register(local.as_str(), columns);
                        selected.insert(local, quant_config);
                    }
                    Err(err) => {
                        warn!(layer = %full, error = %err, "invalid quantization config");
                        summary.layers.insert(full, LayerRecord::skipped(err.to_string()));
                    }
                }
            }

            // calibration pass on the still full-precision block
            let mut failed: BTreeMap<String, String> = BTreeMap::new();
            for input in &inputs {
                let mut observer = |name: &str, x: &Tensor, y: &Tensor| -> Result<()> {
                    if collector.contains(name) && !failed.contains_key(name) {
                        if let Err(err) = collector.accumulate(name, x, y) {
                            failed.insert(name.to_string(), err.to_string());
                        }
                    }
                    Ok(())
                };
                block.forward(input, Some(&mut observer))?;
            }

            let mut jobs = Vec::with_capacity(selected.len());
            for (name, quant_config) in selected {
                let full = format!("{blocks_name}.{k}.{name}");
                if let Some(reason) = failed.remove(&name) {
                    warn!(layer = %full, error = %reason, "calibration failed, keeping full precision");
                    summary.layers.insert(full, LayerRecord::skipped(reason));
                    continue;
                }
                let hessian = collector.take(&name).ok_or_else(|| Error::UnknownLayer { name: name.clone() })?;
                let weight = match block.layer(&name).map(|layer| layer.weight().cloned()) {
                    Some(Ok(weight)) => weight,
                    Some(Err(err)) => {
                        warn!(layer = %full, error = %err, "weight unavailable, keeping full precision");
                        summary.layers.insert(full, LayerRecord::skipped(err.to_string()));
                        continue;
                    }
                    None => return Err(Error::UnknownLayer { name }),
                };
                jobs.push(LayerJob {
                    weight,
                    name,
                    config: quant_config,
                    hessian,
                });
            }

            let results: Vec<LayerResult> = if config.parallel_layers {
                jobs.into_par_iter().map(run_job).collect()
            } else {
                jobs.into_iter().map(run_job).collect()
            };

            for result in results {
                let full = format!("{blocks_name}.{k}.{}", result.name);
                let bias = block.layer(&result.name).and_then(|layer| layer.bias().cloned());

                let packed = result
                    .output
                    .and_then(|output| pack_output(&output, bias.as_ref(), &result.config).map(|p| (output, p)));
                let (status, output, packed, reason) = match packed {
                    Ok((output, packed)) => (LayerStatus::Quantized, output, packed, None),
                    Err(err) => match config.fallback {
                        FallbackPolicy::Skip => {
                            warn!(layer = %full, error = %err, "quantization failed, keeping full precision");
                            summary.layers.insert(full, LayerRecord::skipped(err.to_string()));
                            continue;
                        }
                        FallbackPolicy::RoundToNearest => {
                            warn!(layer = %full, error = %err, "quantization failed, falling back to round-to-nearest");
                            let rtn = quantize_rtn(&result.weight, &result.config).and_then(|output| {
                                pack_output(&output, bias.as_ref(), &result.config).map(|p| (output, p))
                            });
                            match rtn {
                                Ok((output, packed)) => (LayerStatus::Fallback, output, packed, Some(err.to_string())),
                                Err(rtn_err) => {
                                    warn!(layer = %full, error = %rtn_err, "round-to-nearest failed too");
                                    summary
                                        .layers
                                        .insert(full, LayerRecord::skipped(format!("{err}; fallback: {rtn_err}")));
                                    continue;
                                }
                            }
                        }
                    },
                };

                let groups = packed.n_groups();
                let layer_store = store.filter(|_| config.layer_wise);
                let (scale, zero, packed_path) =
                    match install_packed(&mut *block, &result.name, &full, &output, packed, layer_store) {
                        Ok(installed) => installed,
                        Err(err) => {
                            warn!(layer = %full, error = %err, "could not install packed layer, keeping full precision");
                            summary.layers.insert(full, LayerRecord::skipped(err.to_string()));
                            continue;
                        }
                    };

                debug!(
                    layer = %full,
                    loss = output.loss(),
                    dead_columns = output.dead_columns,
                    elapsed_ms = result.elapsed_ms,
                    "layer packed"
                );
                summary.layers.insert(
                    full,
                    LayerRecord {
                        status,
                        loss: Some(output.loss()),
                        groups,
                        scale,
                        zero,
                        perm: output.perm,
                        reason,
                        packed_path,
                        elapsed_ms: result.elapsed_ms,
                    },
                );
            }

            // quantized outputs feed the next block
            for input in inputs.iter_mut() {
                let hidden = block.forward(input, None)?;
                *input = input.with_hidden(hidden);
            }
            if config.layer_wise {
                block.evict();
                debug!(block = k, "evicted block weights");
            }
            info!(block = k, elapsed_ms = block_start.elapsed().as_millis() as u64, "block quantized");
        }

        info!(
            quantized = summary.count(LayerStatus::Quantized),
            fallback = summary.count(LayerStatus::Fallback),
            skipped = summary.count(LayerStatus::Skipped),
            "quantization finished"
        );
        Ok(summary)
    }
}
