use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Activation, Block, BlockInput, BlockModel, CalibrationSample, Layer, Linear, SequentialBlock};
use crate::error::{Error, Result};
use crate::store::TensorStore;

const EMBED_PREFIX: &str = "embed";
const BLOCKS_NAME: &str = "blocks";

/// How a [`StackedModel`] is assembled from stored tensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackedModelOptions {
    /// Activation between consecutive layers of a block
    pub activation: Activation,
    /// Add the block input to its output when shapes match
    pub residual: bool,
    /// Load every weight up front (false: load per block on demand)
    pub eager: bool,
}

impl Default for StackedModelOptions {
    fn default() -> Self {
        Self {
            activation: Activation::Gelu,
            residual: true,
            eager: true,
        }
    }
}

/// Embedding layers followed by a stack of [`SequentialBlock`]s.
///
/// Tensor naming: `embed.{layer}.weight` for pre-block layers and
/// `blocks.{k}.{layer}.weight` (optional `.bias`) for block layers. Layers in
/// a block run in name order. Tensors that are not 2-D weights are ignored.
#[derive(Debug)]
pub struct StackedModel {
    embeddings: Vec<(String, Box<dyn Layer>)>,
    blocks: Vec<SequentialBlock>,
}

impl StackedModel {
    pub fn new(embeddings: Vec<(String, Box<dyn Layer>)>, blocks: Vec<SequentialBlock>) -> Self {
        Self { embeddings, blocks }
    }

    /// Build the layer tree from tensor names in `store`.
    pub fn from_store(store: &dyn TensorStore, options: StackedModelOptions) -> Result<Self> {
        let mut embeds: BTreeMap<String, Box<dyn Layer>> = BTreeMap::new();
        let mut blocks: BTreeMap<usize, BTreeMap<String, Box<dyn Layer>>> = BTreeMap::new();

        for name in store.names() {
            let Some(prefix) = name.strip_suffix(".weight") else {
                continue;
            };
            let shape = store.shape(&name)?;
            let [out_features, in_features] = shape[..] else {
                debug!(tensor = %name, ?shape, "skipping non-matrix weight");
                continue;
            };

            let has_bias = store.contains(&format!("{prefix}.bias"));
            let layer: Box<dyn Layer> = if options.eager {
                let weight = store.load(&name, &candle_core::Device::Cpu)?;
                let bias = if has_bias {
                    Some(store.load(&format!("{prefix}.bias"), &candle_core::Device::Cpu)?)
                } else {
                    None
                };
                Box::new(Linear::new(prefix, weight, bias)?)
            } else {
                Box::new(Linear::lazy(prefix, in_features, out_features, has_bias))
            };

            if prefix.starts_with(&format!("{EMBED_PREFIX}.")) {
                embeds.insert(prefix.to_string(), layer);
            } else if let Some((index, local)) = prefix
                .strip_prefix(&format!("{BLOCKS_NAME}."))
                .and_then(|rest| rest.split_once('.'))
                .and_then(|(k, local)| k.parse::<usize>().ok().map(|k| (k, local)))
            {
                blocks.entry(index).or_default().insert(local.to_string(), layer);
            } else {
                debug!(tensor = %name, "skipping tensor outside embed/blocks");
            }
        }

        let mut sequential = Vec::with_capacity(blocks.len());
        for (expected, (index, layers)) in blocks.into_iter().enumerate() {
            if index != expected {
                return Err(Error::MissingTensor {
                    name: format!("{BLOCKS_NAME}.{expected}"),
                });
            }
            sequential.push(SequentialBlock::new(
                layers.into_iter().collect(),
                options.activation,
                options.residual,
            ));
        }

        debug!(
            embeddings = embeds.len(),
            blocks = sequential.len(),
            eager = options.eager,
            "assembled stacked model"
        );
        Ok(Self::new(embeds.into_iter().collect(), sequential))
    }

    pub fn blocks(&self) -> &[SequentialBlock] {
        &self.blocks
    }

    /// Full forward pass for one sample.
    pub fn forward(&self, sample: &CalibrationSample) -> Result<Tensor> {
        let mut input = self.capture_block_inputs(sample)?;
        for block in &self.blocks {
            let hidden = block.forward(&input, None)?;
            input = input.with_hidden(hidden);
        }
        Ok(input.hidden)
    }

    /// Every layer's tensors under its full name; packed layers in packed form.
    pub fn export_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        let mut export = |name: &str, layer: &dyn Layer| -> Result<()> {
            if let Some(packed) = layer.packed() {
                tensors.extend(packed.to_tensors(name)?);
                return Ok(());
            }
            tensors.insert(format!("{name}.weight"), layer.weight()?.clone());
            if let Some(bias) = layer.bias() {
                tensors.insert(format!("{name}.bias"), bias.clone());
            }
            Ok(())
        };

        for (name, layer) in &self.embeddings {
            export(name.as_str(), layer.as_ref())?;
        }
        for (k, block) in self.blocks.iter().enumerate() {
            for name in block.children() {
                if let Some(layer) = block.layer(&name) {
                    export(format!("{BLOCKS_NAME}.{k}.{name}").as_str(), layer)?;
                }
            }
        }
        Ok(tensors)
    }
}

impl BlockModel for StackedModel {
    fn blocks_name(&self) -> &str {
        BLOCKS_NAME
    }

    fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn block(&self, index: usize) -> Option<&dyn Block> {
        self.blocks.get(index).map(|b| b as &dyn Block)
    }

    fn block_mut(&mut self, index: usize) -> Option<&mut dyn Block> {
        self.blocks.get_mut(index).map(|b| b as &mut dyn Block)
    }

    fn embeddings(&self) -> Vec<String> {
        self.embeddings.iter().map(|(name, _)| name.clone()).collect()
    }

    fn capture_block_inputs(&self, sample: &CalibrationSample) -> Result<BlockInput> {
        let mut hidden = sample.input.clone();
        for (_, layer) in &self.embeddings {
            hidden = layer.forward(&hidden)?;
        }
        Ok(BlockInput {
            hidden,
            aux: sample.aux.clone(),
        })
    }

    fn materialize_embeddings(&mut self, store: &dyn TensorStore) -> Result<()> {
        for (_, layer) in &mut self.embeddings {
            layer.materialize(store)?;
        }
        Ok(())
    }

    fn evict_embeddings(&mut self) {
        for (_, layer) in &mut self.embeddings {
            layer.evict();
        }
    }
}
