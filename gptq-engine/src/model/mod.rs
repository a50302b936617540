//! Model-tree capabilities the orchestrator drives.
//!
//! A model is a short stack of embedding layers followed by a sequence of
//! structurally identical blocks. Blocks own named layers; layers expose their
//! weight for quantization and can be swapped atomically for a packed version.

mod block;
mod linear;
mod stacked;

use std::collections::BTreeMap;
use std::fmt;

use candle_core::Tensor;

use crate::error::Result;
use crate::pack::PackedLayer;
use crate::store::TensorStore;

pub use block::{Activation, SequentialBlock};
pub use linear::{Linear, PackedLinear};
pub use stacked::{StackedModel, StackedModelOptions};

/// Callback seeing `(layer name, layer input, layer output)` during a block forward.
pub type LayerObserver<'a> = dyn FnMut(&str, &Tensor, &Tensor) -> Result<()> + 'a;

/// A leaf layer with a weight matrix.
pub trait Layer: fmt::Debug + Send + Sync {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// `(out_features, in_features)` weight; fails while evicted.
    fn weight(&self) -> Result<&Tensor>;

    fn set_weight(&mut self, weight: Tensor) -> Result<()>;

    fn bias(&self) -> Option<&Tensor>;

    fn in_features(&self) -> usize;

    fn out_features(&self) -> usize;

    /// Whether the orchestrator should quantize this layer.
    fn is_quantizable(&self) -> bool;

    /// Load weights from `store` if they are not resident.
    fn materialize(&mut self, store: &dyn TensorStore) -> Result<()>;

    /// Drop resident weights.
    fn evict(&mut self);

    fn packed(&self) -> Option<&PackedLayer> {
        None
    }
}

/// Input to one block: hidden states plus named auxiliary tensors (masks and the like).
#[derive(Debug, Clone)]
pub struct BlockInput {
    pub hidden: Tensor,
    pub aux: BTreeMap<String, Tensor>,
}

impl BlockInput {
    pub fn new(hidden: Tensor) -> Self {
        Self {
            hidden,
            aux: BTreeMap::new(),
        }
    }

    /// Same auxiliary tensors, new hidden states.
    pub fn with_hidden(&self, hidden: Tensor) -> Self {
        Self {
            hidden,
            aux: self.aux.clone(),
        }
    }
}

/// One calibration example as fed to the model.
#[derive(Debug, Clone)]
pub struct CalibrationSample {
    pub input: Tensor,
    pub aux: BTreeMap<String, Tensor>,
}

impl CalibrationSample {
    pub fn new(input: Tensor) -> Self {
        Self {
            input,
            aux: BTreeMap::new(),
        }
    }
}

/// A repeated unit of the model holding named layers.
pub trait Block: Send + Sync {
    /// Layer names in execution order.
    fn children(&self) -> Vec<String>;

    fn layer(&self, name: &str) -> Option<&dyn Layer>;

    fn layer_mut(&mut self, name: &str) -> Option<&mut dyn Layer>;

    /// Swap `layer` in under `name`, returning the previous layer.
    fn replace_layer(&mut self, name: &str, layer: Box<dyn Layer>) -> Result<Box<dyn Layer>>;

    /// Run the block. The observer, if any, sees every child's input and output.
    fn forward(&self, input: &BlockInput, observer: Option<&mut LayerObserver<'_>>) -> Result<Tensor>;

    fn materialize(&mut self, store: &dyn TensorStore) -> Result<()> {
        for name in self.children() {
            if let Some(layer) = self.layer_mut(&name) {
                layer.materialize(store)?;
            }
        }
        Ok(())
    }

    fn evict(&mut self) {
        for name in self.children() {
            if let Some(layer) = self.layer_mut(&name) {
                layer.evict();
            }
        }
    }
}

/// A model made of embedding layers followed by a block sequence.
pub trait BlockModel: Send + Sync {
    /// Name prefix of the block container, e.g. `blocks`.
    fn blocks_name(&self) -> &str;

    fn num_blocks(&self) -> usize;

    fn block(&self, index: usize) -> Option<&dyn Block>;

    fn block_mut(&mut self, index: usize) -> Option<&mut dyn Block>;

    /// Names of the layers evaluated before the first block.
    fn embeddings(&self) -> Vec<String>;

    /// Evaluate only up to the first block and return its input.
    fn capture_block_inputs(&self, sample: &CalibrationSample) -> Result<BlockInput>;

    fn materialize_embeddings(&mut self, store: &dyn TensorStore) -> Result<()>;

    fn evict_embeddings(&mut self);
}

/// Names of the quantizable layers in `block`, in execution order.
pub fn find_layers(block: &dyn Block) -> Vec<String> {
    block
        .children()
        .into_iter()
        .filter(|name| block.layer(name).is_some_and(|layer| layer.is_quantizable()))
        .collect()
}
