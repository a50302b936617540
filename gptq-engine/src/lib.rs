//! GPTQ Engine - Hessian-guided post-training weight quantization.
//!
//! Maps full-precision weight matrices to low-bit codes while compensating
//! each rounding decision's error into the columns not yet quantized, using
//! curvature accumulated from calibration activations.
//!
//! # Pieces
//! - [`Quantizer`]: per-row (or per-group) scale/zero search and the
//!   elementary quantize operation (integer grids, nf4/fp4 tables, trits)
//! - [`HessianAccumulator`]: running `2·E[xxᵀ]` over calibration inputs
//! - [`GptqSession`]: the blockwise error-compensating sweep for one layer
//! - [`pack`] / [`PackedLayer`]: bit-packed codes with scales, zeros and group index
//! - [`GptqRunner`]: drives all of the above block by block over a [`BlockModel`]
//! - [`SafetensorsStore`]: lazy tensor source for layer-wise runs
//!
//! # Usage
//! ```ignore
//! use gptq_engine::{GptqRunner, RunConfig, SafetensorsStore, StackedModel, StackedModelOptions};
//!
//! let store = SafetensorsStore::open("model.safetensors", "out/layers")?;
//! let mut model = StackedModel::from_store(&store, StackedModelOptions::default())?;
//! let summary = GptqRunner::new(&mut model, RunConfig::default()).run(&samples)?;
//! let tensors = model.export_tensors()?;
//! ```

pub mod config;
pub mod error;
pub mod gptq;
pub mod hessian;
pub mod linalg;
pub mod model;
pub mod orchestrator;
pub mod pack;
pub mod quant;
pub mod store;

// Re-exports
pub use config::{DoubleQuantConfig, LayerPattern, LayerQuantConfig, MseSearch, QuantConfig, WeightConfig, WeightDType};
pub use error::{Error, Result};
pub use gptq::{quantize_layer, quantize_rtn, GptqOutput, GptqSession};
pub use hessian::HessianAccumulator;
pub use model::{
    find_layers, Activation, Block, BlockInput, BlockModel, CalibrationSample, Layer, Linear, PackedLinear,
    SequentialBlock, StackedModel, StackedModelOptions,
};
pub use orchestrator::{
    CalibrationCollector, FallbackPolicy, GptqRunner, LayerRecord, LayerStatus, QuantSummary, RunConfig,
};
pub use pack::{pack, PackedLayer, UnpackedLayer};
pub use quant::{FloatFormat, Quantizer};
pub use store::{SafetensorsStore, TensorStore};
