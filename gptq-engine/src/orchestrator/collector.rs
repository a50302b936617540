use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::hessian::HessianAccumulator;

/// Per-layer curvature accumulators for one block's calibration pass.
#[derive(Debug, Default)]
pub struct CalibrationCollector {
    accumulators: BTreeMap<String, HessianAccumulator>,
}

impl CalibrationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting for `layer_id` with `columns` input features.
    pub fn register(&mut self, layer_id: impl Into<String>, columns: usize) {
        self.accumulators.insert(layer_id.into(), HessianAccumulator::new(columns));
    }

    pub fn contains(&self, layer_id: &str) -> bool {
        self.accumulators.contains_key(layer_id)
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    /// Feed one calibration batch seen at `layer_id`. Only the input matters.
    pub fn accumulate(&mut self, layer_id: &str, input: &Tensor, _output: &Tensor) -> Result<()> {
        self.accumulators
            .get_mut(layer_id)
            .ok_or_else(|| Error::UnknownLayer {
                name: layer_id.to_string(),
            })?
            .add_batch(input)
    }

    /// Hand over a layer's accumulator, ending its collection.
    pub fn take(&mut self, layer_id: &str) -> Option<HessianAccumulator> {
        self.accumulators.remove(layer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_accumulate_registered_layer() {
        let mut collector = CalibrationCollector::new();
        collector.register("fc1", 4);
        assert!(collector.contains("fc1"));

        let x = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap();
        collector.accumulate("fc1", &x, &y).unwrap();
        collector.accumulate("fc1", &x, &y).unwrap();

        let hessian = collector.take("fc1").unwrap();
        assert_eq!(hessian.nsamples(), 6);
        assert!((hessian.matrix()[0] - 2.0).abs() < 1e-6);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_accumulate_unknown_layer() {
        let mut collector = CalibrationCollector::new();
        let x = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            collector.accumulate("fc9", &x, &x),
            Err(Error::UnknownLayer { .. })
        ));
    }

    #[test]
    fn test_accumulate_wrong_width() {
        let mut collector = CalibrationCollector::new();
        collector.register("fc1", 4);
        let x = Tensor::ones((1, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(collector.accumulate("fc1", &x, &x).is_err());
        assert_eq!(collector.len(), 1);
    }
}
