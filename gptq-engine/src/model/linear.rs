use candle_core::{Device, Tensor};

use super::Layer;
use crate::error::{Error, Result};
use crate::pack::PackedLayer;
use crate::store::TensorStore;

/// Dense `y = x·Wᵀ + b`.
///
/// `name` is the tensor prefix (`{name}.weight`, `{name}.bias`) used when the
/// weights are streamed from a store.
#[derive(Debug, Clone)]
pub struct Linear {
    name: String,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    in_features: usize,
    out_features: usize,
    has_bias: bool,
}

impl Linear {
    pub fn new(name: impl Into<String>, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        if let Some(b) = &bias {
            if b.dims() != [out_features] {
                return Err(Error::ShapeMismatch {
                    what: "linear bias".to_string(),
                    expected: vec![out_features],
                    got: b.dims().to_vec(),
                });
            }
        }
        Ok(Self {
            name: name.into(),
            has_bias: bias.is_some(),
            weight: Some(weight),
            bias,
            in_features,
            out_features,
        })
    }

    /// A layer whose weights stay on disk until `materialize`.
    pub fn lazy(name: impl Into<String>, in_features: usize, out_features: usize, has_bias: bool) -> Self {
        Self {
            name: name.into(),
            weight: None,
            bias: None,
            in_features,
            out_features,
            has_bias,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_resident(&self) -> bool {
        self.weight.is_some()
    }
}

impl Layer for Linear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight()?.to_dtype(x.dtype())?;
        let y = x.broadcast_matmul(&w.t()?)?;
        match &self.bias {
            Some(b) => Ok(y.broadcast_add(&b.to_dtype(y.dtype())?)?),
            None => Ok(y),
        }
    }

    fn weight(&self) -> Result<&Tensor> {
        self.weight.as_ref().ok_or_else(|| Error::MissingTensor {
            name: format!("{}.weight", self.name),
        })
    }

    fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        if weight.dims() != [self.out_features, self.in_features] {
            return Err(Error::ShapeMismatch {
                what: format!("{}.weight", self.name),
                expected: vec![self.out_features, self.in_features],
                got: weight.dims().to_vec(),
            });
        }
        self.weight = Some(weight);
        Ok(())
    }

    fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }

    fn is_quantizable(&self) -> bool {
        true
    }

    fn materialize(&mut self, store: &dyn TensorStore) -> Result<()> {
        if self.weight.is_none() {
            let weight = store.load(&format!("{}.weight", self.name), &Device::Cpu)?;
            self.set_weight(weight)?;
        }
        if self.has_bias && self.bias.is_none() {
            self.bias = Some(store.load(&format!("{}.bias", self.name), &Device::Cpu)?);
        }
        Ok(())
    }

    fn evict(&mut self) {
        self.weight = None;
        if self.has_bias {
            self.bias = None;
        }
    }
}

/// Linear layer backed by packed low-bit weights.
///
/// Keeps a dequantized copy for `forward` while resident.
#[derive(Debug, Clone)]
pub struct PackedLinear {
    name: String,
    packed: PackedLayer,
    dequantized: Option<Tensor>,
}

impl PackedLinear {
    pub fn new(name: impl Into<String>, packed: PackedLayer) -> Result<Self> {
        let dequantized = packed.dequantize()?;
        Ok(Self {
            name: name.into(),
            packed,
            dequantized: Some(dequantized),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_packed(self) -> PackedLayer {
        self.packed
    }
}

impl Layer for PackedLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = match &self.dequantized {
            Some(w) => w.to_dtype(x.dtype())?,
            None => self.packed.dequantize()?.to_dtype(x.dtype())?,
        };
        let y = x.broadcast_matmul(&w.t()?)?;
        match &self.packed.bias {
            Some(b) => Ok(y.broadcast_add(&b.to_dtype(y.dtype())?)?),
            None => Ok(y),
        }
    }

    fn weight(&self) -> Result<&Tensor> {
        self.dequantized.as_ref().ok_or_else(|| Error::MissingTensor {
            name: format!("{}.weight", self.name),
        })
    }

    fn set_weight(&mut self, _weight: Tensor) -> Result<()> {
        Err(Error::Unsupported {
            reason: format!("'{}' is packed; its weight is read-only", self.name),
        })
    }

    fn bias(&self) -> Option<&Tensor> {
        self.packed.bias.as_ref()
    }

    fn in_features(&self) -> usize {
        self.packed.in_features
    }

    fn out_features(&self) -> usize {
        self.packed.out_features
    }

    fn is_quantizable(&self) -> bool {
        false
    }

    fn materialize(&mut self, _store: &dyn TensorStore) -> Result<()> {
        if self.dequantized.is_none() {
            self.dequantized = Some(self.packed.dequantize()?);
        }
        Ok(())
    }

    fn evict(&mut self) {
        self.dequantized = None;
    }

    fn packed(&self) -> Option<&PackedLayer> {
        Some(&self.packed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantConfig;
    use crate::gptq::quantize_rtn;
    use crate::pack::pack;
    use candle_core::DType;

    fn linear() -> Linear {
        let w = Tensor::new(&[[1.0f32, 0.0, 2.0], [0.0, -1.0, 1.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[0.5f32, -0.5], &Device::Cpu).unwrap();
        Linear::new("fc", w, Some(b)).unwrap()
    }

    #[test]
    fn test_linear_forward() {
        let layer = linear();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![7.5, 0.5]]);
    }

    #[test]
    fn test_linear_forward_rank3() {
        let layer = linear();
        let x = Tensor::ones((2, 4, 3), DType::F32, &Device::Cpu).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 4, 2]);
    }

    #[test]
    fn test_set_weight_checks_shape() {
        let mut layer = linear();
        assert!(layer.set_weight(Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap()).is_err());
        assert!(layer.set_weight(Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap()).is_ok());
    }

    #[test]
    fn test_bias_shape_checked() {
        let w = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        assert!(Linear::new("fc", w, Some(b)).is_err());
    }

    #[test]
    fn test_evicted_weight_unavailable() {
        let mut layer = linear();
        layer.evict();
        assert!(!layer.is_resident());
        assert!(layer.bias().is_none());
        assert!(matches!(layer.weight(), Err(Error::MissingTensor { .. })));
        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(layer.forward(&x).is_err());
    }

    #[test]
    fn test_packed_linear_matches_dequantized() {
        let layer = linear();
        let config = QuantConfig {
            bits: 8,
            group_size: None,
            ..Default::default()
        };
        let output = quantize_rtn(layer.weight().unwrap(), &config).unwrap();
        let packed = pack(&output.weight, &output.scale, &output.zero, layer.bias(), None, &config).unwrap();
        let mut packed_layer = PackedLinear::new("fc", packed).unwrap();

        assert!(!packed_layer.is_quantizable());
        assert!(packed_layer.packed().is_some());
        assert!(packed_layer.set_weight(output.weight.clone()).is_err());

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let before = packed_layer.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let dense = layer.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        for (a, b) in before[0].iter().zip(&dense[0]) {
            assert!((a - b).abs() < 0.05);
        }

        // evicted layers still compute from the packed codes
        packed_layer.evict();
        let after = packed_layer.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(before, after);
    }
}
