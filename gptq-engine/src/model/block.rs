use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::{Block, BlockInput, Layer, LayerObserver};
use crate::error::{Error, Result};

/// Nonlinearity applied between consecutive layers of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    #[default]
    Gelu,
    Silu,
    Identity,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Relu => x.relu()?,
            Self::Gelu => x.gelu()?,
            Self::Silu => x.silu()?,
            Self::Identity => x.clone(),
        })
    }
}

/// Chain of linear layers with an activation in between.
///
/// If the output has the input's shape and `residual` is set, the block input
/// is added back. An auxiliary `mask` tensor, when present, is multiplied into
/// the output before the residual.
#[derive(Debug)]
pub struct SequentialBlock {
    layers: Vec<(String, Box<dyn Layer>)>,
    activation: Activation,
    residual: bool,
}

impl SequentialBlock {
    pub fn new(layers: Vec<(String, Box<dyn Layer>)>, activation: Activation, residual: bool) -> Self {
        Self {
            layers,
            activation,
            residual,
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|(n, _)| n == name)
    }
}

impl Block for SequentialBlock {
    fn children(&self) -> Vec<String> {
        self.layers.iter().map(|(name, _)| name.clone()).collect()
    }

    fn layer(&self, name: &str) -> Option<&dyn Layer> {
        self.position(name).map(|i| self.layers[i].1.as_ref())
    }

    fn layer_mut(&mut self, name: &str) -> Option<&mut dyn Layer> {
        let i = self.position(name)?;
        Some(self.layers[i].1.as_mut())
    }

    fn replace_layer(&mut self, name: &str, layer: Box<dyn Layer>) -> Result<Box<dyn Layer>> {
        let i = self.position(name).ok_or_else(|| Error::UnknownLayer {
            name: name.to_string(),
        })?;
        let current = &self.layers[i].1;
        if current.in_features() != layer.in_features() || current.out_features() != layer.out_features() {
            return Err(Error::ShapeMismatch {
                what: format!("replacement for '{name}'"),
                expected: vec![current.out_features(), current.in_features()],
                got: vec![layer.out_features(), layer.in_features()],
            });
        }
        Ok(std::mem::replace(&mut self.layers[i].1, layer))
    }

    fn forward(&self, input: &BlockInput, mut observer: Option<&mut LayerObserver<'_>>) -> Result<Tensor> {
        let mut x = input.hidden.clone();
        let last = self.layers.len().saturating_sub(1);

        for (i, (name, layer)) in self.layers.iter().enumerate() {
            let y = layer.forward(&x)?;
            if let Some(observe) = observer.as_deref_mut() {
                observe(name.as_str(), &x, &y)?;
            }
            x = if i < last { self.activation.apply(&y)? } else { y };
        }

        if let Some(mask) = input.aux.get("mask") {
            x = x.broadcast_mul(&mask.to_dtype(x.dtype())?)?;
        }
        if self.residual && x.dims() == input.hidden.dims() {
            x = (x + &input.hidden)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{find_layers, Linear};
    use candle_core::{DType, Device};

    fn block(residual: bool) -> SequentialBlock {
        let fc1 = Tensor::new(&[[1.0f32, -1.0], [0.5, 0.5], [0.0, 2.0]], &Device::Cpu).unwrap();
        let fc2 = Tensor::new(&[[1.0f32, 1.0, 1.0], [0.0, -1.0, 0.0]], &Device::Cpu).unwrap();
        SequentialBlock::new(
            vec![
                ("fc1".to_string(), Box::new(Linear::new("blocks.0.fc1", fc1, None).unwrap()) as Box<dyn Layer>),
                ("fc2".to_string(), Box::new(Linear::new("blocks.0.fc2", fc2, None).unwrap())),
            ],
            Activation::Relu,
            residual,
        )
    }

    #[test]
    fn test_forward_with_activation() {
        let b = block(false);
        let x = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        // fc1: [-1, 1.5, 4] -> relu [0, 1.5, 4] -> fc2: [5.5, -1.5]
        let y = b.forward(&BlockInput::new(x), None).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![5.5, -1.5]]);
    }

    #[test]
    fn test_residual_and_mask() {
        let b = block(true);
        let x = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let y = b.forward(&BlockInput::new(x.clone()), None).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![6.5, 0.5]]);

        let mut input = BlockInput::new(x);
        input
            .aux
            .insert("mask".to_string(), Tensor::new(&[0.0f32, 1.0], &Device::Cpu).unwrap());
        let y = b.forward(&input, None).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![1.0, 0.5]]);
    }

    #[test]
    fn test_observer_sees_every_layer() {
        let b = block(false);
        let x = Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap();
        let mut seen = Vec::new();
        let mut observer = |name: &str, input: &Tensor, output: &Tensor| -> Result<()> {
            seen.push((name.to_string(), input.dims().to_vec(), output.dims().to_vec()));
            Ok(())
        };
        b.forward(&BlockInput::new(x), Some(&mut observer)).unwrap();

        assert_eq!(
            seen,
            vec![
                ("fc1".to_string(), vec![3, 2], vec![3, 3]),
                ("fc2".to_string(), vec![3, 3], vec![3, 2]),
            ]
        );
    }

    #[test]
    fn test_observer_error_aborts_forward() {
        let b = block(false);
        let x = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
        let mut observer = |name: &str, _: &Tensor, _: &Tensor| -> Result<()> {
            Err(Error::UnknownLayer { name: name.to_string() })
        };
        assert!(b.forward(&BlockInput::new(x), Some(&mut observer)).is_err());
    }

    #[test]
    fn test_replace_layer() {
        let mut b = block(false);
        assert_eq!(find_layers(&b), vec!["fc1", "fc2"]);

        let replacement = Linear::new("blocks.0.fc2", Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(), None).unwrap();
        let old = b.replace_layer("fc2", Box::new(replacement)).unwrap();
        assert_eq!(old.out_features(), 2);

        let x = Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let y = b.forward(&BlockInput::new(x), None).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn test_replace_layer_rejects_bad_shape_and_name() {
        let mut b = block(false);
        let wrong = Linear::new("x", Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap(), None).unwrap();
        assert!(b.replace_layer("fc2", Box::new(wrong.clone())).is_err());
        assert!(matches!(
            b.replace_layer("fc9", Box::new(wrong)),
            Err(Error::UnknownLayer { .. })
        ));
        // the original stays in place
        assert_eq!(b.layer("fc2").unwrap().in_features(), 3);
    }

    #[test]
    fn test_evict_drops_weights() {
        let mut b = block(false);
        b.evict();
        assert!(b.layer("fc1").unwrap().weight().is_err());
    }
}
