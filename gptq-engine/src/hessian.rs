//! Running curvature estimate `H ≈ 2·E[xxᵀ]` for one layer's inputs.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Accumulates `H` over calibration batches without keeping the batches.
///
/// Every row of an incoming batch (after flattening all leading dimensions)
/// counts as one sample, so splitting a batch into pieces gives the same `H`.
#[derive(Debug, Clone)]
pub struct HessianAccumulator {
    columns: usize,
    h: Vec<f32>,
    nsamples: usize,
}

impl HessianAccumulator {
    pub fn new(columns: usize) -> Self {
        Self {
            columns,
            h: vec![0.0; columns * columns],
            nsamples: 0,
        }
    }

    /// Wrap an existing row-major `columns × columns` matrix.
    pub fn from_matrix(columns: usize, h: Vec<f32>, nsamples: usize) -> Result<Self> {
        if h.len() != columns * columns {
            return Err(Error::ShapeMismatch {
                what: "curvature matrix".to_string(),
                expected: vec![columns, columns],
                got: vec![h.len()],
            });
        }
        Ok(Self { columns, h, nsamples })
    }

    /// Fold one activation batch `(..., columns)` into the running average.
    pub fn add_batch(&mut self, input: &Tensor) -> Result<()> {
        let last = input.dims().last().copied().unwrap_or(0);
        if last != self.columns {
            return Err(Error::ShapeMismatch {
                what: "calibration activations".to_string(),
                expected: vec![self.columns],
                got: input.dims().to_vec(),
            });
        }

        let inp = input
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .reshape(((), self.columns))?;
        let n = inp.dim(0)?;
        if n == 0 {
            return Ok(());
        }

        let total = self.nsamples + n;
        let keep = self.nsamples as f32 / total as f32;
        self.h.iter_mut().for_each(|v| *v *= keep);
        self.nsamples = total;

        let inp = inp.affine((2.0 / total as f64).sqrt(), 0.0)?;
        let outer = inp.t()?.contiguous()?.matmul(&inp)?;
        let outer = outer.flatten_all()?.to_vec1::<f32>()?;
        for (h, o) in self.h.iter_mut().zip(outer) {
            *h += o;
        }
        Ok(())
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Rows folded in so far.
    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    pub fn matrix(&self) -> &[f32] {
        &self.h
    }

    pub fn into_matrix(self) -> Vec<f32> {
        self.h
    }

    pub fn to_tensor(&self) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.h, (self.columns, self.columns), &Device::Cpu)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activations(rows: usize, cols: usize, offset: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|i| (((i + offset) as f32) * 0.731).sin() * 2.0)
            .collect()
    }

    #[test]
    fn test_split_batches_match_single_batch() {
        let data = activations(5, 8, 0);
        let mut whole = HessianAccumulator::new(8);
        whole
            .add_batch(&Tensor::from_slice(&data, (5, 8), &Device::Cpu).unwrap())
            .unwrap();

        let mut split = HessianAccumulator::new(8);
        split
            .add_batch(&Tensor::from_slice(&data[..16], (2, 8), &Device::Cpu).unwrap())
            .unwrap();
        split
            .add_batch(&Tensor::from_slice(&data[16..], (3, 8), &Device::Cpu).unwrap())
            .unwrap();

        assert_eq!(whole.nsamples(), 5);
        assert_eq!(split.nsamples(), 5);
        for (a, b) in whole.matrix().iter().zip(split.matrix()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_matches_closed_form() {
        let data = activations(4, 3, 7);
        let mut acc = HessianAccumulator::new(3);
        acc.add_batch(&Tensor::from_slice(&data, (4, 3), &Device::Cpu).unwrap())
            .unwrap();

        for i in 0..3 {
            for j in 0..3 {
                let expected: f32 = (0..4).map(|s| data[s * 3 + i] * data[s * 3 + j]).sum::<f32>() * 2.0 / 4.0;
                assert!((acc.matrix()[i * 3 + j] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_symmetric() {
        let data = activations(6, 5, 3);
        let mut acc = HessianAccumulator::new(5);
        acc.add_batch(&Tensor::from_slice(&data, (6, 5), &Device::Cpu).unwrap())
            .unwrap();
        let h = acc.matrix();
        for i in 0..5 {
            for j in 0..5 {
                assert!((h[i * 5 + j] - h[j * 5 + i]).abs() < 1e-5);
            }
            assert!(h[i * 5 + i] >= 0.0);
        }
    }

    #[test]
    fn test_leading_dims_flattened() {
        let data = activations(6, 4, 11);
        let mut flat = HessianAccumulator::new(4);
        flat.add_batch(&Tensor::from_slice(&data, (6, 4), &Device::Cpu).unwrap())
            .unwrap();

        let mut batched = HessianAccumulator::new(4);
        batched
            .add_batch(&Tensor::from_slice(&data, (2, 3, 4), &Device::Cpu).unwrap())
            .unwrap();

        assert_eq!(batched.nsamples(), 6);
        for (a, b) in flat.matrix().iter().zip(batched.matrix()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_wrong_width_rejected() {
        let mut acc = HessianAccumulator::new(4);
        let input = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(acc.add_batch(&input), Err(Error::ShapeMismatch { .. })));
        assert_eq!(acc.nsamples(), 0);
    }

    #[test]
    fn test_from_matrix_checks_size() {
        assert!(HessianAccumulator::from_matrix(3, vec![0.0; 8], 1).is_err());
        let acc = HessianAccumulator::from_matrix(2, vec![1.0, 0.0, 0.0, 1.0], 1).unwrap();
        assert_eq!(acc.to_tensor().unwrap().dims(), &[2, 2]);
    }
}
