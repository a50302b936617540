//! Hessian-guided blockwise weight quantization.
//!
//! Columns are quantized left to right. Each column's rounding error is scaled
//! by the inverse-curvature factor and pushed into the columns that have not
//! been quantized yet: inside the current block one column at a time, and into
//! later blocks once per block.
//!
//! # Usage
//! ```ignore
//! let mut hessian = HessianAccumulator::new(in_features);
//! for batch in calibration {
//!     hessian.add_batch(&batch)?;
//! }
//! let output = quantize_layer(&weight, hessian, &config)?;
//! let packed = pack(&output.weight, &output.scale, &output.zero, bias, output.perm.as_deref(), &config)?;
//! ```


use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;
use tracing::debug;

use crate::config::QuantConfig;
use crate::error::{Error, Result};
use crate::hessian::HessianAccumulator;
use crate::linalg::inverse_cholesky_factor;
use crate::quant::Quantizer;

/// Result of quantizing one weight matrix.
#[derive(Debug, Clone)]
pub struct GptqOutput {
    /// Fake-quantized weight, same shape, dtype and device as the input
    pub weight: Tensor,
    /// `(rows, n_groups)` f32 scales; group columns follow quantization order
    pub scale: Tensor,
    /// `(rows, n_groups)` f32 zero points
    pub zero: Tensor,
    /// Column order used for quantization (act-order only)
    pub perm: Option<Vec<u32>>,
    /// Half the curvature-weighted squared error, per block
    pub block_losses: Vec<f32>,
    /// Input columns with no calibration signal
    pub dead_columns: usize,
}

impl GptqOutput {
    /// Total loss across blocks.
    pub fn loss(&self) -> f32 {
        self.block_losses.iter().sum()
    }
}

/// One layer's weight, curvature and settings.
///
/// Consumed by [`GptqSession::quantize`] so the curvature buffer never
/// outlives the layer it belongs to.
#[derive(Debug)]
pub struct GptqSession {
    hessian: HessianAccumulator,
    config: QuantConfig,
}

impl GptqSession {
    pub fn new(hessian: HessianAccumulator, config: QuantConfig) -> Self {
        Self { hessian, config }
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    pub fn quantize(self, weight: &Tensor) -> Result<GptqOutput> {
        let start = Instant::now();
        let config = self.config;
        let shaped = DenseWeight::from_tensor(weight)?;
        let (rows, cols) = (shaped.rows, shaped.cols);

        if self.hessian.columns() != cols {
            return Err(Error::ShapeMismatch {
                what: "curvature matrix".to_string(),
                expected: vec![cols, cols],
                got: vec![self.hessian.columns(), self.hessian.columns()],
            });
        }

        let mut w = shaped.data.clone();
        let mut h = self.hessian.into_matrix();

        // dead inputs: unit curvature, zero weight
        let mut dead_columns = 0;
        for j in 0..cols {
            if h[j * cols + j] == 0.0 {
                h[j * cols + j] = 1.0;
                for r in 0..rows {
                    w[r * cols + j] = 0.0;
                }
                dead_columns += 1;
            }
        }

        let mut quantizer = Quantizer::new(config);
        quantizer.find_params(&w, (rows, cols), true)?;

        let static_groups = match config.group_size {
            Some(g) if config.static_groups => {
                let mut groups = Vec::with_capacity(cols.div_ceil(g));
                for start in (0..cols).step_by(g) {
                    let end = (start + g).min(cols);
                    let mut group = Quantizer::new(config);
                    group.find_params(&column_slice(&w, rows, cols, start, end), (rows, end - start), true)?;
                    groups.push(group);
                }
                Some(groups)
            }
            _ => None,
        };

        let perm = if config.act_order {
            let mut perm: Vec<usize> = (0..cols).collect();
            perm.sort_by(|&a, &b| h[b * cols + b].total_cmp(&h[a * cols + a]));
            w = permute_columns(&w, rows, cols, &perm);
            h = permute_symmetric(&h, cols, &perm);
            Some(perm)
        } else {
            None
        };

        let mean_diag = (0..cols).map(|j| h[j * cols + j]).sum::<f32>() / cols as f32;
        let damp = config.percdamp * mean_diag;
        for j in 0..cols {
            h[j * cols + j] += damp;
        }

        let hinv = inverse_cholesky_factor(&h, cols)?;
        drop(h);

        let mut q = vec![0.0f32; rows * cols];
        let mut block_losses = Vec::with_capacity(cols.div_ceil(config.block_size));
        let mut group_scales: Vec<Vec<f32>> = Vec::new();
        let mut group_zeros: Vec<Vec<f32>> = Vec::new();

        for i1 in (0..cols).step_by(config.block_size) {
            let i2 = (i1 + config.block_size).min(cols);
            let count = i2 - i1;

            let mut w1 = column_slice(&w, rows, cols, i1, i2);
            let mut err1 = vec![0.0f32; rows * count];
            let mut loss = 0.0f64;

            for i in 0..count {
                let col = i1 + i;

                if let (Some(g), None) = (config.group_size, &static_groups) {
                    if col % g == 0 {
                        let end = (col + g).min(cols);
                        quantizer.find_params(&column_slice(&w, rows, cols, col, end), (rows, end - col), true)?;
                        group_scales.push(quantizer.scale().to_vec());
                        group_zeros.push(quantizer.zero().to_vec());
                    }
                }
                let active = match (&static_groups, config.group_size) {
                    (Some(groups), Some(g)) => &groups[perm.as_ref().map_or(col, |p| p[col]) / g],
                    _ => &quantizer,
                };

                let d = hinv[col * cols + col];
                for r in 0..rows {
                    let row = &mut w1[r * count..(r + 1) * count];
                    let value = row[i];
                    let quantized = active.quantize_value(value, r);
                    q[r * cols + col] = quantized;

                    let residual = value - quantized;
                    loss += (residual as f64).powi(2) / (d as f64).powi(2) / 2.0;

                    let err = residual / d;
                    err1[r * count + i] = err;
                    for j in (i + 1)..count {
                        row[j] -= err * hinv[col * cols + i1 + j];
                    }
                }
            }

            block_losses.push(loss as f32);

            // W[:, i2:] -= Err1 · Hinv[i1:i2, i2:]
            if i2 < cols {
                w.par_chunks_mut(cols).enumerate().for_each(|(r, row)| {
                    let errs = &err1[r * count..(r + 1) * count];
                    for (k, &err) in errs.iter().enumerate() {
                        if err == 0.0 {
                            continue;
                        }
                        let hrow = &hinv[(i1 + k) * cols..(i1 + k + 1) * cols];
                        for j in i2..cols {
                            row[j] -= err * hrow[j];
                        }
                    }
                });
            }
        }

        if let Some(perm) = &perm {
            let mut inverse = vec![0usize; cols];
            for (k, &j) in perm.iter().enumerate() {
                inverse[j] = k;
            }
            q = permute_columns(&q, rows, cols, &inverse);
        }

        let (scale, zero) = match static_groups {
            Some(groups) => (
                columns_to_matrix(groups.iter().map(|g| g.scale().to_vec()).collect(), rows),
                columns_to_matrix(groups.iter().map(|g| g.zero().to_vec()).collect(), rows),
            ),
            None if !group_scales.is_empty() => (
                columns_to_matrix(group_scales, rows),
                columns_to_matrix(group_zeros, rows),
            ),
            None => (quantizer.scale().to_vec(), quantizer.zero().to_vec()),
        };
        let groups = scale.len() / rows;

        let output = GptqOutput {
            weight: shaped.restore(q)?,
            scale: Tensor::from_vec(scale, (rows, groups), &Device::Cpu)?,
            zero: Tensor::from_vec(zero, (rows, groups), &Device::Cpu)?,
            perm: perm.map(|p| p.into_iter().map(|j| j as u32).collect()),
            block_losses,
            dead_columns,
        };

        debug!(
            rows,
            cols,
            groups,
            dead_columns,
            loss = output.loss(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "quantized weight"
        );
        Ok(output)
    }
}

/// Quantize `weight` against its curvature estimate.
pub fn quantize_layer(weight: &Tensor, hessian: HessianAccumulator, config: &QuantConfig) -> Result<GptqOutput> {
    GptqSession::new(hessian, *config).quantize(weight)
}

/// Plain per-group round-to-nearest, no error compensation.
///
/// Used when a layer's curvature cannot be factored. Ignores `act_order`.
pub fn quantize_rtn(weight: &Tensor, config: &QuantConfig) -> Result<GptqOutput> {
    let shaped = DenseWeight::from_tensor(weight)?;
    let (rows, cols) = (shaped.rows, shaped.cols);
    let group = config.group_size.unwrap_or(cols).min(cols);

    let mut q = vec![0.0f32; rows * cols];
    let mut scales = Vec::new();
    let mut zeros = Vec::new();

    for start in (0..cols).step_by(group) {
        let end = (start + group).min(cols);
        let mut quantizer = Quantizer::new(*config);
        quantizer.find_params(&column_slice(&shaped.data, rows, cols, start, end), (rows, end - start), true)?;
        for r in 0..rows {
            for j in start..end {
                q[r * cols + j] = quantizer.quantize_value(shaped.data[r * cols + j], r);
            }
        }
        scales.push(quantizer.scale().to_vec());
        zeros.push(quantizer.zero().to_vec());
    }

    let groups = scales.len();
    Ok(GptqOutput {
        weight: shaped.restore(q)?,
        scale: Tensor::from_vec(columns_to_matrix(scales, rows), (rows, groups), &Device::Cpu)?,
        zero: Tensor::from_vec(columns_to_matrix(zeros, rows), (rows, groups), &Device::Cpu)?,
        perm: None,
        block_losses: Vec::new(),
        dead_columns: 0,
    })
}

/// Row-major f32 copy of a weight plus what is needed to restore it.
struct DenseWeight {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
    dims: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl DenseWeight {
    fn from_tensor(weight: &Tensor) -> Result<Self> {
        let dims = weight.dims().to_vec();
        let flat = match dims.len() {
            2 => weight.clone(),
            n if n > 2 => weight.flatten_from(1)?,
            _ => {
                return Err(Error::ShapeMismatch {
                    what: "weight matrix".to_string(),
                    expected: vec![0, 0],
                    got: dims,
                })
            }
        };
        let (rows, cols) = flat.dims2()?;
        let data = flat
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            data,
            rows,
            cols,
            dims,
            dtype: weight.dtype(),
            device: weight.device().clone(),
        })
    }

    fn restore(&self, data: Vec<f32>) -> Result<Tensor> {
        Ok(Tensor::from_vec(data, (self.rows, self.cols), &Device::Cpu)?
            .reshape(self.dims.as_slice())?
            .to_dtype(self.dtype)?
            .to_device(&self.device)?)
    }
}

/// Copy columns `start..end` of a row-major matrix.
fn column_slice(data: &[f32], rows: usize, cols: usize, start: usize, end: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(rows * (end - start));
    for r in 0..rows {
        out.extend_from_slice(&data[r * cols + start..r * cols + end]);
    }
    out
}

/// `out[:, k] = data[:, order[k]]`
fn permute_columns(data: &[f32], rows: usize, cols: usize, order: &[usize]) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for (k, &j) in order.iter().enumerate() {
            out[r * cols + k] = data[r * cols + j];
        }
    }
    out
}

/// `out[a, b] = h[order[a], order[b]]`
fn permute_symmetric(h: &[f32], n: usize, order: &[usize]) -> Vec<f32> {
    let mut out = vec![0.0f32; n * n];
    for (a, &i) in order.iter().enumerate() {
        for (b, &j) in order.iter().enumerate() {
            out[a * n + b] = h[i * n + j];
        }
    }
    out
}

/// Interleave per-group column vectors into a row-major `(rows, groups)` buffer.
fn columns_to_matrix(columns: Vec<Vec<f32>>, rows: usize) -> Vec<f32> {
    let groups = columns.len();
    let mut out = vec![0.0f32; rows * groups];
    for (g, column) in columns.iter().enumerate() {
        for (r, &v) in column.iter().enumerate().take(rows) {
            out[r * groups + g] = v;
        }
    }
    out
}
