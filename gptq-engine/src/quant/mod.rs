//! Elementary quantizer: scale/zero calibration and round-and-clamp.
//!
//! A `Quantizer` holds one scale and zero point per channel (row of a weight
//! slice). `find_params` calibrates them from a slice; `quantize_value` maps a
//! single weight onto the calibrated grid and back.
//!
//! Grids:
//! - asymmetric int: `scale = (max - min) / maxq`, `zero = round(-min / scale)`
//! - symmetric int: zero fixed at the mid code `(maxq + 1) / 2`, scale chosen so
//!   `[-absmax, absmax]` lands on the grid without clipping
//! - trits (`maxq < 0`): `scale = max`, `zero = min`, three levels
//! - nf4/fp4: `scale = absmax / table_max`, zero unused

mod float_quant;

use std::borrow::Cow;

use crate::config::{DoubleQuantConfig, QuantConfig, WeightDType};
use crate::error::{Error, Result};

pub use float_quant::FloatFormat;

/// Quantize-dequantize one value on an integer grid.
///
/// `q = clamp(round(x / scale) + zero, 0, maxq)`, result `scale * (q - zero)`.
/// With `maxq < 0` (trits) the result is `scale`, `zero` or 0.
pub fn quantize(x: f32, scale: f32, zero: f32, maxq: i32) -> f32 {
    if maxq < 0 {
        let high = if x > scale / 2.0 { scale } else { 0.0 };
        let low = if x < zero / 2.0 { zero } else { 0.0 };
        return high + low;
    }
    let q = ((x / scale).round_ties_even() + zero).clamp(0.0, maxq as f32);
    scale * (q - zero)
}

/// Integer code of `x` on the grid (the `q` of [`quantize`]).
pub fn quantize_code(x: f32, scale: f32, zero: f32, maxq: i32) -> u32 {
    ((x / scale).round_ties_even() + zero).clamp(0.0, maxq.max(0) as f32) as u32
}

/// Per-channel scale/zero calibration and quantization.
#[derive(Debug, Clone)]
pub struct Quantizer {
    config: QuantConfig,
    maxq: i32,
    scale: Vec<f32>,
    zero: Vec<f32>,
}

impl Quantizer {
    pub fn new(config: QuantConfig) -> Self {
        Self {
            maxq: config.maxq(),
            config,
            scale: Vec::new(),
            zero: Vec::new(),
        }
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    pub fn maxq(&self) -> i32 {
        self.maxq
    }

    /// Calibrated scale per channel.
    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    /// Calibrated zero point per channel.
    pub fn zero(&self) -> &[f32] {
        &self.zero
    }

    /// True once `find_params` produced a nonzero scale for every channel.
    pub fn ready(&self) -> bool {
        !self.scale.is_empty() && self.scale.iter().all(|&s| s != 0.0)
    }

    /// Calibrate scale/zero from a row-major `(rows, cols)` slice.
    ///
    /// Weights (`is_weight`) get one parameter set per row. Activations get one
    /// per column (channel). Without `perchannel` a single set is computed over
    /// the whole slice and repeated.
    pub fn find_params(&mut self, x: &[f32], shape: (usize, usize), is_weight: bool) -> Result<()> {
        let (rows, cols) = shape;
        if rows == 0 || cols == 0 || x.len() != rows * cols {
            return Err(Error::ShapeMismatch {
                what: "quantizer calibration slice".to_string(),
                expected: vec![rows, cols],
                got: vec![x.len()],
            });
        }

        let channels: Vec<Cow<'_, [f32]>> = if !self.config.perchannel {
            vec![Cow::Borrowed(x)]
        } else if is_weight {
            x.chunks(cols).map(Cow::Borrowed).collect()
        } else {
            (0..cols)
                .map(|c| Cow::Owned((0..rows).map(|r| x[r * cols + c]).collect()))
                .collect()
        };

        let mut scale = Vec::with_capacity(channels.len());
        let mut zero = Vec::with_capacity(channels.len());
        for channel in &channels {
            let (s, z) = self.channel_params(channel);
            scale.push(s);
            zero.push(z);
        }

        if !self.config.perchannel {
            let repeat = if is_weight { rows } else { cols };
            scale = vec![scale[0]; repeat];
            zero = vec![zero[0]; repeat];
        }

        self.scale = scale;
        self.zero = zero;

        if is_weight {
            if let Some(dq) = self.config.double_quant {
                self.double_quantize(dq)?;
            }
        }
        Ok(())
    }

    /// Quantize-dequantize `x` with the parameters of `channel`.
    pub fn quantize_value(&self, x: f32, channel: usize) -> f32 {
        let (scale, zero) = (self.scale[channel], self.zero[channel]);
        match self.config.dtype.float_format() {
            Some(format) => scale * format.round(x / scale),
            None => quantize(x, scale, zero, self.maxq),
        }
    }

    fn channel_params(&self, channel: &[f32]) -> (f32, f32) {
        if let Some(format) = self.config.dtype.float_format() {
            let absmax = channel.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let absmax = if absmax == 0.0 { 1.0 } else { absmax };
            return (absmax / format.max_abs(), 0.0);
        }

        let mut xmin = channel.iter().copied().fold(f32::INFINITY, f32::min).min(0.0);
        let mut xmax = channel.iter().copied().fold(f32::NEG_INFINITY, f32::max).max(0.0);

        if self.config.sym {
            xmax = xmax.max(xmin.abs());
            if xmin < 0.0 {
                xmin = -xmax;
            }
        }
        if xmin == 0.0 && xmax == 0.0 {
            xmin = -1.0;
            xmax = 1.0;
        }

        let (mut scale, mut zero) = self.grid_params(xmin, xmax);

        if let Some(search) = self.config.mse.filter(|_| self.maxq > 0) {
            let mut best = f32::INFINITY;
            let steps = (search.maxshrink * search.grid as f32) as usize;
            for i in 0..steps {
                let p = 1.0 - i as f32 / search.grid as f32;
                let (s, z) = self.grid_params(p * xmin, p * xmax);
                let err: f32 = channel
                    .iter()
                    .map(|&v| (quantize(v, s, z, self.maxq) - v).abs().powf(search.norm))
                    .sum();
                if err < best {
                    best = err;
                    scale = s;
                    zero = z;
                }
            }
        }

        (scale, zero)
    }

    fn grid_params(&self, xmin: f32, xmax: f32) -> (f32, f32) {
        let maxq = self.maxq;
        if maxq < 0 {
            return (xmax, xmin);
        }
        if self.config.sym {
            let half = (maxq - 1) as f32 / 2.0;
            let zero = ((maxq + 1) / 2) as f32;
            (xmax.max(-xmin) / half, zero)
        } else {
            let scale = (xmax - xmin) / maxq as f32;
            (scale, (-xmin / scale).round_ties_even())
        }
    }

    /// Fake-quantize the scale vector in runs of `dq.group_size`.
    fn double_quantize(&mut self, dq: DoubleQuantConfig) -> Result<()> {
        let inner_config = QuantConfig {
            dtype: WeightDType::Int,
            bits: dq.bits,
            group_size: None,
            sym: dq.sym,
            perchannel: true,
            mse: None,
            trits: false,
            double_quant: None,
            ..self.config
        };
        let mut inner = Quantizer::new(inner_config);

        for run in self.scale.chunks_mut(dq.group_size) {
            let len = run.len();
            inner.find_params(run, (1, len), true)?;
            let (step, zero) = (inner.scale[0], inner.zero[0]);
            for value in run.iter_mut() {
                let q = quantize(*value, step, zero, inner.maxq);
                // a scale must never collapse to zero
                *value = if q > 0.0 { q } else { step };
            }
        }
        Ok(())
    }
}
