//! Per-layer quantization configuration.
//!
//! `LayerQuantConfig` is the loose, serde-facing form read from JSON: every key
//! is optional and missing keys take the documented defaults. It is turned into
//! an immutable `QuantConfig` once, by `validate`, before a layer's session starts.

mod pattern;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::quant::FloatFormat;

pub use pattern::{LayerPattern, WeightConfig};

/// Number of shrink candidates evaluated by the MSE clip search.
pub const DEFAULT_MSE_GRID: usize = 100;
/// Fraction of the grid searched (`p` goes down to `1 - maxshrink`).
pub const DEFAULT_MSE_MAXSHRINK: f32 = 0.8;
/// Exponent of the clip-search error norm.
pub const DEFAULT_MSE_NORM: f32 = 2.4;

/// Target encoding of quantized weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightDType {
    /// Uniform integer grid with scale and zero point
    Int,
    /// 4-bit NormalFloat table
    Nf4,
    /// 4-bit E2M1 float table
    Fp4,
}

impl WeightDType {
    /// Table format for the narrow float encodings.
    pub fn float_format(&self) -> Option<FloatFormat> {
        match self {
            Self::Int => None,
            Self::Nf4 => Some(FloatFormat::Nf4),
            Self::Fp4 => Some(FloatFormat::Fp4),
        }
    }

    /// Stable numeric code used in packed layer metadata.
    pub fn code(&self) -> u32 {
        match self {
            Self::Int => 0,
            Self::Nf4 => 1,
            Self::Fp4 => 2,
        }
    }

    /// Inverse of [`WeightDType::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Int),
            1 => Some(Self::Nf4),
            2 => Some(Self::Fp4),
            _ => None,
        }
    }
}

/// Per-layer quantization settings as written in a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerQuantConfig {
    /// "int", "int2".."int8", "nf4" or "fp4"
    pub dtype: String,
    /// Bit width for integer targets
    pub bits: u8,
    /// Columns per scale/zero group, -1 for one group per row
    pub group_size: i64,
    /// Columns per error-propagation block
    pub block_size: usize,
    /// Damping as a fraction of the mean curvature diagonal
    pub percdamp: f32,
    /// Symmetric grid with a fixed mid-code zero point
    pub sym: bool,
    /// Quantize columns in descending curvature order
    pub act_order: bool,
    /// Fix group parameters on the original column order up front
    pub static_groups: bool,
    /// Per-row parameters (false: one set for the whole slice)
    pub perchannel: bool,
    /// Search clip ratios minimizing the p-norm error
    pub mse: bool,
    /// Ternary mode: codes {zero, 0, scale}
    pub trits: bool,
    /// Re-quantize the scale vector
    pub use_double_quant: bool,
    /// Scale re-quantization target: "int" or "int2".."int8"
    pub double_quant_dtype: String,
    /// Bit width used for scale re-quantization
    pub double_quant_bits: u8,
    /// Scales per re-quantization run
    pub double_quant_group_size: usize,
    /// Symmetric grid for scale re-quantization
    pub double_quant_sym: bool,
}

impl Default for LayerQuantConfig {
    fn default() -> Self {
        Self {
            dtype: "int".to_string(),
            bits: 4,
            group_size: 128,
            block_size: 128,
            percdamp: 0.01,
            sym: false,
            act_order: false,
            static_groups: false,
            perchannel: true,
            mse: false,
            trits: false,
            use_double_quant: false,
            double_quant_dtype: "int".to_string(),
            double_quant_bits: 4,
            double_quant_group_size: 128,
            double_quant_sym: false,
        }
    }
}

impl LayerQuantConfig {
    /// Check ranges and produce the immutable session config.
    pub fn validate(&self) -> Result<QuantConfig> {
        let (dtype, bits) = parse_dtype(&self.dtype, self.bits, ("dtype", "bits"))?;

        let group_size = match self.group_size {
            -1 => None,
            g if g > 0 => Some(g as usize),
            g => {
                return Err(Error::InvalidConfig {
                    field: "group_size",
                    reason: format!("must be -1 or positive, got {g}"),
                })
            }
        };

        if self.block_size == 0 {
            return Err(Error::InvalidConfig {
                field: "block_size",
                reason: "must be positive".to_string(),
            });
        }
        if !self.percdamp.is_finite() || self.percdamp < 0.0 {
            return Err(Error::InvalidConfig {
                field: "percdamp",
                reason: format!("must be a non-negative number, got {}", self.percdamp),
            });
        }
        if self.static_groups && group_size.is_none() {
            return Err(Error::InvalidConfig {
                field: "static_groups",
                reason: "requires a positive group_size".to_string(),
            });
        }
        if self.sym && dtype == WeightDType::Int && bits < 2 && !self.trits {
            return Err(Error::InvalidConfig {
                field: "bits",
                reason: "symmetric integer grids need at least 2 bits".to_string(),
            });
        }

        let double_quant = if self.use_double_quant {
            let (dq_dtype, dq_bits) = parse_dtype(
                &self.double_quant_dtype,
                self.double_quant_bits,
                ("double_quant_dtype", "double_quant_bits"),
            )?;
            if dq_dtype != WeightDType::Int {
                return Err(Error::InvalidConfig {
                    field: "double_quant_dtype",
                    reason: format!("scales re-quantize to int only, got '{}'", self.double_quant_dtype),
                });
            }
            if !(2..=8).contains(&dq_bits) {
                return Err(Error::InvalidConfig {
                    field: "double_quant_bits",
                    reason: format!("must be in 2..=8, got {dq_bits}"),
                });
            }
            if self.double_quant_group_size == 0 {
                return Err(Error::InvalidConfig {
                    field: "double_quant_group_size",
                    reason: "must be positive".to_string(),
                });
            }
            Some(DoubleQuantConfig {
                bits: dq_bits,
                group_size: self.double_quant_group_size,
                sym: self.double_quant_sym,
            })
        } else {
            None
        };

        Ok(QuantConfig {
            dtype,
            bits,
            group_size,
            block_size: self.block_size,
            percdamp: self.percdamp,
            sym: self.sym,
            act_order: self.act_order,
            static_groups: self.static_groups,
            perchannel: self.perchannel,
            mse: self.mse.then(MseSearch::default),
            trits: self.trits && dtype == WeightDType::Int,
            double_quant,
        })
    }
}

/// Parse a dtype string, folding "intN" into (Int, N).
///
/// `fields` names the dtype and bits keys in errors.
fn parse_dtype(dtype: &str, bits: u8, fields: (&'static str, &'static str)) -> Result<(WeightDType, u8)> {
    let (dtype_field, bits_field) = fields;
    let lowered = dtype.trim().to_ascii_lowercase();
    let (dtype, bits) = match lowered.as_str() {
        "int" => (WeightDType::Int, bits),
        "nf4" => (WeightDType::Nf4, 4),
        "fp4" | "fp4_e2m1" => (WeightDType::Fp4, 4),
        other => match other.strip_prefix("int").map(str::parse::<u8>) {
            Some(Ok(n)) => (WeightDType::Int, n),
            _ => {
                return Err(Error::InvalidConfig {
                    field: dtype_field,
                    reason: format!("unknown dtype '{dtype}'. Valid: int, int2..int8, nf4, fp4"),
                })
            }
        },
    };

    if !(1..=8).contains(&bits) {
        return Err(Error::InvalidConfig {
            field: bits_field,
            reason: format!("must be in 1..=8, got {bits}"),
        });
    }
    Ok((dtype, bits))
}

/// Clip-ratio search parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MseSearch {
    pub norm: f32,
    pub grid: usize,
    pub maxshrink: f32,
}

impl Default for MseSearch {
    fn default() -> Self {
        Self {
            norm: DEFAULT_MSE_NORM,
            grid: DEFAULT_MSE_GRID,
            maxshrink: DEFAULT_MSE_MAXSHRINK,
        }
    }
}

/// Scale re-quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoubleQuantConfig {
    pub bits: u8,
    pub group_size: usize,
    pub sym: bool,
}

/// Validated, immutable settings for one layer's quantization session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantConfig {
    pub dtype: WeightDType,
    pub bits: u8,
    /// `None` means one group spanning the whole row
    pub group_size: Option<usize>,
    pub block_size: usize,
    pub percdamp: f32,
    pub sym: bool,
    pub act_order: bool,
    pub static_groups: bool,
    pub perchannel: bool,
    pub mse: Option<MseSearch>,
    pub trits: bool,
    pub double_quant: Option<DoubleQuantConfig>,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            dtype: WeightDType::Int,
            bits: 4,
            group_size: Some(128),
            block_size: 128,
            percdamp: 0.01,
            sym: false,
            act_order: false,
            static_groups: false,
            perchannel: true,
            mse: None,
            trits: false,
            double_quant: None,
        }
    }
}

impl QuantConfig {
    /// Largest integer code, or -1 in trit mode.
    pub fn maxq(&self) -> i32 {
        if self.trits {
            -1
        } else {
            (1i32 << self.bits) - 1
        }
    }

    /// Number of scale/zero groups for a row of `columns` weights.
    pub fn num_groups(&self, columns: usize) -> usize {
        match self.group_size {
            Some(g) => columns.div_ceil(g),
            None => 1,
        }
    }
}
