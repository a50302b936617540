//! Packed low-bit layer format.
//!
//! Tensor layout (row = output feature):
//! - `qweight`: (out_features, ceil(in_features / per_word)) u32, codes packed
//!   low bits first, `per_word = 32 / bits`
//! - `scales`: (out_features, n_groups) f32
//! - `qzeros`: (out_features, ceil(n_groups / per_word)) u32, asymmetric int only
//! - `g_idx`: (in_features,) u32, group of each input column
//! - `perm`: (in_features,) u32, quantization column order (act-order only)
//! - `qmeta`: [bits, group_size (0 = per row), sym, dtype code, weight dtype code]

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use crate::config::{QuantConfig, WeightDType};
use crate::error::{Error, Result};
use crate::quant::quantize_code;

/// Suffixes of the tensors a packed layer writes under its prefix.
pub mod keys {
    pub const QWEIGHT: &str = "qweight";
    pub const SCALES: &str = "scales";
    pub const QZEROS: &str = "qzeros";
    pub const G_IDX: &str = "g_idx";
    pub const PERM: &str = "perm";
    pub const BIAS: &str = "bias";
    pub const QMETA: &str = "qmeta";
}

/// Low-bit replacement for a full-precision linear weight.
#[derive(Debug, Clone)]
pub struct PackedLayer {
    pub in_features: usize,
    pub out_features: usize,
    pub bits: u8,
    pub dtype: WeightDType,
    /// `None` means one group per row
    pub group_size: Option<usize>,
    pub sym: bool,
    pub qweight: Tensor,
    pub scales: Tensor,
    pub qzeros: Option<Tensor>,
    pub g_idx: Tensor,
    pub perm: Option<Tensor>,
    pub bias: Option<Tensor>,
    /// Dtype of the weight before packing; `dequantize` returns it
    pub weight_dtype: DType,
}

/// Plain buffers recovered from a [`PackedLayer`].
#[derive(Debug, Clone)]
pub struct UnpackedLayer {
    /// (out_features, in_features) codes
    pub codes: Vec<u32>,
    /// (out_features, n_groups)
    pub scales: Vec<f32>,
    /// (out_features, n_groups); implicit midpoint for symmetric, 0 for float tables
    pub zeros: Vec<f32>,
    pub g_idx: Vec<u32>,
    pub perm: Option<Vec<u32>>,
    pub bias: Option<Tensor>,
}

/// Pack a quantized weight and its group parameters.
///
/// `quantized_weight` must already lie on the grid described by `scale` and
/// `zero`; codes are recovered by rounding.
pub fn pack(
    quantized_weight: &Tensor,
    scale: &Tensor,
    zero: &Tensor,
    bias: Option<&Tensor>,
    perm: Option<&[u32]>,
    config: &QuantConfig,
) -> Result<PackedLayer> {
    if config.trits {
        return Err(Error::Unsupported {
            reason: "trit layers have no integer grid to pack".to_string(),
        });
    }

    let weight = if quantized_weight.rank() > 2 {
        quantized_weight.flatten_from(1)?
    } else {
        quantized_weight.clone()
    };
    let (out_features, in_features) = weight.dims2()?;
    let w = dense_f32(&weight)?;
    let scales = dense_f32(scale)?;
    let zeros = dense_f32(zero)?;

    let n_groups = scale.dims2()?.1;
    let expected_groups = config.num_groups(in_features);
    if scale.dims2()?.0 != out_features || n_groups != expected_groups {
        return Err(Error::ShapeMismatch {
            what: "scale".to_string(),
            expected: vec![out_features, expected_groups],
            got: scale.dims().to_vec(),
        });
    }
    if zeros.len() != scales.len() {
        return Err(Error::ShapeMismatch {
            what: "zero".to_string(),
            expected: vec![out_features, n_groups],
            got: zero.dims().to_vec(),
        });
    }
    if w.iter().chain(&scales).chain(&zeros).any(|v| !v.is_finite()) {
        return Err(Error::NonFinite {
            what: "quantized weight or group parameters".to_string(),
        });
    }
    if let Some(perm) = perm {
        if perm.len() != in_features {
            return Err(Error::ShapeMismatch {
                what: "permutation".to_string(),
                expected: vec![in_features],
                got: vec![perm.len()],
            });
        }
    }

    let g_idx = group_index(in_features, config, perm);
    let maxq = config.maxq();
    let format = config.dtype.float_format();

    let mut codes = vec![0u32; out_features * in_features];
    for r in 0..out_features {
        for j in 0..in_features {
            let g = r * n_groups + g_idx[j] as usize;
            let value = w[r * in_features + j];
            codes[r * in_features + j] = match format {
                Some(format) => format.nearest_index(value / scales[g]),
                None => quantize_code(value, scales[g], zeros[g], maxq),
            };
        }
    }

    let bits = config.bits as usize;
    let words = in_features.div_ceil(32 / bits);
    let qweight = pack_codes(&codes, out_features, in_features, bits);

    let qzeros = if format.is_none() && !config.sym {
        let zero_codes: Vec<u32> = zeros.iter().map(|&z| z.round().clamp(0.0, maxq as f32) as u32).collect();
        let zero_words = n_groups.div_ceil(32 / bits);
        let packed = pack_codes(&zero_codes, out_features, n_groups, bits);
        Some(Tensor::from_vec(packed, (out_features, zero_words), &Device::Cpu)?)
    } else {
        None
    };

    Ok(PackedLayer {
        in_features,
        out_features,
        bits: config.bits,
        dtype: config.dtype,
        group_size: config.group_size,
        sym: config.sym,
        qweight: Tensor::from_vec(qweight, (out_features, words), &Device::Cpu)?,
        scales: Tensor::from_vec(scales, (out_features, n_groups), &Device::Cpu)?,
        qzeros,
        g_idx: Tensor::from_vec(g_idx, in_features, &Device::Cpu)?,
        perm: perm
            .map(|p| Tensor::from_slice(p, in_features, &Device::Cpu))
            .transpose()?,
        bias: bias.cloned(),
        weight_dtype: quantized_weight.dtype(),
    })
}

/// Group of each original input column.
fn group_index(in_features: usize, config: &QuantConfig, perm: Option<&[u32]>) -> Vec<u32> {
    let Some(g) = config.group_size else {
        return vec![0; in_features];
    };
    match perm {
        Some(perm) if !config.static_groups => {
            let mut g_idx = vec![0u32; in_features];
            for (k, &j) in perm.iter().enumerate() {
                g_idx[j as usize] = (k / g) as u32;
            }
            g_idx
        }
        _ => (0..in_features).map(|j| (j / g) as u32).collect(),
    }
}

/// Pack `bits`-wide codes row by row, `32 / bits` per word, low bits first.
fn pack_codes(codes: &[u32], rows: usize, cols: usize, bits: usize) -> Vec<u32> {
    let per_word = 32 / bits;
    let words = cols.div_ceil(per_word);
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };

    let mut packed = vec![0u32; rows * words];
    for r in 0..rows {
        for j in 0..cols {
            let code = codes[r * cols + j] & mask;
            packed[r * words + j / per_word] |= code << (bits * (j % per_word));
        }
    }
    packed
}

fn unpack_codes(packed: &[u32], rows: usize, cols: usize, bits: usize) -> Vec<u32> {
    let per_word = 32 / bits;
    let words = cols.div_ceil(per_word);
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };

    let mut codes = vec![0u32; rows * cols];
    for r in 0..rows {
        for j in 0..cols {
            codes[r * cols + j] = (packed[r * words + j / per_word] >> (bits * (j % per_word))) & mask;
        }
    }
    codes
}

fn dense_f32(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

fn dense_u32(t: &Tensor) -> Result<Vec<u32>> {
    Ok(t.to_device(&Device::Cpu)?.flatten_all()?.to_vec1::<u32>()?)
}

fn dtype_code(dtype: DType) -> u32 {
    match dtype {
        DType::F16 => 1,
        DType::BF16 => 2,
        DType::F64 => 3,
        _ => 0,
    }
}

fn dtype_from_code(code: u32) -> DType {
    match code {
        1 => DType::F16,
        2 => DType::BF16,
        3 => DType::F64,
        _ => DType::F32,
    }
}

impl PackedLayer {
    pub fn n_groups(&self) -> usize {
        self.scales.dims().get(1).copied().unwrap_or(0)
    }

    /// Recover codes and group parameters.
    pub fn unpack(&self) -> Result<UnpackedLayer> {
        let bits = self.bits as usize;
        let n_groups = self.n_groups();
        let codes = unpack_codes(&dense_u32(&self.qweight)?, self.out_features, self.in_features, bits);
        let scales = dense_f32(&self.scales)?;

        let zeros = match (&self.qzeros, self.dtype) {
            (Some(qzeros), WeightDType::Int) => unpack_codes(&dense_u32(qzeros)?, self.out_features, n_groups, bits)
                .into_iter()
                .map(|z| z as f32)
                .collect(),
            (None, WeightDType::Int) => {
                let midpoint = (1u32 << (bits - 1)) as f32;
                vec![midpoint; self.out_features * n_groups]
            }
            _ => vec![0.0; self.out_features * n_groups],
        };

        Ok(UnpackedLayer {
            codes,
            scales,
            zeros,
            g_idx: dense_u32(&self.g_idx)?,
            perm: self.perm.as_ref().map(dense_u32).transpose()?,
            bias: self.bias.clone(),
        })
    }

    /// Full-precision `(out_features, in_features)` weight in the original dtype.
    pub fn dequantize(&self) -> Result<Tensor> {
        let unpacked = self.unpack()?;
        let n_groups = self.n_groups();
        let format = self.dtype.float_format();

        let mut w = vec![0.0f32; self.out_features * self.in_features];
        for r in 0..self.out_features {
            for j in 0..self.in_features {
                let g = r * n_groups + unpacked.g_idx[j] as usize;
                let code = unpacked.codes[r * self.in_features + j];
                let scale = unpacked.scales[g];
                w[r * self.in_features + j] = match format {
                    Some(format) => scale * format.value(code),
                    None => scale * (code as f32 - unpacked.zeros[g]),
                };
            }
        }

        Ok(Tensor::from_vec(w, (self.out_features, self.in_features), &Device::Cpu)?.to_dtype(self.weight_dtype)?)
    }

    /// Tensors to persist, keyed `{prefix}.{suffix}`.
    pub fn to_tensors(&self, prefix: &str) -> Result<HashMap<String, Tensor>> {
        let key = |suffix: &str| format!("{prefix}.{suffix}");
        let meta = [
            self.bits as u32,
            self.group_size.unwrap_or(0) as u32,
            self.sym as u32,
            self.dtype.code(),
            dtype_code(self.weight_dtype),
        ];

        let mut tensors = HashMap::new();
        tensors.insert(key(keys::QWEIGHT), self.qweight.clone());
        tensors.insert(key(keys::SCALES), self.scales.clone());
        tensors.insert(key(keys::G_IDX), self.g_idx.clone());
        tensors.insert(key(keys::QMETA), Tensor::from_slice(&meta, meta.len(), &Device::Cpu)?);
        if let Some(qzeros) = &self.qzeros {
            tensors.insert(key(keys::QZEROS), qzeros.clone());
        }
        if let Some(perm) = &self.perm {
            tensors.insert(key(keys::PERM), perm.clone());
        }
        if let Some(bias) = &self.bias {
            tensors.insert(key(keys::BIAS), bias.clone());
        }
        Ok(tensors)
    }

    /// Rebuild a layer written by [`PackedLayer::to_tensors`].
    pub fn from_tensors(prefix: &str, tensors: &HashMap<String, Tensor>) -> Result<Self> {
        let get = |suffix: &str| {
            let name = format!("{prefix}.{suffix}");
            tensors.get(&name).cloned().ok_or(Error::MissingTensor { name })
        };
        let optional = |suffix: &str| tensors.get(&format!("{prefix}.{suffix}")).cloned();

        let meta = dense_u32(&get(keys::QMETA)?)?;
        if meta.len() != 5 {
            return Err(Error::ShapeMismatch {
                what: format!("{prefix}.{}", keys::QMETA),
                expected: vec![5],
                got: vec![meta.len()],
            });
        }
        let bits = meta[0] as u8;
        if !(1..=8).contains(&bits) {
            return Err(Error::InvalidConfig {
                field: "bits",
                reason: format!("packed layer '{prefix}' has {bits} bits"),
            });
        }
        let dtype = WeightDType::from_code(meta[3]).ok_or_else(|| Error::Unsupported {
            reason: format!("packed layer '{prefix}' has unknown dtype code {}", meta[3]),
        })?;

        let qweight = get(keys::QWEIGHT)?.to_dtype(DType::U32)?;
        let scales = get(keys::SCALES)?.to_dtype(DType::F32)?;
        let g_idx = get(keys::G_IDX)?.to_dtype(DType::U32)?;
        let out_features = qweight.dims2()?.0;
        let in_features = g_idx.dims1()?;

        Ok(Self {
            in_features,
            out_features,
            bits,
            dtype,
            group_size: (meta[1] > 0).then_some(meta[1] as usize),
            sym: meta[2] != 0,
            qweight,
            scales,
            qzeros: optional(keys::QZEROS),
            g_idx,
            perm: optional(keys::PERM),
            bias: optional(keys::BIAS),
            weight_dtype: dtype_from_code(meta[4]),
        })
    }
}
