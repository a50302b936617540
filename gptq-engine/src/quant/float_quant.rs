//! Narrow float value tables (NF4, FP4 E2M1).

/// NormalFloat-4 levels: quantiles of N(0, 1) normalized to [-1, 1].
const NF4_VALUES: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// FP4 with 1 sign, 2 exponent, 1 mantissa bit. Both zeros kept so every code decodes.
const FP4_E2M1_VALUES: [f32; 16] = [
    -6.0, -4.0, -3.0, -2.0, -1.5, -1.0, -0.5, -0.0, 0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0,
];

/// 4-bit table encodings. Codes are indices into an ascending value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatFormat {
    Nf4,
    Fp4,
}

impl FloatFormat {
    /// Ascending table of representable values.
    pub fn values(&self) -> &'static [f32; 16] {
        match self {
            Self::Nf4 => &NF4_VALUES,
            Self::Fp4 => &FP4_E2M1_VALUES,
        }
    }

    /// Largest magnitude in the table; a group's absmax maps onto it.
    pub fn max_abs(&self) -> f32 {
        match self {
            Self::Nf4 => 1.0,
            Self::Fp4 => 6.0,
        }
    }

    /// Index of the nearest table value (ties go to the lower value).
    pub fn nearest_index(&self, x: f32) -> u32 {
        let values = self.values();
        let pos = values.partition_point(|&v| v < x);
        if pos == 0 {
            return 0;
        }
        if pos == values.len() {
            return (values.len() - 1) as u32;
        }
        let lower = pos - 1;
        if x - values[lower] <= values[pos] - x {
            lower as u32
        } else {
            pos as u32
        }
    }

    /// Decode a code back to its table value.
    pub fn value(&self, code: u32) -> f32 {
        self.values()
            .get(code as usize)
            .copied()
            .unwrap_or(f32::NAN)
    }

    /// Round to the nearest representable value. NaN stays NaN.
    pub fn round(&self, x: f32) -> f32 {
        if x.is_nan() {
            return x;
        }
        self.value(self.nearest_index(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_ascending() {
        for format in [FloatFormat::Nf4, FloatFormat::Fp4] {
            let values = format.values();
            assert!(values.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(values[15], format.max_abs());
        }
    }

    #[test]
    fn test_exact_values_roundtrip() {
        for format in [FloatFormat::Nf4, FloatFormat::Fp4] {
            for (i, &v) in format.values().iter().enumerate() {
                let code = format.nearest_index(v);
                assert_eq!(format.value(code), v, "{format:?} index {i}");
            }
        }
    }

    #[test]
    fn test_fp4_rounding() {
        let fp4 = FloatFormat::Fp4;
        assert_eq!(fp4.round(2.4), 2.0);
        assert_eq!(fp4.round(2.6), 3.0);
        assert_eq!(fp4.round(5.0), 4.0); // tie goes low
        assert_eq!(fp4.round(100.0), 6.0);
        assert_eq!(fp4.round(-100.0), -6.0);
        assert_eq!(fp4.round(0.2), 0.0);
    }

    #[test]
    fn test_nf4_rounding() {
        let nf4 = FloatFormat::Nf4;
        assert_eq!(nf4.round(0.95), 1.0);
        assert_eq!(nf4.round(-0.03), 0.0);
        assert!((nf4.round(0.55) - 0.562_617).abs() < 1e-6);
    }

    #[test]
    fn test_nan_passthrough() {
        assert!(FloatFormat::Nf4.round(f32::NAN).is_nan());
        assert!(FloatFormat::Fp4.value(16).is_nan());
    }
}
