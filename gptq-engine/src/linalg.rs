//! Dense symmetric-positive-definite helpers on row-major `f64` buffers.

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Lower Cholesky factor `L` with `A = L·Lᵀ`.
pub fn cholesky_lower(a: &[f64], n: usize) -> Result<Vec<f64>> {
    let mut l = vec![0.0f64; n * n];
    for j in 0..n {
        let mut d = a[j * n + j];
        for k in 0..j {
            d -= l[j * n + k] * l[j * n + k];
        }
        // NaN must fail too
        if !(d > 0.0) {
            return Err(Error::Factorization { column: j, pivot: d });
        }
        let d = d.sqrt();
        l[j * n + j] = d;

        for i in (j + 1)..n {
            let mut s = a[i * n + j];
            for k in 0..j {
                s -= l[i * n + k] * l[j * n + k];
            }
            l[i * n + j] = s / d;
        }
    }
    Ok(l)
}

/// `A⁻¹` from the lower Cholesky factor of `A`.
pub fn cholesky_inverse(l: &[f64], n: usize) -> Vec<f64> {
    // L⁻¹ by forward substitution, one column at a time
    let mut linv = vec![0.0f64; n * n];
    for c in 0..n {
        linv[c * n + c] = 1.0 / l[c * n + c];
        for i in (c + 1)..n {
            let mut s = 0.0;
            for k in c..i {
                s -= l[i * n + k] * linv[k * n + c];
            }
            linv[i * n + c] = s / l[i * n + i];
        }
    }

    // A⁻¹ = L⁻ᵀ·L⁻¹
    let mut inv = vec![0.0f64; n * n];
    inv.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, out) in row.iter_mut().enumerate() {
            let start = i.max(j);
            *out = (start..n).map(|k| linv[k * n + i] * linv[k * n + j]).sum();
        }
    });
    inv
}

/// Upper Cholesky factor `U` with `A = Uᵀ·U`.
pub fn cholesky_upper(a: &[f64], n: usize) -> Result<Vec<f64>> {
    let l = cholesky_lower(a, n)?;
    let mut u = vec![0.0f64; n * n];
    for i in 0..n {
        for j in i..n {
            u[i * n + j] = l[j * n + i];
        }
    }
    Ok(u)
}

/// Upper Cholesky factor of `H⁻¹` for a damped curvature matrix.
///
/// Factor, invert, factor again. Fails if `H` is not positive-definite.
pub fn inverse_cholesky_factor(h: &[f32], n: usize) -> Result<Vec<f32>> {
    let h: Vec<f64> = h.iter().map(|&v| v as f64).collect();
    let l = cholesky_lower(&h, n)?;
    let inv = cholesky_inverse(&l, n);
    let u = cholesky_upper(&inv, n)?;
    Ok(u.into_iter().map(|v| v as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matmul(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
        let mut out = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                out[i * n + j] = (0..n).map(|k| a[i * n + k] * b[k * n + j]).sum();
            }
        }
        out
    }

    fn transpose(a: &[f64], n: usize) -> Vec<f64> {
        let mut t = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                t[j * n + i] = a[i * n + j];
            }
        }
        t
    }

    fn spd(n: usize) -> Vec<f64> {
        // B·Bᵀ + n·I
        let b: Vec<f64> = (0..n * n).map(|i| ((i as f64) * 0.37).sin()).collect();
        let mut a = matmul(&b, &transpose(&b, n), n);
        for i in 0..n {
            a[i * n + i] += n as f64;
        }
        a
    }

    #[test]
    fn test_lower_reconstructs() {
        let n = 6;
        let a = spd(n);
        let l = cholesky_lower(&a, n).unwrap();
        let back = matmul(&l, &transpose(&l, n), n);
        for (x, y) in a.iter().zip(&back) {
            assert!((x - y).abs() < 1e-9);
        }
        for i in 0..n {
            for j in (i + 1)..n {
                assert_eq!(l[i * n + j], 0.0);
            }
        }
    }

    #[test]
    fn test_inverse_is_inverse() {
        let n = 5;
        let a = spd(n);
        let inv = cholesky_inverse(&cholesky_lower(&a, n).unwrap(), n);
        let eye = matmul(&a, &inv, n);
        for i in 0..n {
            for j in 0..n {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((eye[i * n + j] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_upper_reconstructs() {
        let n = 4;
        let a = spd(n);
        let u = cholesky_upper(&a, n).unwrap();
        let back = matmul(&transpose(&u, n), &u, n);
        for (x, y) in a.iter().zip(&back) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_identity_factor() {
        let h = [2.0f32, 0.0, 0.0, 2.0];
        let u = inverse_cholesky_factor(&h, 2).unwrap();
        let expected = 1.0 / 2.0f32.sqrt();
        assert!((u[0] - expected).abs() < 1e-6);
        assert!((u[3] - expected).abs() < 1e-6);
        assert_eq!(u[1], 0.0);
        assert_eq!(u[2], 0.0);
    }

    #[test]
    fn test_indefinite_fails() {
        let a = [1.0, 2.0, 2.0, 1.0];
        match cholesky_lower(&a, 2) {
            Err(Error::Factorization { column, pivot }) => {
                assert_eq!(column, 1);
                assert!(pivot < 0.0);
            }
            other => panic!("expected factorization error, got {other:?}"),
        }
    }

    #[test]
    fn test_nan_pivot_fails() {
        let a = [f64::NAN, 0.0, 0.0, 1.0];
        assert!(cholesky_lower(&a, 1).is_err());
    }
}
