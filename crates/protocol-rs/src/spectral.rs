//! Spectral solver.
//!
//! For a constant generator Q with eigenvalues λ_i, right eigenvectors v_i
//! and rows w_i of the inverse eigenvector matrix,
//!
//! ```text
//! P(t) = Σ_i exp(λ_i t) · P(0) · A_i        A_i = v_i w_i
//! ```
//!
//! Eigenvalues are ordered by modulus, so `A_0` projects onto the steady
//! state. Complex pairs are carried in complex arithmetic and the real part
//! of the sum is the occupancy.

use crate::epoch::{Epoch, UniqueEpoch};
use clamp_core::{AbortFlag, ClampError, PassOutcome, Result, Time};
use nalgebra::{DMatrix, DVector, RowDVector};
use ndarray::{Array1, Array2};
use num_complex::Complex64;
use std::cmp::Ordering;

/// Eigen-decomposition of one rate matrix
#[derive(Debug, Clone)]
pub struct Spectrum {
    /// Eigenvalues in ascending order of modulus
    pub eigenvalues: Vec<Complex64>,
    /// Projection matrix for each eigenvalue
    pub projections: Vec<DMatrix<Complex64>>,
}

impl Spectrum {
    pub fn num_states(&self) -> usize {
        self.eigenvalues.len()
    }

    /// `P(0) · A_i` for every eigenvalue
    pub fn coefficients(&self, start: &RowDVector<Complex64>) -> Vec<RowDVector<Complex64>> {
        self.projections.iter().map(|a| start * a).collect()
    }

    /// Occupancy after `elapsed` seconds from the given coefficients
    pub fn propagate(&self, coefficients: &[RowDVector<Complex64>], elapsed: Time) -> RowDVector<Complex64> {
        let n = self.num_states();
        let mut p = RowDVector::<Complex64>::zeros(n);
        for (lambda, c) in self.eigenvalues.iter().zip(coefficients) {
            p += c * (*lambda * elapsed).exp();
        }
        p
    }
}

fn to_nalgebra(q: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(q.nrows(), q.ncols(), |i, j| q[[i, j]])
}

/// Eigen-decompose a rate matrix into spectral projections.
///
/// Eigenvalues within `1e-7` of each other relative to their own modulus
/// are treated as one cluster and share an eigenspace basis; only values
/// within `1e-12 · max|λ|` of zero are matched absolutely. A cluster whose
/// eigenspace is too small (a defective matrix) is an error.
pub fn spectral_expansion(q: &Array2<f64>) -> Result<Spectrum> {
    let n = q.nrows();
    if n < 2 || q.ncols() != n {
        return Err(ClampError::ModelError(
            "spectral expansion for less than two states does not make sense".to_string(),
        ));
    }

    let qm = to_nalgebra(q);
    let mut eigenvalues: Vec<Complex64> = qm.complex_eigenvalues().iter().copied().collect();
    eigenvalues.sort_by(|a, b| a.norm().partial_cmp(&b.norm()).unwrap_or(Ordering::Equal));

    let scale = eigenvalues.iter().map(|l| l.norm()).fold(1.0, f64::max);
    let qc: DMatrix<Complex64> = qm.map(|x| Complex64::new(x, 0.0));

    let mut vectors = DMatrix::<Complex64>::zeros(n, n);
    let mut assigned = vec![false; n];
    for i in 0..n {
        if assigned[i] {
            continue;
        }
        let members: Vec<usize> = (i..n)
            .filter(|&j| !assigned[j] && same_eigenvalue(eigenvalues[i], eigenvalues[j], scale))
            .collect();
        let lambda = members
            .iter()
            .map(|&j| eigenvalues[j])
            .sum::<Complex64>()
            / members.len() as f64;

        let shifted = &qc - DMatrix::<Complex64>::identity(n, n) * lambda;
        let basis = null_space(shifted, members.len(), scale)?;
        for (k, &j) in members.iter().enumerate() {
            vectors.set_column(j, &basis[k]);
            assigned[j] = true;
        }
    }

    let inverse = vectors.clone().try_inverse().ok_or_else(|| {
        ClampError::NumericalError("eigenvector matrix of rate matrix is singular".to_string())
    })?;
    let projections = (0..n)
        .map(|i| vectors.column(i) * inverse.row(i))
        .collect();

    Ok(Spectrum {
        eigenvalues,
        projections,
    })
}

const CLUSTER_TOLERANCE: f64 = 1e-7;
const ZERO_TOLERANCE: f64 = 1e-12;

fn same_eigenvalue(a: Complex64, b: Complex64, scale: f64) -> bool {
    let gap = (a - b).norm();
    gap <= CLUSTER_TOLERANCE * a.norm().max(b.norm()) || gap <= ZERO_TOLERANCE * scale
}

/// `dim` orthonormal vectors spanning the numerical null space of `m`
fn null_space(m: DMatrix<Complex64>, dim: usize, scale: f64) -> Result<Vec<DVector<Complex64>>> {
    let svd = m.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| ClampError::NumericalError("SVD did not produce V".to_string()))?;
    let singular = svd.singular_values;

    let mut order: Vec<usize> = (0..singular.len()).collect();
    order.sort_by(|&a, &b| singular[a].partial_cmp(&singular[b]).unwrap_or(Ordering::Equal));

    let tol = 1e-6 * scale;
    if order.len() < dim || singular[order[dim - 1]] > tol {
        return Err(ClampError::NumericalError(format!(
            "rate matrix is defective: eigenvalue of multiplicity {} has a smaller eigenspace",
            dim
        )));
    }
    Ok(order[..dim].iter().map(|&k| v_t.row(k).adjoint()).collect())
}

/// Stationary distribution `u · (S Sᵀ)⁻¹` with `S = [Q | 1]`
pub fn equilibrium_probability(q: &Array2<f64>) -> Result<Array1<f64>> {
    let n = q.nrows();
    let s = DMatrix::from_fn(n, n + 1, |i, j| if j < n { q[[i, j]] } else { 1.0 });
    let sst = &s * s.transpose();
    let inverse = sst.try_inverse().ok_or_else(|| {
        ClampError::NumericalError("no unique equilibrium for rate matrix".to_string())
    })?;
    let p = RowDVector::from_element(n, 1.0) * inverse;
    Ok(p.iter().copied().collect())
}

fn to_complex_row(p: &Array1<f64>) -> RowDVector<Complex64> {
    RowDVector::from_iterator(p.len(), p.iter().map(|&x| Complex64::new(x, 0.0)))
}

/// Occupancy of one condition by chaining spectral propagators across epochs.
///
/// Writes a `samples × states` matrix into `probability`.
pub fn spectral_probability(
    time: &Array1<Time>,
    epochs: &[Epoch],
    unique: &[UniqueEpoch],
    start_equilibrated: bool,
    abort: &AbortFlag,
    probability: &mut Array2<f64>,
) -> Result<PassOutcome> {
    let first = match epochs.first() {
        Some(epoch) => &unique[epoch.unique],
        None => return Ok(PassOutcome::Completed),
    };
    let n = first.num_states();
    *probability = Array2::zeros((time.len(), n));

    let mut start = to_complex_row(&first.starting_probability);
    for (k, epoch) in epochs.iter().enumerate() {
        if abort.is_aborted() {
            return Ok(PassOutcome::Aborted);
        }
        let spectrum = unique[epoch.unique].spectrum.as_ref().ok_or_else(|| {
            ClampError::NumericalError("epoch rate matrix has not been decomposed".to_string())
        })?;
        if spectrum.num_states() != n {
            return Err(ClampError::ModelError(
                "number of states changes between epochs".to_string(),
            ));
        }

        if k == 0 && start_equilibrated {
            start = &start * &spectrum.projections[0];
            for pt in epoch.first_pt..epoch.first_pt + epoch.num_pts {
                for s in 0..n {
                    probability[[pt, s]] = start[s].re;
                }
            }
            continue;
        }

        let coefficients = spectrum.coefficients(&start);
        for pt in epoch.first_pt..epoch.first_pt + epoch.num_pts {
            let p = spectrum.propagate(&coefficients, time[pt] - epoch.start);
            for s in 0..n {
                probability[[pt, s]] = p[s].re;
            }
        }
        if k + 1 < epochs.len() {
            start = spectrum.propagate(&coefficients, epoch.duration);
        }
    }
    Ok(PassOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Forward Euler reference for P(t) = P(0) exp(Qt)
    fn euler(q: &Array2<f64>, p0: &Array1<f64>, t: f64) -> Array1<f64> {
        let dt = 1e-5;
        let steps = (t / dt).round() as usize;
        let mut p = p0.clone();
        for _ in 0..steps {
            let dp = p.dot(q) * dt;
            p += &dp;
        }
        p
    }

    fn occupancy(spectrum: &Spectrum, p0: &Array1<f64>, t: f64) -> Array1<f64> {
        let c = spectrum.coefficients(&to_complex_row(p0));
        spectrum.propagate(&c, t).iter().map(|z| z.re).collect()
    }

    #[test]
    fn test_two_state_analytic() {
        let q = array![[-1.0, 1.0], [2.0, -2.0]];
        let spectrum = spectral_expansion(&q).unwrap();

        assert!(spectrum.eigenvalues[0].norm() < 1e-10);
        assert!((spectrum.eigenvalues[1].re + 3.0).abs() < 1e-10);

        let p0 = array![1.0, 0.0];
        for &t in &[0.0, 0.1, 0.5, 2.0] {
            let p = occupancy(&spectrum, &p0, t);
            let expected = 2.0 / 3.0 + (-3.0 * t).exp() / 3.0;
            assert!((p[0] - expected).abs() < 1e-10);
            assert!((p.sum() - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn test_complex_eigenvalues() {
        // Irreversible cycle has a complex conjugate pair
        let q = array![[-1.0, 1.0, 0.0], [0.0, -1.0, 1.0], [1.0, 0.0, -1.0]];
        let spectrum = spectral_expansion(&q).unwrap();
        assert!(spectrum.eigenvalues.iter().any(|l| l.im.abs() > 0.1));

        let p0 = array![1.0, 0.0, 0.0];
        let p = occupancy(&spectrum, &p0, 1.0);
        let reference = euler(&q, &p0, 1.0);
        for s in 0..3 {
            assert!((p[s] - reference[s]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_repeated_eigenvalues() {
        let q = array![[-2.0, 1.0, 1.0], [1.0, -2.0, 1.0], [1.0, 1.0, -2.0]];
        let spectrum = spectral_expansion(&q).unwrap();

        let p0 = array![1.0, 0.0, 0.0];
        let t = 0.4;
        let p = occupancy(&spectrum, &p0, t);
        assert!((p[0] - (1.0 / 3.0 + 2.0 / 3.0 * (-3.0 * t).exp())).abs() < 1e-9);
        assert!((p[1] - p[2]).abs() < 1e-9);
    }

    #[test]
    fn test_stiff_spectrum_keeps_slow_mode() {
        // Fast C <-> O exchange next to a slow O <-> I leak
        let (fast, slow) = (1e5, 0.01);
        let q = array![
            [-fast, fast, 0.0],
            [fast, -fast - slow, slow],
            [0.0, slow, -slow]
        ];
        let spectrum = spectral_expansion(&q).unwrap();
        assert_eq!(spectrum.projections.len(), 3);
        assert!((spectrum.eigenvalues[1].re + 0.015).abs() < 1e-6);

        let mut total = DMatrix::<Complex64>::zeros(3, 3);
        for a in &spectrum.projections {
            total += a;
        }
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((total[(i, j)] - Complex64::new(expected, 0.0)).norm() < 1e-9);
            }
        }

        let p0 = array![1.0, 0.0, 0.0];
        for &t in &[0.0, 50.0, 100.0, 200.0] {
            let p = occupancy(&spectrum, &p0, t);
            assert!((p.sum() - 1.0).abs() < 1e-9, "t = {}: sum {}", t, p.sum());
            assert!(p.iter().all(|&x| (-1e-9..=1.0 + 1e-9).contains(&x)));
            let leaked = (1.0 - (-0.015 * t).exp()) / 3.0;
            assert!((p[2] - leaked).abs() < 1e-4, "t = {}: I = {}", t, p[2]);
        }
    }

    #[test]
    fn test_nearby_eigenvalues_stay_distinct() {
        assert!(!same_eigenvalue(Complex64::new(0.0, 0.0), Complex64::new(-0.015, 0.0), 2e5));
        assert!(same_eigenvalue(Complex64::new(1e-13, 0.0), Complex64::new(-1e-13, 0.0), 2e5));
        assert!(same_eigenvalue(Complex64::new(-3.0, 0.0), Complex64::new(-3.0 + 1e-12, 0.0), 3.0));
        assert!(!same_eigenvalue(Complex64::new(-3.0, 0.0), Complex64::new(-3.001, 0.0), 3.0));
    }

    #[test]
    fn test_defective_matrix_rejected() {
        let q = array![[-1.0, 1.0, 0.0], [0.0, -1.0, 1.0], [0.0, 0.0, 0.0]];
        assert!(matches!(spectral_expansion(&q), Err(ClampError::NumericalError(_))));
    }

    #[test]
    fn test_single_state_rejected() {
        let q = array![[0.0]];
        assert!(spectral_expansion(&q).is_err());
    }

    #[test]
    fn test_equilibrium_probability() {
        let q = array![[-1.0, 1.0], [2.0, -2.0]];
        let p = equilibrium_probability(&q).unwrap();
        assert!((p[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((p[1] - 1.0 / 3.0).abs() < 1e-12);

        let q = array![[-2.0, 1.0, 1.0], [1.0, -2.0, 1.0], [1.0, 1.0, -2.0]];
        let p = equilibrium_probability(&q).unwrap();
        for s in 0..3 {
            assert!((p[s] - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_steady_state_projection() {
        let q = array![[-1.0, 1.0], [2.0, -2.0]];
        let spectrum = spectral_expansion(&q).unwrap();
        let p = to_complex_row(&array![0.0, 1.0]) * &spectrum.projections[0];
        assert!((p[0].re - 2.0 / 3.0).abs() < 1e-10);
        assert!(p[0].im.abs() < 1e-10);
    }
}
