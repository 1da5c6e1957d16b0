//! # Nystrom Kernel Exponential Family Estimator
//!
//! The unnormalised log-density is restricted to the span of kernel
//! derivatives at `m` basis points,
//!
//! ```text
//! f(y) = sum_a sum_i beta[a*D + i] * dk(x_a, y) / dx_i
//! ```
//!
//! and `beta` is fitted by minimising the regularised score-matching
//! objective. Setting its gradient to zero gives the `m*D` system
//!
//! ```text
//! (G_mn G_mn^T / N + lambda G_mm + lambda_l2 I) beta = -h
//! ```
//!
//! where `G_mn` holds the mixed kernel Hessians between basis and data,
//! `G_mm` those between basis points (the RKHS norm of `f`) and `h` the
//! averaged third derivatives. When the basis is a literal subsample of the
//! data, `G_mm` is sliced out of `G_mn` instead of being recomputed.

use crate::kernel::{KernelEvaluator, Rebinding};
use crate::solver::{SolveStrategy, SolverError, solve_system};
use crate::subsample::{SubsampleError, choose_m_in_n, subsample_matrix_cols};
use ndarray::{Array1, Array2, ArrayView1, s};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DensityError {
    #[error("Data must hold at least one point of at least one dimension, got a {dims}x{num_points} matrix.")]
    EmptyData { dims: usize, num_points: usize },

    #[error("At least one basis point is required.")]
    EmptyBasis,

    #[error("Points have {found} dimensions, but the estimator works in {expected}.")]
    DimensionMismatch { found: usize, expected: usize },

    #[error("Basis index {0} is listed more than once.")]
    DuplicateBasisIndex(usize),

    #[error("Regularization parameter '{name}' must be non-negative and finite, got {value}.")]
    InvalidRegularization { name: &'static str, value: f64 },

    #[error("Basis subsampling failed: {0}")]
    Subsample(#[from] SubsampleError),

    #[error("Solving the regularized system failed: {0}")]
    Solver(#[from] SolverError),

    #[error("The basis was not subsampled from the data, so G_mm cannot be sliced out of G_mn.")]
    BasisNotSubsampled,

    #[error("The kernel is bound to test data; G_mm can only be sliced out of the training G_mn.")]
    NotBoundToTrainingData,

    #[error("Expected G_mn of shape {expected:?}, got {found:?}.")]
    GmnShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Coefficient vector has length {found}, but the system size is {expected}.")]
    CoefficientLengthMismatch { found: usize, expected: usize },

    #[error("Query index {index} is out of range for {num_points} bound data points.")]
    QueryOutOfRange { index: usize, num_points: usize },

    #[error("The estimator has not been fitted.")]
    NotFitted,

    #[error(
        "The Hessian diagonal is not implemented with a base measure (base_measure_cov_ridge = {0})."
    )]
    BaseMeasureHessianUnsupported(f64),
}

/// Regularization of the fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NystromParams {
    /// Weight of the RKHS norm `beta^T G_mm beta`.
    pub lambda: f64,
    /// Ridge added to the diagonal of the system matrix.
    pub lambda_l2: f64,
    /// Variance of an isotropic Gaussian base measure. Zero disables it.
    #[serde(default)]
    pub base_measure_cov_ridge: f64,
}

impl Default for NystromParams {
    fn default() -> Self {
        Self {
            lambda: 1e-3,
            lambda_l2: 0.0,
            base_measure_cov_ridge: 0.0,
        }
    }
}

impl NystromParams {
    fn validate(&self) -> Result<(), DensityError> {
        let named = [
            ("lambda", self.lambda),
            ("lambda_l2", self.lambda_l2),
            ("base_measure_cov_ridge", self.base_measure_cov_ridge),
        ];
        for (name, value) in named {
            if !(value.is_finite() && value >= 0.0) {
                return Err(DensityError::InvalidRegularization { name, value });
            }
        }
        Ok(())
    }
}

/// Score-matching density estimator on a Nystrom basis.
///
/// Operations on one instance must be serialised: `fit`, `compute_g_mm`
/// and `set_test_data` rebind the kernel and therefore take `&mut self`.
pub struct NystromEstimator {
    kernel: Box<dyn KernelEvaluator>,
    data: Arc<Array2<f64>>,
    basis: Arc<Array2<f64>>,
    basis_inds: Option<Vec<usize>>,
    params: NystromParams,
    beta: Option<Array1<f64>>,
    solve_strategy: Option<SolveStrategy>,
}

impl NystromEstimator {
    /// Uses a basis supplied independently of the data.
    pub fn from_basis(
        data: Arc<Array2<f64>>,
        basis: Arc<Array2<f64>>,
        kernel: Box<dyn KernelEvaluator>,
        params: NystromParams,
    ) -> Result<Self, DensityError> {
        validate_data(&data)?;
        if basis.nrows() != data.nrows() {
            return Err(DensityError::DimensionMismatch {
                found: basis.nrows(),
                expected: data.nrows(),
            });
        }
        if basis.ncols() == 0 {
            return Err(DensityError::EmptyBasis);
        }
        params.validate()?;

        log::info!(
            "Using m={} of N={} user provided basis points.",
            basis.ncols(),
            data.ncols()
        );
        Ok(Self::bind(data, basis, None, kernel, params))
    }

    /// Uses the data columns at `basis_inds` as basis.
    pub fn from_basis_indices(
        data: Arc<Array2<f64>>,
        basis_inds: Vec<usize>,
        kernel: Box<dyn KernelEvaluator>,
        params: NystromParams,
    ) -> Result<Self, DensityError> {
        validate_data(&data)?;
        params.validate()?;

        log::info!(
            "Using m={} of N={} user provided subsampled data basis points.",
            basis_inds.len(),
            data.ncols()
        );
        Self::from_validated_indices(data, basis_inds, kernel, params)
    }

    /// Uses `num_subsample_basis` data points chosen uniformly at random.
    pub fn from_subsample<R: Rng + ?Sized>(
        data: Arc<Array2<f64>>,
        num_subsample_basis: usize,
        sorted: bool,
        kernel: Box<dyn KernelEvaluator>,
        params: NystromParams,
        rng: &mut R,
    ) -> Result<Self, DensityError> {
        validate_data(&data)?;
        params.validate()?;

        log::info!(
            "Using m={} of N={} uniformly sub-sampled data as basis points.",
            num_subsample_basis,
            data.ncols()
        );
        let basis_inds = choose_m_in_n(num_subsample_basis, data.ncols(), sorted, rng)?;
        Self::from_validated_indices(data, basis_inds, kernel, params)
    }

    fn from_validated_indices(
        data: Arc<Array2<f64>>,
        basis_inds: Vec<usize>,
        kernel: Box<dyn KernelEvaluator>,
        params: NystromParams,
    ) -> Result<Self, DensityError> {
        if basis_inds.is_empty() {
            return Err(DensityError::EmptyBasis);
        }
        let mut seen = HashSet::with_capacity(basis_inds.len());
        if let Some(&duplicate) = basis_inds.iter().find(|&&idx| !seen.insert(idx)) {
            return Err(DensityError::DuplicateBasisIndex(duplicate));
        }

        let basis = Arc::new(subsample_matrix_cols(&basis_inds, data.view())?);
        Ok(Self::bind(data, basis, Some(basis_inds), kernel, params))
    }

    fn bind(
        data: Arc<Array2<f64>>,
        basis: Arc<Array2<f64>>,
        basis_inds: Option<Vec<usize>>,
        mut kernel: Box<dyn KernelEvaluator>,
        params: NystromParams,
    ) -> Self {
        kernel.set_basis_and_data(Arc::clone(&basis), Arc::clone(&data));
        Self {
            kernel,
            data,
            basis,
            basis_inds,
            params,
            beta: None,
            solve_strategy: None,
        }
    }

    pub fn num_dimensions(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_basis(&self) -> usize {
        self.basis.ncols()
    }

    /// Number of training points.
    pub fn num_data(&self) -> usize {
        self.data.ncols()
    }

    pub fn system_size(&self) -> usize {
        self.num_basis() * self.num_dimensions()
    }

    pub fn basis(&self) -> &Array2<f64> {
        &self.basis
    }

    pub fn basis_indices(&self) -> Option<&[usize]> {
        self.basis_inds.as_deref()
    }

    pub fn basis_is_subsampled_data(&self) -> bool {
        self.basis_inds.is_some()
    }

    pub fn params(&self) -> &NystromParams {
        &self.params
    }

    pub fn kernel(&self) -> &dyn KernelEvaluator {
        self.kernel.as_ref()
    }

    pub fn beta(&self) -> Option<&Array1<f64>> {
        self.beta.as_ref()
    }

    /// Strategy of the solver cascade that produced the current `beta`.
    pub fn solve_strategy(&self) -> Option<SolveStrategy> {
        self.solve_strategy
    }

    /// Rebinds the kernel to `(basis, data)` so that queries index `data`.
    pub fn set_test_data(&mut self, data: Arc<Array2<f64>>) -> Result<(), DensityError> {
        validate_data(&data)?;
        if data.nrows() != self.num_dimensions() {
            return Err(DensityError::DimensionMismatch {
                found: data.nrows(),
                expected: self.num_dimensions(),
            });
        }
        self.kernel.set_basis_and_data(Arc::clone(&self.basis), data);
        Ok(())
    }

    /// Installs coefficients from an earlier fit.
    pub fn restore_coefficients(&mut self, beta: Array1<f64>) -> Result<(), DensityError> {
        if beta.len() != self.system_size() {
            return Err(DensityError::CoefficientLengthMismatch {
                found: beta.len(),
                expected: self.system_size(),
            });
        }
        self.beta = Some(beta);
        self.solve_strategy = None;
        Ok(())
    }

    /// `h[a*D + i] = 1/N sum_b sum_j d^3 k(x_a, y_b) / dx_i dx_j dx_j` over the
    /// currently bound data.
    pub fn compute_h(&self) -> Array1<f64> {
        let d = self.num_dimensions();
        let n = self.kernel.num_data();

        let mut h = Array1::<f64>::zeros(self.system_size());
        for idx_a in 0..self.num_basis() {
            let mut h_a = h.slice_mut(s![idx_a * d..(idx_a + 1) * d]);
            for idx_b in 0..n {
                h_a += &self.kernel.dx_i_dx_j_dx_j_sum(idx_a, idx_b);
            }
        }
        h / n as f64
    }

    pub fn compute_g_mn(&self) -> Array2<f64> {
        self.kernel.dx_dy_all()
    }

    /// Exact basis-basis Hessians, computed by temporarily binding the kernel
    /// to `(basis, basis)`. The previous binding is restored on return.
    pub fn compute_g_mm(&mut self) -> Array2<f64> {
        // TODO: keep G_mm between fit() calls; the basis cannot change after construction.
        log::info!("Computing kernel Hessians for basis.");
        let basis = Arc::clone(&self.basis);
        let rebound = Rebinding::new(self.kernel.as_mut(), Arc::clone(&basis), basis);
        rebound.dx_dy_all()
    }

    /// Slices `G_mm` out of `G_mn`: column block `a` of `G_mm` is the column
    /// block of `G_mn` belonging to data point `basis_inds[a]`.
    ///
    /// `g_mn` must come from `compute_g_mn` while the kernel is bound to the
    /// training data; after `set_test_data` this fails until the next `fit`.
    pub fn subsample_g_mm_from_g_mn(&self, g_mn: &Array2<f64>) -> Result<Array2<f64>, DensityError> {
        let basis_inds = self
            .basis_inds
            .as_deref()
            .ok_or(DensityError::BasisNotSubsampled)?;
        if !Arc::ptr_eq(self.kernel.data(), &self.data) {
            return Err(DensityError::NotBoundToTrainingData);
        }

        let d = self.num_dimensions();
        let system_size = self.system_size();
        let expected = (system_size, self.num_data() * d);
        if g_mn.dim() != expected {
            return Err(DensityError::GmnShapeMismatch {
                expected,
                found: g_mn.dim(),
            });
        }

        let mut g_mm = Array2::<f64>::zeros((system_size, system_size));
        for (src_block, &idx) in basis_inds.iter().enumerate() {
            g_mm.slice_mut(s![.., src_block * d..(src_block + 1) * d])
                .assign(&g_mn.slice(s![.., idx * d..(idx + 1) * d]));
        }
        Ok(g_mm)
    }

    /// Fits `beta` on the training data. Any previous coefficients are
    /// discarded first, so a failed fit leaves the estimator unfitted.
    pub fn fit(&mut self) -> Result<(), DensityError> {
        self.beta = None;
        self.solve_strategy = None;
        self.kernel
            .set_basis_and_data(Arc::clone(&self.basis), Arc::clone(&self.data));

        let n = self.num_data() as f64;
        let NystromParams {
            lambda,
            lambda_l2,
            base_measure_cov_ridge,
        } = self.params;

        log::info!("Computing h.");
        let mut h = self.compute_h();

        log::info!("Computing kernel Hessians between basis and data.");
        let g_mn = self.compute_g_mn();

        if base_measure_cov_ridge > 0.0 {
            log::info!("Adding base measure scores to h.");
            let base_scores: Array1<f64> = self
                .data
                .t()
                .iter()
                .map(|&x| -x / base_measure_cov_ridge)
                .collect();
            h.scaled_add(1.0 / n, &g_mn.dot(&base_scores));
        }

        let mut system_matrix = g_mn.dot(&g_mn.t()) / n;
        if lambda > 0.0 {
            let g_mm = if self.basis_is_subsampled_data() {
                log::info!("Block sub-sampling kernel Hessians for basis.");
                self.subsample_g_mm_from_g_mn(&g_mn)?
            } else {
                self.compute_g_mm()
            };
            system_matrix.scaled_add(lambda, &g_mm);
        }

        if lambda_l2 > 0.0 {
            system_matrix.diag_mut().mapv_inplace(|v| v + lambda_l2);
        }

        let outcome = solve_system(&system_matrix, &h, lambda_l2)?;
        log::info!("Fitted {} coefficients with {}.", outcome.solution.len(), outcome.strategy);
        self.beta = Some(outcome.solution);
        self.solve_strategy = Some(outcome.strategy);
        Ok(())
    }

    fn fitted_beta(&self) -> Result<&Array1<f64>, DensityError> {
        self.beta.as_ref().ok_or(DensityError::NotFitted)
    }

    fn query_point(&self, idx_test: usize) -> Result<ArrayView1<'_, f64>, DensityError> {
        let data = self.kernel.data();
        if idx_test >= data.ncols() {
            return Err(DensityError::QueryOutOfRange {
                index: idx_test,
                num_points: data.ncols(),
            });
        }
        Ok(data.column(idx_test))
    }

    /// Unnormalised log-density at bound data point `idx_test`.
    pub fn log_pdf(&self, idx_test: usize) -> Result<f64, DensityError> {
        let beta = self.fitted_beta()?;
        let x = self.query_point(idx_test)?;
        let d = self.num_dimensions();

        let mut beta_sum = 0.0;
        for (idx_a, beta_a) in beta.exact_chunks(d).into_iter().enumerate() {
            beta_sum += self.kernel.dx(idx_a, idx_test).dot(&beta_a);
        }

        let ridge = self.params.base_measure_cov_ridge;
        if ridge > 0.0 {
            beta_sum -= 0.5 * x.dot(&x) / ridge;
        }
        Ok(beta_sum)
    }

    /// Gradient of the log-density at bound data point `idx_test`.
    pub fn grad(&self, idx_test: usize) -> Result<Array1<f64>, DensityError> {
        let beta = self.fitted_beta()?;
        let x = self.query_point(idx_test)?;
        let d = self.num_dimensions();

        let mut beta_sum_grad = Array1::<f64>::zeros(d);
        for (idx_a, beta_a) in beta.exact_chunks(d).into_iter().enumerate() {
            let left_arg_hessian = self.kernel.dx_i_dx_j(idx_a, idx_test);
            beta_sum_grad -= &left_arg_hessian.dot(&beta_a);
        }

        let ridge = self.params.base_measure_cov_ridge;
        if ridge > 0.0 {
            beta_sum_grad.scaled_add(-1.0 / ridge, &x);
        }
        Ok(beta_sum_grad)
    }

    /// Diagonal of the log-density Hessian at bound data point `idx_test`.
    pub fn hessian_diag(&self, idx_test: usize) -> Result<Array1<f64>, DensityError> {
        let ridge = self.params.base_measure_cov_ridge;
        if ridge > 0.0 {
            return Err(DensityError::BaseMeasureHessianUnsupported(ridge));
        }
        let beta = self.fitted_beta()?;
        self.query_point(idx_test)?;
        let d = self.num_dimensions();

        let mut beta_sum_hessian_diag = Array1::<f64>::zeros(d);
        for (idx_a, beta_a) in beta.exact_chunks(d).into_iter().enumerate() {
            for i in 0..d {
                beta_sum_hessian_diag[i] +=
                    self.kernel
                        .dx_i_dx_j_dx_k_dot_vec_component(idx_a, idx_test, beta_a, i, i);
            }
        }
        Ok(beta_sum_hessian_diag)
    }

    /// `log_pdf` at every bound data point.
    pub fn log_pdf_multiple(&self) -> Result<Array1<f64>, DensityError> {
        self.fitted_beta()?;
        let values = (0..self.kernel.num_data())
            .into_par_iter()
            .map(|idx| self.log_pdf(idx))
            .collect::<Result<Vec<f64>, DensityError>>()?;
        Ok(Array1::from_vec(values))
    }

    /// `grad` at every bound data point, one column per point.
    pub fn grad_multiple(&self) -> Result<Array2<f64>, DensityError> {
        self.fitted_beta()?;
        let n = self.kernel.num_data();
        let grads = (0..n)
            .into_par_iter()
            .map(|idx| self.grad(idx))
            .collect::<Result<Vec<Array1<f64>>, DensityError>>()?;

        let mut out = Array2::<f64>::zeros((self.num_dimensions(), n));
        for (mut column, grad) in out.columns_mut().into_iter().zip(&grads) {
            column.assign(grad);
        }
        Ok(out)
    }

    /// Score-matching objective on the bound data,
    /// `1/N sum_b sum_i (d^2 f / dy_i^2 + (df / dy_i)^2 / 2)`.
    pub fn objective(&self) -> Result<f64, DensityError> {
        self.fitted_beta()?;
        let n = self.kernel.num_data();
        let terms = (0..n)
            .into_par_iter()
            .map(|idx| {
                let grad = self.grad(idx)?;
                let hessian_diag = self.hessian_diag(idx)?;
                Ok(hessian_diag.sum() + 0.5 * grad.dot(&grad))
            })
            .collect::<Result<Vec<f64>, DensityError>>()?;
        Ok(terms.iter().sum::<f64>() / n as f64)
    }
}

fn validate_data(data: &Array2<f64>) -> Result<(), DensityError> {
    let (dims, num_points) = data.dim();
    if dims == 0 || num_points == 0 {
        return Err(DensityError::EmptyData { dims, num_points });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::GaussianKernel;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const SIGMA: f64 = 2.0;

    fn random_points(dims: usize, num_points: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((dims, num_points), |_| rng.gen_range(-2.0..2.0))
    }

    fn gaussian() -> Box<dyn KernelEvaluator> {
        Box::new(GaussianKernel::new(SIGMA).unwrap())
    }

    fn params(lambda: f64, lambda_l2: f64) -> NystromParams {
        NystromParams {
            lambda,
            lambda_l2,
            base_measure_cov_ridge: 0.0,
        }
    }

    fn assert_all_close(a: &Array2<f64>, b: &Array2<f64>, epsilon: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = epsilon);
        }
    }

    #[test]
    fn sliced_g_mm_matches_exact_recomputation_for_index_basis() {
        let data = Arc::new(random_points(3, 12, 1));
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![7, 2, 11, 4], gaussian(), params(0.1, 0.0))
                .unwrap();

        let g_mn = estimator.compute_g_mn();
        let sliced = estimator.subsample_g_mm_from_g_mn(&g_mn).unwrap();
        let exact = estimator.compute_g_mm();
        assert_all_close(&sliced, &exact, 1e-12);
    }

    #[test]
    fn sliced_g_mm_matches_exact_recomputation_for_random_basis() {
        let data = Arc::new(random_points(2, 20, 2));
        let mut rng = StdRng::seed_from_u64(5);
        let mut estimator = NystromEstimator::from_subsample(
            data,
            6,
            true,
            gaussian(),
            params(0.1, 0.0),
            &mut rng,
        )
        .unwrap();

        let g_mn = estimator.compute_g_mn();
        let sliced = estimator.subsample_g_mm_from_g_mn(&g_mn).unwrap();
        let exact = estimator.compute_g_mm();
        assert_all_close(&sliced, &exact, 1e-12);
    }

    #[test]
    fn compute_g_mm_restores_the_data_binding() {
        let data = Arc::new(random_points(2, 9, 3));
        let basis = Arc::new(random_points(2, 3, 4));
        let mut estimator =
            NystromEstimator::from_basis(Arc::clone(&data), basis, gaussian(), params(1.0, 0.0))
                .unwrap();

        let g_mm = estimator.compute_g_mm();
        assert_eq!(g_mm.dim(), (6, 6));
        assert!(Arc::ptr_eq(estimator.kernel().data(), &data));
        assert_eq!(estimator.compute_g_mn().dim(), (6, 18));
    }

    #[test]
    fn slicing_requires_a_subsampled_basis() {
        let data = Arc::new(random_points(2, 5, 6));
        let basis = Arc::new(random_points(2, 2, 7));
        let estimator = NystromEstimator::from_basis(data, basis, gaussian(), params(1.0, 0.0)).unwrap();
        assert!(!estimator.basis_is_subsampled_data());
        assert!(estimator.basis_indices().is_none());

        let g_mn = estimator.compute_g_mn();
        assert!(matches!(
            estimator.subsample_g_mm_from_g_mn(&g_mn),
            Err(DensityError::BasisNotSubsampled)
        ));
    }

    #[test]
    fn slicing_rejects_wrongly_shaped_g_mn() {
        let data = Arc::new(random_points(2, 5, 8));
        let estimator =
            NystromEstimator::from_basis_indices(data, vec![0, 3], gaussian(), params(1.0, 0.0)).unwrap();
        let wrong = Array2::<f64>::zeros((4, 4));
        assert!(matches!(
            estimator.subsample_g_mm_from_g_mn(&wrong),
            Err(DensityError::GmnShapeMismatch {
                expected: (4, 10),
                found: (4, 4)
            })
        ));
    }

    #[test]
    fn construction_validates_inputs() {
        let data = Arc::new(random_points(2, 4, 9));

        let wrong_dims = Arc::new(random_points(3, 2, 10));
        assert!(matches!(
            NystromEstimator::from_basis(Arc::clone(&data), wrong_dims, gaussian(), params(0.1, 0.0)),
            Err(DensityError::DimensionMismatch { found: 3, expected: 2 })
        ));

        assert!(matches!(
            NystromEstimator::from_basis_indices(Arc::clone(&data), vec![1, 3, 1], gaussian(), params(0.1, 0.0)),
            Err(DensityError::DuplicateBasisIndex(1))
        ));

        assert!(matches!(
            NystromEstimator::from_basis_indices(Arc::clone(&data), vec![0, 4], gaussian(), params(0.1, 0.0)),
            Err(DensityError::Subsample(SubsampleError::IndexOutOfRange { index: 4, num_cols: 4 }))
        ));

        assert!(matches!(
            NystromEstimator::from_basis_indices(Arc::clone(&data), Vec::new(), gaussian(), params(0.1, 0.0)),
            Err(DensityError::EmptyBasis)
        ));

        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            NystromEstimator::from_subsample(Arc::clone(&data), 5, false, gaussian(), params(0.1, 0.0), &mut rng),
            Err(DensityError::Subsample(SubsampleError::CountExceedsPopulation {
                chosen: 5,
                population: 4
            }))
        ));

        assert!(matches!(
            NystromEstimator::from_basis_indices(Arc::clone(&data), vec![0], gaussian(), params(-1.0, 0.0)),
            Err(DensityError::InvalidRegularization { name: "lambda", .. })
        ));

        let empty = Arc::new(Array2::<f64>::zeros((2, 0)));
        assert!(matches!(
            NystromEstimator::from_basis_indices(empty, vec![0], gaussian(), params(0.1, 0.0)),
            Err(DensityError::EmptyData { dims: 2, num_points: 0 })
        ));
    }

    #[test]
    fn queries_before_fit_are_rejected() {
        let data = Arc::new(random_points(2, 4, 11));
        let estimator =
            NystromEstimator::from_basis_indices(data, vec![0, 1], gaussian(), params(0.1, 0.0)).unwrap();
        assert!(matches!(estimator.log_pdf(0), Err(DensityError::NotFitted)));
        assert!(matches!(estimator.grad(0), Err(DensityError::NotFitted)));
        assert!(matches!(estimator.hessian_diag(0), Err(DensityError::NotFitted)));
        assert!(matches!(estimator.log_pdf_multiple(), Err(DensityError::NotFitted)));
    }

    #[test]
    fn hessian_diag_rejects_base_measure_for_any_input() {
        let data = Arc::new(random_points(2, 6, 12));
        let with_base_measure = NystromParams {
            lambda: 0.1,
            lambda_l2: 0.01,
            base_measure_cov_ridge: 4.0,
        };
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![0, 2, 4], gaussian(), with_base_measure)
                .unwrap();

        assert!(matches!(
            estimator.hessian_diag(0),
            Err(DensityError::BaseMeasureHessianUnsupported(_))
        ));
        estimator.fit().unwrap();
        for idx in [0, 5, 100] {
            assert!(matches!(
                estimator.hessian_diag(idx),
                Err(DensityError::BaseMeasureHessianUnsupported(_))
            ));
        }
        assert!(estimator.objective().is_err());
    }

    #[test]
    fn query_index_must_be_in_range() {
        let data = Arc::new(random_points(2, 4, 13));
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![0, 1], gaussian(), params(0.1, 0.01)).unwrap();
        estimator.fit().unwrap();
        assert!(matches!(
            estimator.log_pdf(4),
            Err(DensityError::QueryOutOfRange { index: 4, num_points: 4 })
        ));
    }

    #[test]
    fn refitting_is_deterministic() {
        let data = Arc::new(random_points(2, 15, 14));
        let build = || {
            let mut rng = StdRng::seed_from_u64(21);
            NystromEstimator::from_subsample(
                Arc::clone(&data),
                5,
                false,
                gaussian(),
                params(0.5, 0.01),
                &mut rng,
            )
            .unwrap()
        };

        let mut first = build();
        let mut second = build();
        assert_eq!(first.basis_indices(), second.basis_indices());

        first.fit().unwrap();
        second.fit().unwrap();
        let beta = first.beta().unwrap().clone();
        second.fit().unwrap();

        assert_eq!(&beta, second.beta().unwrap());
        for idx in 0..15 {
            assert_eq!(first.log_pdf(idx).unwrap(), second.log_pdf(idx).unwrap());
            assert_eq!(first.grad(idx).unwrap(), second.grad(idx).unwrap());
            assert_eq!(first.hessian_diag(idx).unwrap(), second.hessian_diag(idx).unwrap());
        }
    }

    fn symmetric_pair(center: &Array1<f64>, direction: &Array1<f64>, step: f64) -> Arc<Array2<f64>> {
        let d = center.len();
        let mut points = Array2::<f64>::zeros((d, 3));
        points.column_mut(0).assign(center);
        points.column_mut(1).assign(&(center + &(direction * step)));
        points.column_mut(2).assign(&(center - &(direction * step)));
        Arc::new(points)
    }

    fn check_derivatives_by_finite_differences(estimator: &mut NystromEstimator, check_hessian: bool) {
        let step = 1e-5;
        let center = array![0.3, -0.4];
        for i in 0..2 {
            let mut direction = Array1::<f64>::zeros(2);
            direction[i] = 1.0;
            estimator
                .set_test_data(symmetric_pair(&center, &direction, step))
                .unwrap();

            let grad = estimator.grad(0).unwrap();
            let numeric_grad =
                (estimator.log_pdf(1).unwrap() - estimator.log_pdf(2).unwrap()) / (2.0 * step);
            assert_relative_eq!(grad[i], numeric_grad, epsilon = 1e-6, max_relative = 1e-5);

            if check_hessian {
                let hessian_diag = estimator.hessian_diag(0).unwrap();
                let numeric_hessian =
                    (estimator.grad(1).unwrap()[i] - estimator.grad(2).unwrap()[i]) / (2.0 * step);
                assert_relative_eq!(
                    hessian_diag[i],
                    numeric_hessian,
                    epsilon = 1e-5,
                    max_relative = 1e-4
                );
            }
        }
    }

    #[test]
    fn gradient_and_hessian_are_derivatives_of_log_pdf() {
        let data = Arc::new(random_points(2, 10, 15));
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![1, 4, 6, 9], gaussian(), params(0.1, 0.01))
                .unwrap();
        estimator.fit().unwrap();
        check_derivatives_by_finite_differences(&mut estimator, true);
    }

    #[test]
    fn gradient_includes_base_measure() {
        let data = Arc::new(random_points(2, 10, 16));
        let with_base_measure = NystromParams {
            lambda: 0.1,
            lambda_l2: 0.01,
            base_measure_cov_ridge: 3.0,
        };
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![0, 5, 8], gaussian(), with_base_measure)
                .unwrap();
        estimator.fit().unwrap();
        check_derivatives_by_finite_differences(&mut estimator, false);
    }

    #[test]
    fn objective_matches_quadratic_form_of_the_system() {
        let data = Arc::new(random_points(2, 8, 17));
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![0, 3, 6], gaussian(), params(0.2, 0.05))
                .unwrap();
        estimator.fit().unwrap();

        let beta = estimator.beta().unwrap().clone();
        let h = estimator.compute_h();
        let g_mn = estimator.compute_g_mn();
        let g_beta = g_mn.t().dot(&beta);
        let expected = beta.dot(&h) + 0.5 * g_beta.dot(&g_beta) / 8.0;

        assert_relative_eq!(
            estimator.objective().unwrap(),
            expected,
            epsilon = 1e-10,
            max_relative = 1e-9
        );
    }

    #[test]
    fn batched_queries_agree_with_single_queries() {
        let data = Arc::new(random_points(2, 7, 18));
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![2, 5], gaussian(), params(0.1, 0.01)).unwrap();
        estimator.fit().unwrap();

        let log_pdfs = estimator.log_pdf_multiple().unwrap();
        let grads = estimator.grad_multiple().unwrap();
        assert_eq!(grads.dim(), (2, 7));
        for idx in 0..7 {
            assert_eq!(log_pdfs[idx], estimator.log_pdf(idx).unwrap());
            assert_eq!(grads.column(idx), estimator.grad(idx).unwrap());
        }
    }

    #[test]
    fn restored_coefficients_reproduce_queries() {
        let data = Arc::new(random_points(2, 6, 19));
        let mut fitted =
            NystromEstimator::from_basis_indices(Arc::clone(&data), vec![1, 3], gaussian(), params(0.1, 0.01))
                .unwrap();
        fitted.fit().unwrap();

        let mut restored =
            NystromEstimator::from_basis_indices(data, vec![1, 3], gaussian(), params(0.1, 0.01)).unwrap();
        assert!(matches!(
            restored.restore_coefficients(Array1::zeros(3)),
            Err(DensityError::CoefficientLengthMismatch { found: 3, expected: 4 })
        ));
        restored
            .restore_coefficients(fitted.beta().unwrap().clone())
            .unwrap();
        assert_eq!(restored.log_pdf(4).unwrap(), fitted.log_pdf(4).unwrap());
    }

    #[test]
    fn slicing_is_refused_while_bound_to_test_data_of_equal_size() {
        let data = Arc::new(random_points(2, 5, 22));
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![0, 3], gaussian(), params(0.1, 0.01)).unwrap();
        let exact = estimator.compute_g_mm();

        estimator
            .set_test_data(Arc::new(random_points(2, 5, 23)))
            .unwrap();
        let test_g_mn = estimator.compute_g_mn();
        assert_eq!(test_g_mn.dim(), (4, 10));
        assert!(matches!(
            estimator.subsample_g_mm_from_g_mn(&test_g_mn),
            Err(DensityError::NotBoundToTrainingData)
        ));

        estimator.fit().unwrap();
        let training_g_mn = estimator.compute_g_mn();
        let sliced = estimator.subsample_g_mm_from_g_mn(&training_g_mn).unwrap();
        assert_all_close(&sliced, &exact, 1e-12);
    }

    #[test]
    fn empty_test_data_is_rejected() {
        let data = Arc::new(random_points(2, 6, 24));
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![1, 3], gaussian(), params(0.1, 0.01)).unwrap();
        estimator.fit().unwrap();
        let objective = estimator.objective().unwrap();

        assert!(matches!(
            estimator.set_test_data(Arc::new(Array2::<f64>::zeros((2, 0)))),
            Err(DensityError::EmptyData { dims: 2, num_points: 0 })
        ));
        assert_eq!(estimator.kernel().num_data(), 6);
        assert_eq!(estimator.objective().unwrap(), objective);
    }

    #[test]
    fn test_data_must_match_dimensions() {
        let data = Arc::new(random_points(2, 6, 20));
        let mut estimator =
            NystromEstimator::from_basis_indices(data, vec![1, 3], gaussian(), params(0.1, 0.01)).unwrap();
        assert!(matches!(
            estimator.set_test_data(Arc::new(random_points(3, 2, 21))),
            Err(DensityError::DimensionMismatch { found: 3, expected: 2 })
        ));
    }

    /// One-dimensional evaluator with hand-picked derivative tables: the
    /// Hessian is `-(a + 1)` on matching indices and zero elsewhere, and the
    /// repeated-index sum is `a + 1`.
    struct TableKernel {
        basis: Arc<Array2<f64>>,
        data: Arc<Array2<f64>>,
    }

    impl KernelEvaluator for TableKernel {
        fn set_basis_and_data(&mut self, basis: Arc<Array2<f64>>, data: Arc<Array2<f64>>) {
            self.basis = basis;
            self.data = data;
        }

        fn basis(&self) -> &Arc<Array2<f64>> {
            &self.basis
        }

        fn data(&self) -> &Arc<Array2<f64>> {
            &self.data
        }

        fn dx(&self, idx_a: usize, idx_b: usize) -> Array1<f64> {
            array![if idx_a == idx_b { 1.0 } else { 0.0 }]
        }

        fn dx_i_dx_j(&self, idx_a: usize, idx_b: usize) -> Array2<f64> {
            let value = if idx_a == idx_b { -((idx_a + 1) as f64) } else { 0.0 };
            array![[value]]
        }

        fn dx_i_dx_j_dx_k_dot_vec_component(
            &self,
            _: usize,
            _: usize,
            _: ArrayView1<f64>,
            _: usize,
            _: usize,
        ) -> f64 {
            0.0
        }

        fn dx_i_dx_j_dx_j_sum(&self, idx_a: usize, _: usize) -> Array1<f64> {
            array![(idx_a + 1) as f64]
        }
    }

    #[test]
    fn assembles_and_solves_the_system_for_any_evaluator() {
        let points = Arc::new(array![[0.0, 1.0]]);
        let kernel = TableKernel {
            basis: Arc::clone(&points),
            data: Arc::clone(&points),
        };
        let mut estimator = NystromEstimator::from_basis(
            Arc::clone(&points),
            points,
            Box::new(kernel),
            params(0.0, 0.1),
        )
        .unwrap();

        assert_eq!(estimator.compute_h(), array![1.0, 2.0]);
        assert_eq!(estimator.compute_g_mn(), array![[1.0, 0.0], [0.0, 2.0]]);

        // (G G^T / 2 + 0.1 I) beta = -h with G = diag(1, 2).
        estimator.fit().unwrap();
        let beta = estimator.beta().unwrap();
        assert_abs_diff_eq!(beta[0], -1.0 / 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(beta[1], -2.0 / 2.1, epsilon = 1e-12);
        assert_eq!(estimator.solve_strategy(), Some(SolveStrategy::Cholesky));
    }
}
