//! # Kernel Derivative Evaluators
//!
//! The Nystrom estimator never looks at kernel values directly. Everything it
//! needs is expressed through derivatives of a translation invariant kernel
//! `k(x, y) = psi(x - y)` between a *basis* point `x` and a *data* point `y`:
//!
//! - `dx`: the gradient with respect to `x` (length `D`).
//! - `dx_i_dx_j`: the Hessian with respect to `x` (`D x D`).
//! - third derivatives, either contracted with a vector or summed over the
//!   repeated index, used for the Hessian of the log-density and for `h`.
//! - `dx_dy_all`: every mixed second derivative between all basis and all
//!   data points, stacked as an `(m*D) x (N*D)` matrix.
//!
//! Evaluators are bound to one (basis, data) pair at a time. Rebinding takes
//! `&mut self`, so it can never overlap with a derivative query on the same
//! evaluator. Temporary rebinding goes through [`Rebinding`], which restores
//! the previous pair when dropped.

use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Gaussian kernel bandwidth must be positive and finite, got {0}")]
    InvalidBandwidth(f64),
}

/// Capability set consumed by the Nystrom estimator.
///
/// Basis and data matrices store one point per column (`D x m` and `D x N`).
/// Implementations must be translation invariant: the mixed derivative
/// `d^2 k / dx_i dy_j` is taken to be `-dx_i_dx_j`.
pub trait KernelEvaluator: Send + Sync {
    /// Rebinds the evaluator to a new (basis, data) pair.
    fn set_basis_and_data(&mut self, basis: Arc<Array2<f64>>, data: Arc<Array2<f64>>);

    fn basis(&self) -> &Arc<Array2<f64>>;

    fn data(&self) -> &Arc<Array2<f64>>;

    fn num_dimensions(&self) -> usize {
        self.basis().nrows()
    }

    fn num_basis(&self) -> usize {
        self.basis().ncols()
    }

    fn num_data(&self) -> usize {
        self.data().ncols()
    }

    /// Gradient of the kernel with respect to the basis argument.
    fn dx(&self, idx_a: usize, idx_b: usize) -> Array1<f64>;

    /// Hessian of the kernel with respect to the basis argument.
    fn dx_i_dx_j(&self, idx_a: usize, idx_b: usize) -> Array2<f64>;

    /// `sum_k d^3 k / (dx_i dx_j dx_k) * vec[k]` for a single `(i, j)` pair.
    fn dx_i_dx_j_dx_k_dot_vec_component(
        &self,
        idx_a: usize,
        idx_b: usize,
        vec: ArrayView1<f64>,
        i: usize,
        j: usize,
    ) -> f64;

    /// Vector over `i` of `sum_j d^3 k / (dx_i dx_j dx_j)`.
    fn dx_i_dx_j_dx_j_sum(&self, idx_a: usize, idx_b: usize) -> Array1<f64>;

    /// All mixed second derivatives between the bound basis and data.
    ///
    /// Row `a*D + i`, column `b*D + j` holds `d^2 k(x_a, y_b) / dx_i dy_j`.
    /// Column blocks are independent and are filled in parallel.
    fn dx_dy_all(&self) -> Array2<f64> {
        let d = self.num_dimensions();
        let m = self.num_basis();
        let n = self.num_data();

        let mut g = Array2::<f64>::zeros((m * d, n * d));
        g.axis_chunks_iter_mut(Axis(1), d)
            .into_par_iter()
            .enumerate()
            .for_each(|(idx_b, mut column_block)| {
                for idx_a in 0..m {
                    let hessian = self.dx_i_dx_j(idx_a, idx_b);
                    column_block
                        .slice_mut(s![idx_a * d..(idx_a + 1) * d, ..])
                        .zip_mut_with(&hessian, |entry, &h| *entry = -h);
                }
            });
        g
    }
}

/// Scoped rebinding of a kernel evaluator.
///
/// The previous (basis, data) pair is captured on construction and put back
/// in `Drop`, so early returns and unwinding both leave the evaluator bound
/// the way the caller found it.
pub struct Rebinding<'k, K: KernelEvaluator + ?Sized> {
    kernel: &'k mut K,
    previous_basis: Arc<Array2<f64>>,
    previous_data: Arc<Array2<f64>>,
}

impl<'k, K: KernelEvaluator + ?Sized> Rebinding<'k, K> {
    pub fn new(kernel: &'k mut K, basis: Arc<Array2<f64>>, data: Arc<Array2<f64>>) -> Self {
        let previous_basis = Arc::clone(kernel.basis());
        let previous_data = Arc::clone(kernel.data());
        kernel.set_basis_and_data(basis, data);
        Self {
            kernel,
            previous_basis,
            previous_data,
        }
    }
}

impl<K: KernelEvaluator + ?Sized> Deref for Rebinding<'_, K> {
    type Target = K;

    fn deref(&self) -> &K {
        &*self.kernel
    }
}

impl<K: KernelEvaluator + ?Sized> Drop for Rebinding<'_, K> {
    fn drop(&mut self) {
        self.kernel.set_basis_and_data(
            Arc::clone(&self.previous_basis),
            Arc::clone(&self.previous_data),
        );
    }
}

/// Gaussian kernel `k(x, y) = exp(-|x - y|^2 / sigma)`.
///
/// With `d = x - y` and `k = k(x, y)`:
/// - `dk/dx_i = -2 d_i k / sigma`
/// - `d2k/dx_i dx_j = k (4 d_i d_j / sigma^2 - 2 delta_ij / sigma)`
/// - `d3k/dx_i dx_j dx_l = k (4 (delta_ij d_l + delta_il d_j + delta_jl d_i) / sigma^2
///   - 8 d_i d_j d_l / sigma^3)`
#[derive(Debug, Clone)]
pub struct GaussianKernel {
    sigma: f64,
    basis: Arc<Array2<f64>>,
    data: Arc<Array2<f64>>,
}

impl GaussianKernel {
    /// Creates an evaluator bound to empty basis and data; the estimator
    /// binds the real pair on construction.
    pub fn new(sigma: f64) -> Result<Self, KernelError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(KernelError::InvalidBandwidth(sigma));
        }
        let empty = Arc::new(Array2::zeros((0, 0)));
        Ok(Self {
            sigma,
            basis: Arc::clone(&empty),
            data: empty,
        })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Kernel value `k(basis[idx_a], data[idx_b])`.
    pub fn kernel(&self, idx_a: usize, idx_b: usize) -> f64 {
        let diff = self.difference(idx_a, idx_b);
        self.kernel_of_difference(&diff)
    }

    fn difference(&self, idx_a: usize, idx_b: usize) -> Array1<f64> {
        &self.basis.column(idx_a) - &self.data.column(idx_b)
    }

    fn kernel_of_difference(&self, diff: &Array1<f64>) -> f64 {
        (-diff.dot(diff) / self.sigma).exp()
    }
}

impl KernelEvaluator for GaussianKernel {
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
        let diff = self.difference(idx_a, idx_b);
        let k = self.kernel_of_difference(&diff);
        diff * (-2.0 * k / self.sigma)
    }

    fn dx_i_dx_j(&self, idx_a: usize, idx_b: usize) -> Array2<f64> {
        let diff = self.difference(idx_a, idx_b);
        let k = self.kernel_of_difference(&diff);
        let d = diff.len();
        let sigma_sq = self.sigma * self.sigma;

        Array2::from_shape_fn((d, d), |(i, j)| {
            let delta = if i == j { 1.0 } else { 0.0 };
            k * (4.0 * diff[i] * diff[j] / sigma_sq - 2.0 * delta / self.sigma)
        })
    }

    fn dx_i_dx_j_dx_k_dot_vec_component(
        &self,
        idx_a: usize,
        idx_b: usize,
        vec: ArrayView1<f64>,
        i: usize,
        j: usize,
    ) -> f64 {
        let diff = self.difference(idx_a, idx_b);
        let k = self.kernel_of_difference(&diff);
        let sigma_sq = self.sigma * self.sigma;
        let sigma_cube = sigma_sq * self.sigma;

        let diff_dot_vec = diff.dot(&vec);
        let delta = if i == j { 1.0 } else { 0.0 };

        k * (4.0 * (delta * diff_dot_vec + diff[j] * vec[i] + diff[i] * vec[j]) / sigma_sq
            - 8.0 * diff[i] * diff[j] * diff_dot_vec / sigma_cube)
    }

    fn dx_i_dx_j_dx_j_sum(&self, idx_a: usize, idx_b: usize) -> Array1<f64> {
        let diff = self.difference(idx_a, idx_b);
        let k = self.kernel_of_difference(&diff);
        let d = diff.len() as f64;
        let sigma_sq = self.sigma * self.sigma;
        let sigma_cube = sigma_sq * self.sigma;

        let scale = k * (4.0 * (d + 2.0) / sigma_sq - 8.0 * diff.dot(&diff) / sigma_cube);
        diff * scale
    }
}
