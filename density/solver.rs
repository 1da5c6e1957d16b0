//! # Regularized System Solver
//!
//! Solves `A x = b` for the symmetric system assembled by the Nystrom fit and
//! returns `-x`. Fast factorizations are tried first; whenever one reports
//! failure the next, more forgiving strategy is used:
//!
//! 1.  With a strictly positive ridge the matrix is positive definite with
//!     eigenvalues bounded away from zero, so Cholesky is tried, followed by a
//!     Bunch-Kaufman `LDL^T` factorization that tolerates indefiniteness.
//! 2.  Without a ridge no definiteness is known and a Householder QR solve is
//!     used directly.
//! 3.  If everything above failed, a pseudo-inverse built from the symmetric
//!     eigendecomposition is applied.

use ndarray::{Array1, Array2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Diag, Eigh, FactorizeC, FactorizeH, QR, SolveC, SolveH, SolveTriangular, UPLO};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("System matrix must be square, got {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },

    #[error("System vector has length {found}, but the system matrix has {expected} rows.")]
    LengthMismatch { found: usize, expected: usize },

    #[error("Cannot solve an empty linear system.")]
    EmptySystem,

    #[error("The linear system contains NaN or infinite entries.")]
    NonFiniteSystem,

    #[error("Eigendecomposition for the pseudo-inverse failed: {0}")]
    EigendecompositionFailed(#[source] LinalgError),
}

/// Reasons a single strategy of the cascade is abandoned.
#[derive(Error, Debug)]
pub enum DecompositionError {
    #[error("LAPACK reported failure: {0}")]
    Lapack(#[from] LinalgError),

    #[error("Triangular factor has numerical rank {rank} of {size}.")]
    RankDeficient { rank: usize, size: usize },

    #[error("Solution contains NaN or infinite entries.")]
    NonFiniteSolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStrategy {
    Cholesky,
    BunchKaufman,
    HouseholderQr,
    PseudoInverse,
}

impl fmt::Display for SolveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolveStrategy::Cholesky => "Cholesky (LLT)",
            SolveStrategy::BunchKaufman => "Bunch-Kaufman (LDLT)",
            SolveStrategy::HouseholderQr => "Householder QR",
            SolveStrategy::PseudoInverse => "self-adjoint eigensolver pseudo-inverse",
        };
        f.write_str(name)
    }
}

/// The negated solution together with the strategy that produced it.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub solution: Array1<f64>,
    pub strategy: SolveStrategy,
}

type DirectSolver = fn(&Array2<f64>, &Array1<f64>) -> Result<Array1<f64>, DecompositionError>;

/// Solves `matrix * x = vector` and returns `-x`.
///
/// Only dimension problems, non-finite input and a failing eigendecomposition
/// are reported as errors. A pseudo-inverse with no eigenvalue above the
/// tolerance is the zero matrix and yields a zero solution; that is logged
/// but returned as a success.
pub fn solve_system(
    matrix: &Array2<f64>,
    vector: &Array1<f64>,
    lambda_l2: f64,
) -> Result<SolveOutcome, SolverError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(SolverError::NotSquare { rows, cols });
    }
    if vector.len() != rows {
        return Err(SolverError::LengthMismatch {
            found: vector.len(),
            expected: rows,
        });
    }
    if rows == 0 {
        return Err(SolverError::EmptySystem);
    }
    if !matrix.iter().chain(vector.iter()).all(|v| v.is_finite()) {
        return Err(SolverError::NonFiniteSystem);
    }

    let cascade: Vec<(SolveStrategy, DirectSolver)> = if lambda_l2 > 0.0 {
        vec![
            (SolveStrategy::Cholesky, solve_cholesky as DirectSolver),
            (SolveStrategy::BunchKaufman, solve_bunch_kaufman as DirectSolver),
        ]
    } else {
        vec![(SolveStrategy::HouseholderQr, solve_householder_qr as DirectSolver)]
    };

    for (strategy, solver) in cascade {
        log::info!("Solving with {strategy}.");
        match solver(matrix, vector) {
            Ok(solution) => {
                log::info!("Constructing solution.");
                return Ok(SolveOutcome {
                    solution: -solution,
                    strategy,
                });
            }
            Err(e) => log::warn!("Numerical problems with {strategy}: {e}"),
        }
    }

    let strategy = SolveStrategy::PseudoInverse;
    log::info!("Solving with {strategy}.");
    let pinv = pinv_self_adjoint(matrix)?;
    log::info!("Constructing solution.");
    Ok(SolveOutcome {
        solution: -pinv.dot(vector),
        strategy,
    })
}

/// Moore-Penrose pseudo-inverse of a symmetric matrix.
///
/// Eigenvalues at or below `eps * n * max_eigenvalue` are treated as zero,
/// the same cut-off numpy and Octave use for singular values.
pub fn pinv_self_adjoint(a: &Array2<f64>) -> Result<Array2<f64>, SolverError> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(SolverError::NotSquare { rows, cols });
    }
    if rows == 0 {
        return Err(SolverError::EmptySystem);
    }

    let (eigenvalues, eigenvectors) = a
        .eigh(UPLO::Lower)
        .map_err(SolverError::EigendecompositionFailed)?;

    let max_eigenvalue = eigenvalues.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    let tol = f64::EPSILON * rows as f64 * max_eigenvalue;

    let inv_eigenvalues = eigenvalues.mapv(|v| if v > tol { 1.0 / v } else { 0.0 });
    let rank = inv_eigenvalues.iter().filter(|&&v| v != 0.0).count();
    if rank == 0 {
        log::warn!(
            "No eigenvalue exceeds the pseudo-inverse tolerance {tol:.3e}; the pseudo-inverse is zero."
        );
    } else if rank < rows {
        log::info!("Pseudo-inverse keeps {rank} of {rows} eigenvalues.");
    }

    let scaled = &eigenvectors * &inv_eigenvalues;
    Ok(scaled.dot(&eigenvectors.t()))
}

fn solve_cholesky(
    matrix: &Array2<f64>,
    vector: &Array1<f64>,
) -> Result<Array1<f64>, DecompositionError> {
    let factor = matrix.factorizec(UPLO::Lower)?;
    finite(factor.solvec(vector)?)
}

fn solve_bunch_kaufman(
    matrix: &Array2<f64>,
    vector: &Array1<f64>,
) -> Result<Array1<f64>, DecompositionError> {
    let factor = matrix.factorizeh()?;
    finite(factor.solveh(vector)?)
}

fn solve_householder_qr(
    matrix: &Array2<f64>,
    vector: &Array1<f64>,
) -> Result<Array1<f64>, DecompositionError> {
    let (q, r) = matrix.qr()?;

    // Exact zeros are caught by LAPACK, near zeros are not.
    let size = r.nrows();
    let largest = r.diag().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let tol = f64::EPSILON * size as f64 * largest;
    let rank = r.diag().iter().filter(|v| v.abs() > tol).count();
    if rank < size {
        return Err(DecompositionError::RankDeficient { rank, size });
    }

    let qt_b = q.t().dot(vector);
    finite(r.solve_triangular(UPLO::Upper, Diag::NonUnit, &qt_b)?)
}

fn finite(solution: Array1<f64>) -> Result<Array1<f64>, DecompositionError> {
    if solution.iter().all(|v| v.is_finite()) {
        Ok(solution)
    } else {
        Err(DecompositionError::NonFiniteSolution)
    }
}
