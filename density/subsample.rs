use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubsampleError {
    #[error("Cannot choose {chosen} distinct indices out of {population}.")]
    CountExceedsPopulation { chosen: usize, population: usize },

    #[error("Column index {index} is out of range for a matrix with {num_cols} columns.")]
    IndexOutOfRange { index: usize, num_cols: usize },
}

/// Chooses `m` distinct indices of `[0, n)` uniformly at random.
///
/// The chosen set is the first `m` entries of a random permutation. With
/// `sorted` the indices are returned in ascending order, which makes later
/// column reads sequential; the chosen set itself is unaffected.
pub fn choose_m_in_n<R: Rng + ?Sized>(
    m: usize,
    n: usize,
    sorted: bool,
    rng: &mut R,
) -> Result<Vec<usize>, SubsampleError> {
    if m > n {
        return Err(SubsampleError::CountExceedsPopulation {
            chosen: m,
            population: n,
        });
    }

    let mut permutation: Vec<usize> = (0..n).collect();
    permutation.shuffle(rng);
    permutation.truncate(m);

    if sorted {
        permutation.sort_unstable();
    }

    Ok(permutation)
}

/// Copies the requested columns into a fresh matrix, in the order given.
pub fn subsample_matrix_cols(
    col_inds: &[usize],
    mat: ArrayView2<f64>,
) -> Result<Array2<f64>, SubsampleError> {
    let num_cols = mat.ncols();
    if let Some(&index) = col_inds.iter().find(|&&index| index >= num_cols) {
        return Err(SubsampleError::IndexOutOfRange { index, num_cols });
    }

    let mut subsampled = Array2::<f64>::zeros((mat.nrows(), col_inds.len()));
    for (mut target, &source) in subsampled.columns_mut().into_iter().zip(col_inds) {
        target.assign(&mat.column(source));
    }
    Ok(subsampled)
}
