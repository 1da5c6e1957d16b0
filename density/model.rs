use crate::kernel::{GaussianKernel, KernelError, KernelEvaluator};
use crate::nystrom::{DensityError, NystromEstimator, NystromParams};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// --- Public Data Structures ---
// Both files are human-readable TOML: a fit configuration written by hand and
// the fitted model written by `kdensity fit`.

/// Kernel family and its hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelSpec {
    /// `k(x, y) = exp(-|x - y|^2 / sigma)`.
    Gaussian { sigma: f64 },
}

impl KernelSpec {
    pub fn build(&self) -> Result<Box<dyn KernelEvaluator>, KernelError> {
        match *self {
            KernelSpec::Gaussian { sigma } => Ok(Box::new(GaussianKernel::new(sigma)?)),
        }
    }
}

/// How the basis points are taken from the training data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BasisSelection {
    /// Every training point is a basis point.
    All,
    /// Explicit column indices into the training data.
    Indices { indices: Vec<usize> },
    /// `count` points drawn uniformly without replacement.
    Subsample {
        count: usize,
        #[serde(default)]
        sorted: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Seed for basis subsampling. Without it the draw is seeded from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    pub kernel: KernelSpec,
    #[serde(default)]
    pub params: NystromParams,
    pub basis: BasisSelection,
}

/// Everything needed to evaluate a fitted density on new points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedDensity {
    /// Data indices of the basis points, when the basis was taken from the data.
    #[serde(default)]
    pub basis_indices: Option<Vec<usize>>,
    pub kernel: KernelSpec,
    pub params: NystromParams,
    /// `D x m`, one basis point per column.
    pub basis: Array2<f64>,
    pub beta: Array1<f64>,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid kernel configuration: {0}")]
    KernelError(#[from] KernelError),
    #[error("Density estimation failed: {0}")]
    DensityError(#[from] DensityError),
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ModelError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

impl FitConfig {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    /// Builds an unfitted estimator over `data` (`D x N`) as configured.
    pub fn estimator(&self, data: Arc<Array2<f64>>) -> Result<NystromEstimator, ModelError> {
        let kernel = self.kernel.build()?;
        let estimator = match &self.basis {
            BasisSelection::All => {
                let indices = (0..data.ncols()).collect();
                NystromEstimator::from_basis_indices(data, indices, kernel, self.params)?
            }
            BasisSelection::Indices { indices } => {
                NystromEstimator::from_basis_indices(data, indices.clone(), kernel, self.params)?
            }
            BasisSelection::Subsample { count, sorted } => {
                let mut rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                NystromEstimator::from_subsample(
                    data,
                    *count,
                    *sorted,
                    kernel,
                    self.params,
                    &mut rng,
                )?
            }
        };
        Ok(estimator)
    }

    /// Fits a density to `data` and packages the result.
    pub fn fit(&self, data: Arc<Array2<f64>>) -> Result<TrainedDensity, ModelError> {
        let mut estimator = self.estimator(data)?;
        estimator.fit()?;
        Ok(TrainedDensity::from_estimator(self.kernel, &estimator)?)
    }
}

impl TrainedDensity {
    /// Captures a fitted estimator. Fails with `NotFitted` if `fit` has not
    /// succeeded on it.
    pub fn from_estimator(
        kernel: KernelSpec,
        estimator: &NystromEstimator,
    ) -> Result<Self, DensityError> {
        let beta = estimator.beta().ok_or(DensityError::NotFitted)?;
        Ok(Self {
            basis_indices: estimator.basis_indices().map(<[usize]>::to_vec),
            kernel,
            params: *estimator.params(),
            basis: estimator.basis().clone(),
            beta: beta.clone(),
        })
    }

    /// Rebuilds a fitted estimator whose queries index the columns of `points`.
    pub fn estimator_for(&self, points: Arc<Array2<f64>>) -> Result<NystromEstimator, ModelError> {
        let mut estimator = NystromEstimator::from_basis(
            points,
            Arc::new(self.basis.clone()),
            self.kernel.build()?,
            self.params,
        )?;
        estimator.restore_coefficients(self.beta.clone())?;
        Ok(estimator)
    }

    /// Saves the fitted model to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        save_toml(self, path)
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}
