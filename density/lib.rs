//! Kernel exponential family density estimation fitted by score matching,
//! with the function space restricted to a Nystrom basis.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod data;
pub mod kernel;
pub mod model;
pub mod nystrom;
pub mod solver;
pub mod subsample;

pub use kernel::{GaussianKernel, KernelEvaluator};
pub use nystrom::{DensityError, NystromEstimator};
