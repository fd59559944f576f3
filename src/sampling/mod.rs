//! Sampling module - Metropolis Monte Carlo over walker batches.

mod mcmc;

pub use mcmc::{McmcState, Walker};
