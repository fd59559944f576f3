//! Adam moment estimates over the flattened parameter vector.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::config::AdamConfig;
use crate::network::NetworkGradients;

/// Exponential moving first/second moments plus the step counter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdamState {
    pub step: u64,
    m: DVector<f64>,
    v: DVector<f64>,
}

impl AdamState {
    pub fn new(n_params: usize) -> Self {
        Self {
            step: 0,
            m: DVector::zeros(n_params),
            v: DVector::zeros(n_params),
        }
    }

    /// Update the moments with `grad` and return the update direction
    /// (the caller applies the learning rate).
    pub fn step(&mut self, grad: &NetworkGradients, cfg: &AdamConfig) -> NetworkGradients {
        let g = grad.to_flat();
        self.m = &self.m * cfg.b1 + &g * (1.0 - cfg.b1);
        self.v = &self.v * cfg.b2 + g.component_mul(&g) * (1.0 - cfg.b2);
        self.step += 1;
        let t = self.step as i32;
        let m_corr = 1.0 - cfg.b1.powi(t);
        let v_corr = 1.0 - cfg.b2.powi(t);
        let delta_flat = DVector::from_fn(g.len(), |i, _| {
            let m_hat = self.m[i] / m_corr;
            let v_hat = self.v[i] / v_corr;
            m_hat / (v_hat.sqrt() + cfg.eps)
        });
        let mut delta = grad.zeros_like();
        delta.set_from_flat(&delta_flat);
        delta
    }
}
