//! Stochastic optimizers for the energy objective.
//!
//! The gradient of the energy expectation w.r.t. network parameters is the
//! covariance estimator
//!
//!   ∇E = 2 ( ⟨E_L O⟩ − ⟨E_L⟩⟨O⟩ ),   O = ∂ log|Ψ| / ∂θ,
//!
//! accumulated over the walker batch. Two preconditioners are available:
//! Adam-style moment scaling and a block-factored natural-gradient solve.
//! Both refuse to apply an update built from non-finite quantities when
//! NaN checking is enabled.

mod adam;
mod kfac;

pub use adam::AdamState;
pub use kfac::KfacState;

use serde::{Deserialize, Serialize};

use crate::config::{OptimConfig, OptimizerKind};
use crate::error::TrainError;
use crate::network::{LayerStats, NetworkGradients, NetworkParameters};

/// Sums of the per-walker estimator terms, mergeable across device shards.
pub struct GradientAccumulator {
    pub n: usize,
    pub sum_e: f64,
    pub sum_e_sq: f64,
    pub sum_o: NetworkGradients,
    pub sum_eo: NetworkGradients,
    pub curvature: Option<Vec<LayerStats>>,
}

impl GradientAccumulator {
    pub fn new(template: &NetworkParameters) -> Self {
        Self {
            n: 0,
            sum_e: 0.0,
            sum_e_sq: 0.0,
            sum_o: template.zeros_like(),
            sum_eo: template.zeros_like(),
            curvature: None,
        }
    }

    /// Record one walker's local energy and log-derivative.
    pub fn push(&mut self, energy: f64, logpsi_grad: &NetworkGradients, stats: Option<Vec<LayerStats>>) {
        self.n += 1;
        self.sum_e += energy;
        self.sum_e_sq += energy * energy;
        self.sum_o.add_scaled(1.0, logpsi_grad);
        self.sum_eo.add_scaled(energy, logpsi_grad);
        if let Some(stats) = stats {
            match self.curvature.as_mut() {
                Some(acc) => {
                    for (a, s) in acc.iter_mut().zip(stats.iter()) {
                        a.merge(s);
                    }
                }
                None => self.curvature = Some(stats),
            }
        }
    }

    /// Fold another shard's sums into this one.
    pub fn merge(&mut self, other: &GradientAccumulator) {
        self.n += other.n;
        self.sum_e += other.sum_e;
        self.sum_e_sq += other.sum_e_sq;
        self.sum_o.add_scaled(1.0, &other.sum_o);
        self.sum_eo.add_scaled(1.0, &other.sum_eo);
        if let Some(stats) = &other.curvature {
            match self.curvature.as_mut() {
                Some(acc) => {
                    for (a, s) in acc.iter_mut().zip(stats.iter()) {
                        a.merge(s);
                    }
                }
                None => self.curvature = Some(stats.clone()),
            }
        }
    }

    pub fn energy_mean(&self) -> f64 {
        self.sum_e / self.n as f64
    }

    pub fn energy_variance(&self) -> f64 {
        let mean = self.energy_mean();
        (self.sum_e_sq / self.n as f64 - mean * mean).max(0.0)
    }

    /// The covariance gradient estimate.
    pub fn gradient(&self) -> NetworkGradients {
        let n = self.n as f64;
        let mut grad = self.sum_eo.clone();
        grad.add_scaled(-self.energy_mean(), &self.sum_o);
        grad.scale(2.0 / n);
        grad
    }
}

/// Per-step optimizer diagnostics handed to the metrics stream.
#[derive(Clone, Copy, Debug)]
pub struct StepMetrics {
    pub grad_norm: f64,
    pub learning_rate: f64,
    pub damping: Option<f64>,
}

/// Serializable optimizer state, part of every checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OptimizerState {
    Adam(AdamState),
    Kfac(KfacState),
}

impl OptimizerState {
    pub fn step_count(&self) -> u64 {
        match self {
            OptimizerState::Adam(s) => s.step,
            OptimizerState::Kfac(s) => s.step,
        }
    }
}

/// Rescale the gradient so its global norm does not exceed `max_norm`.
fn clip_by_global_norm(grad: &mut NetworkGradients, max_norm: f64) -> f64 {
    let norm = grad.norm();
    if norm > max_norm && norm > 0.0 {
        grad.scale(max_norm / norm);
    }
    norm
}

/// The configured optimizer together with its persistent state.
pub struct Optimizer {
    cfg: OptimConfig,
    state: OptimizerState,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, cfg: &OptimConfig, params: &NetworkParameters) -> Self {
        let state = match kind {
            OptimizerKind::Adam => OptimizerState::Adam(AdamState::new(params.len())),
            OptimizerKind::Kfac => OptimizerState::Kfac(KfacState::new(params)),
        };
        Self { cfg: cfg.clone(), state }
    }

    pub fn from_state(cfg: &OptimConfig, state: OptimizerState) -> Self {
        Self { cfg: cfg.clone(), state }
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    /// Apply one update. Returns the new parameters; the previous set is
    /// untouched, so a failed step leaves nothing corrupted.
    pub fn step(
        &mut self,
        iteration: u64,
        params: &NetworkParameters,
        batch: &GradientAccumulator,
        check_nan: bool,
    ) -> Result<(NetworkParameters, StepMetrics), TrainError> {
        let e_mean = batch.energy_mean();
        if check_nan && !e_mean.is_finite() {
            return Err(TrainError::NumericalInstability {
                iteration,
                quantity: "batch local energy".into(),
            });
        }
        let mut grad = batch.gradient();
        if check_nan && grad.has_non_finite() {
            return Err(TrainError::NumericalInstability {
                iteration,
                quantity: "energy gradient".into(),
            });
        }
        let grad_norm = clip_by_global_norm(&mut grad, self.cfg.clip_norm);
        let learning_rate = self.cfg.learning_rate / (1.0 + iteration as f64 / self.cfg.lr_delay);

        let (delta, damping) = match &mut self.state {
            OptimizerState::Adam(state) => (state.step(&grad, &self.cfg.adam), None),
            OptimizerState::Kfac(state) => {
                let (delta, damping) = state.step(
                    &grad,
                    batch.curvature.as_deref(),
                    batch.n as f64,
                    &self.cfg.kfac,
                );
                (delta, Some(damping))
            }
        };

        let mut new_params = params.clone();
        new_params.add_scaled(-learning_rate, &delta);
        Ok((new_params, StepMetrics { grad_norm, learning_rate, damping }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};
    use crate::network::{DenseParams, DetParams, OrbitalParams};
    use approx::assert_relative_eq;

    fn template() -> NetworkParameters {
        NetworkParameters {
            layers: vec![DenseParams {
                w: DMatrix::zeros(2, 3),
                b: DVector::zeros(2),
            }],
            dets: vec![DetParams {
                up: OrbitalParams {
                    w: DMatrix::zeros(1, 2),
                    b: DVector::zeros(1),
                    pi: DMatrix::zeros(1, 1),
                    sigma: DMatrix::zeros(1, 1),
                },
                dn: OrbitalParams {
                    w: DMatrix::zeros(0, 2),
                    b: DVector::zeros(0),
                    pi: DMatrix::zeros(0, 1),
                    sigma: DMatrix::zeros(0, 1),
                },
            }],
        }
    }

    fn constant_grad(t: &NetworkParameters, value: f64) -> NetworkGradients {
        let mut g = t.zeros_like();
        let n = g.len();
        g.set_from_flat(&DVector::from_element(n, value));
        g
    }

    fn default_cfg() -> OptimConfig {
        OptimConfig {
            learning_rate: 0.1,
            lr_delay: 1e6,
            clip_norm: 100.0,
            ..OptimConfig::default()
        }
    }

    #[test]
    fn test_covariance_gradient() {
        let t = template();
        let mut acc = GradientAccumulator::new(&t);
        acc.push(1.0, &constant_grad(&t, 1.0), None);
        acc.push(3.0, &constant_grad(&t, 0.5), None);
        // mean E = 2, grad = 2/2 * (Σ E O − mean Σ O)
        //        = (1·1 + 3·0.5) − 2·(1 + 0.5) = -0.5 per component.
        let grad = acc.gradient();
        for v in grad.values() {
            assert_relative_eq!(v, -0.5, epsilon = 1e-12);
        }
        assert_relative_eq!(acc.energy_mean(), 2.0);
        assert_relative_eq!(acc.energy_variance(), 1.0);
    }

    #[test]
    fn test_merge_matches_single_accumulator() {
        let t = template();
        let mut whole = GradientAccumulator::new(&t);
        whole.push(1.0, &constant_grad(&t, 1.0), None);
        whole.push(2.0, &constant_grad(&t, -1.0), None);

        let mut left = GradientAccumulator::new(&t);
        left.push(1.0, &constant_grad(&t, 1.0), None);
        let mut right = GradientAccumulator::new(&t);
        right.push(2.0, &constant_grad(&t, -1.0), None);
        left.merge(&right);

        for (a, b) in whole.gradient().values().zip(left.gradient().values()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_clip_by_global_norm() {
        let t = template();
        let mut grad = constant_grad(&t, 3.0);
        let n = grad.len() as f64;
        let norm = clip_by_global_norm(&mut grad, 1.0);
        assert_relative_eq!(norm, 3.0 * n.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(grad.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_nan_energy_aborts_without_touching_state() {
        let t = template();
        let mut acc = GradientAccumulator::new(&t);
        acc.push(f64::NAN, &constant_grad(&t, 1.0), None);
        acc.push(1.0, &constant_grad(&t, 1.0), None);

        let cfg = default_cfg();
        let mut opt = Optimizer::new(OptimizerKind::Adam, &cfg, &t);
        let err = opt.step(7, &t, &acc, true).unwrap_err();
        match err {
            TrainError::NumericalInstability { iteration, .. } => assert_eq!(iteration, 7),
            other => panic!("expected numerical instability, got {other}"),
        }
        assert_eq!(opt.state().step_count(), 0);
    }

    #[test]
    fn test_nan_gradient_aborts_for_both_variants() {
        let t = template();
        let mut acc = GradientAccumulator::new(&t);
        let mut bad = constant_grad(&t, 1.0);
        let n = bad.len();
        let mut flat = bad.to_flat();
        flat[n - 1] = f64::NAN;
        bad.set_from_flat(&flat);
        acc.push(1.0, &bad, None);

        let cfg = default_cfg();
        for kind in [OptimizerKind::Adam, OptimizerKind::Kfac] {
            let mut opt = Optimizer::new(kind, &cfg, &t);
            assert!(opt.step(0, &t, &acc, true).is_err());
            assert_eq!(opt.state().step_count(), 0);
        }
    }

    #[test]
    fn test_adam_step_moves_against_gradient() {
        let t = template();
        let mut acc = GradientAccumulator::new(&t);
        // Constant positive gradient: E_L correlates positively with O.
        acc.push(1.0, &constant_grad(&t, 0.0), None);
        acc.push(3.0, &constant_grad(&t, 1.0), None);

        let cfg = default_cfg();
        let mut opt = Optimizer::new(OptimizerKind::Adam, &cfg, &t);
        let (new_params, metrics) = opt.step(0, &t, &acc, true).unwrap();
        for v in new_params.values() {
            assert!(v < 0.0, "update should move against a positive gradient");
        }
        assert!(metrics.grad_norm > 0.0);
        assert_eq!(opt.state().step_count(), 1);
    }
}
