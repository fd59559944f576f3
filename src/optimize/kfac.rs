//! Block-factored natural-gradient preconditioner.
//!
//! Each dense layer keeps a Kronecker-factored curvature estimate: an EMA
//! of input second moments A = ⟨a aᵀ⟩ (bias-augmented) and of output-
//! gradient second moments G = ⟨g gᵀ⟩. The raw layer gradient is
//! preconditioned by the damped factor inverses,
//!
//!   Ŵ = (G + λ_g I)⁻¹ [∂W ∂b] (A + λ_a I)⁻¹,
//!
//! with the damping split π-adjusted between the two factors. Inverses are
//! refreshed every `refresh_interval` steps to amortize their cost; the
//! envelope/orbital blocks fall back to a damped diagonal curvature.

use nalgebra::{DMatrix, DVector};
use nalgebra::linalg::Cholesky;
use serde::{Deserialize, Serialize};

use crate::config::KfacConfig;
use crate::network::{LayerStats, NetworkGradients, NetworkParameters};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LayerFactors {
    a: DMatrix<f64>,
    g: DMatrix<f64>,
    a_inv: DMatrix<f64>,
    g_inv: DMatrix<f64>,
}

/// Curvature approximation blocks plus the step counter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KfacState {
    pub step: u64,
    layers: Vec<LayerFactors>,
    /// Squared-gradient EMA for the non-dense (determinant block) tail.
    diag: DVector<f64>,
}

impl KfacState {
    pub fn new(params: &NetworkParameters) -> Self {
        let layers = params
            .layers
            .iter()
            .map(|l| {
                let da = l.w.ncols() + 1;
                let dg = l.w.nrows();
                LayerFactors {
                    a: DMatrix::zeros(da, da),
                    g: DMatrix::zeros(dg, dg),
                    a_inv: DMatrix::identity(da, da),
                    g_inv: DMatrix::identity(dg, dg),
                }
            })
            .collect();
        let tail = params.len() - params.dense_len();
        Self {
            step: 0,
            layers,
            diag: DVector::zeros(tail),
        }
    }

    /// Current damping with its decay schedule applied.
    fn damping(&self, cfg: &KfacConfig) -> f64 {
        cfg.damping / (1.0 + self.step as f64 / cfg.damping_delay)
    }

    /// Precondition `grad` and advance the curvature state. `curvature`
    /// holds the batch's per-layer second moments summed over walkers.
    /// Returns the update direction and the damping used.
    pub fn step(
        &mut self,
        grad: &NetworkGradients,
        curvature: Option<&[LayerStats]>,
        n_walkers: f64,
        cfg: &KfacConfig,
    ) -> (NetworkGradients, f64) {
        if let Some(stats) = curvature {
            let decay = cfg.cov_ema_decay;
            for (lf, st) in self.layers.iter_mut().zip(stats.iter()) {
                let a_batch = &st.a / n_walkers;
                let g_batch = &st.g / n_walkers;
                if self.step == 0 {
                    lf.a = a_batch;
                    lf.g = g_batch;
                } else {
                    lf.a = &lf.a * decay + a_batch * (1.0 - decay);
                    lf.g = &lf.g * decay + g_batch * (1.0 - decay);
                }
            }
        }

        let damping = self.damping(cfg);
        if self.step % cfg.refresh_interval.max(1) == 0 {
            for lf in self.layers.iter_mut() {
                let (a_inv, g_inv) = pi_adjusted_inverses(&lf.a, &lf.g, damping);
                lf.a_inv = a_inv;
                lf.g_inv = g_inv;
            }
        }

        let mut delta = grad.clone();
        for (i, lf) in self.layers.iter().enumerate() {
            let gw = &grad.layers[i].w;
            let gb = &grad.layers[i].b;
            let mut wb = DMatrix::zeros(gw.nrows(), gw.ncols() + 1);
            wb.view_mut((0, 0), (gw.nrows(), gw.ncols())).copy_from(gw);
            wb.set_column(gw.ncols(), gb);
            let pre = &lf.g_inv * wb * &lf.a_inv;
            delta.layers[i]
                .w
                .copy_from(&pre.view((0, 0), (gw.nrows(), gw.ncols())));
            delta.layers[i].b.copy_from(&pre.column(gw.ncols()));
        }

        // Diagonal Fisher for the determinant blocks.
        let decay = cfg.cov_ema_decay;
        let first = self.step == 0;
        let sqrt_damping = damping.sqrt();
        for (dv, (g, ema)) in delta
            .det_values_mut()
            .zip(grad.det_values().zip(self.diag.iter_mut()))
        {
            *ema = if first {
                g * g
            } else {
                decay * *ema + (1.0 - decay) * g * g
            };
            *dv = g / (ema.sqrt() + sqrt_damping);
        }

        self.step += 1;
        (delta, damping)
    }
}

/// Damped inverses of both Kronecker factors, with the damping split by
/// the π ratio of their average diagonals so the product carries the full
/// Tikhonov weight.
fn pi_adjusted_inverses(a: &DMatrix<f64>, g: &DMatrix<f64>, damping: f64) -> (DMatrix<f64>, DMatrix<f64>) {
    let da = a.nrows() as f64;
    let dg = g.nrows() as f64;
    let mean_a = (a.trace() / da).max(f64::MIN_POSITIVE);
    let mean_g = (g.trace() / dg).max(f64::MIN_POSITIVE);
    let mut pi = (mean_a / mean_g).sqrt();
    if !pi.is_finite() || pi == 0.0 {
        pi = 1.0;
    }
    let sqrt_damping = damping.sqrt();
    let a_damped = a + DMatrix::identity(a.nrows(), a.ncols()) * (sqrt_damping * pi);
    let g_damped = g + DMatrix::identity(g.nrows(), g.ncols()) * (sqrt_damping / pi);
    (robust_inverse(a_damped), robust_inverse(g_damped))
}

/// Cholesky inverse with LU fallback; identity if the block is beyond
/// saving (the update then reduces to the raw gradient).
fn robust_inverse(m: DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    if let Some(chol) = Cholesky::new(m.clone()) {
        return chol.inverse();
    }
    m.lu().try_inverse().unwrap_or_else(|| DMatrix::identity(n, n))
}
