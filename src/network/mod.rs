//! Wavefunction network: parameter blocks and the determinant ansatz.

mod detnet;
mod params;

use nalgebra::Vector3;

pub use detnet::{DetNet, ForwardCache, SignedLog};
pub use params::{DenseParams, DetParams, NetworkGradients, NetworkParameters, OrbitalParams};

/// Anything that maps an electron configuration to log|Ψ|.
///
/// Coordinate derivatives default to central differences; implementations
/// with cheap closed-form derivatives can override.
pub trait LogAmplitude {
    /// log|Ψ(r)|; `-inf` on a node.
    fn log_abs(&self, r: &[Vector3<f64>]) -> f64;

    /// Gradient of log|Ψ| per electron and the total Laplacian
    /// Σ_i ∇²_i log|Ψ|, by central differences with step `h`.
    fn grad_laplacian_log(&self, r: &[Vector3<f64>], h: f64) -> (Vec<Vector3<f64>>, f64) {
        let f0 = self.log_abs(r);
        let mut pos = r.to_vec();
        let mut grad = vec![Vector3::zeros(); r.len()];
        let mut lap = 0.0;
        for i in 0..r.len() {
            for axis in 0..3 {
                let orig = pos[i][axis];
                pos[i][axis] = orig + h;
                let fp = self.log_abs(&pos);
                pos[i][axis] = orig - h;
                let fm = self.log_abs(&pos);
                pos[i][axis] = orig;
                grad[i][axis] = (fp - fm) / (2.0 * h);
                lap += (fp - 2.0 * f0 + fm) / (h * h);
            }
        }
        (grad, lap)
    }
}

/// A network paired with a read-only view of its parameters for the
/// duration of one step.
#[derive(Clone, Copy)]
pub struct BoundNet<'a> {
    pub net: &'a DetNet,
    pub params: &'a NetworkParameters,
}

impl LogAmplitude for BoundNet<'_> {
    fn log_abs(&self, r: &[Vector3<f64>]) -> f64 {
        self.net.evaluate(self.params, r).logabs
    }
}

/// Per-dense-layer second-moment statistics collected during backprop,
/// consumed by the curvature-preconditioned optimizer. `a` accumulates
/// outer products of (bias-augmented) layer inputs, `g` of the
/// backpropagated output gradients, summed over electrons and walkers.
#[derive(Clone, Debug)]
pub struct LayerStats {
    pub a: nalgebra::DMatrix<f64>,
    pub g: nalgebra::DMatrix<f64>,
}

impl LayerStats {
    pub fn merge(&mut self, other: &LayerStats) {
        self.a += &other.a;
        self.g += &other.g;
    }
}
