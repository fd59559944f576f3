//! Named network parameter blocks and elementwise operations over them.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Weights and bias of one dense layer of the equivariant stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DenseParams {
    pub w: DMatrix<f64>,
    pub b: DVector<f64>,
}

/// Orbital parameters for one spin channel of one determinant: a linear
/// readout of the final hidden features plus per-atom exponential-envelope
/// weights and decays. Row α holds the parameters of orbital α.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrbitalParams {
    pub w: DMatrix<f64>,
    pub b: DVector<f64>,
    pub pi: DMatrix<f64>,
    pub sigma: DMatrix<f64>,
}

impl OrbitalParams {
    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.w
            .iter()
            .chain(self.b.iter())
            .chain(self.pi.iter())
            .chain(self.sigma.iter())
            .copied()
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut f64> + '_ {
        self.w
            .iter_mut()
            .chain(self.b.iter_mut())
            .chain(self.pi.iter_mut())
            .chain(self.sigma.iter_mut())
    }

    fn len(&self) -> usize {
        self.w.len() + self.b.len() + self.pi.len() + self.sigma.len()
    }
}

/// Spin-up and spin-down orbital blocks of one determinant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetParams {
    pub up: OrbitalParams,
    pub dn: OrbitalParams,
}

/// Full parameter set of the wavefunction network. Owned exclusively by
/// the optimizer during updates; shared read-only with the sampler and
/// energy evaluator within a step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkParameters {
    pub layers: Vec<DenseParams>,
    pub dets: Vec<DetParams>,
}

/// Gradients share the parameter structure.
pub type NetworkGradients = NetworkParameters;

impl NetworkParameters {
    /// All values in canonical order: dense layers first, then the
    /// determinant blocks.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.layers
            .iter()
            .flat_map(|l| l.w.iter().chain(l.b.iter()).copied())
            .chain(
                self.dets
                    .iter()
                    .flat_map(|d| d.up.values().chain(d.dn.values())),
            )
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut f64> + '_ {
        self.layers
            .iter_mut()
            .flat_map(|l| l.w.iter_mut().chain(l.b.iter_mut()))
            .chain(
                self.dets
                    .iter_mut()
                    .flat_map(|d| d.up.values_mut().chain(d.dn.values_mut())),
            )
    }

    /// Determinant-block values only (everything after the dense prefix).
    pub fn det_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.dets
            .iter()
            .flat_map(|d| d.up.values().chain(d.dn.values()))
    }

    pub fn det_values_mut(&mut self) -> impl Iterator<Item = &mut f64> + '_ {
        self.dets
            .iter_mut()
            .flat_map(|d| d.up.values_mut().chain(d.dn.values_mut()))
    }

    pub fn len(&self) -> usize {
        self.dense_len()
            + self
                .dets
                .iter()
                .map(|d| d.up.len() + d.dn.len())
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the dense-layer prefix in the canonical order.
    pub fn dense_len(&self) -> usize {
        self.layers.iter().map(|l| l.w.len() + l.b.len()).sum()
    }

    pub fn zeros_like(&self) -> Self {
        let mut out = self.clone();
        for v in out.values_mut() {
            *v = 0.0;
        }
        out
    }

    pub fn to_flat(&self) -> DVector<f64> {
        DVector::from_iterator(self.len(), self.values())
    }

    /// Overwrite all values from a flat vector in canonical order.
    pub fn set_from_flat(&mut self, flat: &DVector<f64>) {
        debug_assert_eq!(flat.len(), self.len());
        for (dst, src) in self.values_mut().zip(flat.iter()) {
            *dst = *src;
        }
    }

    /// self += a * other, blockwise.
    pub fn add_scaled(&mut self, a: f64, other: &Self) {
        for (dst, src) in self.values_mut().zip(other.values()) {
            *dst += a * src;
        }
    }

    pub fn scale(&mut self, a: f64) {
        for v in self.values_mut() {
            *v *= a;
        }
    }

    /// Global L2 norm over every block.
    pub fn norm(&self) -> f64 {
        self.values().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn has_non_finite(&self) -> bool {
        self.values().any(|v| !v.is_finite())
    }
}
