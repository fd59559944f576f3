//! Local energy of the molecular Coulomb Hamiltonian.
//!
//! H = -1/2 Σ_i ∇_i² - Σ_ia Z_a/r_ia + Σ_{i<j} 1/r_ij + Σ_{a<b} Z_a Z_b/R_ab
//!
//! The potential terms are closed-form in the positions and charges. The
//! kinetic term is evaluated on the log-amplitude:
//! T = -1/2 Σ_i (∇²_i log|Ψ| + |∇_i log|Ψ||²).

use nalgebra::Vector3;

use crate::network::LogAmplitude;
use crate::system::MoleculeConfig;

/// Regularization floor for interparticle distances. Keeps the potential
/// finite when a walker proposal lands on a nucleus or another electron.
const DIST_EPS: f64 = 1e-12;

/// Central-difference step for the kinetic term.
const LAPLACIAN_STEP: f64 = 5e-4;

/// Evaluates per-walker local energies for a fixed molecule.
#[derive(Clone, Debug)]
pub struct LocalEnergy {
    molecule: MoleculeConfig,
    nuclear_repulsion: f64,
}

impl LocalEnergy {
    pub fn new(molecule: &MoleculeConfig) -> Self {
        Self {
            molecule: molecule.clone(),
            nuclear_repulsion: molecule.nuclear_repulsion(),
        }
    }

    /// Electron-nuclear plus electron-electron plus nuclear-nuclear
    /// Coulomb energy.
    pub fn potential(&self, r: &[Vector3<f64>]) -> f64 {
        let mut v = self.nuclear_repulsion;
        for (i, ri) in r.iter().enumerate() {
            for atom in &self.molecule.atoms {
                let d = (ri - atom.coords).norm().max(DIST_EPS);
                v -= atom.charge / d;
            }
            for rj in &r[i + 1..] {
                let d = (ri - rj).norm().max(DIST_EPS);
                v += 1.0 / d;
            }
        }
        v
    }

    /// Kinetic energy from the log-amplitude.
    pub fn kinetic<W: LogAmplitude>(&self, wfn: &W, r: &[Vector3<f64>]) -> f64 {
        let (grad, lap) = wfn.grad_laplacian_log(r, LAPLACIAN_STEP);
        let grad_sq: f64 = grad.iter().map(|g| g.norm_squared()).sum();
        -0.5 * (lap + grad_sq)
    }

    /// Local energy of one walker: E_L(r) = (HΨ)(r) / Ψ(r).
    pub fn local_energy<W: LogAmplitude>(&self, wfn: &W, r: &[Vector3<f64>]) -> f64 {
        self.kinetic(wfn, r) + self.potential(r)
    }
}
