//! Supervised pretraining toward reference orbitals.
//!
//! Before energy optimization starts, the network's orbital outputs are
//! fitted by least squares to a Hartree-Fock-like reference built from
//! Slater-type orbitals of the configured basis. Pretraining runs a fixed
//! number of iterations on its own sampler state, decoupled from the main
//! chain, and does not check convergence.

use std::cmp::Ordering;

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::error::TrainError;
use crate::network::{BoundNet, DetNet, NetworkParameters};
use crate::optimize::AdamState;
use crate::rng::RngKey;
use crate::sampling::McmcState;
use crate::system::MoleculeConfig;

/// One Slater-type atomic orbital, nodeless radial part r^(n-1) e^(-ζr/n).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AtomicOrbital {
    center: Vector3<f64>,
    shell: Shell,
    zeta: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
enum Shell {
    S { n: u32 },
    P { n: u32, axis: usize },
}

impl Shell {
    fn principal(self) -> u32 {
        match self {
            Shell::S { n } => n,
            Shell::P { n, .. } => n,
        }
    }

    /// Ordering rank within a principal shell: s below p.
    fn rank(self) -> u32 {
        match self {
            Shell::S { .. } => 0,
            Shell::P { .. } => 1,
        }
    }
}

impl AtomicOrbital {
    pub fn eval(&self, r: &Vector3<f64>) -> f64 {
        let dr = r - self.center;
        let d = dr.norm();
        let n = self.shell.principal() as f64;
        let radial = (-self.zeta * d / n).exp();
        match self.shell {
            Shell::S { n } => d.powi(n as i32 - 1) * radial,
            Shell::P { n, axis } => dr[axis] * d.powi(n as i32 - 2) * radial,
        }
    }

    /// Hydrogenic shell energy with the screened charge.
    fn energy(&self) -> f64 {
        let n = self.shell.principal() as f64;
        -0.5 * (self.zeta / n).powi(2)
    }
}

/// Slater-rule screening; the floor keeps light atoms bound.
fn zeff(z: f64, n: u32) -> f64 {
    match n {
        1 => (z - 0.30).max(1.0),
        2 => (z - 2.05).max(0.65),
        _ => (z - 10.90).max(0.65),
    }
}

/// The reference orbital sets the network is pretrained against, one per
/// spin channel.
#[derive(Clone, Debug)]
pub struct ReferenceOrbitals {
    pub up: Vec<AtomicOrbital>,
    pub dn: Vec<AtomicOrbital>,
}

impl ReferenceOrbitals {
    /// Occupy the lowest screened atomic shells across all atoms, aufbau
    /// style. The basis identifier selects the reference family; the
    /// Slater forms here stand in for an externally solved basis.
    pub fn build(molecule: &MoleculeConfig, basis: &str) -> Result<Self, TrainError> {
        log::debug!(
            "building {} reference orbitals for {} atoms",
            basis,
            molecule.atoms.len()
        );
        let mut aos = Vec::new();
        for atom in &molecule.atoms {
            let shells = [
                Shell::S { n: 1 },
                Shell::S { n: 2 },
                Shell::P { n: 2, axis: 0 },
                Shell::P { n: 2, axis: 1 },
                Shell::P { n: 2, axis: 2 },
                Shell::S { n: 3 },
                Shell::P { n: 3, axis: 0 },
                Shell::P { n: 3, axis: 1 },
                Shell::P { n: 3, axis: 2 },
            ];
            for shell in shells {
                aos.push(AtomicOrbital {
                    center: atom.coords,
                    shell,
                    zeta: zeff(atom.charge, shell.principal()),
                });
            }
        }
        aos.sort_by(|a, b| {
            a.energy()
                .partial_cmp(&b.energy())
                .unwrap_or(Ordering::Equal)
                .then(a.shell.rank().cmp(&b.shell.rank()))
        });
        let needed = molecule.n_up.max(molecule.n_down);
        if aos.len() < needed {
            return Err(TrainError::Config(format!(
                "reference basis provides {} orbitals but {} are occupied",
                aos.len(),
                needed
            )));
        }
        Ok(Self {
            up: aos[..molecule.n_up].to_vec(),
            dn: aos[..molecule.n_down].to_vec(),
        })
    }

    /// Reference orbital matrices at a configuration, rows = electrons of
    /// the spin block, cols = occupied reference orbitals.
    pub fn matrices(
        &self,
        positions: &[Vector3<f64>],
        n_up: usize,
        n_dn: usize,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        let up = DMatrix::from_fn(n_up, n_up, |i, a| self.up[a].eval(&positions[i]));
        let dn = DMatrix::from_fn(n_dn, n_dn, |i, a| self.dn[a].eval(&positions[n_up + i]));
        (up, dn)
    }
}

/// Run the configured number of supervised steps and return the pretrained
/// parameters. Uses a dedicated sampler and optimizer state.
pub fn pretrain(
    cfg: &TrainingConfig,
    net: &DetNet,
    params: NetworkParameters,
    key: RngKey,
) -> Result<NetworkParameters, TrainError> {
    if cfg.pretrain.iterations == 0 {
        return Ok(params);
    }
    let reference = ReferenceOrbitals::build(&cfg.molecule, &cfg.pretrain.basis)?;
    let (key_walkers, _) = key.split();
    let mut mcmc = McmcState::new(key_walkers, &cfg.mcmc);
    let mut params = params;
    let mut adam = AdamState::new(params.len());

    let mut walkers = {
        let bound = BoundNet { net, params: &params };
        mcmc.init_walkers(&bound, cfg.batch_size, |rng| {
            net.init_positions(cfg.mcmc.init_width, rng)
        })
    };

    for it in 0..cfg.pretrain.iterations {
        {
            let bound = BoundNet { net, params: &params };
            mcmc.refresh(&bound, &mut walkers);
            mcmc.run_steps(&bound, &mut walkers, 1, &cfg.mcmc);
        }
        let mut loss_sum = 0.0;
        let mut grad_sum = params.zeros_like();
        for walker in &walkers {
            let cache = net.forward(&params, &walker.positions);
            let (up_ref, dn_ref) =
                reference.matrices(&walker.positions, net.n_up(), net.n_down());
            let (loss, grads) = net.orbital_loss_grads(&params, &cache, &up_ref, &dn_ref);
            loss_sum += loss;
            grad_sum.add_scaled(1.0, &grads);
        }
        let n = walkers.len() as f64;
        grad_sum.scale(1.0 / n);
        let loss = loss_sum / n;
        if cfg.check_nan && (!loss.is_finite() || grad_sum.has_non_finite()) {
            return Err(TrainError::NumericalInstability {
                iteration: it,
                quantity: "pretraining loss".into(),
            });
        }
        let delta = adam.step(&grad_sum, &cfg.optim.adam);
        params.add_scaled(-cfg.pretrain.learning_rate, &delta);
        log::debug!("pretrain iteration {it}: loss {loss:.6}");
    }
    Ok(params)
}
