//! Training configuration: serde tree, YAML loading, resolution.
//!
//! The raw `Config` mirrors the external configuration surface
//! (`system`, `network.detnet`, `pretrain`, `mcmc`, `optim`, `debug`,
//! `log`). `resolve()` validates it once, fails fast on inconsistencies and
//! produces an immutable `TrainingConfig` that every component reads and
//! none mutates.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::TrainError;
use crate::system::{named_system, Atom, ExternalMolecule, MoleculeConfig};

/// Raw configuration as read from YAML (or built in code).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "defaults::seed")]
    pub seed: u64,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    /// Number of logical devices the walker batch is sharded across.
    #[serde(default = "defaults::devices")]
    pub devices: usize,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pretrain: PretrainConfig,
    #[serde(default)]
    pub mcmc: McmcConfig,
    #[serde(default)]
    pub optim: OptimConfig,
    #[serde(default)]
    pub debug: DebugConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// Named atomic system, e.g. "H" or "Li".
    pub atom: Option<String>,
    /// Named molecular system, e.g. "H2", "LiH".
    pub molecule_name: Option<String>,
    /// Inline geometry, in bohr.
    pub molecule: Option<Vec<AtomSpec>>,
    #[serde(default)]
    pub charge: i32,
    /// n_up - n_down; defaults to 0 or 1 by electron parity.
    pub spin: Option<i32>,
    /// Externally-built molecule descriptor; set programmatically, not from
    /// YAML (mirrors handing over a quantum-chemistry molecule object).
    #[serde(skip)]
    pub external: Option<ExternalMolecule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AtomSpec {
    pub symbol: String,
    pub coords: [f64; 3],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    #[serde(default)]
    pub detnet: DetnetConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { detnet: DetnetConfig::default() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetnetConfig {
    /// Hidden-layer widths of the equivariant stream.
    pub hidden_dims: Vec<usize>,
    /// Number of determinants in the amplitude sum.
    pub determinants: usize,
}

impl Default for DetnetConfig {
    fn default() -> Self {
        Self { hidden_dims: vec![32, 32], determinants: 4 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PretrainConfig {
    pub iterations: u64,
    /// Basis-set identifier for the reference orbitals.
    pub basis: String,
    pub learning_rate: f64,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self { iterations: 100, basis: "sto-3g".into(), learning_rate: 3e-4 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McmcConfig {
    /// Sampler steps discarded before the first optimization iteration.
    pub burn_in: u64,
    /// Metropolis sweeps between consecutive optimization batches.
    pub steps: u64,
    /// Width of the Gaussian cloud walkers are initialized from.
    pub init_width: f64,
    /// Initial proposal standard deviation.
    pub move_width: f64,
    pub min_width: f64,
    pub max_width: f64,
    pub target_acceptance: f64,
    /// Sweeps between step-size adaptations.
    pub adaptation_interval: u64,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            burn_in: 100,
            steps: 10,
            init_width: 0.8,
            move_width: 0.2,
            min_width: 1e-3,
            max_width: 2.0,
            target_acceptance: 0.55,
            adaptation_interval: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimConfig {
    /// "kfac" or "adam".
    pub optimizer: String,
    pub iterations: u64,
    pub learning_rate: f64,
    /// Learning rate decays as lr / (1 + t / lr_delay).
    pub lr_delay: f64,
    /// Global-norm bound applied to the (preconditioned) update.
    pub clip_norm: f64,
    #[serde(default)]
    pub kfac: KfacConfig,
    #[serde(default)]
    pub adam: AdamConfig,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            optimizer: "kfac".into(),
            iterations: 1000,
            learning_rate: 0.05,
            lr_delay: 10_000.0,
            clip_norm: 10.0,
            kfac: KfacConfig::default(),
            adam: AdamConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KfacConfig {
    /// Base Tikhonov damping added to the curvature factors.
    pub damping: f64,
    /// Damping decays as damping / (1 + t / damping_delay).
    pub damping_delay: f64,
    /// EMA decay of the Kronecker factors.
    pub cov_ema_decay: f64,
    /// Iterations between factor-inverse refreshes.
    pub refresh_interval: u64,
}

impl Default for KfacConfig {
    fn default() -> Self {
        Self {
            damping: 1e-3,
            damping_delay: 1000.0,
            cov_ema_decay: 0.95,
            refresh_interval: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdamConfig {
    pub b1: f64,
    pub b2: f64,
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self { b1: 0.9, b2: 0.999, eps: 1e-8 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    /// Abort the run when a non-finite energy or gradient appears.
    #[serde(default = "defaults::check_nan")]
    pub check_nan: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self { check_nan: true }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    pub save_path: PathBuf,
    /// Iterations between checkpoint writes.
    pub save_frequency: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { save_path: PathBuf::from("logs"), save_frequency: 100 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: defaults::seed(),
            batch_size: defaults::batch_size(),
            devices: defaults::devices(),
            system: SystemConfig::default(),
            network: NetworkConfig::default(),
            pretrain: PretrainConfig::default(),
            mcmc: McmcConfig::default(),
            optim: OptimConfig::default(),
            debug: DebugConfig::default(),
            log: LogConfig::default(),
        }
    }
}

mod defaults {
    pub fn seed() -> u64 {
        23
    }
    pub fn batch_size() -> usize {
        256
    }
    pub fn devices() -> usize {
        1
    }
    pub fn check_nan() -> bool {
        true
    }
}

/// Which stochastic optimizer drives the main loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Adam,
    Kfac,
}

/// Immutable resolved configuration, constructed once before training.
#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub seed: u64,
    pub batch_size: usize,
    pub devices: usize,
    pub molecule: MoleculeConfig,
    pub hidden_dims: Vec<usize>,
    pub determinants: usize,
    pub pretrain: PretrainConfig,
    pub mcmc: McmcConfig,
    pub optim: OptimConfig,
    pub optimizer: OptimizerKind,
    pub check_nan: bool,
    pub save_path: PathBuf,
    pub save_frequency: u64,
}

impl Config {
    /// Read a raw configuration from a YAML file.
    pub fn from_yaml_file(path: &str) -> Result<Self, TrainError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader)
            .map_err(|e| TrainError::Config(format!("failed to parse {path}: {e}")))
    }

    /// Attach an externally-built molecule descriptor.
    pub fn with_external_molecule(mut self, mol: ExternalMolecule) -> Self {
        self.system.external = Some(mol);
        self
    }

    fn molecule(&self) -> Result<MoleculeConfig, TrainError> {
        if let Some(ext) = &self.system.external {
            return ext.to_molecule();
        }
        let (atoms, default_spin) = if let Some(specs) = &self.system.molecule {
            let atoms = specs
                .iter()
                .map(|s| {
                    Atom::new(
                        &s.symbol,
                        nalgebra::Vector3::new(s.coords[0], s.coords[1], s.coords[2]),
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            let nuclear: i64 = atoms.iter().map(|a| a.charge as i64).sum();
            let parity = ((nuclear - self.system.charge as i64) % 2) as i32;
            (atoms, parity.abs())
        } else if let Some(name) = &self.system.atom {
            named_system(name)?
        } else if let Some(name) = &self.system.molecule_name {
            named_system(name)?
        } else {
            return Err(TrainError::Config(
                "no system specified: set system.atom, system.molecule_name, \
                 system.molecule or an external molecule"
                    .into(),
            ));
        };
        let spin = self.system.spin.unwrap_or(default_spin);
        MoleculeConfig::with_charge_and_spin(atoms, self.system.charge, spin)
    }

    /// Validate and freeze the configuration.
    pub fn resolve(&self) -> Result<TrainingConfig, TrainError> {
        let molecule = self.molecule()?;
        let optimizer = match self.optim.optimizer.as_str() {
            "adam" => OptimizerKind::Adam,
            "kfac" => OptimizerKind::Kfac,
            other => {
                return Err(TrainError::Config(format!(
                    "optim.optimizer must be \"kfac\" or \"adam\", got {other:?}"
                )))
            }
        };
        if self.network.detnet.hidden_dims.is_empty()
            || self.network.detnet.hidden_dims.contains(&0)
        {
            return Err(TrainError::Config(
                "network.detnet.hidden_dims must be non-empty and positive".into(),
            ));
        }
        if self.network.detnet.determinants == 0 {
            return Err(TrainError::Config(
                "network.detnet.determinants must be at least 1".into(),
            ));
        }
        if self.devices == 0 || self.batch_size == 0 || self.batch_size % self.devices != 0 {
            return Err(TrainError::Config(format!(
                "batch_size {} must be a positive multiple of devices {}",
                self.batch_size, self.devices
            )));
        }
        let mcmc = &self.mcmc;
        if mcmc.move_width <= 0.0
            || mcmc.min_width <= 0.0
            || mcmc.min_width > mcmc.max_width
            || !(0.0..1.0).contains(&mcmc.target_acceptance)
            || mcmc.adaptation_interval == 0
        {
            return Err(TrainError::Config(
                "mcmc widths must be positive with min_width <= max_width and a \
                 target acceptance in (0, 1)"
                    .into(),
            ));
        }
        // An external descriptor carries the basis its reference solution
        // was built in; it overrides the configured pretraining basis.
        let mut pretrain = self.pretrain.clone();
        if let Some(ext) = &self.system.external {
            pretrain.basis = ext.basis.clone();
        }
        Ok(TrainingConfig {
            seed: self.seed,
            batch_size: self.batch_size,
            devices: self.devices,
            molecule,
            hidden_dims: self.network.detnet.hidden_dims.clone(),
            determinants: self.network.detnet.determinants,
            pretrain,
            mcmc: self.mcmc.clone(),
            optim: self.optim.clone(),
            optimizer,
            check_nan: self.debug.check_nan,
            save_path: self.log.save_path.clone(),
            save_frequency: self.log.save_frequency.max(1),
        })
    }
}
