//! Training loop orchestration.
//!
//! Sequence: initialize parameters from the seeded key, pretrain, burn in
//! the sampler under the initial parameters, then iterate {sample a batch,
//! evaluate local energies and log-derivatives, apply one optimizer step,
//! emit metrics, periodically checkpoint}. The walker batch is sharded
//! across logical devices; shards are processed in parallel and reduced
//! after a synchronization barrier, where the NaN check runs once per
//! iteration.

use rayon::prelude::*;

use crate::checkpoint::{Checkpoint, ShardState};
use crate::config::{OptimizerKind, TrainingConfig};
use crate::error::TrainError;
use crate::hamiltonian::LocalEnergy;
use crate::metrics::{IterationStats, StatsWriter};
use crate::network::{BoundNet, DetNet, NetworkParameters};
use crate::optimize::{GradientAccumulator, Optimizer};
use crate::rng::RngKey;
use crate::sampling::{McmcState, Walker};

/// Final state of a completed run.
pub struct TrainOutcome {
    pub iterations: u64,
    pub energy: f64,
    pub params: NetworkParameters,
}

struct Shard {
    mcmc: McmcState,
    walkers: Vec<Walker>,
}

/// Run the full training sequence described by `cfg`.
pub fn train(cfg: &TrainingConfig) -> Result<TrainOutcome, TrainError> {
    let net = DetNet::new(&cfg.molecule, &cfg.hidden_dims, cfg.determinants);
    let energy = LocalEnergy::new(&cfg.molecule);
    let key = RngKey::new(cfg.seed);
    let (key_init, key_rest) = key.split();
    let (key_pretrain, key_mcmc) = key_rest.split();

    let walkers_per_device = cfg.batch_size / cfg.devices;
    let use_curvature = cfg.optimizer == OptimizerKind::Kfac;

    let resume = match Checkpoint::latest(&cfg.save_path) {
        Some(path) => Some(Checkpoint::load(&path)?),
        None => None,
    };

    let (mut params, mut optimizer, mut shards, start_iter) = match resume {
        Some(ckpt) => {
            log::info!("restored checkpoint at iteration {}", ckpt.iteration);
            let optimizer = Optimizer::from_state(&cfg.optim, ckpt.optimizer);
            let shards = ckpt
                .shards
                .into_iter()
                .map(|s| Shard { mcmc: s.mcmc, walkers: s.walkers })
                .collect::<Vec<_>>();
            (ckpt.params, optimizer, shards, ckpt.iteration)
        }
        None => {
            let params = net.init_params(key_init);
            let params = crate::pretrain::pretrain(cfg, &net, params, key_pretrain)?;
            let mut shards = (0..cfg.devices)
                .map(|d| {
                    let mut mcmc = McmcState::new(key_mcmc.fold_in(d as u64), &cfg.mcmc);
                    let bound = BoundNet { net: &net, params: &params };
                    let walkers = mcmc.init_walkers(&bound, walkers_per_device, |rng| {
                        net.init_positions(cfg.mcmc.init_width, rng)
                    });
                    Shard { mcmc, walkers }
                })
                .collect::<Vec<_>>();
            // Burn-in runs under the initial (possibly pretrained)
            // parameters; the configurations are discarded.
            if cfg.mcmc.burn_in > 0 {
                shards.par_iter_mut().for_each(|shard| {
                    let bound = BoundNet { net: &net, params: &params };
                    shard
                        .mcmc
                        .run_steps(&bound, &mut shard.walkers, cfg.mcmc.burn_in, &cfg.mcmc);
                });
            }
            let optimizer = Optimizer::new(cfg.optimizer, &cfg.optim, &params);
            (params, optimizer, shards, 0)
        }
    };

    let mut writer = StatsWriter::create(&cfg.save_path)?;
    let mut last_energy = f64::NAN;

    for t in start_iter..cfg.optim.iterations {
        // Each shard samples and accumulates independently; collect() is
        // the barrier and the sequential merge below is the reduction.
        let shard_results: Vec<(GradientAccumulator, f64)> = shards
            .par_iter_mut()
            .map(|shard| {
                let bound = BoundNet { net: &net, params: &params };
                shard.mcmc.refresh(&bound, &mut shard.walkers);
                let pmove =
                    shard
                        .mcmc
                        .run_steps(&bound, &mut shard.walkers, cfg.mcmc.steps, &cfg.mcmc);
                let mut acc = GradientAccumulator::new(&params);
                for walker in &shard.walkers {
                    let e_loc = energy.local_energy(&bound, &walker.positions);
                    let cache = net.forward(&params, &walker.positions);
                    let (logpsi_grad, stats) =
                        net.backward_logpsi(&params, &cache, use_curvature);
                    acc.push(e_loc, &logpsi_grad, stats);
                }
                (acc, pmove)
            })
            .collect();

        let mut batch = GradientAccumulator::new(&params);
        let mut pmove_sum = 0.0;
        for (acc, pmove) in &shard_results {
            batch.merge(acc);
            pmove_sum += pmove;
        }
        let pmove = pmove_sum / cfg.devices as f64;

        if cfg.check_nan && !batch.sum_e.is_finite() {
            return Err(TrainError::NumericalInstability {
                iteration: t,
                quantity: "local energy".into(),
            });
        }

        let (new_params, metrics) = optimizer.step(t, &params, &batch, cfg.check_nan)?;
        params = new_params;

        let e_mean = batch.energy_mean();
        let variance = batch.energy_variance();
        last_energy = e_mean;
        writer.append(&IterationStats {
            step: t,
            energy: e_mean,
            variance,
            pmove,
            grad_norm: metrics.grad_norm,
        })?;
        log::info!(
            "iteration {t}: energy {e_mean:.6} variance {variance:.6} pmove {pmove:.3} lr {:.3e}",
            metrics.learning_rate
        );

        if (t + 1) % cfg.save_frequency == 0 || t + 1 == cfg.optim.iterations {
            let ckpt = Checkpoint {
                iteration: t + 1,
                params: params.clone(),
                optimizer: optimizer.state().clone(),
                shards: shards
                    .iter()
                    .map(|s| ShardState { mcmc: s.mcmc.clone(), walkers: s.walkers.clone() })
                    .collect(),
            };
            ckpt.save(&cfg.save_path)?;
        }
    }

    Ok(TrainOutcome {
        iterations: cfg.optim.iterations,
        energy: last_energy,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;
    use std::path::PathBuf;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nnvmc-train-{tag}-{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        dir
    }

    fn small_config(system: &str, optimizer: &str, dir: &PathBuf) -> Config {
        let mut raw = Config::default();
        match system {
            "H" | "Li" => raw.system.atom = Some(system.into()),
            _ => raw.system.molecule_name = Some(system.into()),
        }
        raw.seed = 23;
        raw.batch_size = 8;
        raw.network.detnet.hidden_dims = vec![4, 4];
        raw.network.detnet.determinants = 2;
        raw.pretrain.iterations = 2;
        raw.mcmc.burn_in = 4;
        raw.mcmc.steps = 2;
        raw.mcmc.adaptation_interval = 2;
        raw.optim.optimizer = optimizer.into();
        raw.optim.iterations = 3;
        raw.debug.check_nan = true;
        raw.log.save_path = dir.clone();
        raw.log.save_frequency = 100;
        raw
    }

    #[test]
    fn test_smoke_h_adam() {
        let dir = test_dir("h-adam");
        let cfg = small_config("H", "adam", &dir).resolve().unwrap();
        let outcome = train(&cfg).unwrap();
        assert_eq!(outcome.iterations, 3);
        assert!(outcome.energy.is_finite());
        assert!(dir.join("train_stats.csv").exists());
        // The final checkpoint is always written.
        assert!(Checkpoint::latest(&dir).is_some());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_smoke_lih_kfac_two_devices() {
        let dir = test_dir("lih-kfac");
        let mut raw = small_config("LiH", "kfac", &dir);
        raw.devices = 2;
        raw.optim.iterations = 2;
        let cfg = raw.resolve().unwrap();
        let outcome = train(&cfg).unwrap();
        assert_eq!(outcome.iterations, 2);
        assert!(outcome.energy.is_finite());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_metrics_rows_match_iterations() {
        let dir = test_dir("metrics");
        let cfg = small_config("H", "adam", &dir).resolve().unwrap();
        train(&cfg).unwrap();
        let contents = fs::read_to_string(dir.join("train_stats.csv")).unwrap();
        // Header plus one row per iteration, each with a finite energy.
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in &lines[1..] {
            let energy: f64 = line.split(',').nth(1).unwrap().parse().unwrap();
            assert!(energy.is_finite());
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_checkpoint_resume_reproduces_trajectory() {
        let dir_full = test_dir("resume-full");
        let dir_split = test_dir("resume-split");

        // Uninterrupted run of 4 iterations.
        let mut raw = small_config("H", "adam", &dir_full);
        raw.optim.iterations = 4;
        raw.log.save_frequency = 2;
        let full = train(&raw.resolve().unwrap()).unwrap();

        // Same run stopped after 2 iterations, then resumed to 4.
        let mut raw_a = small_config("H", "adam", &dir_split);
        raw_a.optim.iterations = 2;
        raw_a.log.save_frequency = 2;
        train(&raw_a.resolve().unwrap()).unwrap();
        let mut raw_b = small_config("H", "adam", &dir_split);
        raw_b.optim.iterations = 4;
        raw_b.log.save_frequency = 2;
        let resumed = train(&raw_b.resolve().unwrap()).unwrap();

        let a = full.params.to_flat();
        let b = resumed.params.to_flat();
        assert_eq!(a.len(), b.len());
        for i in 0..a.len() {
            assert!(
                (a[i] - b[i]).abs() <= 1e-12,
                "parameter {i} diverged after resume: {} vs {}",
                a[i],
                b[i]
            );
        }
        assert!((full.energy - resumed.energy).abs() <= 1e-9);

        fs::remove_dir_all(&dir_full).ok();
        fs::remove_dir_all(&dir_split).ok();
    }
}
