//! Metropolis random-walk sampling of |Ψ|².
//!
//! Walkers are mutated in place and live for the whole run. The sampler
//! state (adaptive proposal width, acceptance window, PRNG key) persists
//! across optimization iterations and is serialized into checkpoints, so a
//! restored run continues the exact same chain.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::McmcConfig;
use crate::network::LogAmplitude;
use crate::rng::RngKey;

/// Acceptance rates outside this window at adaptation time are reported as
/// sampler divergence. Adaptation is expected to self-correct, so this
/// warns and continues.
const DIVERGENCE_LO: f64 = 0.02;
const DIVERGENCE_HI: f64 = 0.98;

/// One sampled electron configuration with its cached log-amplitude.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Walker {
    pub positions: Vec<Vector3<f64>>,
    pub log_psi: f64,
}

/// Per-batch sampler state. Never reset between iterations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McmcState {
    width: f64,
    key: RngKey,
    accepted: u64,
    attempted: u64,
    steps: u64,
}

impl McmcState {
    pub fn new(key: RngKey, cfg: &McmcConfig) -> Self {
        Self {
            width: cfg.move_width,
            key,
            accepted: 0,
            attempted: 0,
            steps: 0,
        }
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn next_rng(&mut self) -> StdRng {
        let (next, sub) = self.key.split();
        self.key = next;
        sub.rng()
    }

    /// Create the walker batch this state will drive, with positions drawn
    /// by `make_positions` and log-amplitudes evaluated under `wfn`.
    pub fn init_walkers<W, F>(&mut self, wfn: &W, n_walkers: usize, mut make_positions: F) -> Vec<Walker>
    where
        W: LogAmplitude,
        F: FnMut(&mut StdRng) -> Vec<Vector3<f64>>,
    {
        let mut rng = self.next_rng();
        (0..n_walkers)
            .map(|_| {
                let positions = make_positions(&mut rng);
                let log_psi = wfn.log_abs(&positions);
                Walker { positions, log_psi }
            })
            .collect()
    }

    /// Re-evaluate cached log-amplitudes after a parameter update.
    pub fn refresh<W: LogAmplitude>(&self, wfn: &W, walkers: &mut [Walker]) {
        for w in walkers.iter_mut() {
            w.log_psi = wfn.log_abs(&w.positions);
        }
    }

    /// Run `n_steps` Metropolis sweeps over the batch. Every electron is
    /// perturbed by isotropic Gaussian noise of the current width; moves
    /// are accepted per walker from the log-space ratio
    /// 2·(logΨ' − logΨ). Returns the acceptance fraction of these sweeps.
    pub fn run_steps<W: LogAmplitude>(
        &mut self,
        wfn: &W,
        walkers: &mut [Walker],
        n_steps: u64,
        cfg: &McmcConfig,
    ) -> f64 {
        let mut accepted_here = 0u64;
        let mut attempted_here = 0u64;
        for _ in 0..n_steps {
            let mut rng = self.next_rng();
            let normal = Normal::new(0.0, self.width).unwrap();
            for walker in walkers.iter_mut() {
                let proposal: Vec<Vector3<f64>> = walker
                    .positions
                    .iter()
                    .map(|p| {
                        p + Vector3::new(
                            normal.sample(&mut rng),
                            normal.sample(&mut rng),
                            normal.sample(&mut rng),
                        )
                    })
                    .collect();
                let new_log = wfn.log_abs(&proposal);
                let u: f64 = rng.gen();
                attempted_here += 1;
                self.attempted += 1;
                if accept_move(walker.log_psi, new_log, u) {
                    walker.positions = proposal;
                    walker.log_psi = new_log;
                    accepted_here += 1;
                    self.accepted += 1;
                }
            }
            self.steps += 1;
            if self.steps % cfg.adaptation_interval == 0 {
                self.adapt(cfg);
            }
        }
        accepted_here as f64 / attempted_here.max(1) as f64
    }

    /// Rescale the proposal width toward the target acceptance rate and
    /// reset the measurement window.
    fn adapt(&mut self, cfg: &McmcConfig) {
        if self.attempted == 0 {
            return;
        }
        let rate = self.accepted as f64 / self.attempted as f64;
        if !(DIVERGENCE_LO..=DIVERGENCE_HI).contains(&rate) {
            log::warn!(
                "sampler acceptance rate {:.3} outside ({}, {}) at step {}; \
                 width {:.2e} continues to adapt",
                rate,
                DIVERGENCE_LO,
                DIVERGENCE_HI,
                self.steps,
                self.width
            );
        }
        let adjustment = if rate == 0.0 {
            0.5
        } else {
            (rate / cfg.target_acceptance).sqrt()
        };
        self.width = (self.width * adjustment).clamp(cfg.min_width, cfg.max_width);
        self.accepted = 0;
        self.attempted = 0;
    }
}

/// Metropolis decision in log space. A proposal on a node is never
/// accepted; a walker currently on a node always moves off it.
fn accept_move(old_log: f64, new_log: f64, u: f64) -> bool {
    if new_log == f64::NEG_INFINITY {
        return false;
    }
    if old_log == f64::NEG_INFINITY {
        return true;
    }
    let log_ratio = 2.0 * (new_log - old_log);
    log_ratio >= 0.0 || u < log_ratio.exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct OriginPeak;

    impl LogAmplitude for OriginPeak {
        fn log_abs(&self, r: &[Vector3<f64>]) -> f64 {
            -r.iter().map(|ri| ri.norm_squared()).sum::<f64>()
        }
    }

    fn test_cfg() -> McmcConfig {
        McmcConfig {
            burn_in: 0,
            steps: 1,
            init_width: 1.0,
            move_width: 0.5,
            min_width: 0.1,
            max_width: 2.0,
            target_acceptance: 0.5,
            adaptation_interval: 1,
            ..McmcConfig::default()
        }
    }

    fn forced_adapt(state: &mut McmcState, cfg: &McmcConfig, accepted: u64, attempted: u64) {
        state.accepted = accepted;
        state.attempted = attempted;
        state.adapt(cfg);
    }

    #[test]
    fn test_width_increases_when_acceptance_above_target() {
        let cfg = test_cfg();
        let mut state = McmcState::new(RngKey::new(1), &cfg);
        let mut previous = state.width();
        for _ in 0..16 {
            forced_adapt(&mut state, &cfg, 90, 100);
            assert!(state.width() >= previous);
            previous = state.width();
        }
        assert_relative_eq!(state.width(), cfg.max_width);
    }

    #[test]
    fn test_width_decreases_when_acceptance_below_target() {
        let cfg = test_cfg();
        let mut state = McmcState::new(RngKey::new(2), &cfg);
        let mut previous = state.width();
        for _ in 0..16 {
            forced_adapt(&mut state, &cfg, 5, 100);
            assert!(state.width() <= previous);
            previous = state.width();
        }
        assert_relative_eq!(state.width(), cfg.min_width);
    }

    #[test]
    fn test_zero_acceptance_still_shrinks_width() {
        let cfg = test_cfg();
        let mut state = McmcState::new(RngKey::new(3), &cfg);
        forced_adapt(&mut state, &cfg, 0, 100);
        assert!(state.width() < cfg.move_width);
    }

    #[test]
    fn test_accept_move_log_space() {
        // Uphill always accepted, downhill by ratio.
        assert!(accept_move(-5.0, -4.0, 0.999));
        assert!(accept_move(-4.0, -4.5, (-1.0f64).exp() * 0.99));
        assert!(!accept_move(-4.0, -4.5, (-1.0f64).exp() * 1.01));
        // Node handling.
        assert!(!accept_move(-4.0, f64::NEG_INFINITY, 0.0));
        assert!(accept_move(f64::NEG_INFINITY, -4.0, 0.999));
    }

    #[test]
    fn test_sweeps_are_deterministic_in_the_key() {
        let cfg = test_cfg();
        let wfn = OriginPeak;
        let run = |seed: u64| {
            let mut state = McmcState::new(RngKey::new(seed), &cfg);
            let mut walkers = state.init_walkers(&wfn, 8, |rng| {
                (0..2)
                    .map(|_| Vector3::new(rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()))
                    .collect()
            });
            state.run_steps(&wfn, &mut walkers, 20, &cfg);
            walkers.iter().map(|w| w.log_psi).collect::<Vec<_>>()
        };
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }

    #[test]
    fn test_walkers_concentrate_near_the_peak() {
        let cfg = test_cfg();
        let wfn = OriginPeak;
        let mut state = McmcState::new(RngKey::new(4), &cfg);
        let mut walkers = state.init_walkers(&wfn, 16, |rng| {
            (0..2)
                .map(|_| {
                    Vector3::new(
                        4.0 + rng.gen::<f64>(),
                        4.0 + rng.gen::<f64>(),
                        4.0 + rng.gen::<f64>(),
                    )
                })
                .collect()
        });
        let before: f64 = walkers.iter().map(|w| w.log_psi).sum();
        let pmove = state.run_steps(&wfn, &mut walkers, 200, &cfg);
        let after: f64 = walkers.iter().map(|w| w.log_psi).sum();
        assert!(after > before, "chain should drift toward the density peak");
        assert!((0.0..=1.0).contains(&pmove));
    }
}
