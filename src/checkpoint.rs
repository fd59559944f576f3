//! Checkpoint bundles for exact resume.
//!
//! A checkpoint holds the iteration counter, network parameters, optimizer
//! state and every device shard's sampler state (including its walkers).
//! Restoring one reproduces the exact trajectory the uninterrupted run
//! would have taken.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TrainError;
use crate::network::NetworkParameters;
use crate::optimize::OptimizerState;
use crate::sampling::{McmcState, Walker};

/// Sampler state of one device shard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardState {
    pub mcmc: McmcState,
    pub walkers: Vec<Walker>,
}

/// The persisted training state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Next iteration index to run.
    pub iteration: u64,
    pub params: NetworkParameters,
    pub optimizer: OptimizerState,
    pub shards: Vec<ShardState>,
}

impl Checkpoint {
    /// Write the bundle as `ckpt_NNNNNN.bin` under `directory`.
    pub fn save(&self, directory: &Path) -> Result<PathBuf, TrainError> {
        fs::create_dir_all(directory)?;
        let path = directory.join(format!("ckpt_{:06}.bin", self.iteration));
        let file = BufWriter::new(File::create(&path)?);
        bincode::serialize_into(file, self)
            .map_err(|e| TrainError::Checkpoint(format!("failed to write {}: {e}", path.display())))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, TrainError> {
        let file = BufReader::new(File::open(path)?);
        bincode::deserialize_from(file)
            .map_err(|e| TrainError::Checkpoint(format!("failed to read {}: {e}", path.display())))
    }

    /// The highest-numbered checkpoint in `directory`, if any.
    pub fn latest(directory: &Path) -> Option<PathBuf> {
        let entries = fs::read_dir(directory).ok()?;
        entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let name = path.file_name()?.to_str()?;
                let iter: u64 = name
                    .strip_prefix("ckpt_")?
                    .strip_suffix(".bin")?
                    .parse()
                    .ok()?;
                Some((iter, path))
            })
            .max_by_key(|(iter, _)| *iter)
            .map(|(_, path)| path)
    }
}
