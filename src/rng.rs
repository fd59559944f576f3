//! Explicit, splittable pseudo-random keys.
//!
//! Random state is threaded through the sampler and trainer as small value
//! types rather than a hidden global generator. Each key deterministically
//! derives independent subkeys (`split`, `fold_in`), so the random stream of
//! every device shard and every sampler step is a pure function of the
//! configured seed. This is what makes checkpoint resume exact.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// A 64-bit PRNG key. Copy-cheap, serializable, never mutated in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngKey(u64);

/// splitmix64 finalizer; decorrelates nearby seeds.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl RngKey {
    pub fn new(seed: u64) -> Self {
        RngKey(mix(seed))
    }

    /// Derive two independent subkeys. Conventionally the first replaces the
    /// caller's key and the second is consumed immediately.
    pub fn split(self) -> (RngKey, RngKey) {
        (
            RngKey(mix(self.0 ^ 0x243f_6a88_85a3_08d3)),
            RngKey(mix(self.0 ^ 0x1319_8a2e_0370_7344)),
        )
    }

    /// Fold an index (device id, iteration counter) into the key.
    pub fn fold_in(self, data: u64) -> RngKey {
        RngKey(mix(self.0 ^ mix(data)))
    }

    /// Seed a generator for the draws belonging to this key.
    pub fn rng(self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }
}
