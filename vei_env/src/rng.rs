//! Seeded random streams.
//!
//! Every stochastic choice in a session (derail rolls, reply variants,
//! fault injection, drift jitter) draws from a `SimRng`. Streams are
//! ChaCha8, which is portable and reproducible across platforms.

use crate::types::Seed;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Derives an independent sub-seed from a master seed and a stream label.
///
/// Uses FNV-1a over the label mixed with the golden-ratio multiplier so
/// that distinct labels produce uncorrelated streams.
pub fn derive_seed(seed: Seed, label: &str) -> Seed {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in label.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    seed.wrapping_mul(0x9e3779b97f4a7c15) ^ hash
}

/// A seeded RNG stream that counts its draws.
#[derive(Debug, Clone)]
pub struct SimRng {
    seed: Seed,
    inner: ChaCha8Rng,
    draws: u64,
}

impl SimRng {
    /// Creates a stream from a seed.
    pub fn new(seed: Seed) -> Self {
        Self {
            seed,
            inner: ChaCha8Rng::seed_from_u64(seed),
            draws: 0,
        }
    }

    /// Returns the seed this stream was created with.
    pub fn seed(&self) -> Seed {
        self.seed
    }

    /// Number of values drawn since creation.
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Draws a float in `[0, 1)`.
    pub fn next_random(&mut self) -> f64 {
        self.draws += 1;
        self.inner.gen::<f64>()
    }

    /// Draws an integer in the inclusive range `[lo, hi]`.
    ///
    /// A degenerate range (`hi <= lo`) returns `lo` and still consumes
    /// one draw, so the stream position never depends on the bounds.
    pub fn randint(&mut self, lo: i64, hi: i64) -> i64 {
        let roll = self.next_random();
        if hi <= lo {
            return lo;
        }
        let span = (hi - lo + 1) as f64;
        lo + ((roll * span) as i64).min(hi - lo)
    }

    /// Picks an index into a collection of `len` items (`len > 0`).
    pub fn choose_index(&mut self, len: usize) -> usize {
        if len == 0 {
            self.next_random();
            return 0;
        }
        self.randint(0, len as i64 - 1) as usize
    }
}
