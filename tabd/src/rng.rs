// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The session id generator: a `u64` PRNG seeded once from a system entropy
//! source (`TABD_RAND_FILE`). No cryptographic guarantee is required here
//! because session endpoints, not ids, carry authority.

use std::io::Read;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::InitError;

/// Default entropy source, overridden by the `TABD_RAND_FILE` environment
/// variable.
pub const DEFAULT_RAND_FILE: &str = "/dev/urandom";

/// A `u64` session id generator, owned by whichever thread handles
/// `CreateConnection`. A single mutex protects the PRNG state.
pub struct IdGenerator {
    state: Mutex<u64>,
}

impl IdGenerator {
    /// Seed a generator by reading 8 bytes from `path`.
    pub fn from_entropy_file(path: &Path) -> Result<Self, InitError> {
        let mut file = std::fs::File::open(path).map_err(|source| InitError::Entropy {
            path: path.display().to_string(),
            source,
        })?;
        let mut seed_bytes = [0u8; 8];
        file.read_exact(&mut seed_bytes)
            .map_err(|source| InitError::Entropy {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::with_seed(u64::from_le_bytes(seed_bytes)))
    }

    /// Seed a generator directly, bypassing the entropy source. Used by
    /// tests that need deterministic ids.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(seed),
        }
    }

    /// Draw the next id in the sequence.
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        splitmix64(&mut state)
    }
}

/// A SplitMix64 step. Fast, well-distributed, and sufficient for
/// collision-resistant but non-cryptographic ids.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
