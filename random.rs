//! Pseudo-random bytes for the `AT_RANDOM` auxiliary vector entry.
//!
//! The C runtime derives its stack protector canary and pointer guard from
//! these 16 bytes. By default the generator is seeded from the loader's own
//! `AT_RANDOM` bytes; `--seed` makes a run reproducible.

use std::sync::atomic::{AtomicU64, Ordering};

/// Fallback seed when the host provides no `AT_RANDOM`.
pub const DEFAULT_SEED: u64 = 0x853c49e6748fea9b;

/// Global PRNG state using xorshift64
static PRNG_STATE: AtomicU64 = AtomicU64::new(DEFAULT_SEED);

/// Initialize the PRNG with a seed value.
///
/// A zero seed would lock xorshift at zero, so it is replaced with
/// [`DEFAULT_SEED`].
pub fn init(seed: u64) {
    let seed = if seed == 0 { DEFAULT_SEED } else { seed };
    PRNG_STATE.store(seed, Ordering::SeqCst);
}

/// One xorshift64 step.
const fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

fn next_u64() -> u64 {
    let prev = PRNG_STATE
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| Some(xorshift(state)))
        .unwrap_or_else(|state| state);
    xorshift(prev)
}

/// Fill a buffer with pseudo-random bytes.
pub fn fill_bytes(buf: &mut [u8]) {
    for chunk in buf.chunks_mut(8) {
        let bytes = next_u64().to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}

/// The 16 bytes `AT_RANDOM` points at.
pub fn at_random_bytes() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    fill_bytes(&mut bytes);
    bytes
}
