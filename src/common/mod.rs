pub mod identity;
pub mod logging;
pub mod records;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Creates the random number generator of a round.
///
/// Every actor gets its own stream, so actors sharing a seed don't draw identical numbers.
pub fn round_rng(seed: u64, round: u32, actor_index: usize) -> ChaCha20Rng {
    let mut rng = ChaCha20Rng::seed_from_u64(seed ^ (u64::from(round) << 32));
    rng.set_stream(actor_index as u64);
    rng
}
