//! SimHash + LSH index — 64-bit content fingerprints with sub-linear
//! nearest-neighbor lookup by Hamming distance.

mod hasher;
mod lsh;
mod store;

pub use hasher::{hamming_distance, SimHasher};
pub use lsh::{LshIndex, Match, DEFAULT_BANDS, DEFAULT_HAMMING_THRESHOLD};
pub use store::{should_index, FingerprintStore, InMemoryFingerprintStore};
