#![allow(dead_code)]

use lsd_sort::{radix_program, HostDevice, RadixSortEngine, SortConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

pub fn random_keys(seed: u64, n: usize) -> Vec<u32> {
    let mut rng = seeded_rng(seed);
    (0..n).map(|_| rng.gen()).collect()
}

/// Many groups even for small inputs: 2 blocks x 8 groups.
pub fn small_config() -> SortConfig {
    SortConfig::default()
        .with_block_count(2)
        .with_threads_per_block(16)
        .with_elements_per_thread(2)
}

pub fn host_engine(config: SortConfig) -> RadixSortEngine<HostDevice> {
    RadixSortEngine::host(config).unwrap()
}

/// Engine whose device records every command.
pub fn recording_engine(config: SortConfig) -> RadixSortEngine<HostDevice> {
    RadixSortEngine::new(HostDevice::new(radix_program()).with_history(), config).unwrap()
}

pub fn verify_sorted(data: &[u32]) -> bool {
    data.windows(2).all(|w| w[0] <= w[1])
}

/// Verify that the same multiset of (key, value) pairs exists before and after sorting.
pub fn verify_pairs_preserved(
    orig_keys: &[u32],
    orig_vals: &[u64],
    sorted_keys: &[u32],
    sorted_vals: &[u64],
) -> bool {
    if orig_keys.len() != sorted_keys.len() || orig_vals.len() != sorted_vals.len() {
        return false;
    }
    let mut orig_pairs: Vec<(u32, u64)> =
        orig_keys.iter().copied().zip(orig_vals.iter().copied()).collect();
    let mut sorted_pairs: Vec<(u32, u64)> =
        sorted_keys.iter().copied().zip(sorted_vals.iter().copied()).collect();
    orig_pairs.sort();
    sorted_pairs.sort();
    orig_pairs == sorted_pairs
}

/// With values holding original positions, equal keys must keep ascending values.
pub fn verify_stable(sorted_keys: &[u32], sorted_vals: &[u64]) -> bool {
    sorted_keys
        .windows(2)
        .zip(sorted_vals.windows(2))
        .all(|(k, v)| k[0] < k[1] || (k[0] == k[1] && v[0] < v[1]))
}
