//! Host implementations of the radix kernels.
//!
//! One launch processes every group; rayon parallelizes across groups. The
//! per-group counter layout, scan order and stable scatter match the MSL
//! kernels exactly, so results are bit-identical across devices.

use lsd_primitives::{HostKernel, HostLaunch};
use rayon::prelude::*;

use crate::blob::ConfigBlob;
use crate::stages::{COUNT_ARITY, PREFIX_SUM_ARITY, SCATTER_KEYS_ARITY, SCATTER_PAIRS_ARITY};

/// Reject launches whose geometry disagrees with the blob.
fn check_launch(launch: &HostLaunch, blob: &ConfigBlob) -> Result<(), String> {
    let geometry = launch.geometry();
    if geometry.blocks != blob.block_count || geometry.threads_per_block != blob.threads_per_block
    {
        return Err(format!(
            "launched as {geometry}, blob expects {}x{}",
            blob.block_count, blob.threads_per_block
        ));
    }
    Ok(())
}

fn check_len(what: &str, actual: usize, required: usize) -> Result<(), String> {
    if actual < required {
        return Err(format!("{what} holds {actual} elements, {required} required"));
    }
    Ok(())
}

fn check_local(launch: &HostLaunch, index: usize, required: usize) -> Result<(), String> {
    let size = launch.local(index)?;
    if size < required {
        return Err(format!(
            "local argument {index} is {size} bytes, {required} required"
        ));
    }
    Ok(())
}

/// Per-group digit histograms, accumulated into the counter table.
pub struct CountKernel;

impl HostKernel for CountKernel {
    fn arity(&self) -> u32 {
        COUNT_ARITY
    }

    fn execute(&self, launch: &mut HostLaunch) -> Result<(), String> {
        let blob: ConfigBlob = launch.value(2)?;
        let shift: u32 = launch.value(3)?;
        check_launch(launch, &blob)?;

        let n = blob.total_elements as usize;
        let groups = blob.total_groups();
        let digits = blob.digit_count as usize;

        let histograms: Vec<Vec<u32>> = {
            let keys = launch.slice::<u32>(0)?;
            check_len("key buffer", keys.len(), n)?;
            (0..groups)
                .into_par_iter()
                .map(|group| {
                    let (start, end) = blob.group_range(group);
                    let mut hist = vec![0u32; digits];
                    for &key in &keys[start..end] {
                        hist[blob.digit(key, shift)] += 1;
                    }
                    hist
                })
                .collect()
        };

        let counters = launch.slice_mut::<u32>(1)?;
        check_len("counter table", counters.len(), digits * groups)?;
        for (group, hist) in histograms.iter().enumerate() {
            for (digit, &count) in hist.iter().enumerate() {
                let slot = &mut counters[blob.counter_index(digit, group)];
                *slot = slot.wrapping_add(count);
            }
        }
        Ok(())
    }
}

/// Two-level exclusive scan: group offsets within each digit row in place,
/// digit bases into the radix-prefix table.
pub struct PrefixSumKernel;

impl HostKernel for PrefixSumKernel {
    fn arity(&self) -> u32 {
        PREFIX_SUM_ARITY
    }

    fn execute(&self, launch: &mut HostLaunch) -> Result<(), String> {
        let blob: ConfigBlob = launch.value(3)?;
        launch.value::<u32>(4)?;
        check_launch(launch, &blob)?;

        let groups = blob.total_groups();
        let digits = blob.digit_count as usize;
        check_local(launch, 5, 4 * groups)?;

        let totals: Vec<u32> = {
            let counters = launch.slice_mut::<u32>(1)?;
            check_len("counter table", counters.len(), digits * groups)?;
            counters[..digits * groups]
                .par_chunks_mut(groups.max(1))
                .map(|row| {
                    let mut sum = 0u32;
                    for c in row.iter_mut() {
                        let count = *c;
                        *c = sum;
                        sum += count;
                    }
                    sum
                })
                .collect()
        };

        let prefix = launch.slice_mut::<u32>(2)?;
        check_len("radix-prefix table", prefix.len(), digits)?;
        let mut base = 0u32;
        for (slot, total) in prefix.iter_mut().zip(&totals) {
            *slot = base;
            base += total;
        }
        Ok(())
    }
}

/// Destination of every element, in element order.
fn scatter_destinations(
    launch: &HostLaunch,
    blob: &ConfigBlob,
    shift: u32,
    counters_at: usize,
) -> Result<Vec<usize>, String> {
    let n = blob.total_elements as usize;
    let groups = blob.total_groups();
    let digits = blob.digit_count as usize;

    let keys = launch.slice::<u32>(0)?;
    let counters = launch.slice::<u32>(counters_at)?;
    let prefix = launch.slice::<u32>(counters_at + 1)?;
    check_len("key buffer", keys.len(), n)?;
    check_len("counter table", counters.len(), digits * groups)?;
    check_len("radix-prefix table", prefix.len(), digits)?;

    let per_group: Vec<Vec<usize>> = (0..groups)
        .into_par_iter()
        .map(|group| {
            let (start, end) = blob.group_range(group);
            let mut next: Vec<u32> = (0..digits)
                .map(|d| prefix[d] + counters[blob.counter_index(d, group)])
                .collect();
            keys[start..end]
                .iter()
                .map(|&key| {
                    let slot = &mut next[blob.digit(key, shift)];
                    let dst = *slot as usize;
                    *slot += 1;
                    dst
                })
                .collect()
        })
        .collect();

    let destinations: Vec<usize> = per_group.into_iter().flatten().collect();
    if let Some(&bad) = destinations.iter().find(|&&d| d >= n) {
        return Err(format!("scatter destination {bad} outside {n} elements"));
    }
    Ok(destinations)
}

fn permute<T: bytemuck::Pod>(
    launch: &mut HostLaunch,
    src: usize,
    dst: usize,
    destinations: &[usize],
) -> Result<(), String> {
    let n = destinations.len();
    let input: Vec<T> = {
        let input = launch.slice::<T>(src)?;
        check_len("scatter input", input.len(), n)?;
        input[..n].to_vec()
    };
    let output = launch.slice_mut::<T>(dst)?;
    check_len("scatter output", output.len(), n)?;
    for (value, &d) in input.into_iter().zip(destinations) {
        output[d] = value;
    }
    Ok(())
}

/// Stable reorder of keys by the current digit.
pub struct ScatterKeysKernel;

impl HostKernel for ScatterKeysKernel {
    fn arity(&self) -> u32 {
        SCATTER_KEYS_ARITY
    }

    fn execute(&self, launch: &mut HostLaunch) -> Result<(), String> {
        let blob: ConfigBlob = launch.value(6)?;
        let shift: u32 = launch.value(7)?;
        check_launch(launch, &blob)?;
        check_local(
            launch,
            4,
            4 * blob.total_groups() * blob.digits_per_block as usize,
        )?;
        check_local(launch, 5, 4 * blob.digit_count as usize)?;

        let destinations = scatter_destinations(launch, &blob, shift, 2)?;
        permute::<u32>(launch, 0, 1, &destinations)
    }
}

/// Stable reorder of keys and their values by the current digit.
pub struct ScatterPairsKernel;

impl HostKernel for ScatterPairsKernel {
    fn arity(&self) -> u32 {
        SCATTER_PAIRS_ARITY
    }

    fn execute(&self, launch: &mut HostLaunch) -> Result<(), String> {
        let blob: ConfigBlob = launch.value(8)?;
        let shift: u32 = launch.value(9)?;
        check_launch(launch, &blob)?;
        check_local(
            launch,
            6,
            4 * blob.total_groups() * blob.digits_per_block as usize,
        )?;
        check_local(launch, 7, 4 * blob.digit_count as usize)?;

        let destinations = scatter_destinations(launch, &blob, shift, 4)?;
        permute::<u32>(launch, 0, 1, &destinations)?;
        permute::<u64>(launch, 2, 3, &destinations)
    }
}
