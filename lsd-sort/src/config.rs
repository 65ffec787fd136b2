//! Work-decomposition configuration.
//!
//! [`SortConfig`] is the user-facing knob set. [`SortConfig::derive`] validates
//! it and produces the immutable [`Decomposition`] an engine is built around.

use lsd_primitives::LaunchGeometry;
use serde::{Deserialize, Serialize};

use crate::blob::ConfigBlob;
use crate::error::SortError;

/// Widest digit the kernels support (65536 counters per group).
pub const MAX_DIGIT_WIDTH: u32 = 16;

/// Keys are u32.
pub const MAX_KEY_BITS: u32 = 32;

/// Radix sort decomposition parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    /// Bits consumed per pass.
    pub digit_width: u32,
    /// Work groups per launch.
    pub block_count: u32,
    pub threads_per_block: u32,
    pub elements_per_thread: u32,
    /// Significant key bits; passes stop once these are consumed.
    pub key_bits: u32,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            digit_width: 4,
            block_count: 16,
            threads_per_block: 512,
            elements_per_thread: 8,
            key_bits: 32,
        }
    }
}

impl SortConfig {
    pub fn with_digit_width(mut self, digit_width: u32) -> Self {
        self.digit_width = digit_width;
        self
    }

    pub fn with_block_count(mut self, block_count: u32) -> Self {
        self.block_count = block_count;
        self
    }

    pub fn with_threads_per_block(mut self, threads_per_block: u32) -> Self {
        self.threads_per_block = threads_per_block;
        self
    }

    pub fn with_elements_per_thread(mut self, elements_per_thread: u32) -> Self {
        self.elements_per_thread = elements_per_thread;
        self
    }

    pub fn with_key_bits(mut self, key_bits: u32) -> Self {
        self.key_bits = key_bits;
        self
    }

    /// Validate and compute the derived constants.
    pub fn derive(&self) -> Result<Decomposition, SortError> {
        let invalid = |msg: String| Err(SortError::Configuration(msg));

        for (name, value) in [
            ("digit_width", self.digit_width),
            ("block_count", self.block_count),
            ("threads_per_block", self.threads_per_block),
            ("elements_per_thread", self.elements_per_thread),
            ("key_bits", self.key_bits),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be non-zero"));
            }
        }
        if self.digit_width > MAX_DIGIT_WIDTH {
            return invalid(format!(
                "digit_width {} exceeds {MAX_DIGIT_WIDTH}",
                self.digit_width
            ));
        }
        if self.key_bits > MAX_KEY_BITS {
            return invalid(format!(
                "key_bits {} exceeds {MAX_KEY_BITS}",
                self.key_bits
            ));
        }
        if self.threads_per_block % self.elements_per_thread != 0 {
            return invalid(format!(
                "threads_per_block {} is not a multiple of elements_per_thread {}",
                self.threads_per_block, self.elements_per_thread
            ));
        }

        let digit_count = 1u32 << self.digit_width;
        if digit_count % self.block_count != 0 {
            return invalid(format!(
                "digit count {digit_count} is not a multiple of block_count {}",
                self.block_count
            ));
        }

        let groups_per_block = self.threads_per_block / self.elements_per_thread;
        let counter_len =
            digit_count as u64 * self.block_count as u64 * groups_per_block as u64;
        if counter_len > u32::MAX as u64 {
            return invalid(format!("counter table of {counter_len} entries overflows u32"));
        }
        let global_size = self.block_count as u64 * self.threads_per_block as u64;
        if global_size > u32::MAX as u64 {
            return invalid(format!("launch of {global_size} threads overflows u32"));
        }

        Ok(Decomposition {
            digit_width: self.digit_width,
            digit_count,
            block_count: self.block_count,
            threads_per_block: self.threads_per_block,
            elements_per_thread: self.elements_per_thread,
            groups_per_block,
            threads_per_group: self.threads_per_block / groups_per_block,
            digits_per_block: digit_count / self.block_count,
            bit_mask: digit_count - 1,
            key_bits: self.key_bits,
            pass_count: self.key_bits.div_ceil(self.digit_width),
        })
    }
}

/// Validated, immutable work-decomposition constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decomposition {
    digit_width: u32,
    digit_count: u32,
    block_count: u32,
    threads_per_block: u32,
    elements_per_thread: u32,
    groups_per_block: u32,
    threads_per_group: u32,
    digits_per_block: u32,
    bit_mask: u32,
    key_bits: u32,
    pass_count: u32,
}

impl Decomposition {
    pub fn digit_width(&self) -> u32 {
        self.digit_width
    }

    pub fn digit_count(&self) -> u32 {
        self.digit_count
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn threads_per_block(&self) -> u32 {
        self.threads_per_block
    }

    pub fn elements_per_thread(&self) -> u32 {
        self.elements_per_thread
    }

    pub fn groups_per_block(&self) -> u32 {
        self.groups_per_block
    }

    pub fn threads_per_group(&self) -> u32 {
        self.threads_per_group
    }

    pub fn digits_per_block(&self) -> u32 {
        self.digits_per_block
    }

    pub fn bit_mask(&self) -> u32 {
        self.bit_mask
    }

    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    pub fn pass_count(&self) -> u32 {
        self.pass_count
    }

    /// Groups across all blocks.
    pub fn total_groups(&self) -> u32 {
        self.block_count * self.groups_per_block
    }

    /// Bit offset of the digit sorted in `pass`.
    pub fn digit_offset(&self, pass: u32) -> u32 {
        pass * self.digit_width
    }

    /// Elements each group owns for an `n`-element sort, rounded up.
    pub fn elements_per_group(&self, n: u32) -> u32 {
        n.div_ceil(self.total_groups())
    }

    /// Entries in the counter table: one per (digit, block, group).
    pub fn counter_table_len(&self) -> usize {
        self.digit_count as usize * self.total_groups() as usize
    }

    /// Entries in the radix-prefix table: one per digit.
    pub fn radix_prefix_len(&self) -> usize {
        self.digit_count as usize
    }

    /// Launch geometry shared by every stage.
    pub fn geometry(&self) -> LaunchGeometry {
        LaunchGeometry::new(self.block_count, self.threads_per_block)
    }

    /// Local scratch of the prefix-sum stage: one u32 per group.
    pub fn prefix_sum_local_bytes(&self) -> usize {
        4 * self.total_groups() as usize
    }

    /// Per-group counter staging of the scatter stage.
    pub fn scatter_counter_local_bytes(&self) -> usize {
        4 * self.total_groups() as usize * self.digits_per_block as usize
    }

    /// Per-digit base staging of the scatter stage.
    pub fn scatter_prefix_local_bytes(&self) -> usize {
        4 * self.digit_count as usize
    }

    /// Configuration blob for an `n`-element sort.
    pub fn blob(&self, n: u32) -> ConfigBlob {
        ConfigBlob {
            digit_count: self.digit_count,
            block_count: self.block_count,
            groups_per_block: self.groups_per_block,
            elements_per_thread: self.elements_per_thread,
            threads_per_group: self.threads_per_group,
            elements_per_group: self.elements_per_group(n),
            digits_per_block: self.digits_per_block,
            bit_mask: self.bit_mask,
            digit_width: self.digit_width,
            threads_per_block: self.threads_per_block,
            total_elements: n,
        }
    }
}
