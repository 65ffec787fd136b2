//! Configuration blob handed to every radix kernel.
//!
//! Field order is part of the kernel ABI: the MSL `RadixConfig` struct and the
//! host kernels both read it positionally.

use bytemuck::{Pod, Zeroable};

/// Work-decomposition constants for one sort call, as the kernels see them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ConfigBlob {
    pub digit_count: u32,
    pub block_count: u32,
    pub groups_per_block: u32,
    pub elements_per_thread: u32,
    pub threads_per_group: u32,
    pub elements_per_group: u32,
    pub digits_per_block: u32,
    pub bit_mask: u32,
    pub digit_width: u32,
    pub threads_per_block: u32,
    pub total_elements: u32,
}

impl ConfigBlob {
    /// Number of groups across all blocks.
    pub fn total_groups(&self) -> usize {
        self.block_count as usize * self.groups_per_block as usize
    }

    /// Element range `[start, end)` owned by the flattened group `group`.
    pub fn group_range(&self, group: usize) -> (usize, usize) {
        let epg = self.elements_per_group as usize;
        let n = self.total_elements as usize;
        let start = (group * epg).min(n);
        let end = (start + epg).min(n);
        (start, end)
    }

    /// Index of digit `digit` for flattened group `group` in the counter table.
    pub fn counter_index(&self, digit: usize, group: usize) -> usize {
        digit * self.total_groups() + group
    }

    /// Digit of `key` at bit offset `shift`.
    #[inline]
    pub fn digit(&self, key: u32, shift: u32) -> usize {
        key.checked_shr(shift).unwrap_or(0) as usize & self.bit_mask as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
