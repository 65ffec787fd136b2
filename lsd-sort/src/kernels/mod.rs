//! Radix kernel programs for each device binding.

mod host;

use lsd_primitives::HostProgram;

pub use host::{CountKernel, PrefixSumKernel, ScatterKeysKernel, ScatterPairsKernel};

use crate::stages::{COUNT_KERNEL, PREFIX_SUM_KERNEL, SCATTER_KEYS_KERNEL, SCATTER_PAIRS_KERNEL};

/// MSL source of the radix kernels, compiled at runtime by `MetalDevice`.
pub const RADIX_SORT_MSL: &str = include_str!("../../shaders/radix_sort.metal");

/// Host program exporting the four radix kernels.
pub fn radix_program() -> HostProgram {
    HostProgram::new()
        .with_kernel(COUNT_KERNEL, CountKernel)
        .with_kernel(PREFIX_SUM_KERNEL, PrefixSumKernel)
        .with_kernel(SCATTER_KEYS_KERNEL, ScatterKeysKernel)
        .with_kernel(SCATTER_PAIRS_KERNEL, ScatterPairsKernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_programs_export_every_stage() {
        let names = [
            COUNT_KERNEL,
            PREFIX_SUM_KERNEL,
            SCATTER_KEYS_KERNEL,
            SCATTER_PAIRS_KERNEL,
        ];
        let program = radix_program();
        for name in names {
            assert!(program.get(name).is_some(), "host program lacks {name}");
            assert!(
                RADIX_SORT_MSL.contains(&format!("kernel void {name}(")),
                "MSL source lacks {name}"
            );
        }
    }
}
