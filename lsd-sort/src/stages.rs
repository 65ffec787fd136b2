//! Kernel contract of the three compute stages.
//!
//! Every stage is launched over (block_count x threads_per_block). Argument
//! positions below are the kernel ABI shared by the host kernels and the MSL
//! source; changing one side without the other breaks the sort.

use lsd_primitives::{ComputeDevice, DeviceError, KernelArg};

use crate::blob::ConfigBlob;
use crate::config::Decomposition;
use crate::error::{SortError, Stage};

pub const COUNT_KERNEL: &str = "radix_count";
pub const PREFIX_SUM_KERNEL: &str = "radix_prefix_sum";
pub const SCATTER_KEYS_KERNEL: &str = "radix_scatter_keys";
pub const SCATTER_PAIRS_KERNEL: &str = "radix_scatter_pairs";

/// Argument counts, in kernel order.
pub const COUNT_ARITY: u32 = 4;
pub const PREFIX_SUM_ARITY: u32 = 6;
pub const SCATTER_KEYS_ARITY: u32 = 8;
pub const SCATTER_PAIRS_ARITY: u32 = 10;

/// Buffers and parameters of one stage invocation.
#[derive(Debug)]
pub struct StageArgs<'a, B> {
    pub keys_in: &'a B,
    pub keys_out: &'a B,
    /// (values_in, values_out) for key-value sorts.
    pub values: Option<(&'a B, &'a B)>,
    pub counters: &'a B,
    pub radix_prefix: &'a B,
    pub blob: &'a ConfigBlob,
    pub digit_offset: u32,
}

/// count: keys_in, counters, blob, digit_offset.
pub fn count_arguments<'a, B>(args: &'a StageArgs<'a, B>) -> Vec<KernelArg<'a, B>> {
    vec![
        KernelArg::Buffer(args.keys_in),
        KernelArg::Buffer(args.counters),
        KernelArg::Bytes(args.blob.as_bytes()),
        KernelArg::Bytes(bytemuck::bytes_of(&args.digit_offset)),
    ]
}

/// prefix-sum: keys_in, counters, radix_prefix, blob, digit_offset, local group sums.
pub fn prefix_sum_arguments<'a, B>(
    args: &'a StageArgs<'a, B>,
    decomposition: &Decomposition,
) -> Vec<KernelArg<'a, B>> {
    vec![
        KernelArg::Buffer(args.keys_in),
        KernelArg::Buffer(args.counters),
        KernelArg::Buffer(args.radix_prefix),
        KernelArg::Bytes(args.blob.as_bytes()),
        KernelArg::Bytes(bytemuck::bytes_of(&args.digit_offset)),
        KernelArg::Local(decomposition.prefix_sum_local_bytes()),
    ]
}

/// scatter: keys_in, keys_out, [values_in, values_out], counters, radix_prefix,
/// local counters, local prefix, blob, digit_offset.
pub fn scatter_arguments<'a, B>(
    args: &'a StageArgs<'a, B>,
    decomposition: &Decomposition,
) -> Vec<KernelArg<'a, B>> {
    let mut out = Vec::with_capacity(SCATTER_PAIRS_ARITY as usize);
    out.push(KernelArg::Buffer(args.keys_in));
    out.push(KernelArg::Buffer(args.keys_out));
    if let Some((values_in, values_out)) = args.values {
        out.push(KernelArg::Buffer(values_in));
        out.push(KernelArg::Buffer(values_out));
    }
    out.extend([
        KernelArg::Buffer(args.counters),
        KernelArg::Buffer(args.radix_prefix),
        KernelArg::Local(decomposition.scatter_counter_local_bytes()),
        KernelArg::Local(decomposition.scatter_prefix_local_bytes()),
        KernelArg::Bytes(args.blob.as_bytes()),
        KernelArg::Bytes(bytemuck::bytes_of(&args.digit_offset)),
    ]);
    out
}

/// Kernel handles for every stage, created once per engine.
pub struct StageKernels<D: ComputeDevice> {
    count: D::Kernel,
    prefix_sum: D::Kernel,
    scatter_keys: D::Kernel,
    scatter_pairs: D::Kernel,
}

impl<D: ComputeDevice> StageKernels<D> {
    /// Look up all four kernels in the device's program.
    pub fn load(device: &D) -> Result<Self, SortError> {
        let create = |kernel: &'static str| {
            device
                .create_kernel(kernel)
                .map_err(|source| SortError::KernelSetup { kernel, source })
        };
        Ok(Self {
            count: create(COUNT_KERNEL)?,
            prefix_sum: create(PREFIX_SUM_KERNEL)?,
            scatter_keys: create(SCATTER_KEYS_KERNEL)?,
            scatter_pairs: create(SCATTER_PAIRS_KERNEL)?,
        })
    }

    /// Bind the arguments of `stage` and enqueue it. Does not wait.
    pub fn enqueue(
        &self,
        device: &D,
        stage: Stage,
        args: &StageArgs<'_, D::Buffer>,
        decomposition: &Decomposition,
    ) -> Result<(), DeviceError> {
        let (kernel, bound) = match stage {
            Stage::Count => (&self.count, count_arguments(args)),
            Stage::PrefixSum => (&self.prefix_sum, prefix_sum_arguments(args, decomposition)),
            Stage::Scatter if args.values.is_some() => {
                (&self.scatter_pairs, scatter_arguments(args, decomposition))
            }
            Stage::Scatter => (&self.scatter_keys, scatter_arguments(args, decomposition)),
            Stage::Zero | Stage::Reconcile => {
                return Err(DeviceError::InvalidArgument {
                    kernel: stage.to_string(),
                    index: 0,
                    reason: "stage has no kernel".to_string(),
                })
            }
        };
        for (index, arg) in bound.into_iter().enumerate() {
            device.set_kernel_argument(kernel, index as u32, arg)?;
        }
        device.enqueue_range_kernel(kernel, decomposition.geometry())
    }
}

/// Minimum sizes and distinctness of the caller's buffers.
pub fn validate_buffers<D: ComputeDevice>(
    device: &D,
    keys: (&D::Buffer, &D::Buffer),
    values: Option<(&D::Buffer, &D::Buffer)>,
    n: usize,
) -> Result<u32, SortError> {
    let n32 = u32::try_from(n).map_err(|_| SortError::TooManyElements(n))?;

    if keys.0 == keys.1 {
        return Err(SortError::AliasedBuffers("key"));
    }
    if let Some((values_in, values_out)) = values {
        if values_in == values_out {
            return Err(SortError::AliasedBuffers("value"));
        }
        if [keys.0, keys.1].contains(&values_in) || [keys.0, keys.1].contains(&values_out) {
            return Err(SortError::AliasedBuffers("key and value"));
        }
    }

    let check = |buffer: &'static str, handle: &D::Buffer, elem: usize| {
        let required = n * elem;
        let actual = device.buffer_size(handle).map_err(SortError::Transfer)?;
        if actual < required {
            return Err(SortError::BufferTooSmall {
                buffer,
                required,
                actual,
            });
        }
        Ok(())
    };
    check("input keys", keys.0, 4)?;
    check("output keys", keys.1, 4)?;
    if let Some((values_in, values_out)) = values {
        check("input values", values_in, 8)?;
        check("output values", values_out, 8)?;
    }
    Ok(n32)
}
