//! Device capability set shared by every compute binding.
//!
//! A binding exposes buffers, named kernels with positional arguments, a single
//! in-order command stream and a blocking `finish`. Everything above this layer
//! (scheduling, buffer roles, reconciliation) is binding-agnostic.

use std::fmt;

/// Errors reported by a compute device binding.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no compute device available: {0}")]
    Unavailable(String),
    #[error("program compilation failed: {0}")]
    Compilation(String),
    #[error("kernel `{0}` not found in program")]
    KernelNotFound(String),
    #[error("allocation of {size} bytes failed: {reason}")]
    OutOfMemory { size: usize, reason: String },
    #[error("invalid or released buffer handle")]
    InvalidBuffer,
    #[error("argument {index} of kernel `{kernel}` rejected: {reason}")]
    InvalidArgument {
        kernel: String,
        index: u32,
        reason: String,
    },
    #[error("launch of `{kernel}` with {geometry} rejected: {reason}")]
    InvalidGeometry {
        kernel: String,
        geometry: LaunchGeometry,
        reason: String,
    },
    #[error("transfer of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("kernel `{kernel}` failed during execution: {reason}")]
    Execution { kernel: String, reason: String },
}

/// One positional kernel argument.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a, B> {
    /// A device buffer handle.
    Buffer(&'a B),
    /// Inline bytes copied at bind time (scalars, parameter structs).
    Bytes(&'a [u8]),
    /// Size in bytes of an on-device local (threadgroup) scratch allocation.
    Local(usize),
}

/// 1D launch geometry: `blocks` work groups of `threads_per_block` threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub blocks: u32,
    pub threads_per_block: u32,
}

impl LaunchGeometry {
    pub fn new(blocks: u32, threads_per_block: u32) -> Self {
        Self {
            blocks,
            threads_per_block,
        }
    }

    /// Total number of threads in the launch.
    pub fn global_size(&self) -> u64 {
        self.blocks as u64 * self.threads_per_block as u64
    }
}

impl fmt::Display for LaunchGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.blocks, self.threads_per_block)
    }
}

/// Minimal device-access capability set.
///
/// Enqueue operations go into one ordered command stream. They may execute
/// lazily; failures that only show up while the device runs are reported by
/// [`ComputeDevice::finish`]. `write_buffer` and `read_buffer` are blocking and
/// drain the stream first.
pub trait ComputeDevice {
    /// Opaque handle to contiguous device memory. Equality is handle identity.
    type Buffer: Clone + PartialEq + fmt::Debug;
    /// Handle to a named kernel together with its bound arguments.
    type Kernel: fmt::Debug;

    /// Human-readable device name.
    fn name(&self) -> String;

    /// Look up a kernel by name in the device's loaded program.
    fn create_kernel(&self, name: &str) -> Result<Self::Kernel, DeviceError>;

    /// Allocate `size` bytes of device memory.
    fn create_buffer(&self, size: usize) -> Result<Self::Buffer, DeviceError>;

    /// Free a buffer. The handle must not be used afterwards.
    fn release_buffer(&self, buffer: Self::Buffer) -> Result<(), DeviceError>;

    /// Size in bytes the buffer was created with.
    fn buffer_size(&self, buffer: &Self::Buffer) -> Result<usize, DeviceError>;

    /// Bind argument `index` of `kernel`. Bindings persist until overwritten.
    fn set_kernel_argument(
        &self,
        kernel: &Self::Kernel,
        index: u32,
        arg: KernelArg<'_, Self::Buffer>,
    ) -> Result<(), DeviceError>;

    /// Enqueue `kernel` with its current bindings over `geometry`.
    fn enqueue_range_kernel(
        &self,
        kernel: &Self::Kernel,
        geometry: LaunchGeometry,
    ) -> Result<(), DeviceError>;

    /// Enqueue a copy of the first `size` bytes of `src` into `dst`.
    fn enqueue_copy_buffer(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: usize,
    ) -> Result<(), DeviceError>;

    /// Blocking write of `data` into `buffer` at `offset`.
    fn write_buffer(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError>;

    /// Blocking read of `out.len()` bytes from `buffer` at `offset`.
    fn read_buffer(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DeviceError>;

    /// Block until every enqueued command has completed.
    fn finish(&self) -> Result<(), DeviceError>;
}

/// Check that `[offset, offset + len)` lies within a buffer of `size` bytes.
pub(crate) fn check_range(offset: usize, len: usize, size: usize) -> Result<(), DeviceError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfRange { offset, len, size }),
    }
}
