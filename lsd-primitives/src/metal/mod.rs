//! Metal binding of the device capability set (macOS only).
//!
//! Every enqueue encodes and commits its own command buffer on the single
//! queue, so submission order is execution order. `finish` waits on all
//! committed command buffers and reports the first one that failed.
//! Buffers use `StorageModeShared`, so blocking reads and writes are plain
//! memcpys once the queue is drained.

mod context;
mod pso_cache;

use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal::{
    MTLBlitCommandEncoder, MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus,
    MTLCommandEncoder, MTLCommandQueue, MTLComputeCommandEncoder, MTLComputePipelineState,
    MTLDevice, MTLResourceOptions, MTLSize,
};

pub use context::MetalContext;
pub use pso_cache::PsoCache;

use crate::device::{check_range, ComputeDevice, DeviceError, KernelArg, LaunchGeometry};

/// Metal rejects inline argument data above this size.
const MAX_INLINE_BYTES: usize = 4096;

/// Threadgroup memory lengths must be multiples of 16 bytes.
const THREADGROUP_MEMORY_ALIGN: usize = 16;

/// Shared-storage Metal buffer. Equality is object identity.
#[derive(Clone)]
pub struct MetalBuffer {
    raw: Retained<ProtocolObject<dyn MTLBuffer>>,
    len: usize,
}

impl PartialEq for MetalBuffer {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(Retained::as_ptr(&self.raw), Retained::as_ptr(&other.raw))
    }
}

impl fmt::Debug for MetalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalBuffer")
            .field("ptr", &Retained::as_ptr(&self.raw))
            .field("len", &self.len)
            .finish()
    }
}

enum MetalBinding {
    Buffer(MetalBuffer),
    Bytes(Vec<u8>),
    Local(usize),
}

/// A compute pipeline plus its argument table.
pub struct MetalKernel {
    name: String,
    pipeline: Retained<ProtocolObject<dyn MTLComputePipelineState>>,
    bindings: RefCell<Vec<Option<MetalBinding>>>,
}

impl fmt::Debug for MetalKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalKernel")
            .field("name", &self.name)
            .field("bound", &self.bindings.borrow().len())
            .finish()
    }
}

/// [`ComputeDevice`] over the system default Metal device.
pub struct MetalDevice {
    context: MetalContext,
    pipelines: RefCell<PsoCache>,
    in_flight: RefCell<Vec<(String, Retained<ProtocolObject<dyn MTLCommandBuffer>>)>>,
}

impl MetalDevice {
    /// Acquire the default device and compile `source` as the kernel library.
    pub fn with_source(source: &str) -> Result<Self, DeviceError> {
        Ok(Self {
            context: MetalContext::with_source(source)?,
            pipelines: RefCell::new(PsoCache::new()),
            in_flight: RefCell::new(Vec::new()),
        })
    }

    fn command_buffer(
        &self,
        label: &str,
    ) -> Result<Retained<ProtocolObject<dyn MTLCommandBuffer>>, DeviceError> {
        self.context
            .queue
            .commandBuffer()
            .ok_or_else(|| DeviceError::Execution {
                kernel: label.to_string(),
                reason: "failed to create command buffer".to_string(),
            })
    }
}

impl ComputeDevice for MetalDevice {
    type Buffer = MetalBuffer;
    type Kernel = MetalKernel;

    fn name(&self) -> String {
        self.context.device_name()
    }

    fn create_kernel(&self, name: &str) -> Result<MetalKernel, DeviceError> {
        let pipeline = self
            .pipelines
            .borrow_mut()
            .get_or_create(&self.context.library, name)?;
        Ok(MetalKernel {
            name: name.to_string(),
            pipeline,
            bindings: RefCell::new(Vec::new()),
        })
    }

    fn create_buffer(&self, size: usize) -> Result<MetalBuffer, DeviceError> {
        // Metal refuses zero-length buffers.
        let raw = self
            .context
            .device
            .newBufferWithLength_options(size.max(4), MTLResourceOptions::StorageModeShared)
            .ok_or_else(|| DeviceError::OutOfMemory {
                size,
                reason: "newBufferWithLength returned nil".to_string(),
            })?;
        Ok(MetalBuffer { raw, len: size })
    }

    fn release_buffer(&self, buffer: MetalBuffer) -> Result<(), DeviceError> {
        drop(buffer);
        Ok(())
    }

    fn buffer_size(&self, buffer: &MetalBuffer) -> Result<usize, DeviceError> {
        Ok(buffer.len)
    }

    fn set_kernel_argument(
        &self,
        kernel: &MetalKernel,
        index: u32,
        arg: KernelArg<'_, MetalBuffer>,
    ) -> Result<(), DeviceError> {
        let binding = match arg {
            KernelArg::Buffer(buffer) => MetalBinding::Buffer(buffer.clone()),
            KernelArg::Bytes(bytes) if bytes.len() > MAX_INLINE_BYTES => {
                return Err(DeviceError::InvalidArgument {
                    kernel: kernel.name.clone(),
                    index,
                    reason: format!("{} inline bytes exceed {MAX_INLINE_BYTES}", bytes.len()),
                });
            }
            KernelArg::Bytes(bytes) => MetalBinding::Bytes(bytes.to_vec()),
            KernelArg::Local(size) => {
                let aligned = size.next_multiple_of(THREADGROUP_MEMORY_ALIGN);
                let limit = self.context.device.maxThreadgroupMemoryLength();
                if aligned > limit {
                    return Err(DeviceError::InvalidArgument {
                        kernel: kernel.name.clone(),
                        index,
                        reason: format!(
                            "{aligned} bytes of threadgroup memory exceed the device limit of {limit}"
                        ),
                    });
                }
                MetalBinding::Local(size)
            }
        };
        let mut bindings = kernel.bindings.borrow_mut();
        let index = index as usize;
        if bindings.len() <= index {
            bindings.resize_with(index + 1, || None);
        }
        bindings[index] = Some(binding);
        Ok(())
    }

    fn enqueue_range_kernel(
        &self,
        kernel: &MetalKernel,
        geometry: LaunchGeometry,
    ) -> Result<(), DeviceError> {
        let max_threads = kernel.pipeline.maxTotalThreadsPerThreadgroup();
        if geometry.blocks == 0
            || geometry.threads_per_block == 0
            || geometry.threads_per_block as usize > max_threads
        {
            return Err(DeviceError::InvalidGeometry {
                kernel: kernel.name.clone(),
                geometry,
                reason: format!("pipeline allows at most {max_threads} threads per block"),
            });
        }

        let bindings = kernel.bindings.borrow();
        if let Some(index) = bindings.iter().position(Option::is_none) {
            return Err(DeviceError::InvalidArgument {
                kernel: kernel.name.clone(),
                index: index as u32,
                reason: "argument not set".to_string(),
            });
        }
        let local_total: usize = bindings
            .iter()
            .flatten()
            .map(|binding| match binding {
                MetalBinding::Local(size) => size.next_multiple_of(THREADGROUP_MEMORY_ALIGN),
                _ => 0,
            })
            .sum();
        let limit = self.context.device.maxThreadgroupMemoryLength();
        if local_total > limit {
            return Err(DeviceError::InvalidGeometry {
                kernel: kernel.name.clone(),
                geometry,
                reason: format!(
                    "{local_total} bytes of threadgroup memory exceed the device limit of {limit}"
                ),
            });
        }

        let cmd = self.command_buffer(&kernel.name)?;
        let enc = cmd
            .computeCommandEncoder()
            .ok_or_else(|| DeviceError::Execution {
                kernel: kernel.name.clone(),
                reason: "failed to create compute encoder".to_string(),
            })?;
        enc.setComputePipelineState(&kernel.pipeline);

        // Buffers and inline bytes share the buffer table at their argument
        // index; local allocations are numbered separately in order.
        let mut local_index = 0usize;
        for (index, binding) in bindings.iter().flatten().enumerate() {
            match binding {
                MetalBinding::Buffer(buffer) => unsafe {
                    enc.setBuffer_offset_atIndex(Some(&buffer.raw), 0, index);
                },
                MetalBinding::Bytes(bytes) => unsafe {
                    let ptr: NonNull<c_void> = NonNull::from(bytes.as_slice()).cast();
                    enc.setBytes_length_atIndex(ptr, bytes.len(), index);
                },
                MetalBinding::Local(size) => {
                    let aligned = size.next_multiple_of(THREADGROUP_MEMORY_ALIGN);
                    unsafe {
                        enc.setThreadgroupMemoryLength_atIndex(aligned, local_index);
                    }
                    local_index += 1;
                }
            }
        }

        let grid = MTLSize {
            width: geometry.blocks as usize,
            height: 1,
            depth: 1,
        };
        let tg = MTLSize {
            width: geometry.threads_per_block as usize,
            height: 1,
            depth: 1,
        };
        enc.dispatchThreadgroups_threadsPerThreadgroup(grid, tg);
        enc.endEncoding();
        cmd.commit();
        self.in_flight.borrow_mut().push((kernel.name.clone(), cmd));
        Ok(())
    }

    fn enqueue_copy_buffer(
        &self,
        src: &MetalBuffer,
        dst: &MetalBuffer,
        size: usize,
    ) -> Result<(), DeviceError> {
        check_range(0, size, src.len)?;
        check_range(0, size, dst.len)?;
        let cmd = self.command_buffer("copy")?;
        let blit = cmd
            .blitCommandEncoder()
            .ok_or_else(|| DeviceError::Execution {
                kernel: "copy".to_string(),
                reason: "failed to create blit encoder".to_string(),
            })?;
        unsafe {
            blit.copyFromBuffer_sourceOffset_toBuffer_destinationOffset_size(
                &src.raw, 0, &dst.raw, 0, size,
            );
        }
        blit.endEncoding();
        cmd.commit();
        self.in_flight.borrow_mut().push(("copy".to_string(), cmd));
        Ok(())
    }

    fn write_buffer(
        &self,
        buffer: &MetalBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.finish()?;
        check_range(offset, data.len(), buffer.len)?;
        unsafe {
            let base = buffer.raw.contents().as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len());
        }
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &MetalBuffer,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        self.finish()?;
        check_range(offset, out.len(), buffer.len)?;
        unsafe {
            let base = buffer.raw.contents().as_ptr() as *const u8;
            std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        let in_flight = std::mem::take(&mut *self.in_flight.borrow_mut());
        let mut first_error = None;
        for (label, cmd) in in_flight {
            cmd.waitUntilCompleted();
            if first_error.is_none() && cmd.status() == MTLCommandBufferStatus::Error {
                let reason = cmd
                    .error()
                    .map(|e| e.localizedDescription().to_string())
                    .unwrap_or_else(|| "command buffer error".to_string());
                first_error = Some(DeviceError::Execution {
                    kernel: label,
                    reason,
                });
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
