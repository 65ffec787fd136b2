//! Compute-device primitives for the LSD radix sort engine.
//!
//! [`ComputeDevice`] is the capability set the engine drives. [`HostDevice`]
//! runs kernels over host memory on every platform; on macOS [`MetalDevice`]
//! drives a real GPU.

pub mod device;
pub mod host;
#[cfg(target_os = "macos")]
pub mod metal;
pub mod transfer;

pub use device::{ComputeDevice, DeviceError, KernelArg, LaunchGeometry};
pub use host::{
    DeviceCommand, HostBuffer, HostDevice, HostKernel, HostKernelHandle, HostLaunch, HostProgram,
};
#[cfg(target_os = "macos")]
pub use metal::{MetalBuffer, MetalContext, MetalDevice, MetalKernel, PsoCache};
pub use transfer::{create_buffer_with_data, read_into, read_vec, write_slice};
