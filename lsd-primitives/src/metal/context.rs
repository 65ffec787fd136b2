//! Metal device initialization: device, command queue, shader library.
//!
//! The library is compiled at runtime from MSL source so the crate builds
//! without an offline `xcrun metal` step.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{MTLCommandQueue, MTLCreateSystemDefaultDevice, MTLDevice, MTLLibrary};

use crate::device::DeviceError;

/// Core GPU state: device, command queue, shader library.
pub struct MetalContext {
    pub device: Retained<ProtocolObject<dyn MTLDevice>>,
    pub queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
    pub library: Retained<ProtocolObject<dyn MTLLibrary>>,
}

impl MetalContext {
    /// Acquire the system default device, create a queue and compile `source`.
    pub fn with_source(source: &str) -> Result<Self, DeviceError> {
        let device = MTLCreateSystemDefaultDevice()
            .ok_or_else(|| DeviceError::Unavailable("no Metal device found".to_string()))?;

        let queue = device.newCommandQueue().ok_or_else(|| {
            DeviceError::Unavailable("failed to create command queue".to_string())
        })?;

        let ns_source = NSString::from_str(source);
        let library = device
            .newLibraryWithSource_options_error(&ns_source, None)
            .map_err(|e| DeviceError::Compilation(e.localizedDescription().to_string()))?;

        Ok(Self {
            device,
            queue,
            library,
        })
    }

    /// Device name as reported by Metal (e.g. "Apple M4 Pro").
    pub fn device_name(&self) -> String {
        self.device.name().to_string()
    }
}
