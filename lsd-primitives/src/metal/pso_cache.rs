//! Pipeline State Object (PSO) cache for compute kernels.

use std::collections::HashMap;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal::{MTLComputePipelineState, MTLDevice, MTLLibrary};

use crate::device::DeviceError;

/// Cache of compiled Metal compute pipeline states, keyed by function name.
#[derive(Default)]
pub struct PsoCache {
    cache: HashMap<String, Retained<ProtocolObject<dyn MTLComputePipelineState>>>,
}

impl PsoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a PSO for the given kernel function name.
    pub fn get_or_create(
        &mut self,
        library: &ProtocolObject<dyn MTLLibrary>,
        function_name: &str,
    ) -> Result<Retained<ProtocolObject<dyn MTLComputePipelineState>>, DeviceError> {
        if let Some(pso) = self.cache.get(function_name) {
            return Ok(pso.clone());
        }
        let pso = Self::compile_pso(library, function_name)?;
        self.cache.insert(function_name.to_string(), pso.clone());
        Ok(pso)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn compile_pso(
        library: &ProtocolObject<dyn MTLLibrary>,
        function_name: &str,
    ) -> Result<Retained<ProtocolObject<dyn MTLComputePipelineState>>, DeviceError> {
        let fn_name = NSString::from_str(function_name);
        #[allow(deprecated)]
        let function = library
            .newFunctionWithName(&fn_name)
            .ok_or_else(|| DeviceError::KernelNotFound(function_name.to_string()))?;

        let device = library.device();
        device
            .newComputePipelineStateWithFunction_error(&function)
            .map_err(|e| {
                DeviceError::Compilation(format!(
                    "pipeline for `{}`: {}",
                    function_name,
                    e.localizedDescription()
                ))
            })
    }
}
