//! In-process reference device.
//!
//! `HostDevice` implements the full capability set over host memory. Kernels are
//! Rust objects registered in a [`HostProgram`] under the names the device-side
//! program would export. Commands are queued in order and only run when the
//! stream is drained (`finish`, or a blocking read/write), so launch-time
//! rejections and execution-time failures surface at the same points they would
//! on a real device.
//!
//! Allocation accounting follows the buffer pool: live and peak bytes are tracked,
//! and an optional memory limit makes allocations fail the way an exhausted
//! device would.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytemuck::Pod;

use crate::device::{check_range, ComputeDevice, DeviceError, KernelArg, LaunchGeometry};

/// A kernel executed by [`HostDevice`].
pub trait HostKernel: Send + Sync {
    /// Number of positional arguments the kernel expects.
    fn arity(&self) -> u32;

    /// Run one launch. Errors are reported by the device as execution failures.
    fn execute(&self, launch: &mut HostLaunch) -> Result<(), String>;
}

/// Named set of host kernels, the host counterpart of a compiled device program.
#[derive(Clone, Default)]
pub struct HostProgram {
    kernels: HashMap<String, Arc<dyn HostKernel>>,
}

impl HostProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel` under `name`, replacing any previous entry.
    pub fn with_kernel(mut self, name: &str, kernel: impl HostKernel + 'static) -> Self {
        self.kernels.insert(name.to_string(), Arc::new(kernel));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HostKernel>> {
        self.kernels.get(name).cloned()
    }

    /// Registered kernel names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HostProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostProgram")
            .field("kernels", &self.names())
            .finish()
    }
}

/// Handle to a host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostBuffer {
    id: u64,
}

/// Handle to a kernel instance with its own argument table.
#[derive(Debug)]
pub struct HostKernelHandle {
    id: u64,
    name: String,
}

impl HostKernelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A command as observed by the device, recorded when history is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Allocate { buffer: HostBuffer, size: usize },
    Release { buffer: HostBuffer },
    Launch {
        kernel: String,
        geometry: LaunchGeometry,
        buffers: Vec<HostBuffer>,
    },
    Copy {
        src: HostBuffer,
        dst: HostBuffer,
        size: usize,
    },
    Write {
        buffer: HostBuffer,
        offset: usize,
        len: usize,
    },
    Read {
        buffer: HostBuffer,
        offset: usize,
        len: usize,
    },
    Finish,
}

/// Backing store, word-aligned so typed views of 4- and 8-byte elements are valid.
struct Allocation {
    words: Vec<u64>,
    size: usize,
}

impl Allocation {
    fn zeroed(size: usize) -> Self {
        Self {
            words: vec![0u64; size.div_ceil(8)],
            size,
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.size]
    }
}

#[derive(Clone)]
enum Binding {
    Buffer(u64),
    Bytes(Vec<u8>),
    Local(usize),
}

struct KernelSlot {
    name: String,
    kernel: Arc<dyn HostKernel>,
    bindings: Vec<Option<Binding>>,
}

enum Command {
    Launch {
        name: String,
        kernel: Arc<dyn HostKernel>,
        geometry: LaunchGeometry,
        bindings: Vec<Binding>,
    },
    Copy {
        src: u64,
        dst: u64,
        size: usize,
    },
}

enum LaunchArg {
    Buffer { id: u64, memory: Allocation },
    Bytes(Vec<u8>),
    Local(usize),
}

/// Arguments of one kernel launch, as seen by a [`HostKernel`].
pub struct HostLaunch {
    kernel: String,
    geometry: LaunchGeometry,
    args: Vec<LaunchArg>,
}

impl HostLaunch {
    pub fn geometry(&self) -> LaunchGeometry {
        self.geometry
    }

    fn arg(&self, index: usize) -> Result<&LaunchArg, String> {
        self.args
            .get(index)
            .ok_or_else(|| format!("argument {index} out of range"))
    }

    /// Inline bytes bound at `index`.
    pub fn bytes(&self, index: usize) -> Result<&[u8], String> {
        match self.arg(index)? {
            LaunchArg::Bytes(bytes) => Ok(bytes),
            _ => Err(format!("argument {index} is not an inline value")),
        }
    }

    /// Inline value bound at `index`, which must be exactly `size_of::<T>()` bytes.
    pub fn value<T: Pod>(&self, index: usize) -> Result<T, String> {
        let bytes = self.bytes(index)?;
        bytemuck::try_pod_read_unaligned(bytes).map_err(|_| {
            format!(
                "argument {index} holds {} bytes, expected {}",
                bytes.len(),
                std::mem::size_of::<T>()
            )
        })
    }

    /// Local scratch size bound at `index`.
    pub fn local(&self, index: usize) -> Result<usize, String> {
        match self.arg(index)? {
            LaunchArg::Local(size) => Ok(*size),
            _ => Err(format!("argument {index} is not a local allocation")),
        }
    }

    /// Typed view of the buffer bound at `index`.
    pub fn slice<T: Pod>(&self, index: usize) -> Result<&[T], String> {
        match self.arg(index)? {
            LaunchArg::Buffer { memory, .. } => bytemuck::try_cast_slice(memory.bytes())
                .map_err(|e| format!("argument {index}: {e}")),
            _ => Err(format!("argument {index} is not a buffer")),
        }
    }

    /// Mutable typed view of the buffer bound at `index`.
    pub fn slice_mut<T: Pod>(&mut self, index: usize) -> Result<&mut [T], String> {
        match self.args.get_mut(index) {
            Some(LaunchArg::Buffer { memory, .. }) => {
                bytemuck::try_cast_slice_mut(memory.bytes_mut())
                    .map_err(|e| format!("argument {index}: {e}"))
            }
            Some(_) => Err(format!("argument {index} is not a buffer")),
            None => Err(format!("argument {index} out of range")),
        }
    }
}

#[derive(Default)]
struct HostState {
    memory: HashMap<u64, Allocation>,
    kernels: HashMap<u64, KernelSlot>,
    queue: Vec<Command>,
    next_id: u64,
    live_bytes: usize,
    peak_bytes: usize,
    launches: u64,
    history: Option<Vec<DeviceCommand>>,
}

impl HostState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, command: DeviceCommand) {
        if let Some(history) = self.history.as_mut() {
            history.push(command);
        }
    }

    fn size_of(&self, id: u64) -> Result<usize, DeviceError> {
        self.memory
            .get(&id)
            .map(|a| a.size)
            .ok_or(DeviceError::InvalidBuffer)
    }

    /// Execute every queued command in order. On failure the rest of the
    /// queue is discarded.
    fn drain(&mut self) -> Result<(), DeviceError> {
        let queue = std::mem::take(&mut self.queue);
        for command in queue {
            match command {
                Command::Launch {
                    name,
                    kernel,
                    geometry,
                    bindings,
                } => self.run_launch(name, kernel.as_ref(), geometry, bindings)?,
                Command::Copy { src, dst, size } => self.run_copy(src, dst, size)?,
            }
        }
        Ok(())
    }

    fn run_launch(
        &mut self,
        name: String,
        kernel: &dyn HostKernel,
        geometry: LaunchGeometry,
        bindings: Vec<Binding>,
    ) -> Result<(), DeviceError> {
        let mut args = Vec::with_capacity(bindings.len());
        let mut failure = None;
        for binding in bindings {
            match binding {
                Binding::Buffer(id) => match self.memory.remove(&id) {
                    Some(memory) => args.push(LaunchArg::Buffer { id, memory }),
                    None => {
                        failure = Some(format!(
                            "buffer {id} was released or bound to more than one argument"
                        ));
                        break;
                    }
                },
                Binding::Bytes(bytes) => args.push(LaunchArg::Bytes(bytes)),
                Binding::Local(size) => args.push(LaunchArg::Local(size)),
            }
        }

        let mut launch = HostLaunch {
            kernel: name,
            geometry,
            args,
        };
        let result = match failure {
            Some(reason) => Err(reason),
            None => kernel.execute(&mut launch),
        };

        for arg in launch.args {
            if let LaunchArg::Buffer { id, memory } = arg {
                self.memory.insert(id, memory);
            }
        }
        self.launches += 1;

        result.map_err(|reason| DeviceError::Execution {
            kernel: launch.kernel,
            reason,
        })
    }

    fn run_copy(&mut self, src: u64, dst: u64, size: usize) -> Result<(), DeviceError> {
        let data = {
            let source = self.memory.get(&src).ok_or(DeviceError::InvalidBuffer)?;
            check_range(0, size, source.size)?;
            source.bytes()[..size].to_vec()
        };
        let target = self.memory.get_mut(&dst).ok_or(DeviceError::InvalidBuffer)?;
        check_range(0, size, target.size)?;
        target.bytes_mut()[..size].copy_from_slice(&data);
        Ok(())
    }
}

/// Reference compute device backed by host memory.
pub struct HostDevice {
    program: HostProgram,
    memory_limit: Option<usize>,
    state: Mutex<HostState>,
}

impl HostDevice {
    /// Create a device that runs kernels from `program`.
    pub fn new(program: HostProgram) -> Self {
        Self {
            program,
            memory_limit: None,
            state: Mutex::new(HostState::default()),
        }
    }

    /// Fail allocations once live memory would exceed `bytes`.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Record every command for later inspection via [`HostDevice::history`].
    pub fn with_history(self) -> Self {
        self.lock().history = Some(Vec::new());
        self
    }

    pub fn program(&self) -> &HostProgram {
        &self.program
    }

    /// Recorded commands, oldest first. Empty unless history is enabled.
    pub fn history(&self) -> Vec<DeviceCommand> {
        self.lock().history.clone().unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Some(history) = self.lock().history.as_mut() {
            history.clear();
        }
    }

    /// Bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.lock().live_bytes
    }

    /// Peak bytes allocated at any one time.
    pub fn peak_bytes(&self) -> usize {
        self.lock().peak_bytes
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.lock().memory.len()
    }

    /// Number of kernel launches executed so far.
    pub fn launch_count(&self) -> u64 {
        self.lock().launches
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("host device state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDevice")
            .field("program", &self.program)
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Kernel = HostKernelHandle;

    fn name(&self) -> String {
        "host".to_string()
    }

    fn create_kernel(&self, name: &str) -> Result<HostKernelHandle, DeviceError> {
        let kernel = self
            .program
            .get(name)
            .ok_or_else(|| DeviceError::KernelNotFound(name.to_string()))?;
        let mut state = self.lock();
        let id = state.next_id();
        let bindings = vec![None; kernel.arity() as usize];
        state.kernels.insert(
            id,
            KernelSlot {
                name: name.to_string(),
                kernel,
                bindings,
            },
        );
        Ok(HostKernelHandle {
            id,
            name: name.to_string(),
        })
    }

    fn create_buffer(&self, size: usize) -> Result<HostBuffer, DeviceError> {
        let mut state = self.lock();
        if let Some(limit) = self.memory_limit {
            if state.live_bytes.saturating_add(size) > limit {
                return Err(DeviceError::OutOfMemory {
                    size,
                    reason: format!(
                        "{} of {limit} bytes already in use",
                        state.live_bytes
                    ),
                });
            }
        }
        let id = state.next_id();
        state.memory.insert(id, Allocation::zeroed(size));
        state.live_bytes += size;
        state.peak_bytes = state.peak_bytes.max(state.live_bytes);
        let buffer = HostBuffer { id };
        state.record(DeviceCommand::Allocate { buffer, size });
        Ok(buffer)
    }

    fn release_buffer(&self, buffer: HostBuffer) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let allocation = state
            .memory
            .remove(&buffer.id)
            .ok_or(DeviceError::InvalidBuffer)?;
        state.live_bytes -= allocation.size;
        state.record(DeviceCommand::Release { buffer });
        Ok(())
    }

    fn buffer_size(&self, buffer: &HostBuffer) -> Result<usize, DeviceError> {
        self.lock().size_of(buffer.id)
    }

    fn set_kernel_argument(
        &self,
        kernel: &HostKernelHandle,
        index: u32,
        arg: KernelArg<'_, HostBuffer>,
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        let binding = match arg {
            KernelArg::Buffer(buffer) => {
                state.size_of(buffer.id)?;
                Binding::Buffer(buffer.id)
            }
            KernelArg::Bytes(bytes) => Binding::Bytes(bytes.to_vec()),
            KernelArg::Local(size) => Binding::Local(size),
        };
        let slot = state
            .kernels
            .get_mut(&kernel.id)
            .ok_or_else(|| DeviceError::KernelNotFound(kernel.name.clone()))?;
        let arity = slot.bindings.len();
        let entry = slot
            .bindings
            .get_mut(index as usize)
            .ok_or_else(|| DeviceError::InvalidArgument {
                kernel: kernel.name.clone(),
                index,
                reason: format!("kernel takes {arity} arguments"),
            })?;
        *entry = Some(binding);
        Ok(())
    }

    fn enqueue_range_kernel(
        &self,
        kernel: &HostKernelHandle,
        geometry: LaunchGeometry,
    ) -> Result<(), DeviceError> {
        if geometry.blocks == 0 || geometry.threads_per_block == 0 {
            return Err(DeviceError::InvalidGeometry {
                kernel: kernel.name.clone(),
                geometry,
                reason: "empty launch".to_string(),
            });
        }
        let mut state = self.lock();
        let slot = state
            .kernels
            .get(&kernel.id)
            .ok_or_else(|| DeviceError::KernelNotFound(kernel.name.clone()))?;

        let mut bindings = Vec::with_capacity(slot.bindings.len());
        let mut buffers = Vec::new();
        for (index, binding) in slot.bindings.iter().enumerate() {
            let binding = binding.clone().ok_or_else(|| DeviceError::InvalidArgument {
                kernel: slot.name.clone(),
                index: index as u32,
                reason: "argument not set".to_string(),
            })?;
            if let Binding::Buffer(id) = binding {
                if !state.memory.contains_key(&id) {
                    return Err(DeviceError::InvalidArgument {
                        kernel: slot.name.clone(),
                        index: index as u32,
                        reason: "bound buffer was released".to_string(),
                    });
                }
                buffers.push(HostBuffer { id });
            }
            bindings.push(binding);
        }

        let command = Command::Launch {
            name: slot.name.clone(),
            kernel: Arc::clone(&slot.kernel),
            geometry,
            bindings,
        };
        let record = DeviceCommand::Launch {
            kernel: slot.name.clone(),
            geometry,
            buffers,
        };
        state.queue.push(command);
        state.record(record);
        Ok(())
    }

    fn enqueue_copy_buffer(
        &self,
        src: &HostBuffer,
        dst: &HostBuffer,
        size: usize,
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if src == dst {
            return Err(DeviceError::InvalidArgument {
                kernel: "copy".to_string(),
                index: 1,
                reason: "source and destination are the same buffer".to_string(),
            });
        }
        check_range(0, size, state.size_of(src.id)?)?;
        check_range(0, size, state.size_of(dst.id)?)?;
        state.queue.push(Command::Copy {
            src: src.id,
            dst: dst.id,
            size,
        });
        state.record(DeviceCommand::Copy {
            src: *src,
            dst: *dst,
            size,
        });
        Ok(())
    }

    fn write_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.drain()?;
        let allocation = state
            .memory
            .get_mut(&buffer.id)
            .ok_or(DeviceError::InvalidBuffer)?;
        check_range(offset, data.len(), allocation.size)?;
        allocation.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
        state.record(DeviceCommand::Write {
            buffer: *buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.drain()?;
        let allocation = state
            .memory
            .get(&buffer.id)
            .ok_or(DeviceError::InvalidBuffer)?;
        check_range(offset, out.len(), allocation.size)?;
        out.copy_from_slice(&allocation.bytes()[offset..offset + out.len()]);
        state.record(DeviceCommand::Read {
            buffer: *buffer,
            offset,
            len: out.len(),
        });
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record(DeviceCommand::Finish);
        state.drain()
    }
}
