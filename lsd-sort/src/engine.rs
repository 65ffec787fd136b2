use lsd_primitives::{create_buffer_with_data, read_into, ComputeDevice, HostDevice};

use crate::config::{Decomposition, SortConfig};
use crate::error::SortError;
use crate::kernels::radix_program;
use crate::observer::StageObserver;
use crate::scheduler::{PassPlan, PassScheduler};
use crate::scratch::{OwnedBuffer, ScratchBuffers, ShadowBuffers};
use crate::stages::{validate_buffers, StageKernels};

/// LSD radix sort over u32 keys (with optional u64 values) on one device.
///
/// Buffer entry points take caller-owned device buffers. Both buffers of a
/// pair serve as ping-pong storage, so the input's contents are unspecified
/// after a call unless it is also the result target.
pub struct RadixSortEngine<D: ComputeDevice> {
    device: D,
    config: SortConfig,
    decomposition: Decomposition,
    kernels: StageKernels<D>,
    observer: Option<Box<dyn StageObserver<D>>>,
}

impl RadixSortEngine<HostDevice> {
    /// Engine on an in-process [`HostDevice`] running the host radix kernels.
    pub fn host(config: SortConfig) -> Result<Self, SortError> {
        Self::new(HostDevice::new(radix_program()), config)
    }
}

#[cfg(target_os = "macos")]
impl RadixSortEngine<lsd_primitives::MetalDevice> {
    /// Engine on the system default Metal device.
    pub fn metal(config: SortConfig) -> Result<Self, SortError> {
        let device = lsd_primitives::MetalDevice::with_source(crate::kernels::RADIX_SORT_MSL)
            .map_err(|source| SortError::KernelSetup {
                kernel: "radix_sort.metal",
                source,
            })?;
        Self::new(device, config)
    }
}

impl<D: ComputeDevice> RadixSortEngine<D> {
    /// Validate `config` and load the stage kernels from `device`.
    pub fn new(device: D, config: SortConfig) -> Result<Self, SortError> {
        let decomposition = config.derive()?;
        let kernels = StageKernels::load(&device)?;
        tracing::debug!(
            device = %device.name(),
            digit_width = decomposition.digit_width(),
            blocks = decomposition.block_count(),
            threads_per_block = decomposition.threads_per_block(),
            passes = decomposition.pass_count(),
            "radix sort engine ready"
        );
        Ok(Self {
            device,
            config,
            decomposition,
            kernels,
            observer: None,
        })
    }

    /// Notify `observer` after every completed stage.
    pub fn with_observer(mut self, observer: impl StageObserver<D> + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    pub fn decomposition(&self) -> &Decomposition {
        &self.decomposition
    }

    /// Sort `n` keys from `input` into `output`.
    pub fn keys_only(
        &mut self,
        input: &D::Buffer,
        output: &D::Buffer,
        n: usize,
    ) -> Result<(), SortError> {
        self.sort_key_buffers(input, output, n)
    }

    /// Sort `n` key-value pairs into `output_keys` / `output_values`.
    /// Equal keys keep their input order.
    pub fn keys_with_values(
        &mut self,
        input_keys: &D::Buffer,
        output_keys: &D::Buffer,
        input_values: &D::Buffer,
        output_values: &D::Buffer,
        n: usize,
    ) -> Result<(), SortError> {
        let n = validate_buffers(
            &self.device,
            (input_keys, output_keys),
            Some((input_values, output_values)),
            n,
        )?;
        tracing::debug!(n, passes = self.decomposition.pass_count(), "sort pairs");
        let plan = PassPlan {
            keys: [input_keys, output_keys],
            values: Some([input_values, output_values]),
            keys_target: output_keys,
            values_target: Some(output_values),
            blob: self.decomposition.blob(n),
        };
        self.execute(&plan)
    }

    /// Sort `n` key-value pairs in place, ping-ponging against internal
    /// shadow buffers.
    pub fn keys_with_values_in_place(
        &mut self,
        keys: &D::Buffer,
        values: &D::Buffer,
        n: usize,
    ) -> Result<(), SortError> {
        self.sort_pairs_in_place(keys, values, n)
    }

    fn sort_key_buffers(
        &self,
        input: &D::Buffer,
        output: &D::Buffer,
        n: usize,
    ) -> Result<(), SortError> {
        let n = validate_buffers(&self.device, (input, output), None, n)?;
        tracing::debug!(n, passes = self.decomposition.pass_count(), "sort keys");
        let plan = PassPlan {
            keys: [input, output],
            values: None,
            keys_target: output,
            values_target: None,
            blob: self.decomposition.blob(n),
        };
        self.execute(&plan)
    }

    fn sort_pairs_in_place(
        &self,
        keys: &D::Buffer,
        values: &D::Buffer,
        n: usize,
    ) -> Result<(), SortError> {
        let n32 = u32::try_from(n).map_err(|_| SortError::TooManyElements(n))?;
        check_in_place(&self.device, keys, values, n)?;
        let shadows = ShadowBuffers::acquire(&self.device, n)?;
        tracing::debug!(n, passes = self.decomposition.pass_count(), "sort pairs in place");
        let plan = PassPlan {
            keys: [keys, shadows.keys()],
            values: Some([values, shadows.values()]),
            keys_target: keys,
            values_target: Some(values),
            blob: self.decomposition.blob(n32),
        };
        let result = self.execute(&plan);
        let released = shadows.release();
        result.and(released)
    }

    /// Acquire scratch, run every pass, release scratch on every path.
    fn execute(&self, plan: &PassPlan<'_, D::Buffer>) -> Result<(), SortError> {
        let scratch = ScratchBuffers::acquire(&self.device, &self.decomposition)?;
        let mut scheduler = PassScheduler::new(
            &self.device,
            &self.kernels,
            &self.decomposition,
            self.observer.as_deref(),
        );
        let result = scheduler.run(&scratch, plan);
        let released = scratch.release();
        result.and(released)
    }

    /// Sort a host slice of keys.
    pub fn sort_keys(&mut self, data: &mut [u32]) -> Result<(), SortError> {
        let n = data.len();
        if n <= 1 {
            return Ok(());
        }
        let input = self.upload("input keys", data)?;
        let output = OwnedBuffer::allocate(&self.device, "output keys", n * 4)?;
        self.sort_key_buffers(input.get(), output.get(), n)?;
        read_into(&self.device, output.get(), data).map_err(SortError::Transfer)?;
        input.release().and(output.release()).map_err(SortError::Transfer)
    }

    /// Sort keys and carry `values` along. Equal keys keep their order.
    pub fn sort_pairs(&mut self, keys: &mut [u32], values: &mut [u64]) -> Result<(), SortError> {
        if keys.len() != values.len() {
            return Err(SortError::LengthMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        let n = keys.len();
        if n <= 1 {
            return Ok(());
        }
        let key_buf = self.upload("keys", keys)?;
        let value_buf = self.upload("values", values)?;
        self.sort_pairs_in_place(key_buf.get(), value_buf.get(), n)?;
        read_into(&self.device, key_buf.get(), keys).map_err(SortError::Transfer)?;
        read_into(&self.device, value_buf.get(), values).map_err(SortError::Transfer)?;
        key_buf
            .release()
            .and(value_buf.release())
            .map_err(SortError::Transfer)
    }

    fn upload<T: bytemuck::Pod>(
        &self,
        label: &'static str,
        data: &[T],
    ) -> Result<OwnedBuffer<'_, D>, SortError> {
        let buffer =
            create_buffer_with_data(&self.device, data).map_err(|source| SortError::Allocation {
                buffer: label,
                size: std::mem::size_of_val(data),
                source,
            })?;
        Ok(OwnedBuffer::adopt(&self.device, label, buffer))
    }
}

/// Caller-side checks of the in-place variant.
fn check_in_place<D: ComputeDevice>(
    device: &D,
    keys: &D::Buffer,
    values: &D::Buffer,
    n: usize,
) -> Result<(), SortError> {
    if keys == values {
        return Err(SortError::AliasedBuffers("key and value"));
    }
    for (buffer, handle, elem) in [("keys", keys, 4), ("values", values, 8)] {
        let required = n * elem;
        let actual = device.buffer_size(handle).map_err(SortError::Transfer)?;
        if actual < required {
            return Err(SortError::BufferTooSmall {
                buffer,
                required,
                actual,
            });
        }
    }
    Ok(())
}
