//! Per-call transient device buffers.
//!
//! Every buffer is held by an [`OwnedBuffer`] guard, so early returns release
//! what was already allocated. `release()` reports failures; a guard dropped
//! without it releases anyway and logs the failure.

use lsd_primitives::{ComputeDevice, DeviceError};

use crate::config::Decomposition;
use crate::error::{SortError, Stage};

/// A device buffer released when dropped.
pub struct OwnedBuffer<'d, D: ComputeDevice> {
    device: &'d D,
    label: &'static str,
    buffer: D::Buffer,
    released: bool,
}

impl<'d, D: ComputeDevice> OwnedBuffer<'d, D> {
    /// Allocate `size` bytes. Failures name the buffer.
    pub fn allocate(device: &'d D, label: &'static str, size: usize) -> Result<Self, SortError> {
        let buffer = device
            .create_buffer(size)
            .map_err(|source| SortError::Allocation {
                buffer: label,
                size,
                source,
            })?;
        Ok(Self::adopt(device, label, buffer))
    }

    /// Take ownership of an existing buffer.
    pub fn adopt(device: &'d D, label: &'static str, buffer: D::Buffer) -> Self {
        Self {
            device,
            label,
            buffer,
            released: false,
        }
    }

    pub fn get(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn release(mut self) -> Result<(), DeviceError> {
        self.released = true;
        self.device.release_buffer(self.buffer.clone())
    }
}

impl<D: ComputeDevice> Drop for OwnedBuffer<'_, D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.device.release_buffer(self.buffer.clone()) {
            tracing::warn!(buffer = self.label, error = %e, "failed to release device buffer");
        }
    }
}

/// Counter table and radix-prefix table for one sort call.
pub struct ScratchBuffers<'d, D: ComputeDevice> {
    device: &'d D,
    counters: OwnedBuffer<'d, D>,
    radix_prefix: OwnedBuffer<'d, D>,
    zeros: Vec<u8>,
}

impl<'d, D: ComputeDevice> ScratchBuffers<'d, D> {
    /// Allocate both tables. On failure nothing stays allocated.
    pub fn acquire(device: &'d D, decomposition: &Decomposition) -> Result<Self, SortError> {
        let counter_bytes = 4 * decomposition.counter_table_len();
        let counters = OwnedBuffer::allocate(device, "counter table", counter_bytes)?;
        let radix_prefix = OwnedBuffer::allocate(
            device,
            "radix-prefix table",
            4 * decomposition.radix_prefix_len(),
        )?;
        Ok(Self {
            device,
            counters,
            radix_prefix,
            zeros: vec![0u8; counter_bytes],
        })
    }

    pub fn counters(&self) -> &D::Buffer {
        self.counters.get()
    }

    pub fn radix_prefix(&self) -> &D::Buffer {
        self.radix_prefix.get()
    }

    /// Blocking overwrite of the counter table with zeros before `pass`.
    pub fn zero_counters(&self, pass: u32) -> Result<(), SortError> {
        self.device
            .write_buffer(self.counters.get(), 0, &self.zeros)
            .map_err(|source| SortError::StageInvocation {
                stage: Stage::Zero,
                pass,
                source,
            })
    }

    /// Release both tables, reporting the first failure.
    pub fn release(self) -> Result<(), SortError> {
        let counters = self.counters.release();
        let radix_prefix = self.radix_prefix.release();
        counters.and(radix_prefix).map_err(SortError::Transfer)
    }
}

/// Internal ping-pong partners for the in-place key-value sort.
pub struct ShadowBuffers<'d, D: ComputeDevice> {
    keys: OwnedBuffer<'d, D>,
    values: OwnedBuffer<'d, D>,
}

impl<'d, D: ComputeDevice> ShadowBuffers<'d, D> {
    pub fn acquire(device: &'d D, n: usize) -> Result<Self, SortError> {
        let keys = OwnedBuffer::allocate(device, "shadow keys", n * 4)?;
        let values = OwnedBuffer::allocate(device, "shadow values", n * 8)?;
        Ok(Self { keys, values })
    }

    pub fn keys(&self) -> &D::Buffer {
        self.keys.get()
    }

    pub fn values(&self) -> &D::Buffer {
        self.values.get()
    }

    pub fn release(self) -> Result<(), SortError> {
        let keys = self.keys.release();
        let values = self.values.release();
        keys.and(values).map_err(SortError::Transfer)
    }
}
