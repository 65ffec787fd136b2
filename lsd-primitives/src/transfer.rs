//! Typed upload/readback helpers on top of any [`ComputeDevice`].

use bytemuck::Pod;

use crate::device::{ComputeDevice, DeviceError};

/// Allocate a buffer sized for `data` and upload it.
///
/// On a failed upload the fresh buffer is released before the error returns.
pub fn create_buffer_with_data<D: ComputeDevice, T: Pod>(
    device: &D,
    data: &[T],
) -> Result<D::Buffer, DeviceError> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let buffer = device.create_buffer(bytes.len())?;
    if let Err(e) = device.write_buffer(&buffer, 0, bytes) {
        let _ = device.release_buffer(buffer);
        return Err(e);
    }
    Ok(buffer)
}

/// Overwrite the start of `buffer` with `data`.
pub fn write_slice<D: ComputeDevice, T: Pod>(
    device: &D,
    buffer: &D::Buffer,
    data: &[T],
) -> Result<(), DeviceError> {
    device.write_buffer(buffer, 0, bytemuck::cast_slice(data))
}

/// Read the first `count` elements of `buffer`.
pub fn read_vec<D: ComputeDevice, T: Pod>(
    device: &D,
    buffer: &D::Buffer,
    count: usize,
) -> Result<Vec<T>, DeviceError> {
    let mut out = vec![T::zeroed(); count];
    device.read_buffer(buffer, 0, bytemuck::cast_slice_mut(&mut out))?;
    Ok(out)
}

/// Read into `dest`, filling it completely.
pub fn read_into<D: ComputeDevice, T: Pod>(
    device: &D,
    buffer: &D::Buffer,
    dest: &mut [T],
) -> Result<(), DeviceError> {
    device.read_buffer(buffer, 0, bytemuck::cast_slice_mut(dest))
}
