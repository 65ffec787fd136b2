mod common;

use std::cell::Cell;

use common::{random_keys, small_config};

use lsd_primitives::{
    create_buffer_with_data, read_vec, HostBuffer, HostKernel, HostKernelHandle, HostLaunch,
    KernelArg, LaunchGeometry,
};
use lsd_sort::kernels::{CountKernel, ScatterKeysKernel};
use lsd_sort::stages::{COUNT_KERNEL, SCATTER_KEYS_KERNEL};
use lsd_sort::{
    radix_program, ComputeDevice, DeviceError, HostDevice, RadixSortEngine, SortError, Stage,
};

/// Scatter that fails once the digit offset reaches `fail_at`.
struct FaultyScatter {
    fail_at: u32,
}

impl HostKernel for FaultyScatter {
    fn arity(&self) -> u32 {
        ScatterKeysKernel.arity()
    }

    fn execute(&self, launch: &mut HostLaunch) -> Result<(), String> {
        let shift: u32 = launch.value(7)?;
        if shift >= self.fail_at {
            return Err(format!("injected fault at shift {shift}"));
        }
        ScatterKeysKernel.execute(launch)
    }
}

/// Count kernel advertising one argument fewer than the stage binds.
struct ShortCount;

impl HostKernel for ShortCount {
    fn arity(&self) -> u32 {
        CountKernel.arity() - 1
    }

    fn execute(&self, launch: &mut HostLaunch) -> Result<(), String> {
        CountKernel.execute(launch)
    }
}

#[test]
fn test_scratch_allocation_failure_launches_nothing() {
    let n = 1_000;
    let keys = random_keys(1, n);
    // Room for the caller's buffers only.
    let device = HostDevice::new(radix_program()).with_memory_limit(2 * n * 4);
    let mut engine = RadixSortEngine::new(device, small_config()).unwrap();
    let device = engine.device();
    let input = create_buffer_with_data(device, &keys).unwrap();
    let output = create_buffer_with_data(device, &vec![7u32; n]).unwrap();

    let err = engine.keys_only(&input, &output, n).unwrap_err();
    assert!(
        matches!(err, SortError::Allocation { buffer: "counter table", .. }),
        "{err}"
    );

    let device = engine.device();
    assert_eq!(device.launch_count(), 0);
    assert_eq!(device.live_buffers(), 2);
    assert_eq!(read_vec::<_, u32>(device, &input, n).unwrap(), keys);
    assert_eq!(read_vec::<_, u32>(device, &output, n).unwrap(), vec![7u32; n]);
}

#[test]
fn test_shadow_allocation_failure_leaves_buffers_untouched() {
    let n = 500;
    let keys = random_keys(2, n);
    let values: Vec<u64> = (0..n as u64).collect();
    // Caller buffers plus shadow keys fit; shadow values do not.
    let device = HostDevice::new(radix_program()).with_memory_limit(n * 12 + n * 4);
    let mut engine = RadixSortEngine::new(device, small_config()).unwrap();
    let device = engine.device();
    let k = create_buffer_with_data(device, &keys).unwrap();
    let v = create_buffer_with_data(device, &values).unwrap();

    let err = engine.keys_with_values_in_place(&k, &v, n).unwrap_err();
    assert!(matches!(
        err,
        SortError::Allocation {
            buffer: "shadow values",
            size: 4000,
            ..
        }
    ));
    let device = engine.device();
    assert_eq!(device.launch_count(), 0);
    assert_eq!(device.live_buffers(), 2);
    assert_eq!(read_vec::<_, u32>(device, &k, n).unwrap(), keys);
    assert_eq!(read_vec::<_, u64>(device, &v, n).unwrap(), values);
}

#[test]
fn test_device_failure_reports_stage_and_pass() {
    let program = radix_program().with_kernel(SCATTER_KEYS_KERNEL, FaultyScatter { fail_at: 8 });
    let mut engine = RadixSortEngine::new(HostDevice::new(program), small_config()).unwrap();
    let mut keys = random_keys(3, 200);

    let err = engine.sort_keys(&mut keys).unwrap_err();
    match &err {
        SortError::Synchronization {
            stage: Stage::Scatter,
            pass: 2,
            source: DeviceError::Execution { kernel, reason },
        } => {
            assert_eq!(kernel, SCATTER_KEYS_KERNEL);
            assert!(reason.contains("shift 8"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.stage(), Some((Stage::Scatter, 2)));
    // Passes 0 and 1 ran fully, pass 2 stopped after its scatter.
    assert_eq!(engine.device().launch_count(), 9);
    assert_eq!(engine.device().live_buffers(), 0, "scratch and uploads released");
}

#[test]
fn test_rejected_argument_is_stage_invocation() {
    let program = radix_program().with_kernel(COUNT_KERNEL, ShortCount);
    let mut engine = RadixSortEngine::new(HostDevice::new(program), small_config()).unwrap();
    let device = engine.device();
    let input = create_buffer_with_data(device, &[3u32, 1, 2]).unwrap();
    let output = device.create_buffer(12).unwrap();

    let err = engine.keys_only(&input, &output, 3).unwrap_err();
    assert!(matches!(
        err,
        SortError::StageInvocation {
            stage: Stage::Count,
            pass: 0,
            source: DeviceError::InvalidArgument { index: 3, .. },
        }
    ));
    assert_eq!(engine.device().launch_count(), 0);
    assert_eq!(engine.device().live_buffers(), 2);
}

#[test]
fn test_in_place_failure_releases_shadows() {
    let program = radix_program().with_kernel(
        lsd_sort::stages::SCATTER_PAIRS_KERNEL,
        FailingPairs,
    );
    let mut engine = RadixSortEngine::new(HostDevice::new(program), small_config()).unwrap();
    let mut keys = vec![3u32, 2, 1];
    let mut values = vec![30u64, 20, 10];
    let err = engine.sort_pairs(&mut keys, &mut values).unwrap_err();
    assert_eq!(err.stage(), Some((Stage::Scatter, 0)));
    assert_eq!(engine.device().live_buffers(), 0);
    assert_eq!(engine.device().live_bytes(), 0);
}

struct FailingPairs;

impl HostKernel for FailingPairs {
    fn arity(&self) -> u32 {
        10
    }

    fn execute(&self, _launch: &mut HostLaunch) -> Result<(), String> {
        Err("device lost".to_string())
    }
}

#[test]
fn test_too_many_elements() {
    let mut engine = RadixSortEngine::host(small_config()).unwrap();
    let device = engine.device();
    let a = device.create_buffer(4).unwrap();
    let b = device.create_buffer(4).unwrap();
    let n = u32::MAX as usize + 1;
    assert!(matches!(
        engine.keys_only(&a, &b, n),
        Err(SortError::TooManyElements(m)) if m == n
    ));
}

/// Host device whose next buffer write or copy can be made to fail.
struct FaultInjectingDevice {
    inner: HostDevice,
    fail_next_write: Cell<bool>,
    fail_next_copy: Cell<bool>,
}

impl FaultInjectingDevice {
    fn new() -> Self {
        Self {
            inner: HostDevice::new(radix_program()),
            fail_next_write: Cell::new(false),
            fail_next_copy: Cell::new(false),
        }
    }
}

impl ComputeDevice for FaultInjectingDevice {
    type Buffer = HostBuffer;
    type Kernel = HostKernelHandle;

    fn name(&self) -> String {
        "fault-injecting host".to_string()
    }

    fn create_kernel(&self, name: &str) -> Result<HostKernelHandle, DeviceError> {
        self.inner.create_kernel(name)
    }

    fn create_buffer(&self, size: usize) -> Result<HostBuffer, DeviceError> {
        self.inner.create_buffer(size)
    }

    fn release_buffer(&self, buffer: HostBuffer) -> Result<(), DeviceError> {
        self.inner.release_buffer(buffer)
    }

    fn buffer_size(&self, buffer: &HostBuffer) -> Result<usize, DeviceError> {
        self.inner.buffer_size(buffer)
    }

    fn set_kernel_argument(
        &self,
        kernel: &HostKernelHandle,
        index: u32,
        arg: KernelArg<'_, HostBuffer>,
    ) -> Result<(), DeviceError> {
        self.inner.set_kernel_argument(kernel, index, arg)
    }

    fn enqueue_range_kernel(
        &self,
        kernel: &HostKernelHandle,
        geometry: LaunchGeometry,
    ) -> Result<(), DeviceError> {
        self.inner.enqueue_range_kernel(kernel, geometry)
    }

    fn enqueue_copy_buffer(
        &self,
        src: &HostBuffer,
        dst: &HostBuffer,
        size: usize,
    ) -> Result<(), DeviceError> {
        if self.fail_next_copy.replace(false) {
            return Err(DeviceError::InvalidBuffer);
        }
        self.inner.enqueue_copy_buffer(src, dst, size)
    }

    fn write_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        if self.fail_next_write.replace(false) {
            return Err(DeviceError::InvalidBuffer);
        }
        self.inner.write_buffer(buffer, offset, data)
    }

    fn read_buffer(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        self.inner.read_buffer(buffer, offset, out)
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.inner.finish()
    }
}

#[test]
fn test_counter_zeroing_failure_reports_zero_stage() {
    let mut engine = RadixSortEngine::new(FaultInjectingDevice::new(), small_config()).unwrap();
    let keys = random_keys(4, 300);
    let device = engine.device();
    let input = create_buffer_with_data(device, &keys).unwrap();
    let output = device.create_buffer(keys.len() * 4).unwrap();
    device.fail_next_write.set(true);

    let err = engine.keys_only(&input, &output, keys.len()).unwrap_err();
    assert!(
        matches!(
            err,
            SortError::StageInvocation {
                stage: Stage::Zero,
                pass: 0,
                source: DeviceError::InvalidBuffer,
            }
        ),
        "{err}"
    );
    assert_eq!(err.stage(), Some((Stage::Zero, 0)));

    let device = &engine.device().inner;
    assert_eq!(device.launch_count(), 0);
    assert_eq!(device.live_buffers(), 2, "scratch released");
    assert_eq!(read_vec::<_, u32>(device, &input, keys.len()).unwrap(), keys);
}

#[test]
fn test_reconcile_copy_failure_reports_reconcile_stage() {
    // Eight passes land in the input buffer, so a copy into `output` follows.
    let mut engine = RadixSortEngine::new(FaultInjectingDevice::new(), small_config()).unwrap();
    let passes = engine.decomposition().pass_count();
    assert_eq!(passes % 2, 0);
    let keys = random_keys(5, 300);
    let device = engine.device();
    let input = create_buffer_with_data(device, &keys).unwrap();
    let output = device.create_buffer(keys.len() * 4).unwrap();
    device.fail_next_copy.set(true);

    let err = engine.keys_only(&input, &output, keys.len()).unwrap_err();
    assert!(
        matches!(
            err,
            SortError::StageInvocation {
                stage: Stage::Reconcile,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(err.stage(), Some((Stage::Reconcile, passes)));

    let device = &engine.device().inner;
    assert_eq!(device.launch_count(), 3 * passes as u64);
    assert_eq!(device.live_buffers(), 2, "scratch released");
    // The sorted data is still in the landing buffer.
    let mut expected = keys;
    expected.sort_unstable();
    assert_eq!(read_vec::<_, u32>(device, &input, expected.len()).unwrap(), expected);
}
