//! Multi-pass LSD radix sort orchestration for compute devices.
//!
//! A [`RadixSortEngine`] sorts u32 keys, optionally with u64 values, by running
//! count, prefix-sum and scatter stages once per digit, least significant digit
//! first, over double-buffered device memory.
//!
//! ```
//! use lsd_sort::{RadixSortEngine, SortConfig};
//!
//! let mut engine = RadixSortEngine::host(SortConfig::default()).unwrap();
//! let mut keys = vec![0x1F, 0x02, 0x10, 0x00];
//! engine.sort_keys(&mut keys).unwrap();
//! assert_eq!(keys, vec![0x00, 0x02, 0x10, 0x1F]);
//! ```

pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod observer;
pub mod scheduler;
pub mod scratch;
pub mod stages;

pub use blob::ConfigBlob;
pub use config::{Decomposition, SortConfig};
pub use engine::RadixSortEngine;
pub use error::{SortError, Stage};
pub use kernels::{radix_program, RADIX_SORT_MSL};
pub use observer::{StageEvent, StageObserver, StageRecord, StageRecorder, TracingObserver};
pub use scheduler::{PassPlan, PassScheduler, SchedulerState};
pub use scratch::{OwnedBuffer, ScratchBuffers, ShadowBuffers};
pub use stages::StageKernels;

pub use lsd_primitives::{ComputeDevice, DeviceError, HostDevice};
