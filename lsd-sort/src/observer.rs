//! Optional per-stage instrumentation.
//!
//! The scheduler notifies an observer after each stage has completed on the
//! device. Observers only read; nothing they do changes the sort result or how
//! errors are classified.

use std::sync::{Arc, Mutex, MutexGuard};

use lsd_primitives::{read_vec, ComputeDevice};

use crate::blob::ConfigBlob;
use crate::error::Stage;

/// A completed stage, with handles to the buffers it touched.
#[derive(Debug)]
pub struct StageEvent<'a, B> {
    pub stage: Stage,
    pub pass: u32,
    pub digit_offset: u32,
    pub blob: &'a ConfigBlob,
    pub counters: &'a B,
    pub radix_prefix: &'a B,
    /// Key buffer written by the stage (the pass output, or the reconcile target).
    pub keys_out: &'a B,
}

pub trait StageObserver<D: ComputeDevice> {
    fn stage_completed(&self, device: &D, event: &StageEvent<'_, D::Buffer>);
}

/// Logs every stage and the radix-prefix table at `debug` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl<D: ComputeDevice> StageObserver<D> for TracingObserver {
    fn stage_completed(&self, device: &D, event: &StageEvent<'_, D::Buffer>) {
        let digits = event.blob.digit_count as usize;
        match read_vec::<D, u32>(device, event.radix_prefix, digits) {
            Ok(prefix) => tracing::debug!(
                stage = %event.stage,
                pass = event.pass,
                digit_offset = event.digit_offset,
                radix_prefix = ?prefix,
                "stage completed"
            ),
            Err(e) => tracing::warn!(
                stage = %event.stage,
                pass = event.pass,
                error = %e,
                "could not read radix-prefix table"
            ),
        }
    }
}

/// One observed stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: Stage,
    pub pass: u32,
    pub digit_offset: u32,
    pub radix_prefix: Vec<u32>,
    /// First `total_elements` keys of the stage's output buffer.
    pub keys_out: Vec<u32>,
}

/// Collects a [`StageRecord`] per stage. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct StageRecorder {
    records: Arc<Mutex<Vec<StageRecord>>>,
}

impl StageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StageRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StageRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("stage recorder mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl<D: ComputeDevice> StageObserver<D> for StageRecorder {
    fn stage_completed(&self, device: &D, event: &StageEvent<'_, D::Buffer>) {
        let digits = event.blob.digit_count as usize;
        let n = event.blob.total_elements as usize;
        let radix_prefix = read_vec::<D, u32>(device, event.radix_prefix, digits);
        let keys_out = read_vec::<D, u32>(device, event.keys_out, n);
        match (radix_prefix, keys_out) {
            (Ok(radix_prefix), Ok(keys_out)) => self.lock().push(StageRecord {
                stage: event.stage,
                pass: event.pass,
                digit_offset: event.digit_offset,
                radix_prefix,
                keys_out,
            }),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(stage = %event.stage, pass = event.pass, error = %e, "stage not recorded")
            }
        }
    }
}
