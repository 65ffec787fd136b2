//! Pass scheduling and final-buffer reconciliation.
//!
//! Each pass sorts by one digit, least significant first. The key (and value)
//! pair swaps roles every pass: pass `p` reads `pair[p % 2]` and writes
//! `pair[(p + 1) % 2]`. After the last pass the data sits in
//! `pair[pass_count % 2]`; if that is not the caller's target, one device-side
//! copy moves it there.

use lsd_primitives::ComputeDevice;

use crate::blob::ConfigBlob;
use crate::config::Decomposition;
use crate::error::{SortError, Stage};
use crate::observer::{StageEvent, StageObserver};
use crate::scratch::ScratchBuffers;
use crate::stages::{StageArgs, StageKernels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Counting,
    Summing,
    Scattering,
    Reconciling,
    Done,
}

/// Ping-pong buffers of one sort call and where the result must end up.
#[derive(Debug)]
pub struct PassPlan<'a, B> {
    /// `[pass 0 input, pass 0 output]`.
    pub keys: [&'a B; 2],
    pub values: Option<[&'a B; 2]>,
    pub keys_target: &'a B,
    pub values_target: Option<&'a B>,
    pub blob: ConfigBlob,
}

impl<'a, B> PassPlan<'a, B> {
    /// (input index, output index) into the pair for `pass`.
    pub fn roles(pass: u32) -> (usize, usize) {
        let input = (pass % 2) as usize;
        (input, 1 - input)
    }

    /// Pair index holding the result after `pass_count` passes.
    pub fn landing(pass_count: u32) -> usize {
        (pass_count % 2) as usize
    }
}

/// Drives the count, prefix-sum and scatter stages through every pass.
pub struct PassScheduler<'a, D: ComputeDevice> {
    device: &'a D,
    kernels: &'a StageKernels<D>,
    decomposition: &'a Decomposition,
    observer: Option<&'a dyn StageObserver<D>>,
    state: SchedulerState,
}

impl<'a, D: ComputeDevice> PassScheduler<'a, D> {
    pub fn new(
        device: &'a D,
        kernels: &'a StageKernels<D>,
        decomposition: &'a Decomposition,
        observer: Option<&'a dyn StageObserver<D>>,
    ) -> Self {
        Self {
            device,
            kernels,
            decomposition,
            observer,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    fn transition(&mut self, next: SchedulerState) {
        tracing::trace!(from = ?self.state, to = ?next, "scheduler transition");
        self.state = next;
    }

    /// Run every pass, then reconcile. Stops at the first device error.
    pub fn run(
        &mut self,
        scratch: &ScratchBuffers<'_, D>,
        plan: &PassPlan<'_, D::Buffer>,
    ) -> Result<(), SortError> {
        let pass_count = self.decomposition.pass_count();
        for pass in 0..pass_count {
            self.run_pass(scratch, plan, pass)?;
        }
        self.reconcile(scratch, plan, pass_count)?;
        self.transition(SchedulerState::Done);
        Ok(())
    }

    fn run_pass(
        &mut self,
        scratch: &ScratchBuffers<'_, D>,
        plan: &PassPlan<'_, D::Buffer>,
        pass: u32,
    ) -> Result<(), SortError> {
        let (input, output) = PassPlan::<D::Buffer>::roles(pass);
        let args = StageArgs {
            keys_in: plan.keys[input],
            keys_out: plan.keys[output],
            values: plan.values.map(|v| (v[input], v[output])),
            counters: scratch.counters(),
            radix_prefix: scratch.radix_prefix(),
            blob: &plan.blob,
            digit_offset: self.decomposition.digit_offset(pass),
        };

        scratch.zero_counters(pass)?;
        for (stage, state) in [
            (Stage::Count, SchedulerState::Counting),
            (Stage::PrefixSum, SchedulerState::Summing),
            (Stage::Scatter, SchedulerState::Scattering),
        ] {
            self.transition(state);
            self.invoke(stage, pass, &args)?;
        }
        Ok(())
    }

    /// Enqueue one stage and wait for it.
    fn invoke(
        &self,
        stage: Stage,
        pass: u32,
        args: &StageArgs<'_, D::Buffer>,
    ) -> Result<(), SortError> {
        tracing::trace!(%stage, pass, digit_offset = args.digit_offset, "enqueue stage");
        self.kernels
            .enqueue(self.device, stage, args, self.decomposition)
            .map_err(|source| SortError::StageInvocation {
                stage,
                pass,
                source,
            })?;
        self.device
            .finish()
            .map_err(|source| SortError::Synchronization {
                stage,
                pass,
                source,
            })?;
        self.notify(stage, pass, args);
        Ok(())
    }

    fn notify(&self, stage: Stage, pass: u32, args: &StageArgs<'_, D::Buffer>) {
        if let Some(observer) = self.observer {
            observer.stage_completed(
                self.device,
                &StageEvent {
                    stage,
                    pass,
                    digit_offset: args.digit_offset,
                    blob: args.blob,
                    counters: args.counters,
                    radix_prefix: args.radix_prefix,
                    keys_out: args.keys_out,
                },
            );
        }
    }

    /// Copy the landing buffers into the targets where they differ.
    fn reconcile(
        &mut self,
        scratch: &ScratchBuffers<'_, D>,
        plan: &PassPlan<'_, D::Buffer>,
        pass_count: u32,
    ) -> Result<(), SortError> {
        self.transition(SchedulerState::Reconciling);
        let landing = PassPlan::<D::Buffer>::landing(pass_count);
        let n = plan.blob.total_elements as usize;

        let mut copies = Vec::with_capacity(2);
        if plan.keys[landing] != plan.keys_target {
            copies.push((plan.keys[landing], plan.keys_target, n * 4));
        }
        if let (Some(values), Some(target)) = (plan.values, plan.values_target) {
            if values[landing] != target {
                copies.push((values[landing], target, n * 8));
            }
        }
        copies.retain(|&(_, _, size)| size > 0);
        if copies.is_empty() {
            return Ok(());
        }

        for (src, dst, size) in copies {
            tracing::debug!(size, pass_count, "reconcile copy into target buffer");
            self.device
                .enqueue_copy_buffer(src, dst, size)
                .map_err(|source| SortError::StageInvocation {
                    stage: Stage::Reconcile,
                    pass: pass_count,
                    source,
                })?;
        }
        self.device
            .finish()
            .map_err(|source| SortError::Synchronization {
                stage: Stage::Reconcile,
                pass: pass_count,
                source,
            })?;

        let args = StageArgs {
            keys_in: plan.keys[landing],
            keys_out: plan.keys_target,
            values: None,
            counters: scratch.counters(),
            radix_prefix: scratch.radix_prefix(),
            blob: &plan.blob,
            digit_offset: self.decomposition.digit_offset(pass_count),
        };
        self.notify(Stage::Reconcile, pass_count, &args);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortConfig;
    use crate::kernels::radix_program;
    use crate::observer::StageRecorder;
    use lsd_primitives::{create_buffer_with_data, read_vec, HostDevice};

    #[test]
    fn test_roles_alternate() {
        assert_eq!(PassPlan::<u32>::roles(0), (0, 1));
        assert_eq!(PassPlan::<u32>::roles(1), (1, 0));
        assert_eq!(PassPlan::<u32>::roles(6), (0, 1));
        assert_eq!(PassPlan::<u32>::landing(8), 0);
        assert_eq!(PassPlan::<u32>::landing(3), 1);
    }

    #[test]
    fn test_run_reaches_done_and_sorts_by_each_digit() {
        let device = HostDevice::new(radix_program());
        let d = SortConfig::default()
            .with_block_count(2)
            .with_threads_per_block(8)
            .with_elements_per_thread(2)
            .with_key_bits(12)
            .derive()
            .unwrap();
        let kernels = StageKernels::load(&device).unwrap();
        let recorder = StageRecorder::new();
        let keys: Vec<u32> = vec![0x321, 0x123, 0x213, 0x132, 0x312, 0x231, 0x111, 0x000];
        let input = create_buffer_with_data(&device, &keys).unwrap();
        let output = device.create_buffer(keys.len() * 4).unwrap();
        let scratch = ScratchBuffers::acquire(&device, &d).unwrap();

        let plan = PassPlan {
            keys: [&input, &output],
            values: None,
            keys_target: &output,
            values_target: None,
            blob: d.blob(keys.len() as u32),
        };
        let mut scheduler = PassScheduler::new(&device, &kernels, &d, Some(&recorder));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.run(&scratch, &plan).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Done);

        // Three passes: landing is the output buffer, no reconcile copy.
        let records = recorder.records();
        let stages: Vec<(Stage, u32)> = records.iter().map(|r| (r.stage, r.pass)).collect();
        assert_eq!(stages.len(), 9);
        assert_eq!(stages[0], (Stage::Count, 0));
        assert_eq!(stages[1], (Stage::PrefixSum, 0));
        assert_eq!(stages[2], (Stage::Scatter, 0));
        assert_eq!(stages[8], (Stage::Scatter, 2));

        for r in records.iter().filter(|r| r.stage == Stage::Scatter) {
            let mask = (1u32 << (r.digit_offset + 4)) - 1;
            assert!(
                r.keys_out.windows(2).all(|w| w[0] & mask <= w[1] & mask),
                "pass {} output not ordered by its low bits: {:x?}",
                r.pass,
                r.keys_out
            );
        }

        let sorted: Vec<u32> = read_vec(&device, &output, keys.len()).unwrap();
        let mut expected = keys.clone();
        expected.sort_unstable();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_radix_prefix_is_exclusive_scan_of_digit_totals() {
        let device = HostDevice::new(radix_program());
        let d = SortConfig::default()
            .with_block_count(1)
            .with_threads_per_block(4)
            .with_elements_per_thread(1)
            .with_key_bits(4)
            .derive()
            .unwrap();
        let kernels = StageKernels::load(&device).unwrap();
        let recorder = StageRecorder::new();
        let keys: Vec<u32> = vec![3, 1, 3, 0, 7, 1];
        let input = create_buffer_with_data(&device, &keys).unwrap();
        let output = device.create_buffer(keys.len() * 4).unwrap();
        let scratch = ScratchBuffers::acquire(&device, &d).unwrap();
        let plan = PassPlan {
            keys: [&input, &output],
            values: None,
            keys_target: &input,
            values_target: None,
            blob: d.blob(keys.len() as u32),
        };
        PassScheduler::new(&device, &kernels, &d, Some(&recorder))
            .run(&scratch, &plan)
            .unwrap();

        let records = recorder.records();
        let prefix = &records[1].radix_prefix;
        assert_eq!(records[1].stage, Stage::PrefixSum);
        // Counts: 0->1, 1->2, 3->2, 7->1.
        assert_eq!(&prefix[..9], &[0, 1, 3, 3, 5, 5, 5, 5, 6]);
        assert_eq!(prefix[15], 6);

        // One pass lands in `output`; the target is `input`, so a copy follows.
        let last = records.last().unwrap();
        assert_eq!(last.stage, Stage::Reconcile);
        assert_eq!(last.pass, 1);
        assert_eq!(last.keys_out, vec![0, 1, 1, 3, 3, 7]);
    }
}
