use std::fmt;

use lsd_primitives::DeviceError;

/// Step of a pass (or of the sort call) an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Re-zeroing the counter table before a pass.
    Zero,
    Count,
    PrefixSum,
    Scatter,
    /// Final copy into the caller's output buffer.
    Reconcile,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Zero => "zero",
            Stage::Count => "count",
            Stage::PrefixSum => "prefix-sum",
            Stage::Scatter => "scatter",
            Stage::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("invalid sort configuration: {0}")]
    Configuration(String),
    #[error("kernel setup failed for `{kernel}`: {source}")]
    KernelSetup {
        kernel: &'static str,
        #[source]
        source: DeviceError,
    },
    #[error("failed to allocate {buffer} ({size} bytes): {source}")]
    Allocation {
        buffer: &'static str,
        size: usize,
        #[source]
        source: DeviceError,
    },
    #[error("{stage} stage of pass {pass} could not be issued: {source}")]
    StageInvocation {
        stage: Stage,
        pass: u32,
        #[source]
        source: DeviceError,
    },
    #[error("{stage} stage of pass {pass} failed on the device: {source}")]
    Synchronization {
        stage: Stage,
        pass: u32,
        #[source]
        source: DeviceError,
    },
    #[error("{buffer} holds {actual} bytes, {required} required")]
    BufferTooSmall {
        buffer: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("{0} input and output are the same buffer")]
    AliasedBuffers(&'static str),
    #[error("{0} elements exceed the 32-bit element count")]
    TooManyElements(usize),
    #[error("length mismatch: keys={keys}, values={values}")]
    LengthMismatch { keys: usize, values: usize },
    #[error("device buffer access failed: {0}")]
    Transfer(#[source] DeviceError),
}

impl SortError {
    /// Stage and pass of a failed pass-level operation, if any.
    pub fn stage(&self) -> Option<(Stage, u32)> {
        match self {
            SortError::StageInvocation { stage, pass, .. }
            | SortError::Synchronization { stage, pass, .. } => Some((*stage, *pass)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::PrefixSum.to_string(), "prefix-sum");
        assert_eq!(Stage::Reconcile.to_string(), "reconcile");
    }

    #[test]
    fn test_error_reports_stage_and_pass() {
        let err = SortError::Synchronization {
            stage: Stage::Scatter,
            pass: 3,
            source: DeviceError::Execution {
                kernel: "radix_scatter_keys".to_string(),
                reason: "fault".to_string(),
            },
        };
        assert_eq!(err.stage(), Some((Stage::Scatter, 3)));
        let msg = err.to_string();
        assert!(msg.contains("scatter stage of pass 3"), "{msg}");
        assert!(SortError::TooManyElements(1).stage().is_none());
    }
}
