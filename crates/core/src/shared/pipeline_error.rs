use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors that can end a pipeline run, or that are reported for a single
/// frame or worker without ending it.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to decode {locator}: {reason}")]
    Decode { locator: String, reason: String },

    /// Isolated to one frame: the worker emits an empty result for it.
    #[error("frame {index} cannot be fed to the model: {reason}")]
    InputFormat { index: usize, reason: String },

    #[error("batch needs ~{required} bytes but the worker budget is {budget} bytes")]
    ResourceExhausted { required: u64, budget: u64 },

    #[error("worker {worker_id} failed to load its model: {reason}")]
    ModelLoad { worker_id: usize, reason: String },

    #[error("no worker could load a model (last error: {0})")]
    NoHealthyWorkers(String),

    #[error(
        "frame {index} is {}x{} but the output is {}x{}",
        .actual.0, .actual.1, .expected.0, .expected.1
    )]
    DimensionMismatch {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("frame {index} was delivered twice")]
    DuplicateFrame { index: usize },

    #[error("frame {index} is past the end of a {total}-frame source")]
    UnexpectedFrame { index: usize, total: usize },

    #[error(
        "reassembly incomplete: missing frame indices {} ({} batch(es) failed permanently)",
        format_indices(.missing), .failures.len()
    )]
    IncompleteResult {
        missing: Vec<usize>,
        failures: Vec<BatchFailure>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("video sink error: {0}")]
    Sink(String),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why one attempt at a batch did not produce results.
///
/// Every variant is retryable; the dispatcher decides when to give up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("worker crashed: {0}")]
    Crashed(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// A batch that failed every attempt it was allowed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "batch {batch_id} (frames {}) failed after {attempts} attempt(s): {cause}",
    format_indices(.frame_indices)
)]
pub struct BatchFailure {
    pub batch_id: usize,
    pub frame_indices: Vec<usize>,
    pub attempts: u32,
    pub cause: WorkerError,
}

/// Renders indices compactly, collapsing consecutive runs: `[0-3, 7, 9-10]`.
pub fn format_indices(indices: &[usize]) -> String {
    struct Runs<'a>(&'a [usize]);

    impl fmt::Display for Runs<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("[")?;
            let mut i = 0;
            let mut first = true;
            while i < self.0.len() {
                let start = self.0[i];
                let mut end = start;
                while i + 1 < self.0.len() && self.0[i + 1] == end + 1 {
                    i += 1;
                    end = self.0[i];
                }
                if !first {
                    f.write_str(", ")?;
                }
                first = false;
                if start == end {
                    write!(f, "{start}")?;
                } else {
                    write!(f, "{start}-{end}")?;
                }
                i += 1;
            }
            f.write_str("]")
        }
    }

    Runs(indices).to_string()
}
