use thiserror::Error;

use crate::shared::detection::Detection;
use crate::shared::frame::Frame;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// The device ran out of memory for this batch; a smaller batch may fit.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("inference failed: {0}")]
    Failed(String),
}

/// Opaque vision model: image batch in, detections per image out.
///
/// Implementations must return exactly one detection list per input frame,
/// in input order. Frames handed in are already validated as 3-channel RGB.
/// `&mut self` only because runtime sessions need exclusive access to run;
/// the weights are never swapped out.
pub trait InferenceModel: Send {
    fn infer(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, InferenceError>;
}
