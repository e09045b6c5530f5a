use crate::shared::frame::Frame;
use crate::shared::pipeline_error::PipelineError;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::source_locator::SourceLocator;

/// Decodes a video into frames.
///
/// `frames` is lazy and single-pass: indices start at 0 and increase by one
/// with no gaps. Unreadable input fails with [`PipelineError::Decode`].
pub trait FrameSource: Send {
    fn open(&mut self, locator: &SourceLocator) -> Result<VideoMetadata, PipelineError>;

    fn frames(&mut self) -> Box<dyn Iterator<Item = Result<Frame, PipelineError>> + '_>;

    /// Releases decoder resources. Safe to call more than once.
    fn close(&mut self);
}
