use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::annotation::annotator::Annotator;
use crate::inference::worker::WorkerPool;
use crate::pipeline::dispatcher::DispatcherConfig;
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::pipeline::pipeline_settings::{FailurePolicy, PipelineSettings};
use crate::pipeline::reassembler::ReassemblyMode;
use crate::shared::pipeline_error::{BatchFailure, PipelineError};
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::frame_source::FrameSource;
use crate::video::domain::video_sink::{SinkOptions, VideoSink};

/// Configuration for a pipeline execution run.
pub struct PipelineConfig {
    pub batch_size: usize,
    pub dispatcher: DispatcherConfig,
    pub reassembly: ReassemblyMode,
    pub failure_policy: FailurePolicy,
    pub sink_options: SinkOptions,
    /// Called with `(frames_written, total_frames)` after every flushed
    /// frame; `total_frames` is 0 when the container does not report it.
    /// Returning `false` cancels the run.
    pub on_progress: Option<Box<dyn Fn(usize, usize) -> bool + Send>>,
    pub cancelled: Arc<AtomicBool>,
}

impl PipelineConfig {
    pub fn from_settings(settings: &PipelineSettings, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            batch_size: settings.batch_size,
            dispatcher: settings.dispatcher_config(),
            reassembly: settings.reassembly,
            failure_policy: settings.failure_policy,
            sink_options: settings.sink_options(),
            on_progress: None,
            cancelled,
        }
    }

    pub fn with_progress(mut self, on_progress: Box<dyn Fn(usize, usize) -> bool + Send>) -> Self {
        self.on_progress = Some(on_progress);
        self
    }
}

/// What one run produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub output_path: PathBuf,
    pub frames_decoded: usize,
    pub frames_written: usize,
    pub batches_completed: usize,
    pub retries: usize,
    /// Batches that exhausted their attempts. Non-empty only under
    /// [`FailurePolicy::Passthrough`]; otherwise the run fails instead.
    pub failed_batches: Vec<BatchFailure>,
    pub passthrough_frames: usize,
    pub peak_buffered: usize,
}

/// Abstracts how the decode → infer → annotate → reorder → encode pipeline
/// is executed.
///
/// This is a port (application-layer interface). Infrastructure provides
/// concrete implementations. `source` is already opened; `sink` is opened
/// by the executor.
pub trait PipelineExecutor: Send {
    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        source: Box<dyn FrameSource>,
        sink: Box<dyn VideoSink>,
        pool: WorkerPool,
        annotator: Arc<Annotator>,
        metadata: &VideoMetadata,
        output_path: &Path,
        config: PipelineConfig,
        logger: &mut dyn PipelineLogger,
    ) -> Result<RunReport, PipelineError>;
}
