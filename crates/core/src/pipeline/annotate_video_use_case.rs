use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::annotation::annotator::Annotator;
use crate::inference::domain::model_loader::ModelLoader;
use crate::inference::worker::WorkerPool;
use crate::labels::label_registry::LabelRegistry;
use crate::pipeline::infrastructure::threaded_pipeline_executor::ThreadedPipelineExecutor;
use crate::shared::pipeline_error::PipelineError;
use crate::video::domain::frame_source::FrameSource;
use crate::video::domain::source_locator::SourceLocator;
use crate::video::domain::video_sink::VideoSink;

use super::pipeline_executor::{PipelineConfig, PipelineExecutor, RunReport};
use super::pipeline_logger::{NullPipelineLogger, PipelineLogger};
use super::pipeline_settings::PipelineSettings;

type ProgressFn = Box<dyn Fn(usize, usize) -> bool + Send>;

/// Annotates one video: decode, batch, infer, draw, reorder, encode.
///
/// Built with [`AnnotateVideoUseCase::builder`]. Building only records the
/// stages; nothing is opened, loaded or spawned until [`materialize`]. This
/// is a single-use struct: `materialize` consumes the owned stages, so
/// calling it twice fails.
///
/// [`materialize`]: AnnotateVideoUseCase::materialize
pub struct AnnotateVideoUseCase {
    stages: Option<Stages>,
}

struct Stages {
    source: Box<dyn FrameSource>,
    sink: Box<dyn VideoSink>,
    loader: Arc<dyn ModelLoader>,
    labels: Arc<LabelRegistry>,
    settings: PipelineSettings,
    executor: Box<dyn PipelineExecutor>,
    on_progress: Option<ProgressFn>,
    cancelled: Arc<AtomicBool>,
    logger: Box<dyn PipelineLogger>,
}

impl AnnotateVideoUseCase {
    pub fn builder() -> AnnotateVideoBuilder {
        AnnotateVideoBuilder::default()
    }

    /// Runs the recorded pipeline from `locator` into `output_path`.
    pub fn materialize(
        &mut self,
        locator: &SourceLocator,
        output_path: &Path,
    ) -> Result<RunReport, PipelineError> {
        let Stages {
            mut source,
            sink,
            loader,
            labels,
            settings,
            executor,
            on_progress,
            cancelled,
            mut logger,
        } = self
            .stages
            .take()
            .ok_or_else(|| PipelineError::Config("Pipeline already executed".into()))?;

        let metadata = source.open(locator)?;
        log::info!(
            "Annotating {}: {}x{} @ {:.2} fps, {} frames, codec {}",
            locator,
            metadata.width,
            metadata.height,
            metadata.fps,
            metadata.total_frames,
            metadata.codec
        );

        let pool = match WorkerPool::new(&settings.resource_per_worker, settings.concurrency, loader) {
            Ok(pool) => pool,
            Err(e) => {
                source.close();
                return Err(e);
            }
        };
        let annotator = Arc::new(Annotator::new(labels, settings.confidence_threshold));

        let mut config = PipelineConfig::from_settings(&settings, cancelled);
        if let Some(on_progress) = on_progress {
            config = config.with_progress(on_progress);
        }

        let report = executor.execute(
            source,
            sink,
            pool,
            annotator,
            &metadata,
            output_path,
            config,
            logger.as_mut(),
        );
        logger.summary();
        report
    }
}

/// Records the stages of an [`AnnotateVideoUseCase`].
///
/// A source, a sink and a model loader are required. Labels default to the
/// table named by the settings (COCO when none); the executor defaults to
/// [`ThreadedPipelineExecutor`].
#[derive(Default)]
pub struct AnnotateVideoBuilder {
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn VideoSink>>,
    loader: Option<Arc<dyn ModelLoader>>,
    labels: Option<Arc<LabelRegistry>>,
    settings: PipelineSettings,
    executor: Option<Box<dyn PipelineExecutor>>,
    on_progress: Option<ProgressFn>,
    cancelled: Option<Arc<AtomicBool>>,
    logger: Option<Box<dyn PipelineLogger>>,
}

impl AnnotateVideoBuilder {
    pub fn source(mut self, source: Box<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink(mut self, sink: Box<dyn VideoSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn labels(mut self, labels: Arc<LabelRegistry>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn executor(mut self, executor: Box<dyn PipelineExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Called with `(frames_written, total_frames)`; returning `false`
    /// cancels the run.
    pub fn on_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn cancelled(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(cancelled);
        self
    }

    pub fn logger(mut self, logger: Box<dyn PipelineLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<AnnotateVideoUseCase, PipelineError> {
        self.settings.validate()?;
        let source = self
            .source
            .ok_or_else(|| PipelineError::Config("no frame source configured".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| PipelineError::Config("no video sink configured".into()))?;
        let loader = self
            .loader
            .ok_or_else(|| PipelineError::Config("no model loader configured".into()))?;
        let labels = match self.labels {
            Some(labels) => labels,
            None => Arc::new(self.settings.label_registry()?),
        };

        Ok(AnnotateVideoUseCase {
            stages: Some(Stages {
                source,
                sink,
                loader,
                labels,
                settings: self.settings,
                executor: self
                    .executor
                    .unwrap_or_else(|| Box::new(ThreadedPipelineExecutor::new())),
                on_progress: self.on_progress,
                cancelled: self
                    .cancelled
                    .unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
                logger: self.logger.unwrap_or_else(|| Box::new(NullPipelineLogger)),
            }),
        })
    }
}
