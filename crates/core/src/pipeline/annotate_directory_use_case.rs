use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::inference::domain::model_loader::ModelLoader;
use crate::labels::label_registry::LabelRegistry;
use crate::shared::pipeline_error::PipelineError;
use crate::video::domain::frame_source::FrameSource;
use crate::video::domain::source_locator::SourceLocator;
use crate::video::domain::video_sink::VideoSink;
use crate::video::infrastructure::directory_source::{DirectorySource, VideoSource};
use crate::video::infrastructure::ffmpeg_sink::FfmpegSink;
use crate::video::infrastructure::ffmpeg_source::FfmpegSource;

use super::annotate_video_use_case::AnnotateVideoUseCase;
use super::pipeline_executor::RunReport;
use super::pipeline_logger::{NullPipelineLogger, PipelineLogger};
use super::pipeline_settings::PipelineSettings;

pub type SourceFactory = Box<dyn Fn(&VideoSource) -> Box<dyn FrameSource> + Send + Sync>;
pub type SinkFactory = Box<dyn Fn(&VideoSource) -> Box<dyn VideoSink> + Send + Sync>;
pub type LoggerFactory = Box<dyn Fn(&VideoSource) -> Box<dyn PipelineLogger> + Send + Sync>;
pub type DirectoryProgressFn = Arc<dyn Fn(&VideoSource, usize, usize) -> bool + Send + Sync>;

/// A source whose run failed while failures were isolated.
#[derive(Debug)]
pub struct SourceFailure {
    pub source: VideoSource,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct DirectoryReport {
    pub runs: Vec<(VideoSource, RunReport)>,
    pub failures: Vec<SourceFailure>,
}

impl DirectoryReport {
    pub fn frames_written(&self) -> usize {
        self.runs.iter().map(|(_, r)| r.frames_written).sum()
    }
}

/// Annotates every video in a directory, one pipeline per file.
///
/// Sources run one after another in name order; each gets the full worker
/// pool. With `isolate_source_failures` a failing source is recorded and the
/// rest still run; otherwise the first failure aborts. Cancellation always
/// aborts.
pub struct AnnotateDirectoryUseCase {
    settings: PipelineSettings,
    loader: Arc<dyn ModelLoader>,
    labels: Arc<LabelRegistry>,
    source_factory: SourceFactory,
    sink_factory: SinkFactory,
    logger_factory: LoggerFactory,
    on_progress: Option<DirectoryProgressFn>,
    cancelled: Arc<AtomicBool>,
}

impl AnnotateDirectoryUseCase {
    pub fn new(
        settings: PipelineSettings,
        loader: Arc<dyn ModelLoader>,
        labels: Arc<LabelRegistry>,
    ) -> Self {
        Self {
            settings,
            loader,
            labels,
            source_factory: Box::new(|source: &VideoSource| {
                Box::new(FfmpegSource::new().with_source_id(source.id))
            }),
            sink_factory: Box::new(|_: &VideoSource| Box::new(FfmpegSink::new())),
            logger_factory: Box::new(|_: &VideoSource| Box::new(NullPipelineLogger)),
            on_progress: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = factory;
        self
    }

    pub fn with_sink_factory(mut self, factory: SinkFactory) -> Self {
        self.sink_factory = factory;
        self
    }

    pub fn with_logger_factory(mut self, factory: LoggerFactory) -> Self {
        self.logger_factory = factory;
        self
    }

    pub fn with_progress(mut self, on_progress: DirectoryProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn execute(
        &self,
        input_dir: &Path,
        output_dir: &Path,
    ) -> Result<DirectoryReport, PipelineError> {
        self.settings.validate()?;
        let sources = DirectorySource::scan(input_dir)?;
        let extension = self.settings.output_format.extension();
        let total = sources.len();

        let mut report = DirectoryReport::default();
        for (position, source) in sources.into_iter().enumerate() {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled);
            }
            log::info!(
                "[{}/{}] {}",
                position + 1,
                total,
                source.path.display()
            );

            match self.run_one(&source, &source.output_path(output_dir, extension)) {
                Ok(run) => report.runs.push((source, run)),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(error) if self.settings.isolate_source_failures => {
                    log::warn!("Skipping {}: {error}", source.path.display());
                    report.failures.push(SourceFailure { source, error });
                }
                Err(error) => return Err(error),
            }
        }

        log::info!(
            "Annotated {} of {} video(s), {} frames written",
            report.runs.len(),
            total,
            report.frames_written()
        );
        Ok(report)
    }

    fn run_one(&self, source: &VideoSource, output_path: &Path) -> Result<RunReport, PipelineError> {
        if same_file(&source.path, output_path) {
            return Err(PipelineError::Config(format!(
                "output {} would overwrite its input",
                output_path.display()
            )));
        }

        let mut builder = AnnotateVideoUseCase::builder()
            .source((self.source_factory)(source))
            .sink((self.sink_factory)(source))
            .loader(Arc::clone(&self.loader))
            .labels(Arc::clone(&self.labels))
            .settings(self.settings.clone())
            .logger((self.logger_factory)(source))
            .cancelled(Arc::clone(&self.cancelled));
        if let Some(on_progress) = &self.on_progress {
            let on_progress = Arc::clone(on_progress);
            let source = source.clone();
            builder = builder.on_progress(Box::new(move |current, total| {
                on_progress(&source, current, total)
            }));
        }

        builder
            .build()?
            .materialize(&SourceLocator::File(source.path.clone()), output_path)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
