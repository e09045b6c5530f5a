use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::annotation::annotator::Annotator;
use crate::inference::worker::WorkerPool;
use crate::pipeline::batcher::Batcher;
use crate::pipeline::dispatcher::{BatchOutcome, Dispatcher};
use crate::pipeline::pipeline_executor::{PipelineConfig, PipelineExecutor, RunReport};
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::pipeline::pipeline_settings::FailurePolicy;
use crate::pipeline::reassembler::{ReassemblyMode, Reassembler};
use crate::shared::frame::{AnnotatedFrame, Frame};
use crate::shared::pipeline_error::PipelineError;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::frame_source::FrameSource;
use crate::video::domain::video_sink::{SinkReport, VideoSink};

const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Executes the annotation pipeline with dedicated threads per stage.
///
/// Layout: `reader → [batcher + dispatcher] → annotators → reorder → writer`
///
/// The dispatcher runs on the calling thread and owns the inference workers.
/// Annotation runs on one thread per worker; finished frames go through a
/// shared [`Reassembler`] that releases them to the writer in index order.
pub struct ThreadedPipelineExecutor {
    channel_capacity: usize,
}

impl ThreadedPipelineExecutor {
    pub fn new() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Default for ThreadedPipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineExecutor for ThreadedPipelineExecutor {
    fn execute(
        &self,
        source: Box<dyn FrameSource>,
        mut sink: Box<dyn VideoSink>,
        pool: WorkerPool,
        annotator: Arc<Annotator>,
        metadata: &VideoMetadata,
        output_path: &Path,
        config: PipelineConfig,
        logger: &mut dyn PipelineLogger,
    ) -> Result<RunReport, PipelineError> {
        let cap = self.channel_capacity;
        let total_hint = metadata.total_frames;
        let annotator_threads = pool.size();
        let started = Instant::now();

        sink.open(output_path, metadata, &config.sink_options)?;

        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Result<Frame, PipelineError>>(cap);
        let (outcome_tx, outcome_rx) = crossbeam_channel::bounded::<BatchOutcome>(cap);
        let (write_tx, write_rx) = crossbeam_channel::bounded::<AnnotatedFrame>(cap);

        let stage_failed = Arc::new(AtomicBool::new(false));
        let ordering = Arc::new(Mutex::new(OrderingStage {
            reassembler: Reassembler::new(config.reassembly),
            write_tx: Some(write_tx),
            flushed: 0,
            total_hint,
            passthrough_frames: 0,
            on_progress: config.on_progress,
            cancelled: Arc::clone(&config.cancelled),
        }));

        let reader_handle = spawn_reader(source, frame_tx, Arc::clone(&config.cancelled))?;
        let writer_handle = spawn_writer(sink, write_rx)?;
        let mut annotation_handles = Vec::with_capacity(annotator_threads);
        for id in 0..annotator_threads {
            annotation_handles.push(spawn_annotator(
                id,
                outcome_rx.clone(),
                Arc::clone(&annotator),
                Arc::clone(&ordering),
                config.failure_policy,
                Arc::clone(&stage_failed),
            )?);
        }
        drop(outcome_rx);

        let mut batcher = Batcher::new(frame_rx.into_iter(), config.batch_size)?;
        let dispatcher = Dispatcher::new(config.dispatcher, pool)
            .with_cancellation(Arc::clone(&config.cancelled));

        let mut failures = Vec::new();
        let dispatch_result = dispatcher.run(
            &mut batcher,
            |outcome| {
                if stage_failed.load(Ordering::Relaxed) {
                    return Err(PipelineError::Sink("annotation stage stopped".into()));
                }
                if let BatchOutcome::Failed { failure, .. } = &outcome {
                    failures.push(failure.clone());
                }
                outcome_tx
                    .send(outcome)
                    .map_err(|_| PipelineError::Sink("annotation stage stopped".into()))
            },
            logger,
        );
        let frames_decoded = batcher.frames_emitted();
        // Unblocks the reader if it is waiting on a full channel.
        drop(batcher);
        drop(outcome_tx);

        let mut stage_error = None;
        for handle in annotation_handles {
            match handle.join() {
                Ok(Ok(timings)) => {
                    for ms in timings {
                        logger.timing("annotate", ms);
                    }
                }
                Ok(Err(e)) => set_if_none(&mut stage_error, e),
                Err(_) => set_if_none(
                    &mut stage_error,
                    PipelineError::Sink("annotation thread panicked".into()),
                ),
            }
        }

        let mut stage = lock(&ordering);
        let finish_result = match (&dispatch_result, &stage_error) {
            (Ok(_), None) if config.cancelled.load(Ordering::Relaxed) => Err(PipelineError::Cancelled),
            (Ok(_), None) => stage.finish(frames_decoded).map_err(|e| match e {
                PipelineError::IncompleteResult { missing, .. } => PipelineError::IncompleteResult {
                    missing,
                    failures: failures.clone(),
                },
                other => other,
            }),
            _ => Ok(()),
        };
        stage.close_writer();
        let (passthrough_frames, peak_buffered) =
            (stage.passthrough_frames, stage.reassembler.peak_buffered());
        drop(stage);

        let sink_report = join_threads(reader_handle, writer_handle);

        // The writer's failure explains everything downstream of it.
        let sink_report = sink_report?;
        if let Some(e) = stage_error {
            return Err(e);
        }
        let stats = dispatch_result?;
        finish_result?;
        if stats.workers_abandoned > 0 {
            log::warn!(
                "{} inference worker(s) left running a timed-out batch",
                stats.workers_abandoned
            );
        }

        logger.progress(sink_report.frames_written, total_hint);
        logger.info(&format!(
            "Wrote {} frames to {} in {:.1}s ({} batches, {} retries)",
            sink_report.frames_written,
            sink_report.path.display(),
            started.elapsed().as_secs_f64(),
            stats.batches_completed,
            stats.retries
        ));

        Ok(RunReport {
            output_path: sink_report.path,
            frames_decoded,
            frames_written: sink_report.frames_written,
            batches_completed: stats.batches_completed,
            retries: stats.retries,
            failed_batches: failures,
            passthrough_frames,
            peak_buffered,
        })
    }
}

/// The ordering barrier plus everything that happens to a frame once it is
/// next in line: hand-off to the writer and progress reporting.
struct OrderingStage {
    reassembler: Reassembler,
    write_tx: Option<Sender<AnnotatedFrame>>,
    flushed: usize,
    total_hint: usize,
    passthrough_frames: usize,
    on_progress: Option<Box<dyn Fn(usize, usize) -> bool + Send>>,
    cancelled: Arc<AtomicBool>,
}

impl OrderingStage {
    fn accept(&mut self, frames: Vec<AnnotatedFrame>) -> Result<(), PipelineError> {
        for frame in frames {
            self.reassembler.insert(frame)?;
        }
        let ready = self.reassembler.drain_ready();
        self.flush(ready)
    }

    fn finish(&mut self, total: usize) -> Result<(), PipelineError> {
        let rest = self.reassembler.finish(total)?;
        if self.reassembler.mode() == ReassemblyMode::Buffered {
            log::debug!("Flushing {} buffered frames", rest.len());
        }
        self.flush(rest)
    }

    fn flush(&mut self, frames: Vec<AnnotatedFrame>) -> Result<(), PipelineError> {
        let Some(write_tx) = self.write_tx.as_ref() else {
            return Err(PipelineError::Sink("writer already closed".into()));
        };
        for frame in frames {
            write_tx
                .send(frame)
                .map_err(|_| PipelineError::Sink("writer channel closed unexpectedly".into()))?;
            self.flushed += 1;
            if let Some(ref callback) = self.on_progress {
                if !callback(self.flushed, self.total_hint) {
                    self.cancelled.store(true, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    fn close_writer(&mut self) {
        self.write_tx = None;
    }
}

fn lock(stage: &Mutex<OrderingStage>) -> MutexGuard<'_, OrderingStage> {
    stage.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_reader(
    mut source: Box<dyn FrameSource>,
    frame_tx: Sender<Result<Frame, PipelineError>>,
    cancelled: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, PipelineError> {
    let handle = std::thread::Builder::new()
        .name("frame-reader".into())
        .spawn(move || {
            for frame_result in source.frames() {
                if cancelled.load(Ordering::Relaxed) {
                    break;
                }
                let failed = frame_result.is_err();
                if frame_tx.send(frame_result).is_err() || failed {
                    break;
                }
            }
            source.close();
        })?;
    Ok(handle)
}

fn spawn_writer(
    mut sink: Box<dyn VideoSink>,
    write_rx: Receiver<AnnotatedFrame>,
) -> Result<JoinHandle<Result<SinkReport, PipelineError>>, PipelineError> {
    let handle = std::thread::Builder::new()
        .name("video-writer".into())
        .spawn(move || {
            for frame in write_rx {
                if let Err(e) = sink.write(&frame) {
                    // Finalize what was written so far; the write error wins.
                    let _ = sink.close();
                    return Err(e);
                }
            }
            sink.close()
        })?;
    Ok(handle)
}

/// Turns batch outcomes into annotated frames and feeds the ordering stage.
///
/// Returns per-frame annotation times in milliseconds.
fn spawn_annotator(
    id: usize,
    outcome_rx: Receiver<BatchOutcome>,
    annotator: Arc<Annotator>,
    ordering: Arc<Mutex<OrderingStage>>,
    failure_policy: FailurePolicy,
    stage_failed: Arc<AtomicBool>,
) -> Result<JoinHandle<Result<Vec<f64>, PipelineError>>, PipelineError> {
    let handle = std::thread::Builder::new()
        .name(format!("annotator-{id}"))
        .spawn(move || {
            let mut timings = Vec::new();
            let result = (|| {
                for outcome in outcome_rx {
                    let frames = match outcome {
                        BatchOutcome::Completed { batch, results, .. } => {
                            let start = Instant::now();
                            let annotated: Vec<AnnotatedFrame> = batch
                                .frames()
                                .iter()
                                .zip(&results)
                                .map(|(frame, result)| annotator.annotate(frame, result))
                                .collect();
                            let per_frame =
                                start.elapsed().as_secs_f64() * 1000.0 / annotated.len().max(1) as f64;
                            timings.extend(std::iter::repeat(per_frame).take(annotated.len()));
                            annotated
                        }
                        BatchOutcome::Failed { batch, failure } => match failure_policy {
                            FailurePolicy::Fail => continue,
                            FailurePolicy::Passthrough => {
                                log::warn!(
                                    "Writing {} frame(s) of batch {} unannotated",
                                    batch.len(),
                                    failure.batch_id
                                );
                                let frames: Vec<AnnotatedFrame> = batch
                                    .frames()
                                    .iter()
                                    .cloned()
                                    .map(AnnotatedFrame::passthrough)
                                    .collect();
                                lock(&ordering).passthrough_frames += frames.len();
                                frames
                            }
                        },
                    };
                    lock(&ordering).accept(frames)?;
                }
                Ok(())
            })();
            if result.is_err() {
                stage_failed.store(true, Ordering::Relaxed);
            }
            result.map(|()| timings)
        })?;
    Ok(handle)
}

/// Joins the I/O threads. The reader has no result of its own: its errors
/// travel through the frame channel.
fn join_threads(
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<Result<SinkReport, PipelineError>>,
) -> Result<SinkReport, PipelineError> {
    let reader_panicked = reader_handle.join().is_err();
    let report = match writer_handle.join() {
        Ok(result) => result?,
        Err(_) => return Err(PipelineError::Sink("writer thread panicked".into())),
    };
    if reader_panicked {
        return Err(PipelineError::Decode {
            locator: report.path.display().to_string(),
            reason: "reader thread panicked".into(),
        });
    }
    Ok(report)
}

fn set_if_none(slot: &mut Option<PipelineError>, err: PipelineError) {
    if slot.is_none() {
        *slot = Some(err);
    }
}
