use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::inference::domain::model_loader::ModelLoader;
use crate::inference::resources::DeviceReservation;
use crate::inference::worker::{InferenceWorker, WorkerPool};
use crate::pipeline::batcher::Batch;
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::shared::detection::FrameResult;
use crate::shared::pipeline_error::{BatchFailure, PipelineError, WorkerError};

/// Upper bound on how long the coordinator sleeps before re-checking the
/// cancellation flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often shutdown checks whether a worker with a join deadline has exited.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Exponential backoff between attempts: `base * 2^(attempt - 1)`, capped.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DispatcherConfig {
    /// Retries after the first attempt; a batch gets `retry_limit + 1` attempts.
    pub retry_limit: u32,
    /// Deadline for one attempt. `None` waits indefinitely.
    pub batch_timeout: Option<Duration>,
    pub backoff: Backoff,
    /// Split a batch in half when a worker runs out of resources on it.
    pub shrink_on_exhaustion: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            batch_timeout: None,
            backoff: Backoff::default(),
            shrink_on_exhaustion: true,
        }
    }
}

/// Terminal status of one batch (or one half of a split batch).
#[derive(Debug)]
pub enum BatchOutcome {
    Completed {
        batch: Arc<Batch>,
        results: Vec<FrameResult>,
        attempts: u32,
        worker_id: usize,
    },
    Failed {
        batch: Arc<Batch>,
        failure: BatchFailure,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchStats {
    pub batches_admitted: usize,
    pub batches_completed: usize,
    pub batches_failed: usize,
    pub retries: usize,
    pub splits: usize,
    pub timeouts: usize,
    pub late_results_discarded: usize,
    pub workers_retired: usize,
    /// Workers still stuck in an attempt past its deadline when the run ended.
    /// Their threads are detached, not joined.
    pub workers_abandoned: usize,
    pub peak_in_flight: usize,
}

/// Schedules batches onto a fixed pool of inference workers.
///
/// Each worker is a thread that loads its model once, then serves one batch at
/// a time. The calling thread coordinates: it owns the idle queue, the
/// in-flight table and the retry queue, and talks to workers only through
/// channels. A new batch is pulled from the source only when a worker is idle,
/// so at most `pool.size()` attempts are ever running.
pub struct Dispatcher {
    config: DispatcherConfig,
    pool: WorkerPool,
    cancelled: Option<Arc<AtomicBool>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, pool: WorkerPool) -> Self {
        Self {
            config,
            pool,
            cancelled: None,
        }
    }

    pub fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(cancelled);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.pool.size()
    }

    /// Runs every batch from `batches` to a terminal outcome.
    ///
    /// `on_outcome` is called on this thread, once per completed or
    /// permanently failed batch, in completion order. An error from it or from
    /// the source stops admission and is returned after in-flight attempts
    /// have returned or passed their deadline.
    pub fn run<I, F>(
        &self,
        batches: I,
        on_outcome: F,
        logger: &mut dyn PipelineLogger,
    ) -> Result<DispatchStats, PipelineError>
    where
        I: Iterator<Item = Result<Batch, PipelineError>>,
        F: FnMut(BatchOutcome) -> Result<(), PipelineError>,
    {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let workers: Vec<WorkerHandle> = self
            .pool
            .reservations()
            .iter()
            .cloned()
            .map(|reservation| spawn_worker(reservation, self.pool.loader(), event_tx.clone()))
            .collect::<Result<_, _>>()?;
        drop(event_tx);

        let mut coordinator = Coordinator {
            config: self.config.clone(),
            cancelled: self.cancelled.clone(),
            states: vec![WorkerState::Loading; workers.len()],
            job_txs: workers.iter().map(|w| Some(w.jobs.clone())).collect(),
            idle: VecDeque::new(),
            in_flight: HashMap::new(),
            retries: Vec::new(),
            next_ticket: 0,
            last_worker_error: None,
            stats: DispatchStats::default(),
            logger,
            on_outcome,
        };
        let result = coordinator.run(batches, &event_rx);
        let mut stats = coordinator.stats.clone();
        let deadlines = coordinator.join_deadlines();
        drop(coordinator);

        stats.workers_abandoned = shutdown(workers, &deadlines);
        result.map(|()| stats)
    }
}

struct Job {
    ticket: u64,
    batch: Arc<Batch>,
}

enum WorkerEvent {
    Ready {
        worker_id: usize,
    },
    LoadFailed {
        worker_id: usize,
        error: PipelineError,
    },
    Finished {
        worker_id: usize,
        ticket: u64,
        result: Result<Vec<FrameResult>, WorkerError>,
        elapsed: Duration,
    },
    Panicked {
        worker_id: usize,
        ticket: u64,
        reason: String,
    },
}

struct WorkerHandle {
    jobs: Sender<Job>,
    thread: JoinHandle<()>,
}

fn spawn_worker(
    reservation: DeviceReservation,
    loader: Arc<dyn ModelLoader>,
    events: Sender<WorkerEvent>,
) -> Result<WorkerHandle, PipelineError> {
    let worker_id = reservation.worker_id;
    let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
    let thread = std::thread::Builder::new()
        .name(format!("inference-worker-{worker_id}"))
        .spawn(move || worker_loop(reservation, loader, job_rx, events))?;
    Ok(WorkerHandle {
        jobs: job_tx,
        thread,
    })
}

fn worker_loop(
    reservation: DeviceReservation,
    loader: Arc<dyn ModelLoader>,
    jobs: Receiver<Job>,
    events: Sender<WorkerEvent>,
) {
    let worker_id = reservation.worker_id;
    let started = panic::catch_unwind(AssertUnwindSafe(|| {
        InferenceWorker::start(reservation, loader.as_ref())
    }));
    let mut worker = match started {
        Ok(Ok(worker)) => worker,
        Ok(Err(error)) => {
            let _ = events.send(WorkerEvent::LoadFailed { worker_id, error });
            return;
        }
        Err(payload) => {
            let error = PipelineError::ModelLoad {
                worker_id,
                reason: panic_message(payload.as_ref()),
            };
            let _ = events.send(WorkerEvent::LoadFailed { worker_id, error });
            return;
        }
    };
    if events.send(WorkerEvent::Ready { worker_id }).is_err() {
        return;
    }

    for job in jobs {
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.process(&job.batch)));
        let event = match outcome {
            Ok(result) => WorkerEvent::Finished {
                worker_id,
                ticket: job.ticket,
                result,
                elapsed: start.elapsed(),
            },
            Err(payload) => WorkerEvent::Panicked {
                worker_id,
                ticket: job.ticket,
                reason: panic_message(payload.as_ref()),
            },
        };
        let fatal = matches!(event, WorkerEvent::Panicked { .. });
        if events.send(event).is_err() || fatal {
            return;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Closes every job channel and waits for the workers to finish whatever they
/// are running.
///
/// A worker with a deadline is waited on only until that deadline; if it is
/// still running then, its thread is detached and counted in the result.
fn shutdown(workers: Vec<WorkerHandle>, deadlines: &[Option<Instant>]) -> usize {
    let threads: Vec<JoinHandle<()>> = workers
        .into_iter()
        .map(|w| {
            drop(w.jobs);
            w.thread
        })
        .collect();

    let mut abandoned = 0;
    for (worker_id, thread) in threads.into_iter().enumerate() {
        let name = thread.thread().name().unwrap_or("inference-worker").to_string();
        if let Some(deadline) = deadlines.get(worker_id).copied().flatten() {
            while !thread.is_finished() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                std::thread::sleep(remaining.min(JOIN_POLL_INTERVAL));
            }
            if !thread.is_finished() {
                log::warn!("{name} is still running a timed-out batch, detaching it");
                abandoned += 1;
                continue;
            }
        }
        if thread.join().is_err() {
            log::warn!("{name} panicked during shutdown");
        }
    }
    abandoned
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Loading,
    Idle,
    Busy,
    Retired,
}

struct Attempt {
    batch: Arc<Batch>,
    attempt: u32,
    worker_id: usize,
    deadline: Option<Instant>,
    /// Timed out and already rescheduled; its result will be discarded.
    superseded: bool,
}

struct PendingRetry {
    batch: Arc<Batch>,
    attempts_made: u32,
    ready_at: Instant,
}

struct Coordinator<'a, F> {
    config: DispatcherConfig,
    cancelled: Option<Arc<AtomicBool>>,
    states: Vec<WorkerState>,
    job_txs: Vec<Option<Sender<Job>>>,
    idle: VecDeque<usize>,
    in_flight: HashMap<u64, Attempt>,
    retries: Vec<PendingRetry>,
    next_ticket: u64,
    last_worker_error: Option<String>,
    stats: DispatchStats,
    logger: &'a mut dyn PipelineLogger,
    on_outcome: F,
}

impl<F> Coordinator<'_, F>
where
    F: FnMut(BatchOutcome) -> Result<(), PipelineError>,
{
    fn run<I>(&mut self, batches: I, events: &Receiver<WorkerEvent>) -> Result<(), PipelineError>
    where
        I: Iterator<Item = Result<Batch, PipelineError>>,
    {
        let mut source = batches;
        let mut source_done = false;

        loop {
            if self.is_cancelled() {
                self.logger.info("Cancellation requested, draining in-flight batches");
                return Err(PipelineError::Cancelled);
            }

            self.dispatch_ready_retries();
            while !source_done && self.retries.is_empty() {
                let Some(worker_id) = self.idle.pop_front() else {
                    break;
                };
                match source.next() {
                    Some(Ok(batch)) => {
                        self.stats.batches_admitted += 1;
                        self.assign(worker_id, Arc::new(batch), 1);
                    }
                    Some(Err(e)) => {
                        self.idle.push_front(worker_id);
                        return Err(e);
                    }
                    None => {
                        self.idle.push_front(worker_id);
                        source_done = true;
                    }
                }
            }

            let active = self.in_flight.values().any(|a| !a.superseded);
            if source_done && !active && self.retries.is_empty() {
                return Ok(());
            }
            if self.live_workers() == 0 {
                return Err(PipelineError::NoHealthyWorkers(
                    self.last_worker_error
                        .clone()
                        .unwrap_or_else(|| "worker pool is empty".into()),
                ));
            }

            match events.recv_timeout(self.wait_budget()) {
                Ok(event) => self.handle_event(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::NoHealthyWorkers(
                        "all worker threads exited".into(),
                    ));
                }
            }
            self.expire_deadlines()?;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn live_workers(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s != WorkerState::Retired)
            .count()
    }

    fn max_attempts(&self) -> u32 {
        self.config.retry_limit.saturating_add(1)
    }

    /// Sends retries whose backoff has elapsed to idle workers, oldest first.
    fn dispatch_ready_retries(&mut self) {
        let now = Instant::now();
        while !self.idle.is_empty() {
            let Some(pos) = self
                .retries
                .iter()
                .enumerate()
                .filter(|(_, r)| r.ready_at <= now)
                .min_by_key(|(_, r)| r.ready_at)
                .map(|(i, _)| i)
            else {
                break;
            };
            let Some(worker_id) = self.idle.pop_front() else {
                break;
            };
            let retry = self.retries.swap_remove(pos);
            self.assign(worker_id, retry.batch, retry.attempts_made + 1);
        }
    }

    /// Hands `batch` to an idle worker. If the worker's thread is gone the
    /// worker is retired and the batch goes back on the retry queue as-is.
    fn assign(&mut self, worker_id: usize, batch: Arc<Batch>, attempt: u32) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let sent = self.job_txs[worker_id].as_ref().is_some_and(|tx| {
            tx.send(Job {
                ticket,
                batch: Arc::clone(&batch),
            })
            .is_ok()
        });
        if !sent {
            self.retire(worker_id, "job channel closed".into());
            self.retries.push(PendingRetry {
                batch,
                attempts_made: attempt - 1,
                ready_at: Instant::now(),
            });
            return;
        }

        log::debug!(
            "Batch {} (frames {:?}) attempt {attempt} -> worker {worker_id}",
            batch.batch_id(),
            batch.frame_indices()
        );
        self.states[worker_id] = WorkerState::Busy;
        self.in_flight.insert(
            ticket,
            Attempt {
                batch,
                attempt,
                worker_id,
                deadline: self.config.batch_timeout.map(|t| Instant::now() + t),
                superseded: false,
            },
        );
        let running = self.in_flight.len();
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(running);
        self.logger.metric("in_flight", running as f64);
    }

    fn retire(&mut self, worker_id: usize, reason: String) {
        if self.states[worker_id] == WorkerState::Retired {
            return;
        }
        log::warn!("Retiring worker {worker_id}: {reason}");
        self.states[worker_id] = WorkerState::Retired;
        self.job_txs[worker_id] = None;
        self.idle.retain(|&id| id != worker_id);
        self.last_worker_error = Some(reason);
        self.stats.workers_retired += 1;
        self.logger.count("workers_retired");
    }

    fn release(&mut self, worker_id: usize) {
        if self.states[worker_id] == WorkerState::Busy {
            self.states[worker_id] = WorkerState::Idle;
            self.idle.push_back(worker_id);
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) -> Result<(), PipelineError> {
        match event {
            WorkerEvent::Ready { worker_id } => {
                log::debug!("Worker {worker_id} ready");
                self.states[worker_id] = WorkerState::Idle;
                self.idle.push_back(worker_id);
            }
            WorkerEvent::LoadFailed { worker_id, error } => {
                self.logger.info(&error.to_string());
                self.retire(worker_id, error.to_string());
            }
            WorkerEvent::Finished {
                worker_id,
                ticket,
                result,
                elapsed,
            } => {
                self.release(worker_id);
                let Some(attempt) = self.in_flight.remove(&ticket) else {
                    return Ok(());
                };
                if attempt.superseded {
                    log::debug!(
                        "Discarding late result for batch {} attempt {}",
                        attempt.batch.batch_id(),
                        attempt.attempt
                    );
                    self.stats.late_results_discarded += 1;
                    return Ok(());
                }
                self.logger.timing("inference", elapsed.as_secs_f64() * 1000.0);
                match result {
                    Ok(results) => {
                        self.stats.batches_completed += 1;
                        (self.on_outcome)(BatchOutcome::Completed {
                            batch: attempt.batch,
                            results,
                            attempts: attempt.attempt,
                            worker_id,
                        })?;
                    }
                    Err(cause) => self.handle_failure(attempt.batch, attempt.attempt, cause)?,
                }
            }
            WorkerEvent::Panicked {
                worker_id,
                ticket,
                reason,
            } => {
                self.retire(worker_id, format!("panicked: {reason}"));
                if let Some(attempt) = self.in_flight.remove(&ticket) {
                    if !attempt.superseded {
                        self.handle_failure(
                            attempt.batch,
                            attempt.attempt,
                            WorkerError::Crashed(reason),
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn expire_deadlines(&mut self) -> Result<(), PipelineError> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, a)| !a.superseded && a.deadline.is_some_and(|d| d <= now))
            .map(|(ticket, _)| *ticket)
            .collect();
        for ticket in expired {
            let Some(attempt) = self.in_flight.get_mut(&ticket) else {
                continue;
            };
            attempt.superseded = true;
            let (batch, number) = (Arc::clone(&attempt.batch), attempt.attempt);
            let timeout = self.config.batch_timeout.unwrap_or_default();
            log::warn!(
                "Batch {} attempt {number} on worker {} timed out after {timeout:?}",
                batch.batch_id(),
                attempt.worker_id
            );
            self.stats.timeouts += 1;
            self.logger.count("timeouts");
            self.handle_failure(batch, number, WorkerError::TimedOut(timeout))?;
        }
        Ok(())
    }

    fn handle_failure(
        &mut self,
        batch: Arc<Batch>,
        attempts_made: u32,
        cause: WorkerError,
    ) -> Result<(), PipelineError> {
        if attempts_made >= self.max_attempts() {
            let failure = BatchFailure {
                batch_id: batch.batch_id(),
                frame_indices: batch.frame_indices(),
                attempts: attempts_made,
                cause,
            };
            log::error!("{failure}");
            self.stats.batches_failed += 1;
            return (self.on_outcome)(BatchOutcome::Failed { batch, failure });
        }

        let ready_at = Instant::now() + self.config.backoff.delay(attempts_made);
        let halves = match cause {
            WorkerError::ResourceExhausted(_) if self.config.shrink_on_exhaustion => batch.split(),
            _ => None,
        };
        log::warn!(
            "Batch {} attempt {attempts_made}/{} failed: {cause}",
            batch.batch_id(),
            self.max_attempts()
        );
        self.stats.retries += 1;
        self.logger.count("retries");

        match halves {
            Some((head, tail)) => {
                log::info!(
                    "Splitting batch {} into {} + {} frames",
                    batch.batch_id(),
                    head.len(),
                    tail.len()
                );
                self.stats.splits += 1;
                self.logger.count("splits");
                for half in [head, tail] {
                    self.retries.push(PendingRetry {
                        batch: Arc::new(half),
                        attempts_made,
                        ready_at,
                    });
                }
            }
            None => self.retries.push(PendingRetry {
                batch,
                attempts_made,
                ready_at,
            }),
        }
        Ok(())
    }

    /// Per worker, how long shutdown may wait for it: until the deadline of
    /// its running attempt, or not at all if that attempt already timed out.
    /// `None` joins without a limit.
    fn join_deadlines(&self) -> Vec<Option<Instant>> {
        let now = Instant::now();
        let mut deadlines = vec![None; self.states.len()];
        for attempt in self.in_flight.values() {
            deadlines[attempt.worker_id] = if attempt.superseded {
                Some(now)
            } else {
                attempt.deadline
            };
        }
        deadlines
    }

    /// How long to block on worker events before the next deadline or retry
    /// becomes due.
    fn wait_budget(&self) -> Duration {
        let now = Instant::now();
        let deadlines = self
            .in_flight
            .values()
            .filter(|a| !a.superseded)
            .filter_map(|a| a.deadline);
        let retry_times = self
            .retries
            .iter()
            .filter(|_| !self.idle.is_empty())
            .map(|r| r.ready_at);
        let next = deadlines.chain(retry_times).min();

        let mut budget = next.map_or(Duration::from_secs(3600), |t| t.saturating_duration_since(now));
        if self.cancelled.is_some() {
            budget = budget.min(CANCEL_POLL_INTERVAL);
        }
        budget
    }
}
