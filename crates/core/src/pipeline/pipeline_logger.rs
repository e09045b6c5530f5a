use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Observer for pipeline orchestration events.
///
/// The dispatcher and executor report through this instead of printing, so
/// the CLI, tests and library callers each decide what to do with them.
pub trait PipelineLogger: Send {
    /// Frames written to the sink so far. `total` is 0 when unknown.
    fn progress(&mut self, current: usize, total: usize);

    /// How long one unit of a named stage took (one batch, one frame).
    fn timing(&mut self, stage: &str, duration_ms: f64);

    /// A sampled value, e.g. batches in flight.
    fn metric(&mut self, name: &str, value: f64);

    /// One occurrence of a named event, e.g. a retry or a timeout.
    fn count(&mut self, name: &str);

    fn info(&mut self, message: &str);

    /// End-of-run report. Default: no-op.
    fn summary(&self) {}
}

/// Discards everything. Used by tests and embedding callers.
pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn progress(&mut self, _current: usize, _total: usize) {}
    fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn metric(&mut self, _name: &str, _value: f64) {}
    fn count(&mut self, _name: &str) {}
    fn info(&mut self, _message: &str) {}
}

/// CLI logger: throttled progress through `log`, per-stage timing averages,
/// event counters and a throughput line at the end.
pub struct StdoutPipelineLogger {
    throttle_frames: usize,
    timings: HashMap<String, Vec<f64>>,
    metrics: HashMap<String, Vec<f64>>,
    counters: BTreeMap<String, u64>,
    start_time: Instant,
    frames_done: usize,
    messages: Vec<String>,
}

impl StdoutPipelineLogger {
    pub fn new(throttle_frames: usize) -> Self {
        Self {
            throttle_frames: throttle_frames.max(1),
            timings: HashMap::new(),
            metrics: HashMap::new(),
            counters: BTreeMap::new(),
            start_time: Instant::now(),
            frames_done: 0,
            messages: Vec::new(),
        }
    }

    /// The formatted summary, or `None` if nothing was recorded.
    pub fn summary_string(&self) -> Option<String> {
        if self.timings.is_empty() && self.metrics.is_empty() && self.counters.is_empty() {
            return None;
        }

        let elapsed_ms = self.start_time.elapsed().as_secs_f64() * 1000.0;
        let frames = self.frames_done;
        let mut lines = vec![format!(
            "Pipeline summary ({frames} frames, {:.1}s total):",
            elapsed_ms / 1000.0
        )];

        let mut stages: Vec<_> = self.timings.iter().collect();
        stages.sort_by(|a, b| a.0.cmp(b.0));
        for (stage, durations) in stages {
            let total_ms: f64 = durations.iter().sum();
            let avg_ms = total_ms / durations.len().max(1) as f64;
            lines.push(format!(
                "  {stage:12}: avg {avg_ms:7.1}ms over {:5} calls, total {total_ms:8.0}ms",
                durations.len()
            ));
        }

        let mut metrics: Vec<_> = self.metrics.iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(b.0));
        for (name, values) in metrics {
            let avg = values.iter().sum::<f64>() / values.len().max(1) as f64;
            let max = values.iter().copied().fold(f64::MIN, f64::max);
            lines.push(format!("  {name}: avg {avg:.1}, max {max:.1}"));
        }

        for (name, n) in &self.counters {
            lines.push(format!("  {name}: {n}"));
        }

        if frames > 0 && elapsed_ms > 0.0 {
            let fps = frames as f64 / (elapsed_ms / 1000.0);
            lines.push(format!("  Throughput: {fps:.1} fps"));
        }

        Some(lines.join("\n"))
    }

    pub fn timings_for(&self, stage: &str) -> Option<&[f64]> {
        self.timings.get(stage).map(|v| v.as_slice())
    }

    pub fn metrics_for(&self, name: &str) -> Option<&[f64]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }

    pub fn count_of(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

impl Default for StdoutPipelineLogger {
    fn default() -> Self {
        Self::new(25)
    }
}

impl PipelineLogger for StdoutPipelineLogger {
    fn progress(&mut self, current: usize, total: usize) {
        self.frames_done = current;
        if current % self.throttle_frames != 0 && current != total {
            return;
        }
        if total > 0 {
            let pct = current as f64 / total as f64 * 100.0;
            log::info!("Annotated {current}/{total} frames ({pct:.1}%)");
        } else {
            log::info!("Annotated {current} frames");
        }
    }

    fn timing(&mut self, stage: &str, duration_ms: f64) {
        self.timings
            .entry(stage.to_string())
            .or_default()
            .push(duration_ms);
    }

    fn metric(&mut self, name: &str, value: f64) {
        self.metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn count(&mut self, name: &str) {
        *self.counters.entry(name.to_string()).or_default() += 1;
    }

    fn info(&mut self, message: &str) {
        self.messages.push(message.to_string());
        log::info!("{message}");
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_null_logger_accepts_everything() {
        let mut logger = NullPipelineLogger;
        logger.progress(1, 10);
        logger.timing("inference", 5.0);
        logger.metric("in_flight", 2.0);
        logger.count("retries");
        logger.info("hello");
        logger.summary();
    }

    #[test]
    fn test_timings_grouped_by_stage() {
        let mut logger = StdoutPipelineLogger::new(10);
        logger.timing("inference", 20.0);
        logger.timing("inference", 30.0);
        logger.timing("annotate", 2.0);

        assert_eq!(logger.timings_for("inference").unwrap(), &[20.0, 30.0]);
        assert_eq!(logger.timings_for("annotate").unwrap().len(), 1);
        assert!(logger.timings_for("write").is_none());
    }

    #[test]
    fn test_counters_accumulate() {
        let mut logger = StdoutPipelineLogger::new(10);
        logger.count("retries");
        logger.count("retries");
        logger.count("timeouts");
        assert_eq!(logger.count_of("retries"), 2);
        assert_eq!(logger.count_of("timeouts"), 1);
        assert_eq!(logger.count_of("splits"), 0);
    }

    #[test]
    fn test_summary_lists_stages_metrics_and_counters() {
        let mut logger = StdoutPipelineLogger::new(10);
        logger.progress(10, 10);
        logger.timing("inference", 12.0);
        logger.metric("in_flight", 1.0);
        logger.metric("in_flight", 3.0);
        logger.count("retries");

        let summary = logger.summary_string().unwrap();
        assert!(summary.contains("Pipeline summary (10 frames"));
        assert!(summary.contains("inference"));
        assert!(summary.contains("in_flight: avg 2.0, max 3.0"));
        assert!(summary.contains("retries: 1"));
        assert!(summary.contains("fps"));
    }

    #[test]
    fn test_metric_average() {
        let mut logger = StdoutPipelineLogger::new(10);
        logger.metric("in_flight", 1.0);
        logger.metric("in_flight", 2.0);
        let values = logger.metrics_for("in_flight").unwrap();
        assert_relative_eq!(values.iter().sum::<f64>() / values.len() as f64, 1.5);
    }

    #[test]
    fn test_empty_summary_is_none() {
        assert!(StdoutPipelineLogger::new(10).summary_string().is_none());
    }

    #[test]
    fn test_progress_tracks_frames_done() {
        let mut logger = StdoutPipelineLogger::new(10);
        for i in 1..=7 {
            logger.progress(i, 0);
        }
        assert_eq!(logger.frames_done, 7);
    }

    #[test]
    fn test_info_keeps_messages() {
        let mut logger = StdoutPipelineLogger::default();
        logger.info("worker 1 retired");
        assert_eq!(logger.messages, vec!["worker 1 retired".to_string()]);
        assert_eq!(logger.throttle_frames, 25);
    }
}
