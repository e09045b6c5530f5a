use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inference::resources::{DeviceKind, ResourceSpec};
use crate::labels::label_registry::LabelRegistry;
use crate::pipeline::dispatcher::{Backoff, DispatcherConfig};
use crate::pipeline::reassembler::ReassemblyMode;
use crate::shared::constants::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::shared::pipeline_error::PipelineError;
use crate::video::domain::video_sink::{OutputFormat, SinkOptions};

/// What happens to the frames of a batch that failed every attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// The run fails with `IncompleteResult` naming the lost frames.
    #[default]
    Fail,
    /// The frames are written unannotated and the run succeeds.
    Passthrough,
}

/// Tunables for one annotation run, loadable from a JSON file.
///
/// Missing keys take their defaults, so `{}` is a valid settings file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub resource_per_worker: ResourceSpec,
    pub confidence_threshold: f32,
    pub retry_limit: u32,
    /// `None` lets an attempt run indefinitely.
    pub batch_timeout_ms: Option<u64>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub shrink_on_exhaustion: bool,
    pub failure_policy: FailurePolicy,
    pub reassembly: ReassemblyMode,
    pub output_format: OutputFormat,
    pub fps_override: Option<f64>,
    pub isolate_source_failures: bool,
    /// JSON label file replacing the built-in COCO table.
    pub labels: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            batch_size: 8,
            resource_per_worker: ResourceSpec::cpu(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            retry_limit: 3,
            batch_timeout_ms: None,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            shrink_on_exhaustion: true,
            failure_policy: FailurePolicy::Fail,
            reassembly: ReassemblyMode::Streaming,
            output_format: OutputFormat::Mp4,
            fps_override: None,
            isolate_source_failures: false,
            labels: None,
        }
    }
}

impl PipelineSettings {
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.concurrency == 0 {
            return Err(PipelineError::Config("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PipelineError::Config(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(PipelineError::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.batch_timeout_ms == Some(0) {
            return Err(PipelineError::Config("batch_timeout_ms must be positive".into()));
        }
        if let Some(fps) = self.fps_override {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(PipelineError::Config(format!(
                    "fps_override must be positive, got {fps}"
                )));
            }
        }
        if self.resource_per_worker.memory_budget_mb == Some(0) {
            return Err(PipelineError::Config("memory_budget_mb must be positive".into()));
        }
        if self.resource_per_worker.device == DeviceKind::Accelerator {
            // Surfaces duplicate or missing ordinals before any worker starts.
            self.resource_per_worker.reserve(self.concurrency)?;
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            retry_limit: self.retry_limit,
            batch_timeout: self.batch_timeout_ms.map(Duration::from_millis),
            backoff: Backoff {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
            shrink_on_exhaustion: self.shrink_on_exhaustion,
        }
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            output_format: self.output_format,
            fps_override: self.fps_override,
        }
    }

    /// The configured label file, or the built-in COCO table.
    pub fn label_registry(&self) -> Result<LabelRegistry, PipelineError> {
        match &self.labels {
            Some(path) => {
                LabelRegistry::from_file(path).map_err(|e| PipelineError::Config(e.to_string()))
            }
            None => Ok(LabelRegistry::coco()),
        }
    }
}
