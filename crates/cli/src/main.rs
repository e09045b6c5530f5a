use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;

use batch_annotate_core::inference::domain::model_loader::ModelLoader;
use batch_annotate_core::inference::infrastructure::model_resolver;
use batch_annotate_core::inference::infrastructure::onnx_detector::OnnxModelLoader;
use batch_annotate_core::inference::resources::DeviceKind;
use batch_annotate_core::pipeline::annotate_directory_use_case::AnnotateDirectoryUseCase;
use batch_annotate_core::pipeline::annotate_video_use_case::AnnotateVideoUseCase;
use batch_annotate_core::pipeline::pipeline_logger::{
    NullPipelineLogger, PipelineLogger, StdoutPipelineLogger,
};
use batch_annotate_core::pipeline::pipeline_settings::{FailurePolicy, PipelineSettings};
use batch_annotate_core::pipeline::reassembler::ReassemblyMode;
use batch_annotate_core::shared::constants::{DETECTION_MODEL_NAME, DETECTION_MODEL_URL};
use batch_annotate_core::video::domain::source_locator::SourceLocator;
use batch_annotate_core::video::domain::video_sink::OutputFormat;
use batch_annotate_core::video::infrastructure::directory_source::VideoSource;
use batch_annotate_core::video::infrastructure::ffmpeg_sink::FfmpegSink;
use batch_annotate_core::video::infrastructure::ffmpeg_source::FfmpegSource;

/// Object detection and annotation for videos, batched across a worker pool.
#[derive(Parser)]
#[command(name = "batch-annotate")]
struct Cli {
    /// Input video file, directory of videos, or http/https/rtsp URL.
    input: String,

    /// Output video file, or output directory when the input is a directory.
    output: PathBuf,

    /// JSON settings file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// ONNX detection model: local path or http(s) URL (default: yolov8n, downloaded on first use).
    #[arg(long)]
    model: Option<String>,

    /// Number of inference workers.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Frames per inference batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Minimum detection confidence to draw (0.0-1.0).
    #[arg(long)]
    confidence: Option<f32>,

    /// Retries per batch after the first attempt.
    #[arg(long)]
    retry_limit: Option<u32>,

    /// Per-attempt timeout in milliseconds.
    #[arg(long)]
    batch_timeout_ms: Option<u64>,

    /// Per-worker memory budget in MiB for one batch's input tensor.
    #[arg(long)]
    memory_budget_mb: Option<u64>,

    /// Run on these accelerator ordinals, one per worker (comma-separated).
    #[arg(long, value_delimiter = ',')]
    accelerators: Option<Vec<u32>>,

    /// Do not split batches that run out of memory.
    #[arg(long)]
    no_shrink: bool,

    /// What to do with frames of a batch that failed every attempt: fail or passthrough.
    #[arg(long)]
    failure_policy: Option<String>,

    /// Reassembly mode: streaming or buffered.
    #[arg(long)]
    reassembly: Option<String>,

    /// Output container: mp4, mkv or avi (default: from the output extension, else mp4).
    #[arg(long)]
    format: Option<String>,

    /// Output frame rate (default: the source's).
    #[arg(long)]
    fps: Option<f64>,

    /// JSON label file replacing the built-in COCO classes.
    #[arg(long)]
    labels: Option<PathBuf>,

    /// In directory mode, keep going when a video fails.
    #[arg(long)]
    isolate: bool,

    /// Print per-stage timings and retry counts when done.
    #[arg(long)]
    stats: bool,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let locator = SourceLocator::parse(&cli.input)?;
    validate(&cli, &locator)?;

    let loader = build_loader(&cli)?;

    match locator {
        SourceLocator::Directory(dir) => {
            run_directory(&dir, &cli.output, settings, loader, cli.stats)
        }
        locator => run_video(&locator, &cli.output, settings, loader, cli.stats),
    }
}

fn run_video(
    locator: &SourceLocator,
    output: &Path,
    settings: PipelineSettings,
    loader: Arc<dyn ModelLoader>,
    stats: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let progress: Box<dyn Fn(usize, usize) -> bool + Send> = Box::new(|current, total| {
        if total > 0 {
            eprint!("\rAnnotating frame {current}/{total}");
        } else {
            eprint!("\rAnnotating frame {current}");
        }
        true
    });

    let mut use_case = AnnotateVideoUseCase::builder()
        .source(Box::new(FfmpegSource::new()))
        .sink(Box::new(FfmpegSink::new()))
        .loader(loader)
        .settings(settings)
        .on_progress(progress)
        .logger(stage_logger(stats))
        .build()?;
    let report = use_case.materialize(locator, output)?;
    eprintln!();

    for failure in &report.failed_batches {
        log::warn!("Written unannotated: {failure}");
    }
    log::info!(
        "Output written to {} ({} frames, {} retries)",
        report.output_path.display(),
        report.frames_written,
        report.retries
    );
    Ok(())
}

fn run_directory(
    input: &Path,
    output: &Path,
    settings: PipelineSettings,
    loader: Arc<dyn ModelLoader>,
    stats: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let labels = Arc::new(settings.label_registry()?);
    let use_case = AnnotateDirectoryUseCase::new(settings, loader, labels)
        .with_logger_factory(Box::new(move |_: &VideoSource| stage_logger(stats)))
        .with_progress(Arc::new(|source: &VideoSource, current: usize, total: usize| {
            let name = source.path.file_name().unwrap_or_default().to_string_lossy();
            if total > 0 {
                eprint!("\r{name}: frame {current}/{total}");
            } else {
                eprint!("\r{name}: frame {current}");
            }
            true
        }));

    let report = use_case.execute(input, output)?;
    eprintln!();

    for failure in &report.failures {
        log::warn!("Failed: {}: {}", failure.source.path.display(), failure.error);
    }
    log::info!(
        "Annotated {} video(s) into {} ({} frames)",
        report.runs.len(),
        output.display(),
        report.frames_written()
    );
    if !report.failures.is_empty() {
        return Err(format!("{} video(s) failed", report.failures.len()).into());
    }
    Ok(())
}

fn stage_logger(stats: bool) -> Box<dyn PipelineLogger> {
    if stats {
        Box::new(StdoutPipelineLogger::default())
    } else {
        Box::new(NullPipelineLogger)
    }
}

fn build_loader(cli: &Cli) -> Result<Arc<dyn ModelLoader>, Box<dyn std::error::Error>> {
    let model_path = match &cli.model {
        Some(location) => {
            log::info!("Resolving model: {location}");
            model_resolver::resolve_location(location, Some(Box::new(download_progress)))?
        }
        None => {
            log::info!("Resolving model: {DETECTION_MODEL_NAME}");
            model_resolver::resolve(
                DETECTION_MODEL_NAME,
                DETECTION_MODEL_URL,
                None,
                Some(Box::new(download_progress)),
            )?
        }
    };
    eprintln!();
    Ok(Arc::new(OnnxModelLoader::new(model_path)))
}

/// Settings file (or defaults) with command-line overrides applied.
fn load_settings(cli: &Cli) -> Result<PipelineSettings, Box<dyn std::error::Error>> {
    let mut settings = match &cli.config {
        Some(path) => PipelineSettings::from_file(path)?,
        None => PipelineSettings::default(),
    };
    apply_overrides(cli, &mut settings)?;
    settings.validate()?;
    Ok(settings)
}

fn apply_overrides(cli: &Cli, settings: &mut PipelineSettings) -> Result<(), String> {
    if let Some(concurrency) = cli.concurrency {
        settings.concurrency = concurrency;
    }
    if let Some(batch_size) = cli.batch_size {
        settings.batch_size = batch_size;
    }
    if let Some(confidence) = cli.confidence {
        settings.confidence_threshold = confidence;
    }
    if let Some(retry_limit) = cli.retry_limit {
        settings.retry_limit = retry_limit;
    }
    if let Some(timeout) = cli.batch_timeout_ms {
        settings.batch_timeout_ms = Some(timeout);
    }
    if let Some(mb) = cli.memory_budget_mb {
        settings.resource_per_worker.memory_budget_mb = Some(mb);
    }
    if let Some(ordinals) = &cli.accelerators {
        settings.resource_per_worker.device = DeviceKind::Accelerator;
        settings.resource_per_worker.accelerators = ordinals.clone();
    }
    if cli.no_shrink {
        settings.shrink_on_exhaustion = false;
    }
    if let Some(policy) = &cli.failure_policy {
        settings.failure_policy = parse_failure_policy(policy)?;
    }
    if let Some(mode) = &cli.reassembly {
        settings.reassembly = parse_reassembly(mode)?;
    }
    match &cli.format {
        Some(format) => settings.output_format = parse_format(format)?,
        None if cli.config.is_none() => {
            if let Some(format) = OutputFormat::from_path(&cli.output) {
                settings.output_format = format;
            }
        }
        None => {}
    }
    if let Some(fps) = cli.fps {
        settings.fps_override = Some(fps);
    }
    if let Some(labels) = &cli.labels {
        settings.labels = Some(labels.clone());
    }
    if cli.isolate {
        settings.isolate_source_failures = true;
    }
    Ok(())
}

fn validate(cli: &Cli, locator: &SourceLocator) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = locator.local_path() {
        if !path.exists() {
            return Err(format!("Input not found: {}", path.display()).into());
        }
    }
    match locator {
        SourceLocator::Directory(dir) => {
            if cli.output.is_file() {
                return Err(format!(
                    "Output must be a directory when the input is one, got file {}",
                    cli.output.display()
                )
                .into());
            }
            if cli.output == *dir {
                return Err("Output directory must differ from the input directory".into());
            }
        }
        _ => {
            if cli.output.is_dir() {
                return Err(format!(
                    "Output must be a file path, got directory {}",
                    cli.output.display()
                )
                .into());
            }
        }
    }
    Ok(())
}

fn parse_failure_policy(value: &str) -> Result<FailurePolicy, String> {
    match value {
        "fail" => Ok(FailurePolicy::Fail),
        "passthrough" => Ok(FailurePolicy::Passthrough),
        other => Err(format!(
            "Failure policy must be 'fail' or 'passthrough', got '{other}'"
        )),
    }
}

fn parse_reassembly(value: &str) -> Result<ReassemblyMode, String> {
    match value {
        "streaming" => Ok(ReassemblyMode::Streaming),
        "buffered" => Ok(ReassemblyMode::Buffered),
        other => Err(format!(
            "Reassembly must be 'streaming' or 'buffered', got '{other}'"
        )),
    }
}

fn parse_format(value: &str) -> Result<OutputFormat, String> {
    match value {
        "mp4" => Ok(OutputFormat::Mp4),
        "mkv" => Ok(OutputFormat::Mkv),
        "avi" => Ok(OutputFormat::Avi),
        other => Err(format!("Format must be one of: mp4, mkv, avi, got '{other}'")),
    }
}

fn download_progress(downloaded: u64, total: u64) {
    if total > 0 {
        let pct = (downloaded as f64 / total as f64 * 100.0) as u32;
        eprint!("\rDownloading detection model... {pct}%");
    } else {
        eprint!("\rDownloading detection model... {downloaded} bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["batch-annotate"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_without_flags() {
        let cli = parse(&["in.mp4", "out.mp4"]);
        let mut settings = PipelineSettings::default();
        apply_overrides(&cli, &mut settings).unwrap();
        assert_eq!(settings, PipelineSettings::default());
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = parse(&[
            "in.mp4",
            "out.mkv",
            "--concurrency",
            "4",
            "--batch-size",
            "3",
            "--confidence",
            "0.25",
            "--accelerators",
            "0,1,2,3",
            "--failure-policy",
            "passthrough",
            "--reassembly",
            "buffered",
            "--no-shrink",
            "--isolate",
        ]);
        let mut settings = PipelineSettings::default();
        apply_overrides(&cli, &mut settings).unwrap();

        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.batch_size, 3);
        assert_eq!(settings.confidence_threshold, 0.25);
        assert_eq!(settings.resource_per_worker.device, DeviceKind::Accelerator);
        assert_eq!(settings.resource_per_worker.accelerators, vec![0, 1, 2, 3]);
        assert_eq!(settings.failure_policy, FailurePolicy::Passthrough);
        assert_eq!(settings.reassembly, ReassemblyMode::Buffered);
        assert_eq!(settings.output_format, OutputFormat::Mkv);
        assert!(!settings.shrink_on_exhaustion);
        assert!(settings.isolate_source_failures);
        settings.validate().unwrap();
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("settings.json");
        std::fs::write(&config, r#"{"batch_size": 16, "retry_limit": 5, "output_format": "avi"}"#)
            .unwrap();
        let cli = parse(&[
            "in.mp4",
            "out.mp4",
            "--config",
            config.to_str().unwrap(),
            "--batch-size",
            "2",
        ]);

        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.batch_size, 2);
        assert_eq!(settings.retry_limit, 5);
        // The file's format wins over the output extension.
        assert_eq!(settings.output_format, OutputFormat::Avi);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = parse(&["in.mp4", "out.mp4", "--concurrency", "0"]);
        assert!(load_settings(&cli).is_err());
    }

    #[rstest]
    #[case("--failure-policy", "ignore")]
    #[case("--reassembly", "eager")]
    #[case("--format", "mov")]
    fn test_bad_enum_flag(#[case] flag: &str, #[case] value: &str) {
        let cli = parse(&["in.mp4", "out.mp4", flag, value]);
        let mut settings = PipelineSettings::default();
        assert!(apply_overrides(&cli, &mut settings).is_err());
    }

    #[test]
    fn test_missing_input_rejected() {
        let cli = parse(&["/nonexistent/in.mp4", "out.mp4"]);
        let locator = SourceLocator::parse(&cli.input).unwrap();
        assert!(validate(&cli, &locator).is_err());
    }

    #[test]
    fn test_directory_input_needs_directory_output() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::NamedTempFile::new().unwrap();
        let cli = parse(&[
            input.path().to_str().unwrap(),
            output.path().to_str().unwrap(),
        ]);
        let locator = SourceLocator::parse(&cli.input).unwrap();
        assert!(matches!(locator, SourceLocator::Directory(_)));
        assert!(validate(&cli, &locator).is_err());
    }

    #[test]
    fn test_remote_input_skips_existence_check() {
        let cli = parse(&["rtsp://camera.local/stream", "out.mp4"]);
        let locator = SourceLocator::parse(&cli.input).unwrap();
        validate(&cli, &locator).unwrap();
    }
}
