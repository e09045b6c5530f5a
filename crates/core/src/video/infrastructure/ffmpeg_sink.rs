use std::path::{Path, PathBuf};

use crate::shared::frame::AnnotatedFrame;
use crate::shared::pipeline_error::PipelineError;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::video_sink::{
    rgb_pixels, DimensionGuard, OutputFormat, SinkOptions, SinkReport, VideoSink,
};

/// An encoder plus the muxer it writes into, created on the first frame.
struct Encoding {
    octx: ffmpeg_next::format::context::Output,
    encoder: ffmpeg_next::codec::encoder::video::Encoder,
    scaler: ffmpeg_next::software::scaling::Context,
    time_base: ffmpeg_next::Rational,
    width: u32,
    height: u32,
}

/// Encodes annotated frames with MPEG-4 Part 2 via ffmpeg-next.
///
/// The container is picked from [`OutputFormat`]. Nothing touches the disk
/// until the first frame arrives, so a run with no frames leaves no file.
pub struct FfmpegSink {
    output_path: Option<PathBuf>,
    options: SinkOptions,
    fps: f64,
    guard: DimensionGuard,
    encoding: Option<Encoding>,
    frames_written: usize,
}

// Safety: FfmpegSink is only used from a single thread at a time.
// The raw pointers inside ffmpeg types are not shared across threads.
unsafe impl Send for FfmpegSink {}

impl FfmpegSink {
    pub fn new() -> Self {
        Self {
            output_path: None,
            options: SinkOptions::default(),
            fps: 0.0,
            guard: DimensionGuard::default(),
            encoding: None,
            frames_written: 0,
        }
    }

    fn start_encoding(&self, path: &Path, width: u32, height: u32) -> Result<Encoding, PipelineError> {
        ffmpeg_next::init().map_err(sink_error)?;

        let format = self.options.output_format;
        let mut octx = ffmpeg_next::format::output_as(&path, format.muxer()).map_err(sink_error)?;

        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::MPEG4)
            .ok_or_else(|| PipelineError::Sink("MPEG4 encoder not found".into()))?;
        let mut ost = octx.add_stream(Some(codec)).map_err(sink_error)?;

        let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(sink_error)?;

        let frame_rate = frame_rate(self.fps);
        let time_base = frame_rate.invert();
        encoder_ctx.set_width(width);
        encoder_ctx.set_height(height);
        encoder_ctx.set_format(ffmpeg_next::format::Pixel::YUV420P);
        encoder_ctx.set_time_base(time_base);
        encoder_ctx.set_frame_rate(Some(frame_rate));
        if global_header {
            encoder_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }

        let encoder = encoder_ctx
            .open_with(ffmpeg_next::Dictionary::new())
            .map_err(sink_error)?;
        ost.set_parameters(&encoder);

        let mut muxer_options = ffmpeg_next::Dictionary::new();
        if format == OutputFormat::Mp4 {
            muxer_options.set("movflags", "+faststart");
        }
        octx.write_header_with(muxer_options).map_err(sink_error)?;

        let scaler = ffmpeg_next::software::scaling::Context::get(
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .map_err(sink_error)?;

        log::debug!(
            "Encoding {}x{} @ {:.3} fps into {} ({})",
            width,
            height,
            self.fps,
            path.display(),
            format.muxer()
        );

        Ok(Encoding {
            octx,
            encoder,
            scaler,
            time_base,
            width,
            height,
        })
    }
}

impl Default for FfmpegSink {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSink for FfmpegSink {
    fn open(
        &mut self,
        path: &Path,
        metadata: &VideoMetadata,
        options: &SinkOptions,
    ) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.output_path = Some(path.to_path_buf());
        self.options = options.clone();
        self.fps = metadata.output_fps(options.fps_override);
        self.guard = DimensionGuard::new(metadata);
        self.encoding = None;
        self.frames_written = 0;
        Ok(())
    }

    fn write(&mut self, annotated: &AnnotatedFrame) -> Result<(), PipelineError> {
        let frame = annotated.frame();
        let path = self
            .output_path
            .clone()
            .ok_or_else(|| PipelineError::Sink("FfmpegSink: not opened".into()))?;
        let (width, height) = self.guard.check(frame)?;
        let pixels = rgb_pixels(frame)?;

        if self.encoding.is_none() {
            self.encoding = Some(self.start_encoding(&path, width, height)?);
        }
        let Some(enc) = self.encoding.as_mut() else {
            return Err(PipelineError::Sink("encoder unavailable".into()));
        };

        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::new(
            ffmpeg_next::format::Pixel::RGB24,
            enc.width,
            enc.height,
        );
        let stride = rgb_frame.stride(0);
        let row_bytes = enc.width as usize * 3;
        let data = rgb_frame.data_mut(0);
        for row in 0..enc.height as usize {
            let src = row * row_bytes;
            let dst = row * stride;
            data[dst..dst + row_bytes].copy_from_slice(&pixels[src..src + row_bytes]);
        }

        let mut yuv_frame = ffmpeg_next::util::frame::video::Video::empty();
        enc.scaler.run(&rgb_frame, &mut yuv_frame).map_err(sink_error)?;
        yuv_frame.set_pts(Some(self.frames_written as i64));

        enc.encoder.send_frame(&yuv_frame).map_err(sink_error)?;
        enc.drain_packets()?;

        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<SinkReport, PipelineError> {
        if let Some(mut enc) = self.encoding.take() {
            enc.encoder.send_eof().map_err(sink_error)?;
            enc.drain_packets()?;
            enc.octx.write_trailer().map_err(sink_error)?;
        }

        let report = SinkReport {
            path: self.output_path.take().unwrap_or_default(),
            frames_written: self.frames_written,
            fps: self.fps,
        };
        if report.frames_written == 0 {
            log::warn!("No frames written to {}", report.path.display());
        }
        Ok(report)
    }
}

impl Encoding {
    fn drain_packets(&mut self) -> Result<(), PipelineError> {
        let ost_time_base = self
            .octx
            .stream(0)
            .map(|s| s.time_base())
            .ok_or_else(|| PipelineError::Sink("output stream missing".into()))?;

        let mut encoded = ffmpeg_next::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(0);
            encoded.rescale_ts(self.time_base, ost_time_base);
            encoded.write_interleaved(&mut self.octx).map_err(sink_error)?;
        }
        Ok(())
    }
}

/// Rational frame rate with millisecond precision, so 29.97 stays 2997/100.
fn frame_rate(fps: f64) -> ffmpeg_next::Rational {
    let millis = (fps * 1000.0).round().clamp(1.0, i32::MAX as f64) as i32;
    ffmpeg_next::Rational(millis, 1000).reduce()
}

fn sink_error(e: ffmpeg_next::Error) -> PipelineError {
    PipelineError::Sink(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::frame::Frame;
    use crate::video::domain::frame_source::FrameSource;
    use crate::video::domain::source_locator::SourceLocator;
    use crate::video::infrastructure::ffmpeg_source::FfmpegSource;
    use rstest::rstest;

    fn metadata(w: u32, h: u32, fps: f64) -> VideoMetadata {
        VideoMetadata {
            width: w,
            height: h,
            fps,
            total_frames: 0,
            codec: String::new(),
            source_path: None,
        }
    }

    fn solid(index: usize, w: u32, h: u32, value: u8) -> AnnotatedFrame {
        AnnotatedFrame::passthrough(Frame::new(vec![value; (w * h * 3) as usize], w, h, 3, index))
    }

    fn write_frames(path: &Path, format: OutputFormat, n: usize) -> SinkReport {
        let mut sink = FfmpegSink::new();
        let options = SinkOptions {
            output_format: format,
            fps_override: None,
        };
        sink.open(path, &metadata(160, 120, 30.0), &options).unwrap();
        for i in 0..n {
            sink.write(&solid(i, 160, 120, 128)).unwrap();
        }
        sink.close().unwrap()
    }

    #[rstest]
    #[case(OutputFormat::Mp4)]
    #[case(OutputFormat::Mkv)]
    #[case(OutputFormat::Avi)]
    fn test_each_format_writes_readable_file(#[case] format: OutputFormat) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("out.{}", format.extension()));
        let report = write_frames(&path, format, 3);
        assert_eq!(report.frames_written, 3);
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        let mut source = FfmpegSource::new();
        let meta = source.open(&SourceLocator::File(path)).unwrap();
        assert_eq!((meta.width, meta.height), (160, 120));
        assert_eq!(source.frames().count(), 3);
    }

    #[test]
    fn test_roundtrip_brightness_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.mp4");
        write_frames(&path, OutputFormat::Mp4, 2);

        let mut source = FfmpegSource::new();
        source.open(&SourceLocator::File(path)).unwrap();
        let first = source.frames().next().unwrap().unwrap();
        let avg: f64 =
            first.data().iter().map(|&b| b as f64).sum::<f64>() / first.data().len() as f64;
        assert!((avg - 128.0).abs() < 40.0, "average {avg} should be near 128");
    }

    #[test]
    fn test_zero_frames_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mp4");
        let report = write_frames(&path, OutputFormat::Mp4, 0);
        assert_eq!(report.frames_written, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_mismatched_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut sink = FfmpegSink::new();
        sink.open(&path, &metadata(160, 120, 30.0), &SinkOptions::default())
            .unwrap();
        sink.write(&solid(0, 160, 120, 0)).unwrap();
        let err = sink.write(&solid(1, 80, 60, 0)).unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { index: 1, .. }));
        sink.close().unwrap();
    }

    #[test]
    fn test_write_without_open_returns_error() {
        let mut sink = FfmpegSink::new();
        assert!(sink.write(&solid(0, 160, 120, 128)).is_err());
    }

    #[test]
    fn test_fps_override_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mkv");
        let mut sink = FfmpegSink::new();
        let options = SinkOptions {
            output_format: OutputFormat::Mkv,
            fps_override: Some(12.0),
        };
        sink.open(&path, &metadata(160, 120, 30.0), &options).unwrap();
        sink.write(&solid(0, 160, 120, 0)).unwrap();
        assert_eq!(sink.close().unwrap().fps, 12.0);
    }

    #[test]
    fn test_frame_rate_keeps_fractional_rates() {
        assert_eq!(frame_rate(29.97), ffmpeg_next::Rational(2997, 100));
        assert_eq!(frame_rate(30.0), ffmpeg_next::Rational(30, 1));
    }
}
