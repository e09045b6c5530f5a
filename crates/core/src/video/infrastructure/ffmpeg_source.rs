use crate::shared::frame::{Frame, SourceId};
use crate::shared::pipeline_error::PipelineError;
use crate::shared::video_metadata::VideoMetadata;
use crate::video::domain::frame_source::FrameSource;
use crate::video::domain::source_locator::SourceLocator;

/// Decodes video frames via ffmpeg-next (libavformat + libavcodec).
///
/// Opens local files and the network streams ffmpeg supports. Each decoded
/// frame is converted to RGB24 and tagged with this source's id.
pub struct FfmpegSource {
    input_ctx: Option<ffmpeg_next::format::context::Input>,
    video_stream_index: usize,
    locator: String,
    source_id: SourceId,
}

// Safety: FfmpegSource is only used from a single thread at a time.
// The raw pointers inside ffmpeg types are not shared across threads.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    pub fn new() -> Self {
        Self {
            input_ctx: None,
            video_stream_index: 0,
            locator: String::new(),
            source_id: 0,
        }
    }

    pub fn with_source_id(mut self, source_id: SourceId) -> Self {
        self.source_id = source_id;
        self
    }

    fn decode_error(&self, reason: impl ToString) -> PipelineError {
        PipelineError::Decode {
            locator: self.locator.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Default for FfmpegSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for FfmpegSource {
    fn open(&mut self, locator: &SourceLocator) -> Result<VideoMetadata, PipelineError> {
        self.locator = locator.to_string();
        if let SourceLocator::Directory(path) = locator {
            return Err(self.decode_error(format!(
                "{} is a directory, not a video",
                path.display()
            )));
        }

        ffmpeg_next::init().map_err(|e| self.decode_error(e))?;
        if locator.is_remote() {
            ffmpeg_next::format::network::init();
        }

        let ictx = ffmpeg_next::format::input(&locator.ffmpeg_input())
            .map_err(|e| self.decode_error(e))?;

        let stream = ictx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| self.decode_error("no video stream found"))?;

        let video_stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| self.decode_error(e))?;
        let decoder = codec_ctx.decoder().video().map_err(|e| self.decode_error(e))?;

        let rate = stream.rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let metadata = VideoMetadata {
            width: decoder.width(),
            height: decoder.height(),
            fps,
            total_frames: stream.frames().max(0) as usize,
            codec: decoder
                .codec()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
            source_path: locator.local_path().map(|p| p.to_path_buf()),
        };
        log::debug!(
            "Opened {} ({}x{} @ {:.2} fps, {} frames, {})",
            self.locator,
            metadata.width,
            metadata.height,
            metadata.fps,
            metadata.total_frames,
            metadata.codec
        );

        self.video_stream_index = video_stream_index;
        self.input_ctx = Some(ictx);

        Ok(metadata)
    }

    fn frames(&mut self) -> Box<dyn Iterator<Item = Result<Frame, PipelineError>> + '_> {
        match self.start_decoding() {
            Ok(iter) => Box::new(iter),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn close(&mut self) {
        self.input_ctx = None;
    }
}

impl FfmpegSource {
    fn start_decoding(&mut self) -> Result<FfmpegFrameIter<'_>, PipelineError> {
        let locator = self.locator.clone();
        let decode_error = |reason: String| PipelineError::Decode {
            locator: locator.clone(),
            reason,
        };
        let source_id = self.source_id;
        let video_stream_index = self.video_stream_index;
        let ictx = self
            .input_ctx
            .as_mut()
            .ok_or_else(|| decode_error("source not opened".into()))?;

        let stream = ictx
            .stream(video_stream_index)
            .ok_or_else(|| decode_error("video stream disappeared".into()))?;
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| decode_error(e.to_string()))?;
        let decoder = codec_ctx
            .decoder()
            .video()
            .map_err(|e| decode_error(e.to_string()))?;

        let width = decoder.width();
        let height = decoder.height();

        let scaler = ffmpeg_next::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| decode_error(e.to_string()))?;

        Ok(FfmpegFrameIter {
            ictx,
            decoder,
            scaler,
            width,
            height,
            video_stream_index,
            source_id,
            locator,
            frame_index: 0,
            flushing: false,
            done: false,
        })
    }
}

/// Lazy iterator that decodes one frame at a time.
struct FfmpegFrameIter<'a> {
    ictx: &'a mut ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    width: u32,
    height: u32,
    video_stream_index: usize,
    source_id: SourceId,
    locator: String,
    frame_index: usize,
    flushing: bool,
    done: bool,
}

impl FfmpegFrameIter<'_> {
    /// Ends iteration with a decode error naming the first frame that was lost.
    fn corrupt(&mut self, reason: String) -> PipelineError {
        self.done = true;
        PipelineError::Decode {
            locator: self.locator.clone(),
            reason: format!("{reason} (at frame {})", self.frame_index),
        }
    }

    fn try_receive(&mut self) -> Option<Result<Frame, PipelineError>> {
        let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return None;
        }
        let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
        if let Err(e) = self.scaler.run(&decoded, &mut rgb_frame) {
            self.done = true;
            return Some(Err(PipelineError::Decode {
                locator: self.locator.clone(),
                reason: format!("pixel conversion failed at frame {}: {e}", self.frame_index),
            }));
        }

        let pixels = extract_rgb_pixels(&rgb_frame, self.width, self.height);
        let frame = Frame::new(pixels, self.width, self.height, 3, self.frame_index)
            .with_source(self.source_id);
        self.frame_index += 1;
        Some(Ok(frame))
    }
}

impl Iterator for FfmpegFrameIter<'_> {
    type Item = Result<Frame, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(result) = self.try_receive() {
            return Some(result);
        }

        if self.flushing {
            self.done = true;
            return None;
        }

        loop {
            let mut packet = ffmpeg_next::Packet::empty();
            match read_step(packet.read(self.ictx)) {
                ReadStep::Packet => {}
                ReadStep::Again => continue,
                ReadStep::EndOfStream => {
                    let _ = self.decoder.send_eof();
                    self.flushing = true;
                    if let Some(result) = self.try_receive() {
                        return Some(result);
                    }
                    self.done = true;
                    return None;
                }
                ReadStep::Corrupt(reason) => {
                    return Some(Err(self.corrupt(format!("demuxing failed: {reason}"))));
                }
            }

            if packet.stream() != self.video_stream_index {
                continue;
            }

            if let Err(e) = self.decoder.send_packet(&packet) {
                return Some(Err(self.corrupt(format!("undecodable packet: {e}"))));
            }

            if let Some(result) = self.try_receive() {
                return Some(result);
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum ReadStep {
    Packet,
    Again,
    EndOfStream,
    Corrupt(String),
}

/// Classifies the result of reading one packet from the demuxer.
fn read_step(result: Result<(), ffmpeg_next::Error>) -> ReadStep {
    match result {
        Ok(()) => ReadStep::Packet,
        Err(ffmpeg_next::Error::Eof) => ReadStep::EndOfStream,
        Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
            ReadStep::Again
        }
        Err(e) => ReadStep::Corrupt(e.to_string()),
    }
}

/// Copies pixel data from an ffmpeg frame into a packed RGB buffer, dropping
/// per-row stride padding.
fn extract_rgb_pixels(
    rgb_frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let row_bytes = width as usize * 3;

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let row_start = row * stride;
        pixels.extend_from_slice(&data[row_start..row_start + row_bytes]);
    }
    pixels
}

#[cfg(test)]
pub(crate) mod test_video {
    use std::path::Path;

    /// Encodes `num_frames` solid frames with MPEG-4, brightness stepping per frame.
    pub fn create_test_video(path: &Path, num_frames: usize, width: u32, height: u32, fps: i32) {
        ffmpeg_next::init().unwrap();

        let mut octx = ffmpeg_next::format::output(&path).unwrap();
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::MPEG4).unwrap();
        let mut ost = octx.add_stream(Some(codec)).unwrap();
        let mut encoder_ctx = ffmpeg_next::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .unwrap();
        encoder_ctx.set_width(width);
        encoder_ctx.set_height(height);
        encoder_ctx.set_format(ffmpeg_next::format::Pixel::YUV420P);
        encoder_ctx.set_time_base(ffmpeg_next::Rational(1, fps));
        encoder_ctx.set_frame_rate(Some(ffmpeg_next::Rational(fps, 1)));
        if global_header {
            encoder_ctx.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = encoder_ctx
            .open_with(ffmpeg_next::Dictionary::new())
            .unwrap();
        ost.set_parameters(&encoder);
        octx.write_header().unwrap();
        let ost_time_base = octx.stream(0).unwrap().time_base();

        let mut scaler = ffmpeg_next::software::scaling::Context::get(
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .unwrap();

        for i in 0..num_frames {
            let mut rgb = ffmpeg_next::util::frame::video::Video::new(
                ffmpeg_next::format::Pixel::RGB24,
                width,
                height,
            );
            let value = ((i * 40) % 256) as u8;
            rgb.data_mut(0).fill(value);
            let mut yuv = ffmpeg_next::util::frame::video::Video::empty();
            scaler.run(&rgb, &mut yuv).unwrap();
            yuv.set_pts(Some(i as i64));
            encoder.send_frame(&yuv).unwrap();
            drain(&mut encoder, &mut octx, fps, ost_time_base);
        }
        encoder.send_eof().unwrap();
        drain(&mut encoder, &mut octx, fps, ost_time_base);
        octx.write_trailer().unwrap();
    }

    fn drain(
        encoder: &mut ffmpeg_next::codec::encoder::video::Encoder,
        octx: &mut ffmpeg_next::format::context::Output,
        fps: i32,
        time_base: ffmpeg_next::Rational,
    ) {
        let mut encoded = ffmpeg_next::Packet::empty();
        while encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(0);
            encoded.rescale_ts(ffmpeg_next::Rational(1, fps), time_base);
            encoded.write_interleaved(octx).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::test_video::create_test_video;
    use super::*;

    fn open_test_video(num_frames: usize) -> (tempfile::TempDir, SourceLocator) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.mp4");
        create_test_video(&path, num_frames, 160, 120, 30);
        (dir, SourceLocator::File(path))
    }

    #[test]
    fn test_open_returns_metadata() {
        let (_dir, locator) = open_test_video(5);
        let mut source = FfmpegSource::new();
        let meta = source.open(&locator).unwrap();
        assert_eq!(meta.width, 160);
        assert_eq!(meta.height, 120);
        assert!(meta.fps > 0.0);
        assert_eq!(meta.source_path.as_deref(), locator.local_path());
    }

    #[test]
    fn test_open_nonexistent_is_decode_error() {
        let mut source = FfmpegSource::new();
        let err = source
            .open(&SourceLocator::File("/nonexistent/test.mp4".into()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode { .. }));
    }

    #[test]
    fn test_open_corrupt_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.mp4");
        std::fs::write(&path, b"definitely not a video").unwrap();
        let mut source = FfmpegSource::new();
        assert!(matches!(
            source.open(&SourceLocator::File(path)),
            Err(PipelineError::Decode { .. })
        ));
    }

    #[test]
    fn test_directory_locator_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FfmpegSource::new();
        assert!(source
            .open(&SourceLocator::Directory(dir.path().to_path_buf()))
            .is_err());
    }

    #[test]
    fn test_frames_are_sequential_rgb_and_tagged() {
        let (_dir, locator) = open_test_video(5);
        let mut source = FfmpegSource::new().with_source_id(3);
        source.open(&locator).unwrap();

        let frames: Vec<Frame> = source.frames().map(|f| f.unwrap()).collect();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index(), i);
            assert_eq!(frame.source(), 3);
            assert_eq!(frame.channels(), 3);
            assert_eq!(frame.data().len(), 160 * 120 * 3);
        }
    }

    #[test]
    fn test_frames_without_open_returns_error() {
        let mut source = FfmpegSource::new();
        let result = source.frames().next().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_close_idempotent() {
        let (_dir, locator) = open_test_video(1);
        let mut source = FfmpegSource::new();
        source.open(&locator).unwrap();
        source.close();
        source.close();
    }

    #[rstest]
    #[case(Ok(()), ReadStep::Packet)]
    #[case(Err(ffmpeg_next::Error::Eof), ReadStep::EndOfStream)]
    #[case(
        Err(ffmpeg_next::Error::Other { errno: ffmpeg_next::util::error::EAGAIN }),
        ReadStep::Again
    )]
    fn test_read_step_passes_through_normal_results(
        #[case] result: Result<(), ffmpeg_next::Error>,
        #[case] expected: ReadStep,
    ) {
        assert_eq!(read_step(result), expected);
    }

    #[rstest]
    #[case(ffmpeg_next::Error::InvalidData)]
    #[case(ffmpeg_next::Error::Bug)]
    fn test_read_step_reports_demux_errors(#[case] error: ffmpeg_next::Error) {
        assert!(matches!(read_step(Err(error)), ReadStep::Corrupt(reason) if !reason.is_empty()));
    }

    #[test]
    fn test_corrupt_ends_iteration_with_frame_position() {
        let (_dir, locator) = open_test_video(3);
        let mut source = FfmpegSource::new();
        source.open(&locator).unwrap();
        let mut iter = source.start_decoding().unwrap();
        assert!(iter.next().unwrap().is_ok());

        let err = iter.corrupt("undecodable packet: Invalid data".into());
        let PipelineError::Decode { locator: name, reason } = err else {
            panic!("expected a decode error");
        };
        assert_eq!(name, locator.to_string());
        assert!(reason.contains("at frame 1"), "{reason}");
        assert!(iter.next().is_none());
    }
}
