use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::shared::frame::{AnnotatedFrame, Frame};
use crate::shared::pipeline_error::PipelineError;
use crate::shared::video_metadata::VideoMetadata;

/// Container and codec of the output video.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Mkv,
    Avi,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Avi => "avi",
        }
    }

    /// libavformat muxer name.
    pub fn muxer(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "matroska",
            Self::Avi => "avi",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "m4v" => Some(Self::Mp4),
            "mkv" => Some(Self::Mkv),
            "avi" => Some(Self::Avi),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SinkOptions {
    pub output_format: OutputFormat,
    pub fps_override: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SinkReport {
    pub path: PathBuf,
    pub frames_written: usize,
    pub fps: f64,
}

/// Encodes annotated frames, in the order given, into an output video.
pub trait VideoSink: Send {
    fn open(
        &mut self,
        path: &Path,
        metadata: &VideoMetadata,
        options: &SinkOptions,
    ) -> Result<(), PipelineError>;

    /// Fails with [`PipelineError::DimensionMismatch`] if the frame's size
    /// differs from the output's.
    fn write(&mut self, frame: &AnnotatedFrame) -> Result<(), PipelineError>;

    /// Finalizes the file. A sink that received no frames reports zero.
    fn close(&mut self) -> Result<SinkReport, PipelineError>;
}

/// Pins the output size to the opened metadata, or to the first frame when
/// the container reported none.
#[derive(Clone, Copy, Debug, Default)]
pub struct DimensionGuard {
    expected: Option<(u32, u32)>,
}

impl DimensionGuard {
    pub fn new(metadata: &VideoMetadata) -> Self {
        let expected = (metadata.width > 0 && metadata.height > 0)
            .then_some((metadata.width, metadata.height));
        Self { expected }
    }

    pub fn expected(&self) -> Option<(u32, u32)> {
        self.expected
    }

    pub fn check(&mut self, frame: &Frame) -> Result<(u32, u32), PipelineError> {
        let actual = frame.dimensions();
        match self.expected {
            None => {
                self.expected = Some(actual);
                Ok(actual)
            }
            Some(expected) if expected == actual => Ok(actual),
            Some(expected) => Err(PipelineError::DimensionMismatch {
                index: frame.index(),
                expected,
                actual,
            }),
        }
    }
}

/// Packed RGB24 bytes for a frame, converting grayscale and RGBA.
pub fn rgb_pixels(frame: &Frame) -> Result<Cow<'_, [u8]>, PipelineError> {
    let pixels = frame.width() as usize * frame.height() as usize;
    let data = frame.data();
    if data.len() != pixels * frame.channels() as usize {
        return Err(PipelineError::Sink(format!(
            "frame {} buffer holds {} bytes for {}x{}x{}",
            frame.index(),
            data.len(),
            frame.width(),
            frame.height(),
            frame.channels()
        )));
    }
    match frame.channels() {
        3 => Ok(Cow::Borrowed(data)),
        1 => Ok(Cow::Owned(data.iter().flat_map(|&v| [v, v, v]).collect())),
        4 => Ok(Cow::Owned(
            data.chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        )),
        n => Err(PipelineError::Sink(format!(
            "frame {} has unsupported channel count {n}",
            frame.index()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn metadata(width: u32, height: u32) -> VideoMetadata {
        VideoMetadata {
            width,
            height,
            fps: 30.0,
            total_frames: 0,
            codec: String::new(),
            source_path: None,
        }
    }

    fn frame(index: usize, w: u32, h: u32) -> Frame {
        Frame::new(vec![0; (w * h * 3) as usize], w, h, 3, index)
    }

    #[test]
    fn test_guard_uses_metadata_size() {
        let mut guard = DimensionGuard::new(&metadata(4, 2));
        assert!(guard.check(&frame(0, 4, 2)).is_ok());
        let err = guard.check(&frame(1, 2, 2)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch {
                index: 1,
                expected: (4, 2),
                actual: (2, 2)
            }
        ));
    }

    #[test]
    fn test_guard_pins_first_frame_when_metadata_unknown() {
        let mut guard = DimensionGuard::new(&metadata(0, 0));
        assert!(guard.expected().is_none());
        guard.check(&frame(0, 3, 3)).unwrap();
        assert_eq!(guard.expected(), Some((3, 3)));
        assert!(guard.check(&frame(1, 4, 3)).is_err());
    }

    #[test]
    fn test_rgb_passthrough_borrows() {
        let f = Frame::new(vec![1, 2, 3], 1, 1, 3, 0);
        assert!(matches!(rgb_pixels(&f).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_gray_expands() {
        let f = Frame::new(vec![7, 9], 2, 1, 1, 0);
        assert_eq!(rgb_pixels(&f).unwrap().as_ref(), &[7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn test_rgba_drops_alpha() {
        let f = Frame::new(vec![1, 2, 3, 255, 4, 5, 6, 0], 2, 1, 4, 0);
        assert_eq!(rgb_pixels(&f).unwrap().as_ref(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_two_channel_rejected() {
        let f = Frame::new(vec![0; 4], 2, 1, 2, 3);
        assert!(matches!(rgb_pixels(&f), Err(PipelineError::Sink(_))));
    }

    #[rstest]
    #[case("out.mp4", Some(OutputFormat::Mp4))]
    #[case("OUT.MKV", Some(OutputFormat::Mkv))]
    #[case("clip.avi", Some(OutputFormat::Avi))]
    #[case("clip.gif", None)]
    #[case("noext", None)]
    fn test_format_from_path(#[case] path: &str, #[case] expected: Option<OutputFormat>) {
        assert_eq!(OutputFormat::from_path(Path::new(path)), expected);
    }

    #[test]
    fn test_format_serde_lowercase() {
        let f: OutputFormat = serde_json::from_str("\"mkv\"").unwrap();
        assert_eq!(f, OutputFormat::Mkv);
        assert_eq!(f.muxer(), "matroska");
    }
}
