use std::path::PathBuf;

use super::constants::DEFAULT_FPS;

#[derive(Clone, Debug, PartialEq)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Frame count reported by the container; 0 when unknown.
    pub total_frames: usize,
    pub codec: String,
    pub source_path: Option<PathBuf>,
}

impl VideoMetadata {
    /// Frame rate to encode with: the override when given, otherwise the
    /// decoded rate, falling back to 30 fps when the container reports none.
    pub fn output_fps(&self, fps_override: Option<f64>) -> f64 {
        match fps_override {
            Some(fps) if fps > 0.0 => fps,
            _ if self.fps > 0.0 => self.fps,
            _ => DEFAULT_FPS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn meta(fps: f64) -> VideoMetadata {
        VideoMetadata {
            width: 1920,
            height: 1080,
            fps,
            total_frames: 900,
            codec: "h264".to_string(),
            source_path: Some(PathBuf::from("/tmp/test.mp4")),
        }
    }

    #[test]
    fn test_output_fps_defaults_to_decoded_rate() {
        assert_relative_eq!(meta(24.0).output_fps(None), 24.0);
    }

    #[test]
    fn test_output_fps_override_wins() {
        assert_relative_eq!(meta(24.0).output_fps(Some(60.0)), 60.0);
    }

    #[test]
    fn test_output_fps_falls_back_when_unknown() {
        assert_relative_eq!(meta(0.0).output_fps(None), DEFAULT_FPS);
        assert_relative_eq!(meta(0.0).output_fps(Some(-1.0)), DEFAULT_FPS);
    }
}
