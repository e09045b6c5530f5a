/// Fallback frame rate when the container does not report one.
pub const DEFAULT_FPS: f64 = 30.0;

/// Fallback model input resolution when the ONNX model has dynamic spatial dims.
pub const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;

/// Detections below this score never leave the model; the annotator applies
/// the user-facing threshold on top.
pub const MODEL_MIN_SCORE: f32 = 0.05;

pub const NMS_IOU_THRESHOLD: f32 = 0.45;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "m4v"];

/// URI schemes handed straight to ffmpeg's network protocols.
pub const STREAMING_SCHEMES: &[&str] = &["http", "https", "rtsp", "rtmp"];

/// Default detector: YOLOv8n exported to ONNX, 80 COCO classes.
pub const DETECTION_MODEL_NAME: &str = "yolov8n.onnx";
pub const DETECTION_MODEL_URL: &str =
    "https://github.com/ultralytics/assets/releases/download/v8.2.0/yolov8n.onnx";
