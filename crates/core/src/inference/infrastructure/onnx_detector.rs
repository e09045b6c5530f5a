/// YOLOv8-style object detector running on ONNX Runtime via `ort`.
///
/// Frames are letterboxed into one NCHW batch tensor, run in a single session
/// call, and decoded per image: box regression plus per-class scores, argmax
/// class, class-aware NMS, then mapped back to frame pixels.
use std::path::{Path, PathBuf};

use ndarray::{s, Array4, ArrayViewMut3};

use crate::inference::domain::inference_model::{InferenceError, InferenceModel};
use crate::inference::domain::model_loader::{LoadError, ModelLoader};
use crate::inference::resources::{Device, DeviceReservation};
use crate::shared::constants::{DEFAULT_MODEL_INPUT_SIZE, MODEL_MIN_SCORE, NMS_IOU_THRESHOLD};
use crate::shared::detection::{non_max_suppression, BoundingBox, Detection};
use crate::shared::frame::Frame;

use super::execution_provider;

/// YOLO letterbox padding value (114/255 gray).
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Box regression values before the class scores in each prediction row.
const BOX_VALUES: usize = 4;

pub struct OnnxDetector {
    session: ort::session::Session,
    input_size: u32,
    /// Exported with a fixed batch dimension of 1: frames are run one by one.
    single_image: bool,
}

impl OnnxDetector {
    /// Loads the model onto `device`.
    ///
    /// Input resolution and batch capability come from the model's NCHW input
    /// shape; dynamic spatial dims fall back to 640.
    pub fn new(model_path: &Path, device: Device) -> Result<Self, LoadError> {
        let session = ort::session::Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_execution_providers(execution_provider::for_device(device))?
            .commit_from_file(model_path)?;

        let dims: Option<Vec<i64>> = session.inputs().first().and_then(|input| {
            if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
                Some(shape.iter().copied().collect())
            } else {
                None
            }
        });
        let (input_size, single_image) = match dims.as_deref() {
            Some([n, _, h, _]) => (
                if *h > 0 { *h as u32 } else { DEFAULT_MODEL_INPUT_SIZE },
                *n == 1,
            ),
            _ => (DEFAULT_MODEL_INPUT_SIZE, true),
        };
        log::debug!(
            "Loaded {} on {device}: input {input_size}px, {}",
            model_path.display(),
            if single_image { "single-image" } else { "batched" }
        );

        Ok(Self {
            session,
            input_size,
            single_image,
        })
    }

    fn run(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, InferenceError> {
        let size = self.input_size as usize;
        let mut tensor = Array4::<f32>::from_elem((frames.len(), 3, size, size), PAD_VALUE);
        let mut boxes = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            boxes.push(letterbox_into(frame, self.input_size, tensor.slice_mut(s![i, .., .., ..]))?);
        }

        let input = ort::value::Tensor::from_array(tensor).map_err(classify)?;
        let outputs = self.session.run(ort::inputs![input]).map_err(classify)?;
        if outputs.len() == 0 {
            return Err(InferenceError::Failed("model produced no outputs".into()));
        }
        let predictions = outputs[0].try_extract_array::<f32>().map_err(classify)?;
        let layout = OutputLayout::from_shape(predictions.shape(), frames.len())?;
        let data = predictions
            .as_slice()
            .ok_or_else(|| InferenceError::Failed("output tensor is not contiguous".into()))?;

        Ok(boxes
            .iter()
            .enumerate()
            .map(|(i, letterbox)| {
                let image = &data[i * layout.per_image()..(i + 1) * layout.per_image()];
                let detections = decode(image, &layout, letterbox, MODEL_MIN_SCORE);
                non_max_suppression(detections, NMS_IOU_THRESHOLD)
            })
            .collect())
    }
}

impl InferenceModel for OnnxDetector {
    fn infer(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, InferenceError> {
        if self.single_image {
            let mut all = Vec::with_capacity(frames.len());
            for frame in frames {
                all.extend(self.run(std::slice::from_ref(frame))?);
            }
            Ok(all)
        } else {
            self.run(frames)
        }
    }
}

/// Loads one [`OnnxDetector`] per worker from a shared model file.
pub struct OnnxModelLoader {
    model_path: PathBuf,
}

impl OnnxModelLoader {
    pub fn new(model_path: PathBuf) -> Self {
        Self { model_path }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, reservation: &DeviceReservation) -> Result<Box<dyn InferenceModel>, LoadError> {
        Ok(Box::new(OnnxDetector::new(&self.model_path, reservation.device)?))
    }
}

/// Allocation failures are retryable with a smaller batch; anything else is not.
fn classify(err: ort::Error) -> InferenceError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("out of memory") || lower.contains("failed to allocate") {
        InferenceError::OutOfMemory(message)
    } else {
        InferenceError::Failed(message)
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// How a frame was fitted into the square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Nearest-neighbor resize of `frame` into a pre-padded `[3, size, size]` slot.
fn letterbox_into(
    frame: &Frame,
    target_size: u32,
    mut dst: ArrayViewMut3<'_, f32>,
) -> Result<Letterbox, InferenceError> {
    let src = frame.as_ndarray().ok_or_else(|| {
        InferenceError::Failed(format!("frame {} has an inconsistent buffer", frame.index()))
    })?;
    let (fw, fh) = (frame.width() as f32, frame.height() as f32);
    let target = target_size as f32;

    let scale = (target / fw).min(target / fh);
    let new_w = ((fw * scale).round() as u32).clamp(1, target_size);
    let new_h = ((fh * scale).round() as u32).clamp(1, target_size);
    let pad_x = (target_size - new_w) / 2;
    let pad_y = (target_size - new_h) / 2;

    let (src_h, src_w) = (frame.height() as usize, frame.width() as usize);
    for y in 0..new_h as usize {
        let sy = ((y as f32 / scale) as usize).min(src_h - 1);
        for x in 0..new_w as usize {
            let sx = ((x as f32 / scale) as usize).min(src_w - 1);
            for c in 0..3 {
                dst[[c, pad_y as usize + y, pad_x as usize + x]] = src[[sy, sx, c]] as f32 / 255.0;
            }
        }
    }

    Ok(Letterbox {
        scale,
        pad_x,
        pad_y,
    })
}

// ---------------------------------------------------------------------------
// Postprocessing
// ---------------------------------------------------------------------------

/// Prediction tensor layout, per image.
///
/// YOLOv8 exports `[N, 4 + classes, anchors]` (feature-major); some exporters
/// transpose to `[N, anchors, 4 + classes]`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct OutputLayout {
    anchors: usize,
    features: usize,
    feature_major: bool,
}

impl OutputLayout {
    fn from_shape(shape: &[usize], batch: usize) -> Result<Self, InferenceError> {
        let [n, a, b] = shape else {
            return Err(InferenceError::Failed(format!(
                "unexpected output shape {shape:?}"
            )));
        };
        if *n != batch {
            return Err(InferenceError::Failed(format!(
                "output batch {n} does not match input batch {batch}"
            )));
        }
        let feature_major = a < b;
        let (features, anchors) = if feature_major { (*a, *b) } else { (*b, *a) };
        if features <= BOX_VALUES {
            return Err(InferenceError::Failed(format!(
                "output has no class scores: {shape:?}"
            )));
        }
        Ok(Self {
            anchors,
            features,
            feature_major,
        })
    }

    fn per_image(&self) -> usize {
        self.anchors * self.features
    }

    fn value(&self, data: &[f32], anchor: usize, feature: usize) -> f32 {
        if self.feature_major {
            data[feature * self.anchors + anchor]
        } else {
            data[anchor * self.features + feature]
        }
    }
}

fn decode(data: &[f32], layout: &OutputLayout, letterbox: &Letterbox, min_score: f32) -> Vec<Detection> {
    let mut detections = Vec::new();
    for anchor in 0..layout.anchors {
        let (label, score) = (BOX_VALUES..layout.features)
            .map(|f| (f - BOX_VALUES, layout.value(data, anchor, f)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < min_score {
            continue;
        }

        let cx = layout.value(data, anchor, 0);
        let cy = layout.value(data, anchor, 1);
        let w = layout.value(data, anchor, 2);
        let h = layout.value(data, anchor, 3);
        let (x1, y1) = letterbox.to_frame(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_frame(cx + w / 2.0, cy + h / 2.0);

        detections.push(Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            label: label as u32,
            score: score.clamp(0.0, 1.0),
        });
    }
    detections
}
