/// Axis-aligned box in frame pixel coordinates, corners `(x1, y1)`-`(x2, y2)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Integer pixel rectangle, inclusive on both ends, guaranteed inside the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Builds a box from YOLO-style center/size values.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }

    /// Rounds and clamps to a `width` x `height` frame.
    ///
    /// Returns `None` when the box lies entirely outside the frame or
    /// collapses to nothing after clamping.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> Option<PixelRect> {
        if width == 0 || height == 0 {
            return None;
        }
        if !(self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite())
        {
            return None;
        }
        let max_x = (width - 1) as f32;
        let max_y = (height - 1) as f32;
        if self.x2 < 0.0 || self.y2 < 0.0 || self.x1 > max_x || self.y1 > max_y {
            return None;
        }
        let left = self.x1.clamp(0.0, max_x).round() as u32;
        let top = self.y1.clamp(0.0, max_y).round() as u32;
        let right = self.x2.clamp(0.0, max_x).round() as u32;
        let bottom = self.y2.clamp(0.0, max_y).round() as u32;
        if right < left || bottom < top {
            return None;
        }
        Some(PixelRect {
            left,
            top,
            right,
            bottom,
        })
    }
}

/// One object found by the model: where, what, and how sure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Class id, resolved to a name by the label registry.
    pub label: u32,
    /// Confidence in `[0, 1]`.
    pub score: f32,
}

/// Detections for a single frame, produced once by the worker that served it.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameResult {
    pub index: usize,
    pub detections: Vec<Detection>,
}

impl FrameResult {
    pub fn new(index: usize, detections: Vec<Detection>) -> Self {
        Self { index, detections }
    }

    pub fn empty(index: usize) -> Self {
        Self::new(index, Vec::new())
    }
}

/// Greedy class-aware non-maximum suppression.
///
/// Sorts by score descending and drops any detection overlapping an already
/// kept detection of the same class by more than `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.label == det.label && k.bbox.iou(&det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, label: u32, score: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            label,
            score,
        }
    }

    #[test]
    fn test_iou_identical_boxes() {
        let a = BoundingBox::new(10.0, 10.0, 110.0, 110.0);
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        // intersection 50*100 = 5000, union 15000
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(50.0, 0.0, 150.0, 100.0);
        assert_relative_eq!(a.iou(&b), 5000.0 / 15000.0);
    }

    #[rstest]
    #[case::disjoint(BoundingBox::new(0.0, 0.0, 50.0, 50.0), BoundingBox::new(100.0, 100.0, 150.0, 150.0))]
    #[case::touching(BoundingBox::new(0.0, 0.0, 50.0, 50.0), BoundingBox::new(50.0, 0.0, 100.0, 50.0))]
    #[case::degenerate(BoundingBox::new(0.0, 0.0, 0.0, 100.0), BoundingBox::new(0.0, 0.0, 50.0, 50.0))]
    fn test_iou_zero(#[case] a: BoundingBox, #[case] b: BoundingBox) {
        assert_relative_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_from_center() {
        let b = BoundingBox::from_center(50.0, 40.0, 20.0, 10.0);
        assert_relative_eq!(b.x1, 40.0);
        assert_relative_eq!(b.y1, 35.0);
        assert_relative_eq!(b.x2, 60.0);
        assert_relative_eq!(b.y2, 45.0);
    }

    #[test]
    fn test_pixel_rect_clamps_to_frame() {
        let b = BoundingBox::new(-10.0, 5.4, 200.0, 30.6);
        let rect = b.to_pixel_rect(100, 50).unwrap();
        assert_eq!(
            rect,
            PixelRect {
                left: 0,
                top: 5,
                right: 99,
                bottom: 31
            }
        );
    }

    #[rstest]
    #[case::left_of_frame(BoundingBox::new(-50.0, 0.0, -1.0, 10.0))]
    #[case::below_frame(BoundingBox::new(0.0, 60.0, 10.0, 80.0))]
    #[case::nan(BoundingBox::new(f32::NAN, 0.0, 10.0, 10.0))]
    fn test_pixel_rect_outside_is_none(#[case] b: BoundingBox) {
        assert!(b.to_pixel_rect(100, 50).is_none());
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap() {
        let kept = non_max_suppression(
            vec![
                det(0.0, 0.0, 100.0, 100.0, 0, 0.8),
                det(5.0, 5.0, 105.0, 105.0, 0, 0.9),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 1);
        assert_relative_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn test_nms_keeps_overlapping_boxes_of_different_classes() {
        let kept = non_max_suppression(
            vec![
                det(0.0, 0.0, 100.0, 100.0, 0, 0.8),
                det(5.0, 5.0, 105.0, 105.0, 2, 0.9),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_nms_empty_input() {
        assert!(non_max_suppression(Vec::new(), 0.45).is_empty());
    }

    #[test]
    fn test_empty_frame_result() {
        let result = FrameResult::empty(3);
        assert_eq!(result.index, 3);
        assert!(result.detections.is_empty());
    }
}
