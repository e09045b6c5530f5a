use std::sync::Arc;

use image::{Rgb, RgbImage};

use crate::labels::label_registry::{Color, LabelRegistry};
use crate::shared::constants::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::shared::detection::{Detection, FrameResult, PixelRect};
use crate::shared::frame::{AnnotatedFrame, Frame};

use super::glyphs;

const LINE_WIDTH: u32 = 2;
const CAPTION_PADDING: u32 = 2;

/// Composites detection boxes and captions onto frames.
///
/// Stateless after construction: `annotate` never mutates its inputs, so
/// one instance can be shared across threads working on disjoint frames.
#[derive(Clone, Debug)]
pub struct Annotator {
    registry: Arc<LabelRegistry>,
    confidence_threshold: f32,
}

impl Annotator {
    pub fn new(registry: Arc<LabelRegistry>, confidence_threshold: f32) -> Self {
        Self {
            registry,
            confidence_threshold,
        }
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Detections that will be drawn: strictly above the threshold.
    pub fn visible<'a>(&self, result: &'a FrameResult) -> Vec<&'a Detection> {
        result
            .detections
            .iter()
            .filter(|d| d.score > self.confidence_threshold)
            .collect()
    }

    pub fn annotate(&self, frame: &Frame, result: &FrameResult) -> AnnotatedFrame {
        debug_assert_eq!(frame.index(), result.index, "result belongs to another frame");

        let visible = self.visible(result);
        if visible.is_empty() || frame.channels() != 3 {
            return AnnotatedFrame::new(frame.clone(), 0);
        }

        let (width, height) = frame.dimensions();
        let Some(mut image) = RgbImage::from_raw(width, height, frame.data().to_vec()) else {
            log::warn!(
                "Frame {}: pixel buffer does not match {width}x{height}, leaving it unannotated",
                frame.index()
            );
            return AnnotatedFrame::new(frame.clone(), 0);
        };

        let mut drawn = 0;
        for det in &visible {
            let Some(rect) = det.bbox.to_pixel_rect(width, height) else {
                continue;
            };
            let entry = self.registry.lookup(det.label);
            let color = entry.color();
            draw_outline(&mut image, rect, color, LINE_WIDTH);
            let caption = format!("{} {:.0}%", entry.name(), det.score * 100.0);
            draw_caption(&mut image, rect, &caption, color);
            drawn += 1;
        }

        let annotated = Frame::new(image.into_raw(), width, height, 3, frame.index())
            .with_source(frame.source());
        AnnotatedFrame::new(annotated, drawn)
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new(Arc::new(LabelRegistry::coco()), DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

fn draw_outline(image: &mut RgbImage, rect: PixelRect, color: Color, line_width: u32) {
    let rgb = Rgb(color.0);
    for inset in 0..line_width {
        let left = rect.left + inset;
        let top = rect.top + inset;
        let (Some(right), Some(bottom)) =
            (rect.right.checked_sub(inset), rect.bottom.checked_sub(inset))
        else {
            break;
        };
        if right < left || bottom < top {
            break;
        }
        for x in left..=right {
            image.put_pixel(x, top, rgb);
            image.put_pixel(x, bottom, rgb);
        }
        for y in top..=bottom {
            image.put_pixel(left, y, rgb);
            image.put_pixel(right, y, rgb);
        }
    }
}

/// Filled strip with the caption, placed above the box, or inside it when
/// the box touches the top edge.
fn draw_caption(image: &mut RgbImage, rect: PixelRect, caption: &str, color: Color) {
    let strip_h = glyphs::GLYPH_HEIGHT + 2 * CAPTION_PADDING;
    let strip_w = glyphs::text_width(caption) + 2 * CAPTION_PADDING;
    let top = if rect.top >= strip_h {
        rect.top - strip_h
    } else {
        rect.top
    };
    let right = (rect.left + strip_w).min(image.width());
    let bottom = (top + strip_h).min(image.height());

    let fill = Rgb(color.0);
    for y in top..bottom {
        for x in rect.left..right {
            image.put_pixel(x, y, fill);
        }
    }
    glyphs::draw_text(
        image,
        (rect.left + CAPTION_PADDING) as i64,
        (top + CAPTION_PADDING) as i64,
        caption,
        Rgb(color.contrasting_text().0),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::detection::BoundingBox;

    fn frame(index: usize, value: u8) -> Frame {
        Frame::new(vec![value; 64 * 48 * 3], 64, 48, 3, index)
    }

    fn detection(score: f32, label: u32) -> Detection {
        Detection {
            bbox: BoundingBox::new(10.0, 20.0, 40.0, 40.0),
            label,
            score,
        }
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width() + x) * 3) as usize;
        [frame.data()[i], frame.data()[i + 1], frame.data()[i + 2]]
    }

    #[test]
    fn test_draws_box_outline_in_class_color() {
        let annotator = Annotator::default();
        let input = frame(0, 0);
        let out = annotator.annotate(&input, &FrameResult::new(0, vec![detection(0.9, 0)]));

        assert_eq!(out.boxes_drawn(), 1);
        let person = LabelRegistry::coco().lookup(0).color();
        assert_eq!(pixel(out.frame(), 10, 30), person.0); // left edge
        assert_eq!(pixel(out.frame(), 40, 30), person.0); // right edge
        assert_eq!(pixel(out.frame(), 25, 30), [0, 0, 0]); // interior untouched
    }

    #[test]
    fn test_never_mutates_input() {
        let annotator = Annotator::default();
        let input = frame(0, 7);
        let before = input.clone();
        annotator.annotate(&input, &FrameResult::new(0, vec![detection(0.9, 2)]));
        assert_eq!(input, before);
    }

    #[test]
    fn test_score_at_threshold_is_not_drawn() {
        let annotator = Annotator::default();
        let input = frame(0, 0);
        let out = annotator.annotate(&input, &FrameResult::new(0, vec![detection(0.5, 0)]));
        assert_eq!(out.boxes_drawn(), 0);
        assert_eq!(out.frame(), &input);
    }

    #[test]
    fn test_threshold_one_leaves_frame_pixel_identical() {
        let annotator = Annotator::new(Arc::new(LabelRegistry::coco()), 1.0);
        let input = frame(3, 99);
        let result = FrameResult::new(3, vec![detection(1.0, 0), detection(0.99, 1)]);
        let out = annotator.annotate(&input, &result);
        assert_eq!(out.frame().data(), input.data());
    }

    #[test]
    fn test_unknown_label_uses_default_color() {
        let registry = Arc::new(LabelRegistry::coco());
        let annotator = Annotator::new(registry.clone(), 0.5);
        let out = annotator.annotate(&frame(0, 0), &FrameResult::new(0, vec![detection(0.9, 999)]));
        assert_eq!(out.boxes_drawn(), 1);
        assert_eq!(pixel(out.frame(), 10, 30), registry.lookup(999).color().0);
    }

    #[test]
    fn test_box_outside_frame_is_skipped() {
        let annotator = Annotator::default();
        let off_screen = Detection {
            bbox: BoundingBox::new(500.0, 500.0, 600.0, 600.0),
            label: 0,
            score: 0.9,
        };
        let out = annotator.annotate(&frame(0, 0), &FrameResult::new(0, vec![off_screen]));
        assert_eq!(out.boxes_drawn(), 0);
    }

    #[test]
    fn test_non_rgb_frame_passes_through() {
        let annotator = Annotator::default();
        let gray = Frame::new(vec![50; 8 * 8], 8, 8, 1, 4);
        let out = annotator.annotate(&gray, &FrameResult::new(4, vec![detection(0.9, 0)]));
        assert_eq!(out.frame(), &gray);
        assert_eq!(out.boxes_drawn(), 0);
    }

    #[test]
    fn test_caption_at_top_edge_goes_inside_box() {
        let annotator = Annotator::default();
        let det = Detection {
            bbox: BoundingBox::new(0.0, 0.0, 60.0, 40.0),
            label: 0,
            score: 0.9,
        };
        let out = annotator.annotate(&frame(0, 0), &FrameResult::new(0, vec![det]));
        // Caption strip fills rows just below the top edge inside the box.
        let person = LabelRegistry::coco().lookup(0).color();
        assert_eq!(pixel(out.frame(), 1, 1), person.0);
    }

    #[test]
    fn test_deterministic() {
        let annotator = Annotator::default();
        let input = frame(0, 30);
        let result = FrameResult::new(0, vec![detection(0.9, 0), detection(0.7, 5)]);
        let a = annotator.annotate(&input, &result);
        let b = annotator.annotate(&input, &result);
        assert_eq!(a, b);
    }
}
