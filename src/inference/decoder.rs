//! YOLO output decoding
//!
//! The model emits a channel-major `[84, 8400]` tensor: rows 0..4 are the box
//! parameters (center x, center y, width, height in model-input pixels), rows 4..84
//! the per-class scores. Decoding keeps anchors whose best class score exceeds the
//! confidence threshold, converts them to normalized corners and runs greedy NMS.

use super::labels;
use super::{Detection, InferenceError};
use crate::config::{BackendMode, InferenceConfig};
use log::warn;

const BOX_PARAMS: usize = 4;

/// Axis-aligned box in normalized corner form
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    /// Corners from a center/size box, dividing by the model input resolution
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32, input_size: f32) -> Self {
        Self {
            xmin: (cx - w / 2.0) / input_size,
            ymin: (cy - h / 2.0) / input_size,
            xmax: (cx + w / 2.0) / input_size,
            ymax: (cy + h / 2.0) / input_size,
        }
    }

    pub fn area(&self) -> f32 {
        (self.xmax - self.xmin) * (self.ymax - self.ymin)
    }
}

/// Intersection over union; 0 when the boxes do not overlap
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let ix = (a.xmax.min(b.xmax) - a.xmin.max(b.xmin)).max(0.0);
    let iy = (a.ymax.min(b.ymax) - a.ymin.max(b.ymin)).max(0.0);
    let inter = ix * iy;
    if inter <= 0.0 {
        return 0.0;
    }
    inter / (a.area() + b.area() - inter)
}

/// One thresholded anchor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub class_index: usize,
    pub score: f32,
    pub bbox: BBox,
}

/// Greedy suppression: repeatedly keep the best remaining candidate and drop everything
/// overlapping it with IoU >= `threshold`. Output is in descending score order.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept = Vec::new();
    let mut pool = candidates;
    while !pool.is_empty() {
        let best = pool.remove(0);
        pool.retain(|c| iou(&best.bbox, &c.bbox) < threshold);
        kept.push(best);
    }
    kept
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderConfig {
    pub input_size: u32,
    pub num_classes: usize,
    pub num_anchors: usize,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            num_classes: 80,
            num_anchors: 8400,
            confidence_threshold: 0.7,
            iou_threshold: 0.5,
        }
    }
}

impl DecoderConfig {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            ..Self::default()
        }
    }

    pub fn channels(&self) -> usize {
        BOX_PARAMS + self.num_classes
    }

    pub fn tensor_len(&self) -> usize {
        self.channels() * self.num_anchors
    }
}

/// Result of decoding one output tensor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeOutcome {
    pub detections: Vec<Detection>,
    /// Anchors above the confidence threshold
    pub candidates: usize,
    /// Boxes surviving NMS that fell outside the unit square and were withheld
    pub out_of_bounds: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionDecoder {
    config: DecoderConfig,
}

impl DetectionDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Thresholded candidates, before suppression
    pub fn candidates(&self, output: &[f32]) -> Result<Vec<Candidate>, InferenceError> {
        let cfg = &self.config;
        if output.len() != cfg.tensor_len() {
            return Err(InferenceError::OutputShape(format!(
                "expected {} values ({}x{}), got {}",
                cfg.tensor_len(),
                cfg.channels(),
                cfg.num_anchors,
                output.len()
            )));
        }

        let n = cfg.num_anchors;
        let at = |channel: usize, anchor: usize| output[channel * n + anchor];
        let input_size = cfg.input_size as f32;

        let mut candidates = Vec::new();
        for anchor in 0..n {
            let mut best_score = 0.0f32;
            let mut best_class = None;
            for class in 0..cfg.num_classes {
                let score = at(BOX_PARAMS + class, anchor);
                if score > best_score {
                    best_score = score;
                    best_class = Some(class);
                }
            }

            let Some(class_index) = best_class else { continue };
            if best_score <= cfg.confidence_threshold {
                continue;
            }

            let bbox = BBox::from_center(
                at(0, anchor),
                at(1, anchor),
                at(2, anchor),
                at(3, anchor),
                input_size,
            );
            candidates.push(Candidate {
                class_index,
                score: best_score,
                bbox,
            });
        }
        Ok(candidates)
    }

    pub fn decode(&self, output: &[f32]) -> Result<DecodeOutcome, InferenceError> {
        let candidates = self.candidates(output)?;
        let candidate_count = candidates.len();
        let kept = non_max_suppression(candidates, self.config.iou_threshold);

        let mut outcome = DecodeOutcome {
            candidates: candidate_count,
            ..Default::default()
        };
        for c in kept {
            let detection = Detection {
                label: labels::label(c.class_index).to_string(),
                score: c.score,
                xmin: c.bbox.xmin,
                ymin: c.bbox.ymin,
                xmax: c.bbox.xmax,
                ymax: c.bbox.ymax,
                backend: BackendMode::Local,
            };
            if detection.is_normalized() {
                outcome.detections.push(detection);
            } else {
                outcome.out_of_bounds += 1;
            }
        }

        if outcome.out_of_bounds > 0 {
            warn!(
                "Withheld {} detection(s) outside the unit square (not clamped)",
                outcome.out_of_bounds
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(score: f32, bbox: BBox) -> Candidate {
        Candidate {
            class_index: 0,
            score,
            bbox,
        }
    }

    /// Build a tensor with the given anchors set; everything else zero
    fn tensor(cfg: &DecoderConfig, anchors: &[(usize, [f32; 4], usize, f32)]) -> Vec<f32> {
        let n = cfg.num_anchors;
        let mut data = vec![0.0f32; cfg.tensor_len()];
        for &(anchor, [cx, cy, w, h], class, score) in anchors {
            data[anchor] = cx;
            data[n + anchor] = cy;
            data[2 * n + anchor] = w;
            data[3 * n + anchor] = h;
            data[(BOX_PARAMS + class) * n + anchor] = score;
        }
        data
    }

    #[test]
    fn test_iou_identity_disjoint_symmetric() {
        let a = BBox::new(0.1, 0.1, 0.4, 0.5);
        let b = BBox::new(0.2, 0.3, 0.6, 0.7);
        let far = BBox::new(0.7, 0.7, 0.9, 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &far), 0.0);
        assert_eq!(iou(&a, &b), iou(&b, &a));

        // touching edges do not overlap
        let left = BBox::new(0.0, 0.0, 0.5, 1.0);
        let right = BBox::new(0.5, 0.0, 1.0, 1.0);
        assert_eq!(iou(&left, &right), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = BBox::new(0.0, 0.0, 0.4, 0.4);
        let b = BBox::new(0.2, 0.0, 0.6, 0.4);
        // inter 0.08, union 0.24
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_drops_lower_scoring_overlap() {
        let strong = candidate(0.9, BBox::new(0.1, 0.1, 0.5, 0.5));
        let weak = candidate(0.8, BBox::new(0.11, 0.1, 0.51, 0.5));
        assert!(iou(&strong.bbox, &weak.bbox) >= 0.5);

        let kept = non_max_suppression(vec![weak, strong], 0.5);
        assert_eq!(kept, vec![strong]);
    }

    #[test]
    fn test_nms_keeps_disjoint_boxes_in_score_order() {
        let a = candidate(0.75, BBox::new(0.0, 0.0, 0.2, 0.2));
        let b = candidate(0.95, BBox::new(0.5, 0.5, 0.7, 0.7));
        let c = candidate(0.85, BBox::new(0.8, 0.0, 1.0, 0.2));
        let kept = non_max_suppression(vec![a, b, c], 0.5);
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.95, 0.85, 0.75]);
    }

    #[test]
    fn test_nms_iou_exactly_at_threshold_is_suppressed() {
        let a = candidate(0.9, BBox::new(0.0, 0.0, 0.75, 0.5));
        // inter 0.25, union 0.5
        let b = candidate(0.8, BBox::new(0.25, 0.0, 1.0, 0.5));
        assert_eq!(iou(&a.bbox, &b.bbox), 0.5);
        let kept = non_max_suppression(vec![a, b], 0.5);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let cfg = DecoderConfig::default();
        let decoder = DetectionDecoder::new(cfg);
        let data = tensor(
            &cfg,
            &[
                (10, [320.0, 320.0, 64.0, 64.0], 0, 0.7),
                (20, [100.0, 100.0, 40.0, 40.0], 2, 0.71),
            ],
        );
        let candidates = decoder.candidates(&data).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_index, 2);
    }

    #[test]
    fn test_decode_converts_and_labels() {
        let cfg = DecoderConfig::default();
        let decoder = DetectionDecoder::new(cfg);
        let data = tensor(
            &cfg,
            &[
                (0, [320.0, 160.0, 128.0, 64.0], 0, 0.9),
                // near-duplicate of anchor 0, suppressed
                (1, [322.0, 160.0, 128.0, 64.0], 0, 0.8),
                (500, [64.0, 576.0, 64.0, 64.0], 16, 0.95),
            ],
        );
        let outcome = decoder.decode(&data).unwrap();
        assert_eq!(outcome.candidates, 3);
        assert_eq!(outcome.detections.len(), 2);

        let dog = &outcome.detections[0];
        assert_eq!(dog.label, "dog");
        assert!((dog.xmin - 0.05).abs() < 1e-6);
        assert!((dog.ymax - 0.95).abs() < 1e-6);

        let person = &outcome.detections[1];
        assert_eq!(person.label, "person");
        assert!((person.xmin - 0.4).abs() < 1e-6);
        assert!((person.ymin - 0.2).abs() < 1e-6);
        assert!((person.xmax - 0.6).abs() < 1e-6);
        assert!((person.ymax - 0.3).abs() < 1e-6);
        assert!(outcome.detections.iter().all(|d| d.is_normalized()));
        assert!(outcome.detections.iter().all(|d| d.backend == BackendMode::Local));
    }

    #[test]
    fn test_single_rescale_matches_two_step_normalization() {
        // pixel conversion against the frame followed by re-normalization by the same frame
        let (cx, cy, w, h) = (300.0f32, 200.0f32, 120.0f32, 80.0f32);
        let (frame_w, frame_h) = (1280.0f32, 720.0f32);
        let two_step_xmin = ((cx - w / 2.0) / 640.0 * frame_w) / frame_w;
        let two_step_ymax = ((cy + h / 2.0) / 640.0 * frame_h) / frame_h;

        let bbox = BBox::from_center(cx, cy, w, h, 640.0);
        assert!((bbox.xmin - two_step_xmin).abs() < 1e-6);
        assert!((bbox.ymax - two_step_ymax).abs() < 1e-6);
    }

    #[test]
    fn test_boxes_crossing_frame_edge_are_flagged_not_clamped() {
        let cfg = DecoderConfig::default();
        let decoder = DetectionDecoder::new(cfg);
        let data = tensor(
            &cfg,
            &[
                (3, [10.0, 320.0, 60.0, 60.0], 0, 0.9),
                (4, [320.0, 320.0, 60.0, 60.0], 0, 0.8),
            ],
        );
        let outcome = decoder.decode(&data).unwrap();
        assert_eq!(outcome.out_of_bounds, 1);
        assert_eq!(outcome.detections.len(), 1);
        assert!(outcome.detections[0].xmin > 0.0);
    }

    #[test]
    fn test_wrong_tensor_length_is_an_error() {
        let decoder = DetectionDecoder::default();
        assert!(matches!(
            decoder.decode(&[0.0; 84]),
            Err(InferenceError::OutputShape(_))
        ));
    }
}
