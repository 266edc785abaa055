//! Weighted box fusion (WBF) of independent detection sets.
//!
//! Boxes from every set are normalised into `[0,1]×[0,1]` with the true
//! image dimensions, clustered per label by IoU against each cluster's
//! running fused box, and every cluster collapses into one score-weighted
//! box. The result is denormalised back to pixels and tagged
//! [`DetectionSource::Fused`].
//!
//! ```text
//! sets ──normalise──▶ per-label clusters ──weighted mean──▶ fused boxes
//!        (true dims)     (IoU ≥ threshold)     (mean score, decayed)
//! ```
//!
//! Degraded modes are reported through [`FusionMode`] rather than hidden:
//! `Concatenated` when fusion is disabled, `InferredScale` when the image
//! size is unknown and the scale had to be guessed from the boxes.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detection::{BoundingBox, Detection, DetectionSource, ImageDims};

/// Tuning for [`fuse`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionParams {
    /// Minimum IoU for a box to join a cluster of the same label.
    pub iou_threshold: f64,
    /// Boxes scoring below this are dropped before clustering.
    pub skip_threshold: f64,
    /// Scale a cluster's score by `min(sets, members) / sets`.
    pub decay_unmatched: bool,
    /// When false, inputs are concatenated untouched.
    pub enabled: bool,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            skip_threshold: 0.0,
            decay_unmatched: true,
            enabled: true,
        }
    }
}

impl FusionParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "iou_threshold must be in [0, 1], got {}",
                self.iou_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.skip_threshold) {
            return Err(format!(
                "skip_threshold must be in [0, 1], got {}",
                self.skip_threshold
            ));
        }
        Ok(())
    }
}

/// How the output of [`fuse`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Full WBF with the true image dimensions.
    Weighted,
    /// WBF with a scale inferred from the largest box coordinates.
    InferredScale,
    /// Fusion disabled; inputs concatenated.
    Concatenated,
    /// Only one set had boxes; it is returned unchanged.
    PassThrough,
    /// No input boxes at all.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionOutcome {
    pub detections: Vec<Detection>,
    pub mode: FusionMode,
}

impl FusionOutcome {
    /// Whether the caller received reduced-quality output.
    pub fn is_degraded(&self) -> bool {
        matches!(self.mode, FusionMode::InferredScale | FusionMode::Concatenated)
    }
}

#[derive(Debug, Clone)]
struct NormBox {
    label: u32,
    class_name: String,
    score: f64,
    coords: [f64; 4],
}

#[derive(Debug)]
struct Cluster {
    members: Vec<NormBox>,
    fused: [f64; 4],
}

impl Cluster {
    fn new(first: NormBox) -> Self {
        let fused = first.coords;
        Self {
            members: vec![first],
            fused,
        }
    }

    fn push(&mut self, member: NormBox) {
        self.members.push(member);
        let weight: f64 = self.members.iter().map(|m| m.score).sum();
        let mut fused = [0.0; 4];
        if weight > 0.0 {
            for m in &self.members {
                for (acc, c) in fused.iter_mut().zip(m.coords) {
                    *acc += m.score * c;
                }
            }
            for acc in &mut fused {
                *acc /= weight;
            }
        } else {
            // All-zero scores: fall back to an unweighted mean.
            let n = self.members.len() as f64;
            for m in &self.members {
                for (acc, c) in fused.iter_mut().zip(m.coords) {
                    *acc += c / n;
                }
            }
        }
        self.fused = fused;
    }

    fn mean_score(&self) -> f64 {
        self.members.iter().map(|m| m.score).sum::<f64>() / self.members.len() as f64
    }
}

fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    BoundingBox::new(a[0], a[1], a[2], a[3]).iou(&BoundingBox::new(b[0], b[1], b[2], b[3]))
}

fn by_score_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Merge several detectors' outputs for one image into a consensus set.
///
/// `dims` should be the real image size; `None` (or a zero side) falls back
/// to [`FusionMode::InferredScale`].
pub fn fuse(sets: &[Vec<Detection>], dims: Option<ImageDims>, params: &FusionParams) -> FusionOutcome {
    let total: usize = sets.iter().map(Vec::len).sum();
    if total == 0 {
        return FusionOutcome {
            detections: Vec::new(),
            mode: FusionMode::Empty,
        };
    }

    if !params.enabled {
        warn!(sets = sets.len(), total, "fusion disabled, concatenating detections");
        return FusionOutcome {
            detections: sets.iter().flatten().cloned().collect(),
            mode: FusionMode::Concatenated,
        };
    }

    let non_empty = sets.iter().filter(|s| !s.is_empty()).count();
    if non_empty < 2 {
        return FusionOutcome {
            detections: sets.iter().flatten().cloned().collect(),
            mode: FusionMode::PassThrough,
        };
    }

    let (scale_x, scale_y, mode) = match dims.filter(ImageDims::is_valid) {
        Some(d) => (f64::from(d.width), f64::from(d.height), FusionMode::Weighted),
        None => {
            let max_x = sets.iter().flatten().map(|d| d.bbox.x2).fold(1.0, f64::max);
            let max_y = sets.iter().flatten().map(|d| d.bbox.y2).fold(1.0, f64::max);
            warn!(
                max_x,
                max_y, "image dimensions unavailable, inferring fusion scale from boxes"
            );
            (max_x, max_y, FusionMode::InferredScale)
        }
    };

    let mut by_label: BTreeMap<u32, Vec<NormBox>> = BTreeMap::new();
    for det in sets.iter().flatten() {
        if !det.confidence.is_finite() {
            debug!(class_id = det.class_id, "dropping box with non-finite confidence");
            continue;
        }
        if det.confidence < params.skip_threshold {
            continue;
        }
        let norm = |v: f64, scale: f64| (v / scale).clamp(0.0, 1.0);
        let (mut x1, mut x2) = (norm(det.bbox.x1, scale_x), norm(det.bbox.x2, scale_x));
        let (mut y1, mut y2) = (norm(det.bbox.y1, scale_y), norm(det.bbox.y2, scale_y));
        if x2 < x1 {
            std::mem::swap(&mut x1, &mut x2);
        }
        if y2 < y1 {
            std::mem::swap(&mut y1, &mut y2);
        }
        if (x2 - x1) * (y2 - y1) <= 0.0 {
            debug!(class_id = det.class_id, "dropping zero-area box before fusion");
            continue;
        }
        by_label.entry(det.class_id).or_default().push(NormBox {
            label: det.class_id,
            class_name: det.class_name.clone(),
            score: det.confidence.clamp(0.0, 1.0),
            coords: [x1, y1, x2, y2],
        });
    }

    let set_count = sets.len() as f64;
    let mut fused = Vec::new();
    for (_, mut boxes) in by_label {
        boxes.sort_by(|a, b| by_score_desc(a.score, b.score));

        let mut clusters: Vec<Cluster> = Vec::new();
        for candidate in boxes {
            let best = clusters
                .iter()
                .enumerate()
                .map(|(i, c)| (i, iou(&c.fused, &candidate.coords)))
                .filter(|(_, overlap)| *overlap >= params.iou_threshold)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
            match best {
                Some((i, _)) => clusters[i].push(candidate),
                None => clusters.push(Cluster::new(candidate)),
            }
        }

        for cluster in clusters {
            let mut score = cluster.mean_score();
            if params.decay_unmatched {
                let contributing = (cluster.members.len() as f64).min(set_count);
                score *= contributing / set_count;
            }
            let head = &cluster.members[0];
            let [x1, y1, x2, y2] = cluster.fused;
            fused.push(Detection {
                class_id: head.label,
                class_name: head.class_name.clone(),
                confidence: score.clamp(0.0, 1.0),
                bbox: BoundingBox::new(x1 * scale_x, y1 * scale_y, x2 * scale_x, y2 * scale_y),
                source: DetectionSource::Fused,
            });
        }
    }

    fused.sort_by(|a, b| by_score_desc(a.confidence, b.confidence));
    debug!(inputs = total, outputs = fused.len(), ?mode, "weighted box fusion complete");
    FusionOutcome {
        detections: fused,
        mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: u32, conf: f64, b: [f64; 4], source: DetectionSource) -> Detection {
        Detection::new(class_id, conf, BoundingBox::new(b[0], b[1], b[2], b[3]), source)
    }

    #[test]
    fn test_empty_input_is_empty_outcome() {
        let out = fuse(&[vec![], vec![]], Some(ImageDims::new(100, 100)), &FusionParams::default());
        assert!(out.detections.is_empty());
        assert_eq!(out.mode, FusionMode::Empty);
        assert!(!out.is_degraded());
    }

    #[test]
    fn test_different_labels_never_merge() {
        let a = vec![det(3, 0.8, [100.0, 100.0, 300.0, 300.0], DetectionSource::Detector)];
        let b = vec![det(5, 0.6, [100.0, 100.0, 300.0, 300.0], DetectionSource::VisionModel)];
        let out = fuse(&[a, b], Some(ImageDims::new(1000, 1000)), &FusionParams::default());
        assert_eq!(out.detections.len(), 2);
        assert!(out.detections.iter().all(|d| d.source == DetectionSource::Fused));
        // unmatched boxes are decayed by half with two sets
        assert!((out.detections[0].confidence - 0.4).abs() < 1e-9);
        assert!((out.detections[1].confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_decay_can_be_disabled() {
        let a = vec![det(3, 0.8, [0.0, 0.0, 100.0, 100.0], DetectionSource::Detector)];
        let b = vec![det(5, 0.6, [500.0, 500.0, 600.0, 600.0], DetectionSource::VisionModel)];
        let params = FusionParams {
            decay_unmatched: false,
            ..FusionParams::default()
        };
        let out = fuse(&[a, b], Some(ImageDims::new(1000, 1000)), &params);
        assert!((out.detections[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_confidence_is_dropped() {
        let mut broken = det(0, 0.9, [100.0, 100.0, 200.0, 200.0], DetectionSource::Detector);
        broken.confidence = f64::NAN;
        let a = vec![broken];
        let b = vec![det(0, 0.6, [100.0, 100.0, 200.0, 200.0], DetectionSource::VisionModel)];
        let out = fuse(&[a, b], Some(ImageDims::new(1000, 1000)), &FusionParams::default());
        assert_eq!(out.detections.len(), 1);
        let conf = out.detections[0].confidence;
        assert!(conf.is_finite() && (0.0..=1.0).contains(&conf));
    }

    #[test]
    fn test_fused_box_is_score_weighted() {
        let a = vec![det(0, 0.9, [100.0, 100.0, 200.0, 200.0], DetectionSource::Detector)];
        let b = vec![det(0, 0.3, [110.0, 110.0, 210.0, 210.0], DetectionSource::VisionModel)];
        let out = fuse(&[a, b], Some(ImageDims::new(1000, 1000)), &FusionParams::default());
        assert_eq!(out.detections.len(), 1);
        let fused = &out.detections[0];
        // (0.9*100 + 0.3*110) / 1.2 = 102.5
        assert!((fused.bbox.x1 - 102.5).abs() < 1e-6);
        assert!((fused.bbox.x2 - 202.5).abs() < 1e-6);
        assert!((fused.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_skip_threshold_drops_weak_boxes() {
        let a = vec![det(0, 0.05, [0.0, 0.0, 50.0, 50.0], DetectionSource::Detector)];
        let b = vec![det(1, 0.7, [0.0, 0.0, 50.0, 50.0], DetectionSource::VisionModel)];
        let params = FusionParams {
            skip_threshold: 0.1,
            ..FusionParams::default()
        };
        let out = fuse(&[a, b], Some(ImageDims::new(100, 100)), &params);
        assert_eq!(out.detections.len(), 1);
        assert_eq!(out.detections[0].class_id, 1);
    }

    #[test]
    fn test_disabled_fusion_concatenates_and_reports_degraded() {
        let a = vec![det(0, 0.9, [0.0, 0.0, 10.0, 10.0], DetectionSource::Detector)];
        let b = vec![det(0, 0.8, [0.0, 0.0, 10.0, 10.0], DetectionSource::VisionModel)];
        let params = FusionParams {
            enabled: false,
            ..FusionParams::default()
        };
        let out = fuse(&[a, b], Some(ImageDims::new(100, 100)), &params);
        assert_eq!(out.mode, FusionMode::Concatenated);
        assert!(out.is_degraded());
        assert_eq!(out.detections.len(), 2);
        assert!(out.detections.iter().all(|d| d.source != DetectionSource::Fused));
    }

    #[test]
    fn test_missing_dimensions_use_inferred_scale() {
        let a = vec![det(0, 0.9, [100.0, 100.0, 200.0, 200.0], DetectionSource::Detector)];
        let b = vec![det(0, 0.7, [100.0, 100.0, 200.0, 200.0], DetectionSource::VisionModel)];
        let out = fuse(&[a, b], None, &FusionParams::default());
        assert_eq!(out.mode, FusionMode::InferredScale);
        assert!(out.is_degraded());
        assert_eq!(out.detections.len(), 1);
        assert!((out.detections[0].bbox.x2 - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_sized_dimensions_count_as_missing() {
        let a = vec![det(0, 0.9, [10.0, 10.0, 20.0, 20.0], DetectionSource::Detector)];
        let b = vec![det(0, 0.9, [10.0, 10.0, 20.0, 20.0], DetectionSource::VisionModel)];
        let out = fuse(&[a, b], Some(ImageDims::new(0, 512)), &FusionParams::default());
        assert_eq!(out.mode, FusionMode::InferredScale);
    }
}
