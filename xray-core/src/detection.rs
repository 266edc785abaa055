//! Detection data model shared by the detector, the vision model and fusion.

use serde::{Deserialize, Serialize};

/// VinDr-CXR finding vocabulary; a detection's `class_id` indexes this list.
pub const VINDR_CLASSES: [&str; 22] = [
    "Aortic enlargement",
    "Atelectasis",
    "Calcification",
    "Cardiomegaly",
    "Clavicle fracture",
    "Consolidation",
    "Edema",
    "Emphysema",
    "Enlarged PA",
    "ILD",
    "Infiltration",
    "Lung Opacity",
    "Lung cavity",
    "Lung cyst",
    "Mediastinal shift",
    "Nodule/Mass",
    "Pleural effusion",
    "Pleural thickening",
    "Pneumothorax",
    "Pulmonary fibrosis",
    "Rib fracture",
    "Other lesion",
];

/// Display name for a class id, `class_<id>` outside the vocabulary.
pub fn class_name_for(class_id: u32) -> String {
    VINDR_CLASSES
        .get(class_id as usize)
        .map(|name| (*name).to_string())
        .unwrap_or_else(|| format!("class_{class_id}"))
}

/// Which model produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    /// Bounding-box detector (YOLO family).
    Detector,
    /// Vision-language model box proposals.
    VisionModel,
    /// Output of weighted box fusion.
    Fused,
}

/// Axis-aligned box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Intersection over union; 0.0 when either box is degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// A single predicted finding. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub bbox: BoundingBox,
    pub source: DetectionSource,
}

impl Detection {
    /// Build a detection, naming the class from [`VINDR_CLASSES`] and
    /// clamping the confidence into `[0, 1]`.
    pub fn new(class_id: u32, confidence: f64, bbox: BoundingBox, source: DetectionSource) -> Self {
        Self {
            class_id,
            class_name: class_name_for(class_id),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            source,
        }
    }
}

/// Pixel dimensions of the image a detection set was produced on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

impl ImageDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both sides non-zero.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}
