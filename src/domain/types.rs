//! Per-request values flowing through the cascade.

use crate::pipeline::stats::ResponseLog;
use crate::processors::geometry::{BoundingBox, Quad};
use crate::utils::transform::Homography;
use serde::Serialize;
use std::collections::BTreeMap;

/// Coarse rotation class predicted by the boundary model.
///
/// The class is the clockwise quarter turn that makes the document upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Rotation {
    /// Already upright.
    #[default]
    Deg0,
    /// Needs a quarter turn clockwise.
    Deg90,
    /// Upside down.
    Deg180,
    /// Needs a quarter turn counter-clockwise.
    Deg270,
}

impl Rotation {
    /// Maps a model class index onto a rotation. Indices wrap modulo four.
    pub fn from_class_index(index: i64) -> Self {
        match index.rem_euclid(4) {
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            3 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    /// Rotation in degrees.
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether the class swaps width and height.
    pub fn is_transposed(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

/// Outcome of one boundary attempt. `bbox == None` means no boundary was found.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundaryResult {
    /// Document box in the attempt image's pixel coordinates.
    pub bbox: Option<BoundingBox>,
    /// Detection confidence.
    pub score: f32,
    /// Coarse rotation class.
    pub rotation: Rotation,
    /// Fine angle in degrees.
    pub angle: f32,
    /// Document outline, when a mask or keypoints were available.
    pub quad: Option<Quad>,
    /// Transform from the attempt image onto the rectified frame.
    pub homography: Option<Homography>,
    /// Size of the rectified frame the homography targets.
    pub rectified_size: Option<(u32, u32)>,
}

impl BoundaryResult {
    /// The "nothing found" result.
    pub fn not_found() -> Self {
        Self {
            bbox: None,
            score: 0.0,
            rotation: Rotation::Deg0,
            angle: 0.0,
            quad: None,
            homography: None,
            rectified_size: None,
        }
    }

    /// Whether a boundary box was found.
    pub fn is_found(&self) -> bool {
        self.bbox.is_some()
    }
}

/// Where the frame handed to field detection came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FrameSource {
    /// First attempt on the orientation-normalized input.
    Original,
    /// Rotation sweep succeeded at this angle.
    Rotated {
        /// Counter-clockwise angle in degrees.
        angle: f32,
    },
    /// Erosion retry succeeded in this round (1-based).
    Eroded {
        /// Erosion round.
        round: usize,
    },
    /// No usable boundary; the whole image is the document.
    WholeImage,
}

impl FrameSource {
    /// Whether a retry strategy produced the frame.
    pub fn is_retry(&self) -> bool {
        matches!(self, FrameSource::Rotated { .. } | FrameSource::Eroded { .. })
    }
}

impl std::fmt::Display for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameSource::Original => write!(f, "original"),
            FrameSource::Rotated { angle } => write!(f, "rotated_{angle}"),
            FrameSource::Eroded { round } => write!(f, "eroded_{round}"),
            FrameSource::WholeImage => write!(f, "whole_image"),
        }
    }
}

/// A detected (or injected) field region in rectified-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldBox {
    /// Field class identifier.
    pub class: String,
    /// Detection confidence; zero for injected boxes.
    pub score: f32,
    /// Region in the rectified image.
    pub bbox: BoundingBox,
    /// Injected from the document type's backup positions.
    pub synthetic: bool,
}

impl FieldBox {
    /// Creates a detected field box.
    pub fn new(class: impl Into<String>, score: f32, bbox: BoundingBox) -> Self {
        Self {
            class: class.into(),
            score,
            bbox,
            synthetic: false,
        }
    }

    /// Creates a zero-score placeholder box.
    pub fn synthetic(class: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            class: class.into(),
            score: 0.0,
            bbox,
            synthetic: true,
        }
    }
}

/// Field boxes in reading order: lines top to bottom, boxes left to right.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldBoxSet {
    boxes: Vec<FieldBox>,
}

impl FieldBoxSet {
    /// Sorts `boxes` into reading order.
    ///
    /// Boxes are grouped into lines greedily by vertical overlap with the first box
    /// of the current line, then each line is sorted by its left edge.
    pub fn from_unsorted(mut boxes: Vec<FieldBox>) -> Self {
        boxes.sort_by(|a, b| {
            a.bbox
                .y1
                .total_cmp(&b.bbox.y1)
                .then(a.bbox.x1.total_cmp(&b.bbox.x1))
        });
        let mut lines: Vec<Vec<FieldBox>> = Vec::new();
        for field in boxes {
            match lines.last_mut() {
                Some(line) if line[0].bbox.vertical_overlap(&field.bbox) >= 0.5 => line.push(field),
                _ => lines.push(vec![field]),
            }
        }
        let boxes = lines
            .into_iter()
            .flat_map(|mut line| {
                line.sort_by(|a, b| a.bbox.x1.total_cmp(&b.bbox.x1));
                line
            })
            .collect();
        Self { boxes }
    }

    /// Number of boxes.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Iterates in reading order.
    pub fn iter(&self) -> std::slice::Iter<'_, FieldBox> {
        self.boxes.iter()
    }

    /// Boxes of one class, in reading order.
    pub fn of_class<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a FieldBox> + 'a {
        self.boxes.iter().filter(move |b| b.class == class)
    }

    /// Borrowed slice in reading order.
    pub fn as_slice(&self) -> &[FieldBox] {
        &self.boxes
    }

    /// Consumes the set.
    pub fn into_vec(self) -> Vec<FieldBox> {
        self.boxes
    }
}

impl<'a> IntoIterator for &'a FieldBoxSet {
    type Item = &'a FieldBox;
    type IntoIter = std::slice::Iter<'a, FieldBox>;

    fn into_iter(self) -> Self::IntoIter {
        self.boxes.iter()
    }
}

/// Text read from one field box.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedText {
    /// The box the text was read from.
    pub field: FieldBox,
    /// Decoded string.
    pub text: String,
    /// Mean per-character probability.
    pub confidence: f32,
    /// Symbols the vocabulary was restricted to; `None` for the full table.
    pub charset: Option<String>,
}

/// Final extraction result for one document.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedRecord {
    /// Resolved document type.
    pub document_type: String,
    /// Field class to final value.
    pub fields: BTreeMap<String, String>,
    /// Reference to the debug snapshot, when one was written.
    pub savepath: Option<String>,
    /// Locator strategy that produced the frame.
    pub frame_source: FrameSource,
    /// Stage timings and call counts.
    pub response_log: ResponseLog,
}

impl NormalizedRecord {
    /// Value of a field, if present.
    pub fn get(&self, class: &str) -> Option<&str> {
        self.fields.get(class).map(String::as_str)
    }
}
