//! Field detector: key-value boxes on the rectified frame.
//!
//! Post-processing runs in a fixed order: rescale and threshold, class filter by
//! forced document type, per-class deduplication, backup-box injection. An empty
//! result after deduplication is [`OCRError::NoFieldsDetected`].

use super::invoker::ModelInvoker;
use crate::core::config::ExtractionConfig;
use crate::core::errors::{OCRError, OcrResult};
use crate::core::inference::TensorMap;
use crate::domain::{DedupRule, DocumentCatalog, FieldBox, FieldBoxSet};
use crate::processors::geometry::BoundingBox;
use crate::utils::image::detection_tensor;
use image::RgbImage;
use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, warn};

/// Input size used when the artifact declares dynamic spatial dimensions.
pub const DEFAULT_KV_INPUT: (u32, u32) = (640, 640);

/// Boxes found on one frame plus the document type they were resolved against.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Field boxes in reading order.
    pub boxes: FieldBoxSet,
    /// Supplied or inferred document type; `None` when no type matches.
    pub document_type: Option<String>,
}

/// Runs the key-value model and cleans up its boxes.
#[derive(Debug, Clone)]
pub struct FieldDetector {
    invoker: ModelInvoker,
    catalog: Arc<DocumentCatalog>,
    input_size: (u32, u32),
}

impl FieldDetector {
    /// Creates a detector. The model input size comes from the artifact's `image` input.
    pub fn new(invoker: ModelInvoker, catalog: Arc<DocumentCatalog>) -> Self {
        let input_size = invoker
            .input_spec("image")
            .and_then(|spec| spec.static_hw())
            .map(|(h, w)| (w, h))
            .unwrap_or(DEFAULT_KV_INPUT);
        Self {
            invoker,
            catalog,
            input_size,
        }
    }

    /// Detects field boxes on `frame`.
    ///
    /// `document_type` is the caller's hint; without one the type is inferred from
    /// the detected classes.
    pub fn detect(
        &self,
        frame: &RgbImage,
        document_type: Option<&str>,
        config: &ExtractionConfig,
    ) -> OcrResult<Detection> {
        let hinted = match document_type {
            Some(name) => Some(self.catalog.document_type(name).ok_or_else(|| {
                OCRError::invalid_input(format!("unknown document type '{name}'"))
            })?),
            None => None,
        };

        let raw = self.run_model(frame, config.kv_score_threshold)?;
        debug!(raw = raw.len(), "key-value boxes above threshold");

        let filtered: Vec<FieldBox> = match hinted {
            Some(doc) if config.force_type => raw.into_iter().filter(|b| doc.allows(&b.class)).collect(),
            _ => raw,
        };

        let mut boxes = self.dedup(filtered, frame.width(), config);
        if boxes.is_empty() {
            return Err(OCRError::NoFieldsDetected {
                document_type: document_type.unwrap_or("unknown").to_string(),
            });
        }

        let doc = hinted.or_else(|| {
            self.catalog
                .infer_type(boxes.iter().map(|b| b.class.as_str()))
        });

        if let Some(doc) = doc {
            for class in &doc.required_classes {
                if boxes.iter().any(|b| &b.class == class) {
                    continue;
                }
                if let Some(backup) = doc.backup_for(class) {
                    debug!(class = %class, "injecting backup box");
                    boxes.push(FieldBox::synthetic(
                        class.clone(),
                        backup.to_bbox(frame.width(), frame.height()),
                    ));
                }
            }
        }

        Ok(Detection {
            boxes: FieldBoxSet::from_unsorted(boxes),
            document_type: doc.map(|d| d.name.clone()),
        })
    }

    /// Runs the model and returns thresholded boxes in frame coordinates.
    fn run_model(&self, frame: &RgbImage, threshold: f32) -> OcrResult<Vec<FieldBox>> {
        let (in_w, in_h) = self.input_size;
        let mut sample = TensorMap::new();
        sample.insert("image".to_string(), detection_tensor(frame, in_w, in_h)?);
        let outputs = self.invoker.run(sample)?;
        let model = self.invoker.handle().name();

        let output = |name: &str| {
            outputs.get(name).ok_or_else(|| {
                OCRError::artifact_contract(model, format!("missing output '{name}'"))
            })
        };
        let boxes = output("boxes")?;
        let scores = output("scores")?;
        let labels = output("labels")?;

        let count = match boxes.shape() {
            [1, n, 4] => *n,
            [1, 0] | [1, 0, _] => 0,
            shape => {
                return Err(OCRError::artifact_contract(
                    model,
                    format!("output 'boxes' has shape {shape:?}, expected [1, N, 4]"),
                ));
            }
        };
        if scores.len() < count || labels.len() < count {
            return Err(OCRError::artifact_contract(
                model,
                format!(
                    "{count} boxes but {} scores and {} labels",
                    scores.len(),
                    labels.len()
                ),
            ));
        }

        let (img_w, img_h) = frame.dimensions();
        let sx = img_w as f32 / in_w as f32;
        let sy = img_h as f32 / in_h as f32;
        let scores: Vec<f32> = scores.iter().copied().collect();
        let labels: Vec<f32> = labels.iter().copied().collect();

        let mut result = Vec::with_capacity(count);
        for i in 0..count {
            if scores[i] < threshold {
                continue;
            }
            let label = labels[i].round().max(0.0) as usize;
            let Some(class) = self.catalog.class_by_index(label) else {
                warn!(label, "key-value label outside the catalog");
                continue;
            };
            let bbox = BoundingBox::new(
                boxes[[0, i, 0]],
                boxes[[0, i, 1]],
                boxes[[0, i, 2]],
                boxes[[0, i, 3]],
            )
            .scale(sx, sy)
            .clamp(img_w, img_h);
            if bbox.area() <= 0.0 {
                continue;
            }
            result.push(FieldBox::new(class.name.clone(), scores[i], bbox));
        }
        Ok(result)
    }

    /// Collapses duplicate boxes class by class.
    fn dedup(&self, boxes: Vec<FieldBox>, frame_width: u32, config: &ExtractionConfig) -> Vec<FieldBox> {
        let tolerance = config.edge_tolerance * frame_width as f32;
        let groups = boxes.into_iter().into_group_map_by(|b| b.class.clone());

        let mut kept_all = Vec::new();
        for (class, mut group) in groups.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
            let rule = self.catalog.dedup_rule(&class);
            group.sort_by(|a, b| b.score.total_cmp(&a.score));

            let mut kept: Vec<FieldBox> = Vec::with_capacity(group.len());
            for candidate in group {
                let duplicate = kept
                    .iter_mut()
                    .find(|k| is_duplicate(k, &candidate, rule, config, tolerance));
                match (duplicate, rule) {
                    (Some(existing), DedupRule::Merge) => {
                        existing.bbox = existing.bbox.union(&candidate.bbox);
                        existing.score = existing.score.max(candidate.score);
                    }
                    (Some(_), _) => {}
                    (None, _) => kept.push(candidate),
                }
            }
            if rule == DedupRule::Merge {
                kept = merge_until_stable(kept, config, tolerance);
            }
            kept_all.extend(kept);
        }
        kept_all
    }
}

fn is_duplicate(
    a: &FieldBox,
    b: &FieldBox,
    rule: DedupRule,
    config: &ExtractionConfig,
    tolerance: f32,
) -> bool {
    if a.bbox.iou(&b.bbox) >= config.dedup_iou {
        return true;
    }
    rule.is_single_valued()
        && a.bbox.vertical_overlap(&b.bbox) >= config.line_overlap
        && a.bbox.horizontal_gap(&b.bbox) <= tolerance
}

/// Union boxes can grow into boxes kept earlier; merge again until nothing changes.
fn merge_until_stable(mut kept: Vec<FieldBox>, config: &ExtractionConfig, tolerance: f32) -> Vec<FieldBox> {
    loop {
        let pair = (0..kept.len())
            .tuple_combinations()
            .find(|&(i, j)| is_duplicate(&kept[i], &kept[j], DedupRule::Merge, config, tolerance));
        let Some((i, j)) = pair else {
            return kept;
        };
        let absorbed = kept.remove(j);
        kept[i].bbox = kept[i].bbox.union(&absorbed.bbox);
        kept[i].score = kept[i].score.max(absorbed.score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inference::{FnBackend, ModelHandle, TensorSpec};
    use ndarray::{ArrayD, IxDyn};

    /// Key-value model on a 100×100 input returning `(label, score, box)` rows.
    fn detector(rows: Vec<(usize, f32, [f32; 4])>) -> FieldDetector {
        let handle = ModelHandle::new(FnBackend::new(
            "kv",
            vec![TensorSpec::new("image", vec![1, 3, 100, 100])],
            move |_inputs: &TensorMap| {
                let n = rows.len();
                let boxes: Vec<f32> = rows.iter().flat_map(|r| r.2).collect();
                let mut out = TensorMap::new();
                out.insert(
                    "boxes".to_string(),
                    ArrayD::from_shape_vec(IxDyn(&[1, n, 4]), boxes).unwrap(),
                );
                out.insert(
                    "scores".to_string(),
                    ArrayD::from_shape_vec(IxDyn(&[1, n]), rows.iter().map(|r| r.1).collect())
                        .unwrap(),
                );
                out.insert(
                    "labels".to_string(),
                    ArrayD::from_shape_vec(IxDyn(&[1, n]), rows.iter().map(|r| r.0 as f32).collect())
                        .unwrap(),
                );
                Ok(out)
            },
        ));
        FieldDetector::new(
            ModelInvoker::Direct(handle),
            Arc::new(DocumentCatalog::builtin()),
        )
    }

    const NAME: usize = 0;
    const ID: usize = 1;
    const ADDRESS: usize = 2;
    const ISSUER: usize = 4;
    const LICENSE: usize = 5;
    const TITLE: usize = 12;

    fn classes(detection: &Detection) -> Vec<&str> {
        detection.boxes.iter().map(|b| b.class.as_str()).collect()
    }

    #[test]
    fn rescales_and_thresholds() {
        let d = detector(vec![
            (NAME, 0.9, [10.0, 10.0, 50.0, 20.0]),
            (ID, 0.1, [10.0, 30.0, 50.0, 40.0]),
        ]);
        let frame = RgbImage::new(200, 100);
        let detection = d.detect(&frame, None, &ExtractionConfig::default()).unwrap();
        let name = detection.boxes.iter().find(|b| b.class == "name").unwrap();
        assert_eq!((name.bbox.x1, name.bbox.x2), (20.0, 100.0));
        assert!(!detection.boxes.iter().any(|b| b.class == "id_number" && !b.synthetic));
    }

    #[test]
    fn single_valued_duplicates_on_same_line_collapse() {
        let d = detector(vec![
            (NAME, 0.7, [10.0, 10.0, 30.0, 20.0]),
            (NAME, 0.9, [31.0, 10.0, 60.0, 20.0]),
            (ADDRESS, 0.8, [10.0, 50.0, 40.0, 60.0]),
            (ADDRESS, 0.8, [41.0, 50.0, 80.0, 60.0]),
        ]);
        let config = ExtractionConfig::default().with_force_type(true);
        let detection = d.detect(&RgbImage::new(100, 100), Some("id_card"), &config).unwrap();
        let names: Vec<_> = detection.boxes.of_class("name").collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].score, 0.9);
        // multi-valued classes only collapse on IoU
        assert_eq!(detection.boxes.of_class("address").count(), 2);
    }

    #[test]
    fn merge_rule_unions_boxes() {
        let d = detector(vec![
            (TITLE, 0.6, [10.0, 10.0, 40.0, 20.0]),
            (TITLE, 0.8, [41.0, 10.0, 80.0, 20.0]),
        ]);
        let detection = d
            .detect(&RgbImage::new(100, 100), Some("certificate"), &ExtractionConfig::default())
            .unwrap();
        let titles: Vec<_> = detection.boxes.of_class("title").collect();
        assert_eq!(titles.len(), 1);
        assert_eq!((titles[0].bbox.x1, titles[0].bbox.x2), (10.0, 80.0));
        assert_eq!(titles[0].score, 0.8);
    }

    #[test]
    fn force_type_drops_foreign_classes() {
        let d = detector(vec![
            (NAME, 0.9, [10.0, 10.0, 50.0, 20.0]),
            (LICENSE, 0.9, [10.0, 30.0, 50.0, 40.0]),
        ]);
        let forced = ExtractionConfig::default().with_force_type(true);
        let detection = d.detect(&RgbImage::new(100, 100), Some("id_card"), &forced).unwrap();
        assert!(!classes(&detection).contains(&"license_number"));

        let relaxed = ExtractionConfig::default();
        let detection = d.detect(&RgbImage::new(100, 100), Some("id_card"), &relaxed).unwrap();
        assert!(classes(&detection).contains(&"license_number"));
    }

    #[test]
    fn injects_backup_box_for_missing_required_class() {
        let d = detector(vec![(NAME, 0.9, [10.0, 10.0, 50.0, 20.0])]);
        let detection = d
            .detect(&RgbImage::new(200, 100), Some("id_card"), &ExtractionConfig::default())
            .unwrap();
        let id = detection.boxes.of_class("id_number").next().unwrap();
        assert!(id.synthetic);
        assert_eq!(id.score, 0.0);
        assert!((id.bbox.x1 - 10.0).abs() < 1e-3);
        assert_eq!(detection.document_type.as_deref(), Some("id_card"));
    }

    #[test]
    fn infers_document_type_without_hint() {
        let d = detector(vec![
            (NAME, 0.9, [10.0, 10.0, 50.0, 20.0]),
            (LICENSE, 0.9, [10.0, 30.0, 50.0, 40.0]),
            (ISSUER, 0.9, [10.0, 60.0, 50.0, 70.0]),
        ]);
        let detection = d
            .detect(&RgbImage::new(100, 100), None, &ExtractionConfig::default())
            .unwrap();
        assert_eq!(detection.document_type.as_deref(), Some("driver_license"));
    }

    #[test]
    fn empty_result_is_no_fields_detected() {
        let d = detector(Vec::new());
        let err = d
            .detect(&RgbImage::new(100, 100), None, &ExtractionConfig::default())
            .unwrap_err();
        assert!(matches!(err, OCRError::NoFieldsDetected { .. }));

        let d = detector(vec![(LICENSE, 0.9, [10.0, 30.0, 50.0, 40.0])]);
        let forced = ExtractionConfig::default().with_force_type(true);
        let err = d.detect(&RgbImage::new(100, 100), Some("id_card"), &forced).unwrap_err();
        assert!(matches!(err, OCRError::NoFieldsDetected { ref document_type } if document_type == "id_card"));
    }

    #[test]
    fn unknown_document_type_is_invalid_input() {
        let d = detector(vec![(NAME, 0.9, [10.0, 10.0, 50.0, 20.0])]);
        let err = d
            .detect(&RgbImage::new(100, 100), Some("passport"), &ExtractionConfig::default())
            .unwrap_err();
        assert!(matches!(err, OCRError::InvalidInput { .. }));
    }
}
