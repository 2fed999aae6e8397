//! Boundary locator: finds the document in the photograph and rectifies it.
//!
//! A single [`BoundaryLocator::attempt`] runs the boundary model once and turns its
//! best detection into a [`BoundaryResult`]. [`BoundaryLocator::locate`] drives a
//! bounded list of [`AttemptStrategy`] values (original, rotation sweep, erosion
//! rounds) and takes the first success, degrading to the whole image when nothing
//! usable is found.

use super::invoker::ModelInvoker;
use super::stats::{Deadline, STAGE_BOUNDARY};
use crate::core::config::{ExtractionConfig, MAX_CROP_ROUNDS, MAX_ROTATE_ANGLES};
use crate::core::errors::{OCRError, OcrResult};
use crate::core::inference::TensorMap;
use crate::domain::{BoundaryResult, FrameSource, Rotation};
use crate::processors::geometry::{BoundingBox, Point, Quad, quad_from_mask};
use crate::utils::image::{crop, detection_tensor, erode, orient_wide};
use crate::utils::transform::{rectification_homography, rotate_by_class, rotate_expand, warp_perspective};
use image::{GrayImage, Luma, RgbImage};
use ndarray::{ArrayD, Axis};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Input size used when the artifact declares dynamic spatial dimensions.
pub const DEFAULT_BOUNDARY_INPUT: (u32, u32) = (640, 640);
const MASK_THRESHOLD: f32 = 0.5;

/// One step of the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptStrategy {
    /// The orientation-normalized input.
    Original,
    /// The input rotated counter-clockwise by `angle` degrees on an expanded canvas.
    Rotate {
        /// Angle in degrees.
        angle: f32,
    },
    /// The previous erosion round's image with `crop_ratio` removed from each side.
    Erode {
        /// Round number, starting at 1.
        round: usize,
    },
}

impl AttemptStrategy {
    /// The ordered retry budget for `config`.
    pub fn plan(config: &ExtractionConfig) -> Vec<AttemptStrategy> {
        let mut plan = vec![AttemptStrategy::Original];
        if config.rotate_retry {
            plan.extend(
                config
                    .rotate_angles
                    .iter()
                    .take(MAX_ROTATE_ANGLES)
                    .map(|&angle| AttemptStrategy::Rotate { angle }),
            );
        }
        if config.crop_retry {
            let rounds = config.crop_rounds.min(MAX_CROP_ROUNDS);
            plan.extend((1..=rounds).map(|round| AttemptStrategy::Erode { round }));
        }
        plan
    }

    fn frame_source(self) -> FrameSource {
        match self {
            AttemptStrategy::Original => FrameSource::Original,
            AttemptStrategy::Rotate { angle } => FrameSource::Rotated { angle },
            AttemptStrategy::Erode { round } => FrameSource::Eroded { round },
        }
    }
}

/// What one attempt saw.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// Strategy used.
    pub strategy: AttemptStrategy,
    /// Whether a boundary was found.
    pub found: bool,
    /// Score of the best candidate, zero when none.
    pub score: f32,
}

/// Result of [`BoundaryLocator::locate`].
#[derive(Debug, Clone)]
pub struct LocateOutcome {
    /// Boundary that produced the frame; not-found for the whole-image fallback.
    pub boundary: BoundaryResult,
    /// The frame handed to field detection.
    pub image: RgbImage,
    /// Strategy that produced the frame.
    pub source: FrameSource,
    /// Every attempt made, in order.
    pub attempts: Vec<AttemptRecord>,
}

/// Runs the boundary model and its retry strategies.
#[derive(Debug, Clone)]
pub struct BoundaryLocator {
    invoker: ModelInvoker,
    input_size: (u32, u32),
}

impl BoundaryLocator {
    /// Creates a locator. The model input size comes from the artifact's `image` input.
    pub fn new(invoker: ModelInvoker) -> Self {
        let input_size = invoker
            .input_spec("image")
            .and_then(|spec| spec.static_hw())
            .map(|(h, w)| (w, h))
            .unwrap_or(DEFAULT_BOUNDARY_INPUT);
        Self {
            invoker,
            input_size,
        }
    }

    /// Model input `(width, height)`.
    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    /// Runs the boundary model once on `image`.
    ///
    /// A missing or empty detection tensor, or no candidate above `threshold`, is a
    /// not-found result rather than an error.
    pub fn attempt(&self, image: &RgbImage, threshold: f32) -> OcrResult<BoundaryResult> {
        let (in_w, in_h) = self.input_size;
        let mut sample = TensorMap::new();
        sample.insert("image".to_string(), detection_tensor(image, in_w, in_h)?);
        let outputs = self.invoker.run(sample)?;
        let model = self.invoker.handle().name();

        let Some(boxes) = outputs.get("boxes") else {
            debug!(model, "boundary model returned no detection tensor");
            return Ok(BoundaryResult::not_found());
        };
        let boxes = rows_of(boxes, 5, "boxes", model)?;

        let best = boxes
            .iter()
            .enumerate()
            .filter(|(_, row)| row[4] >= threshold)
            .max_by(|(_, a), (_, b)| a[4].total_cmp(&b[4]));
        let Some((idx, row)) = best else {
            return Ok(BoundaryResult::not_found());
        };

        let (img_w, img_h) = image.dimensions();
        let sx = img_w as f32 / in_w as f32;
        let sy = img_h as f32 / in_h as f32;
        let bbox = BoundingBox::new(row[0], row[1], row[2], row[3])
            .scale(sx, sy)
            .clamp(img_w, img_h);

        let rotation = scalar_at(&outputs, "labels", idx)
            .map(|label| Rotation::from_class_index(label.round() as i64))
            .unwrap_or_default();
        let angle = scalar_at(&outputs, "angles", idx).unwrap_or(0.0);

        let quad = outputs
            .get("masks")
            .and_then(|masks| quad_from_mask_tensor(masks, idx, img_w, img_h))
            .or_else(|| {
                outputs
                    .get("keypoints")
                    .and_then(|kp| quad_from_keypoints(kp, idx, sx, sy))
            });

        let (homography, rectified_size) = match quad.as_ref().map(rectification_homography) {
            Some(Ok((h, w, ht))) => (Some(h), Some((w, ht))),
            Some(Err(e)) => {
                debug!(model, error = %e, "discarding degenerate document outline");
                (None, None)
            }
            None => (None, None),
        };

        Ok(BoundaryResult {
            bbox: Some(bbox),
            score: row[4],
            rotation,
            angle,
            quad,
            homography,
            rectified_size,
        })
    }

    /// Finds the document frame, trying each strategy of the retry budget in order.
    ///
    /// Always yields a frame unless the whole-image fallback is disabled, in which
    /// case an exhausted budget is [`OCRError::DocumentNotLocated`].
    pub fn locate(
        &self,
        image: &RgbImage,
        config: &ExtractionConfig,
        deadline: &Deadline,
    ) -> OcrResult<LocateOutcome> {
        let base = if config.normalize_wide {
            let (wide, rotated) = orient_wide(image);
            if rotated {
                debug!("rotated portrait input to landscape");
            }
            wide
        } else {
            image.clone()
        };

        let plan = AttemptStrategy::plan(config);
        let mut attempts = Vec::with_capacity(plan.len());
        let mut eroded: Option<RgbImage> = None;

        for strategy in plan {
            deadline.check(STAGE_BOUNDARY)?;
            let candidate = match strategy {
                AttemptStrategy::Original => base.clone(),
                AttemptStrategy::Rotate { angle } => rotate_expand(&base, angle),
                AttemptStrategy::Erode { .. } => {
                    let next = erode(eroded.as_ref().unwrap_or(&base), config.crop_ratio);
                    eroded = Some(next.clone());
                    next
                }
            };

            let result = self.attempt(&candidate, config.boundary_score_threshold)?;
            attempts.push(AttemptRecord {
                strategy,
                found: result.is_found(),
                score: result.score,
            });

            let Some(bbox) = result.bbox else {
                debug!(?strategy, "no boundary found");
                continue;
            };

            let (w, h) = candidate.dimensions();
            if bbox.width() < config.min_boundary_fraction * w as f32
                || bbox.height() < config.min_boundary_fraction * h as f32
            {
                info!(
                    ?strategy,
                    box_w = bbox.width(),
                    box_h = bbox.height(),
                    "boundary too small, using whole image"
                );
                return Ok(Self::whole_image(base, attempts));
            }

            if strategy != AttemptStrategy::Original {
                info!(?strategy, score = result.score, "boundary found by retry");
            }
            let frame = derive_frame(&candidate, &result, &bbox);
            return Ok(LocateOutcome {
                boundary: result,
                image: frame,
                source: strategy.frame_source(),
                attempts,
            });
        }

        if !config.whole_image_fallback {
            return Err(OCRError::DocumentNotLocated {
                attempts: attempts.len(),
            });
        }
        info!(attempts = attempts.len(), "no boundary found, using whole image");
        Ok(Self::whole_image(base, attempts))
    }

    fn whole_image(base: RgbImage, attempts: Vec<AttemptRecord>) -> LocateOutcome {
        LocateOutcome {
            boundary: BoundaryResult::not_found(),
            image: base,
            source: FrameSource::WholeImage,
            attempts,
        }
    }
}

/// Warps by the homography when one exists, else crops the box; then applies the
/// rotation class. Falls back to the attempt image as-is.
fn derive_frame(candidate: &RgbImage, result: &BoundaryResult, bbox: &BoundingBox) -> RgbImage {
    if let (Some(h), Some((w, ht))) = (result.homography.as_ref(), result.rectified_size) {
        match warp_perspective(candidate, h, w, ht) {
            Ok(warped) => return rotate_by_class(&warped, result.rotation),
            Err(e) => warn!(error = %e, "rectification failed, falling back to box crop"),
        }
    }
    match crop(candidate, bbox) {
        Some(cropped) => rotate_by_class(&cropped, result.rotation),
        None => candidate.clone(),
    }
}

/// Reads a `[1, N, width]` tensor as `N` rows.
fn rows_of(tensor: &ArrayD<f32>, width: usize, name: &str, model: &str) -> OcrResult<Vec<Vec<f32>>> {
    let shape = tensor.shape();
    if tensor.is_empty() {
        return Ok(Vec::new());
    }
    if shape.len() != 3 || shape[2] < width {
        return Err(OCRError::artifact_contract(
            model,
            format!("output '{name}' has shape {shape:?}, expected [1, N, {width}]"),
        ));
    }
    Ok(tensor
        .index_axis(Axis(0), 0)
        .outer_iter()
        .map(|row| row.iter().copied().collect())
        .collect())
}

/// Value at `[0, idx]` of an optional `[1, N]` output.
fn scalar_at(outputs: &TensorMap, name: &str, idx: usize) -> Option<f32> {
    let tensor = outputs.get(name)?;
    match tensor.shape() {
        [1, n] if idx < *n => Some(tensor[[0, idx]]),
        _ => None,
    }
}

/// Binarizes instance `idx` of a `[1, N, Hm, Wm]` mask tensor and maps its outline
/// into a `img_w` × `img_h` image.
fn quad_from_mask_tensor(masks: &ArrayD<f32>, idx: usize, img_w: u32, img_h: u32) -> Option<Quad> {
    let &[1, n, mh, mw] = masks.shape() else {
        return None;
    };
    if idx >= n || mh == 0 || mw == 0 {
        return None;
    }
    let mut binary = GrayImage::new(mw as u32, mh as u32);
    for y in 0..mh {
        for x in 0..mw {
            if masks[[0, idx, y, x]] >= MASK_THRESHOLD {
                binary.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
    }
    quad_from_mask(&binary).map(|q| q.scale(img_w as f32 / mw as f32, img_h as f32 / mh as f32))
}

/// Reads the TL, TR, BR, BL keypoints of instance `idx` from a `[1, N, 4, >=2]` tensor.
fn quad_from_keypoints(keypoints: &ArrayD<f32>, idx: usize, sx: f32, sy: f32) -> Option<Quad> {
    let &[1, n, 4, dims] = keypoints.shape() else {
        return None;
    };
    if idx >= n || dims < 2 {
        return None;
    }
    let point = |k: usize| Point::new(keypoints[[0, idx, k, 0]] * sx, keypoints[[0, idx, k, 1]] * sy);
    let quad = Quad::new([point(0), point(1), point(2), point(3)]);
    (quad.area() >= 1.0).then_some(quad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inference::{FnBackend, ModelHandle, TensorSpec};
    use ndarray::IxDyn;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Boundary model on a 64×64 input whose answer depends on the call number.
    fn scripted_locator(
        script: impl Fn(usize) -> TensorMap + Send + Sync + 'static,
    ) -> (BoundaryLocator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = ModelHandle::new(FnBackend::new(
            "boundary",
            vec![TensorSpec::new("image", vec![1, 3, 64, 64])],
            move |_inputs: &TensorMap| Ok(script(counter.fetch_add(1, Ordering::SeqCst))),
        ));
        (BoundaryLocator::new(ModelInvoker::Direct(handle)), calls)
    }

    fn detection(rows: &[[f32; 5]]) -> TensorMap {
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        let mut out = TensorMap::new();
        out.insert(
            "boxes".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[1, rows.len(), 5]), data).unwrap(),
        );
        out
    }

    #[test]
    fn attempt_rescales_best_box() {
        let (locator, _) = scripted_locator(|_| {
            detection(&[[8.0, 8.0, 56.0, 56.0, 0.9], [0.0, 0.0, 10.0, 10.0, 0.95]])
        });
        let image = RgbImage::new(128, 64);
        let result = locator.attempt(&image, 0.5).unwrap();
        let bbox = result.bbox.unwrap();
        assert_eq!((bbox.x2, bbox.y2), (20.0, 10.0));
        assert_eq!(result.score, 0.95);
        assert!(result.homography.is_none());
    }

    #[test]
    fn attempt_below_threshold_is_not_found() {
        let (locator, _) = scripted_locator(|_| detection(&[[8.0, 8.0, 56.0, 56.0, 0.3]]));
        let result = locator.attempt(&RgbImage::new(64, 64), 0.5).unwrap();
        assert!(!result.is_found());

        let (locator, _) = scripted_locator(|_| TensorMap::new());
        assert!(!locator.attempt(&RgbImage::new(64, 64), 0.5).unwrap().is_found());
    }

    #[test]
    fn attempt_builds_homography_from_mask() {
        let (locator, _) = scripted_locator(|_| {
            let mut out = detection(&[[8.0, 8.0, 56.0, 48.0, 0.9]]);
            let mut masks = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 32, 32]));
            for y in 4..24 {
                for x in 4..28 {
                    masks[[0, 0, y, x]] = 1.0;
                }
            }
            out.insert("masks".to_string(), masks);
            out.insert("labels".to_string(), ArrayD::from_elem(IxDyn(&[1, 1]), 2.0));
            out
        });
        let result = locator.attempt(&RgbImage::new(64, 64), 0.5).unwrap();
        assert!(result.homography.is_some());
        assert_eq!(result.rotation, Rotation::Deg180);
        let (w, h) = result.rectified_size.unwrap();
        assert_eq!((w, h), (46, 38));
    }

    #[test]
    fn attempt_uses_keypoints_without_masks() {
        let (locator, _) = scripted_locator(|_| {
            let mut out = detection(&[[8.0, 8.0, 56.0, 48.0, 0.9]]);
            let kp = vec![
                8.0, 8.0, 1.0, 56.0, 10.0, 1.0, 54.0, 48.0, 1.0, 10.0, 46.0, 1.0,
            ];
            out.insert(
                "keypoints".to_string(),
                ArrayD::from_shape_vec(IxDyn(&[1, 1, 4, 3]), kp).unwrap(),
            );
            out
        });
        let result = locator.attempt(&RgbImage::new(64, 64), 0.5).unwrap();
        assert!(result.quad.is_some());
        assert!(result.homography.is_some());
    }

    #[test]
    fn attempt_falls_back_to_keypoints_when_mask_is_empty() {
        let (locator, _) = scripted_locator(|_| {
            let mut out = detection(&[[8.0, 8.0, 56.0, 48.0, 0.9]]);
            out.insert("masks".to_string(), ArrayD::zeros(IxDyn(&[1, 1, 32, 32])));
            let kp = vec![
                8.0, 8.0, 1.0, 56.0, 10.0, 1.0, 54.0, 48.0, 1.0, 10.0, 46.0, 1.0,
            ];
            out.insert(
                "keypoints".to_string(),
                ArrayD::from_shape_vec(IxDyn(&[1, 1, 4, 3]), kp).unwrap(),
            );
            out
        });
        let result = locator.attempt(&RgbImage::new(64, 64), 0.5).unwrap();
        assert!(result.quad.is_some());
        assert!(result.homography.is_some());
    }

    #[test]
    fn plan_is_bounded_for_unvalidated_configs() {
        let config = ExtractionConfig {
            rotate_retry: true,
            rotate_angles: vec![90.0; 100],
            crop_retry: true,
            crop_rounds: usize::MAX,
            ..ExtractionConfig::default()
        };
        let plan = AttemptStrategy::plan(&config);
        assert_eq!(plan.len(), 1 + MAX_ROTATE_ANGLES + MAX_CROP_ROUNDS);
        assert_eq!(
            plan.last(),
            Some(&AttemptStrategy::Erode { round: MAX_CROP_ROUNDS })
        );
    }

    #[test]
    fn attempt_rejects_malformed_boxes() {
        let (locator, _) = scripted_locator(|_| {
            let mut out = TensorMap::new();
            out.insert("boxes".to_string(), ArrayD::zeros(IxDyn(&[1, 2, 3])));
            out
        });
        let err = locator.attempt(&RgbImage::new(64, 64), 0.5).unwrap_err();
        assert!(matches!(err, OCRError::ArtifactRuntime { .. }));
    }

    #[test]
    fn locate_stops_at_first_rotation_success() {
        let (locator, calls) = scripted_locator(|call| {
            if call == 1 {
                detection(&[[4.0, 4.0, 60.0, 60.0, 0.9]])
            } else {
                detection(&[])
            }
        });
        let config = ExtractionConfig::default();
        let outcome = locator
            .locate(&RgbImage::new(100, 60), &config, &Deadline::unbounded())
            .unwrap();
        assert_eq!(outcome.source, FrameSource::Rotated { angle: 45.0 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(outcome.attempts[1].found);
    }

    #[test]
    fn locate_exhausts_budget_then_uses_whole_image() {
        let (locator, calls) = scripted_locator(|_| detection(&[]));
        let config = ExtractionConfig::default();
        let image = RgbImage::new(60, 100);
        let outcome = locator.locate(&image, &config, &Deadline::unbounded()).unwrap();
        assert_eq!(outcome.source, FrameSource::WholeImage);
        // 1 original + 2 angles + 2 erosion rounds
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // portrait input was normalized to landscape
        assert_eq!(outcome.image.dimensions(), (100, 60));
        assert!(!outcome.boundary.is_found());
    }

    #[test]
    fn locate_without_fallback_fails() {
        let (locator, _) = scripted_locator(|_| detection(&[]));
        let config = ExtractionConfig::default()
            .with_rotate_retry(false, Vec::new())
            .with_crop_retry(false, 0, 0.05)
            .with_whole_image_fallback(false);
        let err = locator
            .locate(&RgbImage::new(64, 64), &config, &Deadline::unbounded())
            .unwrap_err();
        assert!(matches!(err, OCRError::DocumentNotLocated { attempts: 1 }));
    }

    #[test]
    fn locate_ignores_tiny_boxes() {
        let (locator, calls) = scripted_locator(|_| detection(&[[0.0, 0.0, 4.0, 4.0, 0.99]]));
        let outcome = locator
            .locate(&RgbImage::new(64, 64), &ExtractionConfig::default(), &Deadline::unbounded())
            .unwrap();
        assert_eq!(outcome.source, FrameSource::WholeImage);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn locate_crops_found_box() {
        let (locator, _) = scripted_locator(|_| detection(&[[16.0, 16.0, 48.0, 48.0, 0.9]]));
        let outcome = locator
            .locate(&RgbImage::new(128, 64), &ExtractionConfig::default(), &Deadline::unbounded())
            .unwrap();
        assert_eq!(outcome.source, FrameSource::Original);
        assert_eq!(outcome.image.dimensions(), (64, 32));
    }

    #[test]
    fn erosion_rounds_compound() {
        let (locator, _) = scripted_locator(|call| {
            if call == 2 {
                detection(&[[0.0, 0.0, 64.0, 64.0, 0.9]])
            } else {
                detection(&[])
            }
        });
        let config = ExtractionConfig::default()
            .with_rotate_retry(false, Vec::new())
            .with_crop_retry(true, 3, 0.1);
        let outcome = locator
            .locate(&RgbImage::new(100, 100), &config, &Deadline::unbounded())
            .unwrap();
        assert_eq!(outcome.source, FrameSource::Eroded { round: 2 });
        // 100 -> 80 -> 64
        assert_eq!(outcome.image.dimensions(), (64, 64));
    }
}
