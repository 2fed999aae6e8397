//! Configuration objects for the extraction cascade.
//!
//! All configuration is plain data deserialized with serde. Missing keys fall back
//! to the defaults below, so a partial JSON document is a valid configuration.

use crate::core::errors::{OCRError, OcrResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on `crop_rounds`.
pub const MAX_CROP_ROUNDS: usize = 16;
/// Upper bound on the number of `rotate_angles`.
pub const MAX_ROTATE_ANGLES: usize = 16;

/// Per-request thresholds and toggles for the cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Minimum confidence to accept a boundary candidate.
    pub boundary_score_threshold: f32,
    /// A boundary box narrower or shorter than this fraction of the image is ignored.
    pub min_boundary_fraction: f32,
    /// Rotate portrait inputs to landscape before the first attempt.
    pub normalize_wide: bool,
    /// Retry the boundary model on rotated copies of the image.
    pub rotate_retry: bool,
    /// Angles (degrees, counter-clockwise) tried by the rotation sweep.
    pub rotate_angles: Vec<f32>,
    /// Retry the boundary model on progressively eroded copies of the image.
    pub crop_retry: bool,
    /// Number of erosion rounds.
    pub crop_rounds: usize,
    /// Fraction removed from each side per erosion round.
    pub crop_ratio: f32,
    /// Use the whole frame when no usable boundary is found.
    pub whole_image_fallback: bool,
    /// Minimum confidence to keep a field box.
    pub kv_score_threshold: f32,
    /// Expansion of a field box (fraction of its height, per side) before cropping.
    pub box_expansion: f32,
    /// Hard-filter field classes by the supplied document type.
    pub force_type: bool,
    /// IoU above which two boxes of the same class are duplicates.
    pub dedup_iou: f32,
    /// Vertical overlap ratio above which two boxes share a text line.
    pub line_overlap: f32,
    /// Horizontal edge tolerance (fraction of image width) for same-line duplicates.
    pub edge_tolerance: f32,
    /// Mask identifier fields.
    pub redact_id: bool,
    /// Mask name fields.
    pub redact_name: bool,
    /// Write a debug snapshot through the debug sink.
    pub debug: bool,
    /// Overall per-request budget in milliseconds.
    pub request_timeout_ms: Option<u64>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            boundary_score_threshold: 0.5,
            min_boundary_fraction: 0.2,
            normalize_wide: true,
            rotate_retry: true,
            rotate_angles: vec![45.0, -45.0],
            crop_retry: true,
            crop_rounds: 2,
            crop_ratio: 0.05,
            whole_image_fallback: true,
            kv_score_threshold: 0.3,
            box_expansion: 0.1,
            force_type: false,
            dedup_iou: 0.5,
            line_overlap: 0.6,
            edge_tolerance: 0.02,
            redact_id: true,
            redact_name: false,
            debug: false,
            request_timeout_ms: None,
        }
    }
}

impl ExtractionConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> OcrResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> OcrResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Sets the boundary score threshold.
    pub fn with_boundary_score_threshold(mut self, threshold: f32) -> Self {
        self.boundary_score_threshold = threshold;
        self
    }

    /// Enables or disables the rotation sweep and sets its angles.
    pub fn with_rotate_retry(mut self, enabled: bool, angles: Vec<f32>) -> Self {
        self.rotate_retry = enabled;
        self.rotate_angles = angles;
        self
    }

    /// Enables or disables the erosion retry.
    pub fn with_crop_retry(mut self, enabled: bool, rounds: usize, ratio: f32) -> Self {
        self.crop_retry = enabled;
        self.crop_rounds = rounds;
        self.crop_ratio = ratio;
        self
    }

    /// Sets whether the whole frame is used when no boundary is found.
    pub fn with_whole_image_fallback(mut self, enabled: bool) -> Self {
        self.whole_image_fallback = enabled;
        self
    }

    /// Sets the key-value score threshold.
    pub fn with_kv_score_threshold(mut self, threshold: f32) -> Self {
        self.kv_score_threshold = threshold;
        self
    }

    /// Sets whether classes are hard-filtered by the document type.
    pub fn with_force_type(mut self, force: bool) -> Self {
        self.force_type = force;
        self
    }

    /// Sets the redaction toggles.
    pub fn with_redaction(mut self, redact_id: bool, redact_name: bool) -> Self {
        self.redact_id = redact_id;
        self.redact_name = redact_name;
        self
    }

    /// Enables the debug snapshot.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Returns the per-request deadline as a duration.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> OcrResult<()> {
        check_unit("boundary_score_threshold", self.boundary_score_threshold)?;
        check_unit("min_boundary_fraction", self.min_boundary_fraction)?;
        check_unit("kv_score_threshold", self.kv_score_threshold)?;
        check_unit("dedup_iou", self.dedup_iou)?;
        check_unit("line_overlap", self.line_overlap)?;
        check_unit("edge_tolerance", self.edge_tolerance)?;
        if !(0.0..0.5).contains(&self.crop_ratio) {
            return Err(OCRError::config_error_with_context(
                "crop_ratio",
                &self.crop_ratio.to_string(),
                "must be in [0, 0.5)",
            ));
        }
        if self.box_expansion < 0.0 || !self.box_expansion.is_finite() {
            return Err(OCRError::config_error_with_context(
                "box_expansion",
                &self.box_expansion.to_string(),
                "must be a non-negative finite number",
            ));
        }
        if self.crop_rounds > MAX_CROP_ROUNDS {
            return Err(OCRError::config_error_with_context(
                "crop_rounds",
                &self.crop_rounds.to_string(),
                &format!("must be at most {MAX_CROP_ROUNDS}"),
            ));
        }
        if self.rotate_angles.len() > MAX_ROTATE_ANGLES {
            return Err(OCRError::config_error_with_context(
                "rotate_angles",
                &self.rotate_angles.len().to_string(),
                &format!("at most {MAX_ROTATE_ANGLES} angles are allowed"),
            ));
        }
        if let Some(angle) = self.rotate_angles.iter().find(|a| !a.is_finite()) {
            return Err(OCRError::config_error_with_context(
                "rotate_angles",
                &angle.to_string(),
                "angles must be finite",
            ));
        }
        Ok(())
    }
}

fn check_unit(field: &str, value: f32) -> OcrResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(OCRError::config_error_with_context(
            field,
            &value.to_string(),
            "must be within [0, 1]",
        ))
    }
}

/// Settings for a micro-batcher placed in front of one model handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Number of samples that triggers an immediate dispatch.
    pub batch_size: usize,
    /// Longest time the oldest queued sample may wait, in milliseconds.
    pub max_latency_ms: u64,
    /// Capacity of the submission queue.
    pub queue_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            max_latency_ms: 10,
            queue_capacity: 256,
        }
    }
}

impl BatcherConfig {
    /// Creates a batcher configuration.
    pub fn new(batch_size: usize, max_latency: Duration) -> Self {
        Self {
            batch_size,
            max_latency_ms: max_latency.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Returns the maximum latency as a duration.
    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> OcrResult<()> {
        if self.batch_size == 0 {
            return Err(OCRError::config_error_with_context(
                "batch_size",
                "0",
                "batch_size must be greater than 0",
            ));
        }
        if self.queue_capacity < self.batch_size {
            return Err(OCRError::config_error_with_context(
                "queue_capacity",
                &self.queue_capacity.to_string(),
                "queue_capacity must be at least batch_size",
            ));
        }
        Ok(())
    }
}

/// Where the three model artifacts live and how their sessions are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Boundary model file.
    pub boundary_model: PathBuf,
    /// Key-value model file.
    pub kv_model: PathBuf,
    /// Recognition model file.
    pub recognition_model: PathBuf,
    /// Recognition character dictionary, one symbol per line.
    #[serde(default)]
    pub char_dict: Option<PathBuf>,
    /// Document catalog JSON; the built-in catalog is used when absent.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    /// Number of sessions per model.
    #[serde(default = "ArtifactConfig::default_session_pool_size")]
    pub session_pool_size: usize,
    /// Intra-op threads per session.
    #[serde(default)]
    pub intra_threads: Option<usize>,
    /// Micro-batcher in front of the boundary model.
    #[serde(default)]
    pub boundary_batcher: Option<BatcherConfig>,
    /// Micro-batcher in front of the key-value model.
    #[serde(default)]
    pub kv_batcher: Option<BatcherConfig>,
}

impl ArtifactConfig {
    fn default_session_pool_size() -> usize {
        1
    }

    /// Creates a configuration for the three model files.
    pub fn new(
        boundary_model: impl Into<PathBuf>,
        kv_model: impl Into<PathBuf>,
        recognition_model: impl Into<PathBuf>,
    ) -> Self {
        Self {
            boundary_model: boundary_model.into(),
            kv_model: kv_model.into(),
            recognition_model: recognition_model.into(),
            char_dict: None,
            catalog: None,
            session_pool_size: Self::default_session_pool_size(),
            intra_threads: None,
            boundary_batcher: None,
            kv_batcher: None,
        }
    }

    /// Sets the character dictionary path.
    pub fn with_char_dict(mut self, path: impl Into<PathBuf>) -> Self {
        self.char_dict = Some(path.into());
        self
    }

    /// Sets the catalog path.
    pub fn with_catalog(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog = Some(path.into());
        self
    }

    /// Loads the configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> OcrResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> OcrResult<()> {
        if self.session_pool_size == 0 {
            return Err(OCRError::config_error_with_context(
                "session_pool_size",
                "0",
                "at least one session is required",
            ));
        }
        for batcher in [&self.boundary_batcher, &self.kv_batcher]
            .into_iter()
            .flatten()
        {
            batcher.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ExtractionConfig::from_json_str(
            r#"{ "rotate_angles": [90.0], "force_type": true, "crop_rounds": 3 }"#,
        )
        .unwrap();
        assert_eq!(config.rotate_angles, vec![90.0]);
        assert!(config.force_type);
        assert_eq!(config.crop_rounds, 3);
        assert_eq!(config.kv_score_threshold, 0.3);
        assert!(config.whole_image_fallback);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = ExtractionConfig::new().with_kv_score_threshold(1.5);
        assert!(config.validate().is_err());

        let config = ExtractionConfig::new().with_crop_retry(true, 2, 0.6);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_retry_budget() {
        let config = ExtractionConfig::from_json_str(r#"{ "crop_rounds": 18446744073709551615 }"#)
            .unwrap();
        assert!(matches!(config.validate(), Err(OCRError::ConfigError { .. })));

        let config = ExtractionConfig::new().with_crop_retry(true, MAX_CROP_ROUNDS, 0.1);
        assert!(config.validate().is_ok());

        let config = ExtractionConfig::new().with_rotate_retry(true, vec![90.0; MAX_ROTATE_ANGLES + 1]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_batcher_config_validation() {
        assert!(BatcherConfig::default().validate().is_ok());
        let zero = BatcherConfig {
            batch_size: 0,
            ..BatcherConfig::default()
        };
        assert!(zero.validate().is_err());
        let small_queue = BatcherConfig {
            batch_size: 8,
            max_latency_ms: 5,
            queue_capacity: 4,
        };
        assert!(small_queue.validate().is_err());
    }

    #[test]
    fn test_artifact_config_roundtrip_defaults() {
        let json = r#"{
            "boundary_model": "models/boundary.onnx",
            "kv_model": "models/kv.onnx",
            "recognition_model": "models/rec.onnx",
            "kv_batcher": { "batch_size": 4 }
        }"#;
        let config: ArtifactConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.session_pool_size, 1);
        assert_eq!(config.kv_batcher.as_ref().unwrap().batch_size, 4);
        assert_eq!(config.kv_batcher.as_ref().unwrap().max_latency_ms, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_request_timeout_conversion() {
        let config =
            ExtractionConfig::new().with_request_timeout(Some(Duration::from_millis(1500)));
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(1500)));
    }
}
