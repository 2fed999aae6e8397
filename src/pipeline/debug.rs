//! Debug snapshots of finished requests.
//!
//! When `debug` is enabled the extractor hands a [`DebugSnapshot`] to its
//! [`DebugSink`]. The returned reference ends up in
//! [`NormalizedRecord::savepath`](crate::domain::NormalizedRecord::savepath).

use super::locator::AttemptRecord;
use crate::core::errors::{OCRError, OcrResult};
use crate::domain::{BoundaryResult, FieldBoxSet, NormalizedRecord};
use crate::utils::visualization::draw_field_boxes;
use chrono::Utc;
use image::RgbImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Everything worth keeping about one request.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    /// Request identifier; also the file stem of the snapshot.
    pub request_id: String,
    /// Rectified frame the fields were detected on.
    #[serde(skip)]
    pub frame: RgbImage,
    /// Field boxes on the frame.
    pub boxes: FieldBoxSet,
    /// Final record, without its savepath.
    pub record: NormalizedRecord,
    /// Boundary attempts in order.
    pub attempts: Vec<AttemptRecord>,
    /// Boundary that produced the frame.
    pub boundary: BoundaryResult,
}

/// Destination for debug snapshots.
pub trait DebugSink: Send + Sync + std::fmt::Debug {
    /// Persists `snapshot` and returns a reference to it.
    fn write_snapshot(&self, snapshot: &DebugSnapshot) -> OcrResult<String>;
}

/// Writes `<request_id>.png` (frame with boxes) and `<request_id>.json` under a directory.
#[derive(Debug)]
pub struct FileDebugSink {
    root: PathBuf,
}

impl FileDebugSink {
    /// Creates a sink rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory snapshots are written to.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl DebugSink for FileDebugSink {
    fn write_snapshot(&self, snapshot: &DebugSnapshot) -> OcrResult<String> {
        check_request_id(&snapshot.request_id)?;
        std::fs::create_dir_all(&self.root)?;
        let image_path = self.root.join(format!("{}.png", snapshot.request_id));
        let json_path = self.root.join(format!("{}.json", snapshot.request_id));

        draw_field_boxes(&snapshot.frame, &snapshot.boxes)
            .save(&image_path)
            .map_err(|e| OCRError::post_processing("write debug image", e))?;
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&json_path, json)?;

        debug!(path = %image_path.display(), "wrote debug snapshot");
        Ok(image_path.to_string_lossy().into_owned())
    }
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);
static REQUEST_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").unwrap_or_else(|e| panic!("Failed to compile regex pattern: {e}"))
});

/// Accepts identifiers made of ASCII letters, digits, `_` and `-` only.
pub fn check_request_id(request_id: &str) -> OcrResult<()> {
    if REQUEST_ID.is_match(request_id) {
        Ok(())
    } else {
        Err(OCRError::invalid_input(format!(
            "request id '{request_id}' may only contain ASCII letters, digits, '_' and '-'"
        )))
    }
}

/// Process-unique request identifier: UTC timestamp plus a counter.
pub fn next_request_id() -> String {
    let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{n:06}", Utc::now().format("%Y%m%dT%H%M%S%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FieldBox, FrameSource};
    use crate::pipeline::stats::ResponseLog;
    use crate::processors::geometry::BoundingBox;
    use std::collections::BTreeMap;

    fn snapshot(id: &str) -> DebugSnapshot {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), "KIM".to_string());
        DebugSnapshot {
            request_id: id.to_string(),
            frame: RgbImage::new(40, 30),
            boxes: FieldBoxSet::from_unsorted(vec![FieldBox::new(
                "name",
                0.9,
                BoundingBox::new(5.0, 5.0, 30.0, 15.0),
            )]),
            record: NormalizedRecord {
                document_type: "id_card".to_string(),
                fields,
                savepath: None,
                frame_source: FrameSource::Rotated { angle: 45.0 },
                response_log: ResponseLog::new(),
            },
            attempts: Vec::new(),
            boundary: BoundaryResult::not_found(),
        }
    }

    #[test]
    fn file_sink_writes_image_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileDebugSink::new(dir.path().join("snapshots"));
        let path = sink.write_snapshot(&snapshot("req_1")).unwrap();

        assert!(path.ends_with("req_1.png"));
        let png = image::open(&path).unwrap();
        assert_eq!((png.width(), png.height()), (40, 30));

        let json = std::fs::read_to_string(dir.path().join("snapshots/req_1.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["record"]["fields"]["name"], "KIM");
        assert_eq!(value["record"]["frame_source"]["strategy"], "rotated");
        assert!(value.get("frame").is_none());
    }

    #[test]
    fn file_sink_rejects_ids_that_leave_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("snapshots");
        let sink = FileDebugSink::new(&root);
        for id in ["../escaped", "a/b", "", "x.y"] {
            let err = sink.write_snapshot(&snapshot(id)).unwrap_err();
            assert!(matches!(err, OCRError::InvalidInput { .. }), "{id}");
        }
        assert!(!dir.path().join("escaped.png").exists());
        assert!(!root.exists());
    }

    #[test]
    fn request_ids_are_unique() {
        let (a, b) = (next_request_id(), next_request_id());
        assert_ne!(a, b);
        assert!(check_request_id(&a).is_ok());
    }
}
