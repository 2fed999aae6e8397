//! Document catalog: field classes, resolution strategies and per-type rules.
//!
//! The catalog is immutable after construction and is shared through an `Arc`.
//! The class list order defines the label indices emitted by the key-value model.

use crate::core::errors::{OCRError, OcrResult};
use crate::processors::geometry::BoundingBox;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const DATE_CHARS: &str = "0123456789.-/ ";
const ID_CHARS: &str = "0123456789-";
const SERIAL_CHARS: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-";

/// How the candidates of one class collapse into a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldStrategy {
    /// Highest confidence, uppercased.
    Serial,
    /// Identifier that may be masked after the first `keep` characters.
    RedactedId {
        /// Characters left visible.
        keep: usize,
        /// Total length of the masked value.
        masked_len: usize,
    },
    /// Hyphen-separated block number whose layout depends on a region field.
    LicenseNumber {
        /// Class holding the region code that replaces the first block.
        region_class: String,
    },
    /// Personal name, optionally masked.
    Name,
    /// Date repaired into `YYYY-MM-DD`.
    Date,
    /// All candidates joined in reading order.
    Concat,
}

/// How duplicate boxes of one class are collapsed during detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupRule {
    /// Single-valued: keep the higher-confidence box.
    #[default]
    KeepBest,
    /// Single-valued: merge into the union box with the higher score.
    Merge,
    /// Multi-valued: only collapse boxes that overlap by IoU.
    MultiValued,
}

impl DedupRule {
    /// Whether the class holds a single value per document.
    pub fn is_single_valued(self) -> bool {
        !matches!(self, DedupRule::MultiValued)
    }
}

/// One field class known to the key-value model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldClass {
    /// Class identifier.
    pub name: String,
    /// Resolution strategy.
    pub strategy: FieldStrategy,
    /// Duplicate handling.
    #[serde(default)]
    pub dedup: DedupRule,
    /// Symbols recognition is restricted to; `None` allows the full table.
    #[serde(default)]
    pub charset: Option<String>,
}

impl FieldClass {
    fn new(name: &str, strategy: FieldStrategy, dedup: DedupRule, charset: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            strategy,
            dedup,
            charset: charset.map(str::to_string),
        }
    }
}

/// Expected position of a required field, relative to the rectified frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupBox {
    /// Class the box stands in for.
    pub class: String,
    /// Left edge as a fraction of the frame width.
    pub x1: f32,
    /// Top edge as a fraction of the frame height.
    pub y1: f32,
    /// Right edge as a fraction of the frame width.
    pub x2: f32,
    /// Bottom edge as a fraction of the frame height.
    pub y2: f32,
}

impl BackupBox {
    /// Absolute box inside a `width` × `height` frame.
    pub fn to_bbox(&self, width: u32, height: u32) -> BoundingBox {
        BoundingBox::new(self.x1, self.y1, self.x2, self.y2)
            .scale(width as f32, height as f32)
            .clamp(width, height)
    }
}

/// A document type and its field rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentType {
    /// Type identifier.
    pub name: String,
    /// Classes that may appear on this document; also the expected output keys.
    pub valid_classes: Vec<String>,
    /// Classes that get a backup box when not detected.
    #[serde(default)]
    pub required_classes: Vec<String>,
    /// Backup positions.
    #[serde(default)]
    pub backup_boxes: Vec<BackupBox>,
    /// Date classes resolved from the bottom-most candidate instead of the best one.
    #[serde(default)]
    pub bottom_most_dates: Vec<String>,
}

impl DocumentType {
    /// Whether `class` may appear on this document.
    pub fn allows(&self, class: &str) -> bool {
        self.valid_classes.iter().any(|c| c == class)
    }

    /// Whether `class` resolves from the bottom-most candidate.
    pub fn uses_bottom_most(&self, class: &str) -> bool {
        self.bottom_most_dates.iter().any(|c| c == class)
    }

    /// Backup box for `class`, if one is defined.
    pub fn backup_for(&self, class: &str) -> Option<&BackupBox> {
        self.backup_boxes.iter().find(|b| b.class == class)
    }
}

/// All field classes and document types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCatalog {
    /// Field classes, indexed by key-value label.
    pub classes: Vec<FieldClass>,
    /// Document types, in inference tie-break order.
    pub document_types: Vec<DocumentType>,
}

impl Default for DocumentCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DocumentCatalog {
    /// Catalog for identity cards, driver licenses and certificates.
    pub fn builtin() -> Self {
        use DedupRule::*;
        use FieldStrategy::*;

        let classes = vec![
            FieldClass::new("name", Name, KeepBest, None),
            FieldClass::new(
                "id_number",
                RedactedId {
                    keep: 8,
                    masked_len: 14,
                },
                KeepBest,
                Some(ID_CHARS),
            ),
            FieldClass::new("address", Concat, MultiValued, None),
            FieldClass::new("issue_date", Date, KeepBest, Some(DATE_CHARS)),
            FieldClass::new("issuer", Concat, MultiValued, None),
            FieldClass::new(
                "license_number",
                LicenseNumber {
                    region_class: "license_region".to_string(),
                },
                MultiValued,
                Some(ID_CHARS),
            ),
            FieldClass::new("license_region", Serial, KeepBest, None),
            FieldClass::new("license_type", Serial, KeepBest, None),
            FieldClass::new("expiry_date", Date, MultiValued, Some(DATE_CHARS)),
            FieldClass::new("serial_number", Serial, KeepBest, Some(SERIAL_CHARS)),
            FieldClass::new("certificate_number", Serial, KeepBest, Some(SERIAL_CHARS)),
            FieldClass::new("birth_date", Date, KeepBest, Some(DATE_CHARS)),
            FieldClass::new("title", Concat, Merge, None),
        ];

        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let backup = |class: &str, x1: f32, y1: f32, x2: f32, y2: f32| BackupBox {
            class: class.to_string(),
            x1,
            y1,
            x2,
            y2,
        };

        let document_types = vec![
            DocumentType {
                name: "id_card".to_string(),
                valid_classes: strings(&["name", "id_number", "address", "issue_date", "issuer"]),
                required_classes: strings(&["name", "id_number"]),
                backup_boxes: vec![
                    backup("name", 0.05, 0.22, 0.45, 0.32),
                    backup("id_number", 0.05, 0.34, 0.50, 0.44),
                ],
                bottom_most_dates: Vec::new(),
            },
            DocumentType {
                name: "driver_license".to_string(),
                valid_classes: strings(&[
                    "name",
                    "id_number",
                    "address",
                    "issue_date",
                    "issuer",
                    "license_number",
                    "license_region",
                    "license_type",
                    "expiry_date",
                    "serial_number",
                ]),
                required_classes: strings(&["license_number"]),
                backup_boxes: vec![backup("license_number", 0.30, 0.20, 0.75, 0.30)],
                bottom_most_dates: strings(&["expiry_date"]),
            },
            DocumentType {
                name: "certificate".to_string(),
                valid_classes: strings(&[
                    "title",
                    "name",
                    "birth_date",
                    "certificate_number",
                    "issue_date",
                    "issuer",
                ]),
                required_classes: Vec::new(),
                backup_boxes: Vec::new(),
                bottom_most_dates: Vec::new(),
            },
        ];

        Self {
            classes,
            document_types,
        }
    }

    /// Parses and validates a catalog from JSON.
    pub fn from_json_str(json: &str) -> OcrResult<Self> {
        let catalog: Self = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Loads a catalog from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> OcrResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Checks that every reference points at a known class.
    pub fn validate(&self) -> OcrResult<()> {
        if self.classes.is_empty() {
            return Err(OCRError::config_error("catalog defines no field classes"));
        }
        let mut seen = HashSet::new();
        for class in &self.classes {
            if !seen.insert(class.name.as_str()) {
                return Err(OCRError::config_error(format!(
                    "duplicate field class '{}'",
                    class.name
                )));
            }
            if let FieldStrategy::RedactedId { keep, masked_len } = class.strategy
                && keep > masked_len
            {
                return Err(OCRError::config_error(format!(
                    "class '{}': keep ({keep}) exceeds masked_len ({masked_len})",
                    class.name
                )));
            }
        }
        for doc in &self.document_types {
            let referenced = doc
                .valid_classes
                .iter()
                .chain(&doc.required_classes)
                .chain(doc.backup_boxes.iter().map(|b| &b.class))
                .chain(&doc.bottom_most_dates);
            for name in referenced {
                if !seen.contains(name.as_str()) {
                    return Err(OCRError::config_error(format!(
                        "document type '{}' references unknown class '{name}'",
                        doc.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Class for a key-value label index.
    pub fn class_by_index(&self, index: usize) -> Option<&FieldClass> {
        self.classes.get(index)
    }

    /// Class by name.
    pub fn class(&self, name: &str) -> Option<&FieldClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Resolution strategy of a class; unknown classes resolve as [`FieldStrategy::Serial`].
    pub fn strategy(&self, name: &str) -> FieldStrategy {
        self.class(name)
            .map(|c| c.strategy.clone())
            .unwrap_or(FieldStrategy::Serial)
    }

    /// Dedup rule of a class.
    pub fn dedup_rule(&self, name: &str) -> DedupRule {
        self.class(name).map(|c| c.dedup).unwrap_or_default()
    }

    /// Recognition charset of a class.
    pub fn charset(&self, name: &str) -> Option<&str> {
        self.class(name).and_then(|c| c.charset.as_deref())
    }

    /// Document type by name.
    pub fn document_type(&self, name: &str) -> Option<&DocumentType> {
        self.document_types.iter().find(|d| d.name == name)
    }

    /// Document type whose valid classes cover the most of `classes`.
    ///
    /// Ties go to the type listed first; `None` when nothing matches.
    pub fn infer_type<'a, I>(&self, classes: I) -> Option<&DocumentType>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let detected: HashSet<&str> = classes.into_iter().collect();
        let mut best: Option<(&DocumentType, usize)> = None;
        for doc in &self.document_types {
            let covered = detected.iter().filter(|c| doc.allows(c)).count();
            if covered > 0 && best.is_none_or(|(_, n)| covered > n) {
                best = Some((doc, covered));
            }
        }
        best.map(|(doc, _)| doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = DocumentCatalog::builtin();
        assert!(catalog.validate().is_ok());
        assert_eq!(catalog.class_by_index(0).unwrap().name, "name");
        let license = catalog.document_type("driver_license").unwrap();
        assert!(license.uses_bottom_most("expiry_date"));
        assert!(license.allows("license_region"));
    }

    #[test]
    fn test_infer_type_prefers_best_coverage() {
        let catalog = DocumentCatalog::builtin();
        let doc = catalog
            .infer_type(["name", "license_number", "expiry_date"])
            .unwrap();
        assert_eq!(doc.name, "driver_license");
        // "name" and "id_number" are covered equally by id_card and driver_license
        let doc = catalog.infer_type(["name", "id_number"]).unwrap();
        assert_eq!(doc.name, "id_card");
        assert!(catalog.infer_type(["unknown"]).is_none());
    }

    #[test]
    fn test_catalog_json_rejects_unknown_reference() {
        let json = r#"{
            "classes": [ { "name": "name", "strategy": { "kind": "name" } } ],
            "document_types": [ { "name": "x", "valid_classes": ["name", "missing"] } ]
        }"#;
        let err = DocumentCatalog::from_json_str(json).unwrap_err();
        assert!(matches!(err, OCRError::ConfigError { .. }));
    }

    #[test]
    fn test_catalog_json_roundtrip_strategies() {
        let json = serde_json::to_string(&DocumentCatalog::builtin()).unwrap();
        let parsed = DocumentCatalog::from_json_str(&json).unwrap();
        assert_eq!(
            parsed.strategy("id_number"),
            FieldStrategy::RedactedId {
                keep: 8,
                masked_len: 14
            }
        );
        assert_eq!(parsed.dedup_rule("address"), DedupRule::MultiValued);
    }

    #[test]
    fn test_backup_box_scales_to_frame() {
        let backup = BackupBox {
            class: "name".to_string(),
            x1: 0.1,
            y1: 0.2,
            x2: 0.5,
            y2: 0.4,
        };
        let bbox = backup.to_bbox(200, 100);
        assert!((bbox.x1 - 20.0).abs() < 1e-4);
        assert!((bbox.y2 - 40.0).abs() < 1e-4);
    }
}
