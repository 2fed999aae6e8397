//! Domain-level structures shared across the extraction cascade.
//!
//! This module groups the per-request values (boundary results, field boxes,
//! recognized text, normalized records) and the immutable catalogs (document
//! types, field strategies, recognition character table).

pub mod catalog;
pub mod charset;
pub mod types;

pub use catalog::{BackupBox, DedupRule, DocumentCatalog, DocumentType, FieldClass, FieldStrategy};
pub use charset::CharTable;
pub use types::{
    BoundaryResult, FieldBox, FieldBoxSet, FrameSource, NormalizedRecord, RecognizedText, Rotation,
};
