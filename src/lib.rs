//! # OAR KIE
//!
//! Key-value extraction from photographs of identity documents, driver licenses
//! and certificates, built on ONNX models.
//!
//! ## Features
//!
//! - Three-model cascade: document boundary, field (key-value) detection, text recognition
//! - Perspective rectification from masks or corner keypoints
//! - Bounded retries (rotation sweep, concentric erosion) with a whole-image fallback
//! - Per-class field resolution: dates, masked identifiers, license numbers, names
//! - Optional micro-batching of concurrent requests in front of a model
//! - Debug snapshots (annotated frame plus JSON record)
//!
//! ## Modules
//!
//! * [`core`] - Errors, configuration, the inference host and batching
//! * [`domain`] - Catalogs and per-request values
//! * [`pipeline`] - The cascade stages and the high-level extractor
//! * [`processors`] - Geometry, recognition resizing and decoding
//! * [`utils`] - Image helpers, transforms and visualization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use oar_kie::prelude::*;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ArtifactConfig::new(
//!     "models/boundary.onnx",
//!     "models/kv.onnx",
//!     "models/rec.onnx",
//! )
//! .with_char_dict("models/dict.txt");
//! let extractor = DocumentExtractor::from_config(&config)?;
//!
//! let image = load_image(Path::new("license.jpg"))?;
//! let request = ExtractionRequest::new(image)
//!     .with_document_type("driver_license")
//!     .with_config(ExtractionConfig::default().with_redaction(true, false));
//! let record = extractor.extract(request)?;
//!
//! for (class, value) in &record.fields {
//!     println!("{class}: {value}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod domain;
pub mod pipeline;
pub mod processors;
pub mod utils;

/// Prelude module for convenient imports.
///
/// ```rust
/// use oar_kie::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{ArtifactConfig, ExtractionConfig, OCRError, OcrResult, init_tracing};
    pub use crate::domain::{DocumentCatalog, NormalizedRecord};
    pub use crate::pipeline::{
        DocumentExtractor, DocumentExtractorBuilder, DocumentInput, ExtractionRequest,
    };
    pub use crate::utils::load_image;
}
