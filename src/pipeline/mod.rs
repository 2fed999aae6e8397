//! The extraction cascade.
//!
//! Stages run leaf to root: [`BoundaryLocator`] frames the document,
//! [`FieldDetector`] finds field boxes on the frame, [`TextRecognizer`] reads them
//! and [`FieldAssembler`] collapses the texts into a [`NormalizedRecord`].
//! [`DocumentExtractor`] drives all four for one request.
//!
//! [`NormalizedRecord`]: crate::domain::NormalizedRecord

pub mod assembler;
pub mod debug;
pub mod detector;
pub mod extractor;
pub mod invoker;
pub mod locator;
pub mod recognizer;
pub mod stats;

pub use assembler::{FieldAssembler, ResolveContext, resolve};
pub use debug::{DebugSink, DebugSnapshot, FileDebugSink, check_request_id};
pub use detector::{Detection, FieldDetector};
pub use extractor::{DocumentExtractor, DocumentExtractorBuilder, DocumentInput, ExtractionRequest};
pub use invoker::ModelInvoker;
pub use locator::{AttemptRecord, AttemptStrategy, BoundaryLocator, LocateOutcome};
pub use recognizer::{Recognition, TextRecognizer};
pub use stats::{Deadline, ExtractionStats, ResponseLog, StageTiming, StatsManager};
