//! The core module of the extraction cascade.
//!
//! This module contains the fundamental components every stage builds on:
//! - Batch assembly and the micro-batcher
//! - Configuration objects
//! - Error handling
//! - The inference artifact host
//!
//! It also provides re-exports of commonly used types and functions for convenience.

pub mod batch;
pub mod config;
pub mod errors;
pub mod inference;

pub use batch::{BatchTicket, MicroBatcher};
pub use config::{ArtifactConfig, BatcherConfig, ExtractionConfig};
pub use errors::{FailureKind, FailureResponse, OCRError, OcrResult, ProcessingStage};
pub use inference::{ArtifactHost, InferenceBackend, ModelHandle, ModelRole, TensorMap};

/// Initializes the tracing subscriber for logging.
///
/// This function sets up the tracing subscriber with environment filter and formatting layer.
/// It's typically called at the start of an application to enable logging.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
