//! Error types for the extraction cascade.
//!
//! Every stage reports failures through [`OCRError`]. Backend failures are fatal
//! and never retried inside the crate, a missing boundary is not an error at all
//! (see [`crate::domain::BoundaryResult`]), and a document where no field could be
//! detected surfaces as [`OCRError::NoFieldsDetected`].
//!
//! [`OCRError::failure_kind`] collapses the taxonomy into the small set of
//! user-visible conditions the calling service reports.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Stage of the cascade an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Tensor construction or reshaping.
    TensorOperation,
    /// Image resizing, cropping or warping.
    Resize,
    /// Assembling or splitting a batch.
    BatchProcessing,
    /// Converting raw model outputs into domain values.
    PostProcessing,
    /// Generic processing error.
    Generic,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::TensorOperation => write!(f, "tensor operation"),
            ProcessingStage::Resize => write!(f, "resize"),
            ProcessingStage::BatchProcessing => write!(f, "batch processing"),
            ProcessingStage::PostProcessing => write!(f, "post-processing"),
            ProcessingStage::Generic => write!(f, "processing"),
        }
    }
}

/// Errors raised by the extraction cascade.
#[derive(Error, Debug)]
pub enum OCRError {
    /// Error occurred while decoding an input image.
    #[error("image load")]
    ImageLoad(#[source] image::ImageError),

    /// Error occurred during processing.
    #[error("{kind} failed: {context}")]
    Processing {
        /// The stage of processing where the error occurred.
        kind: ProcessingStage,
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The inference backend failed or rejected the inputs.
    #[error("artifact '{model_name}' failed: {context}")]
    ArtifactRuntime {
        /// Name of the artifact that failed.
        model_name: String,
        /// What was being attempted.
        context: String,
        /// Backend error, when one exists.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A batched run failed; every waiter of that batch receives the same error.
    #[error("batched run on '{model_name}' failed")]
    BatchFailed {
        /// Name of the artifact behind the batcher.
        model_name: String,
        /// The error shared by the whole batch.
        #[source]
        source: Arc<OCRError>,
    },

    /// The key-value model produced no usable field box.
    #[error("no fields detected in document (document type: {document_type})")]
    NoFieldsDetected {
        /// Active document type, or `unknown`.
        document_type: String,
    },

    /// No document boundary was found and the whole-image fallback is disabled.
    #[error("document boundary not found after {attempts} attempts")]
    DocumentNotLocated {
        /// Number of attempts made.
        attempts: usize,
    },

    /// The per-request deadline expired between stages.
    #[error("request deadline of {budget_ms} ms exceeded before {stage}")]
    DeadlineExceeded {
        /// Configured budget in milliseconds.
        budget_ms: u64,
        /// Stage that was about to start.
        stage: String,
    },

    /// Error indicating invalid input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// Error indicating a configuration problem.
    #[error("configuration: {message}")]
    ConfigError {
        /// A message describing the configuration error.
        message: String,
    },

    /// Error from tensor operations.
    #[error("tensor operation")]
    Tensor(#[from] ndarray::ShapeError),

    /// JSON (de)serialization error.
    #[error("json")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

/// Convenient result alias for extraction operations.
pub type OcrResult<T> = Result<T, OCRError>;

/// User-visible failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No document could be located in the photograph.
    DocumentNotLocated,
    /// A document was framed but no field could be detected on it.
    NoFieldsDetected,
    /// An inference backend failed or is unavailable.
    BackendUnavailable,
    /// The submitted image could not be decoded or is unusable.
    InvalidImage,
    /// Anything else (configuration, deadline, internal processing).
    Internal,
}

/// Structured failure body handed back to the calling service.
#[derive(Debug, Clone, Serialize)]
pub struct FailureResponse {
    /// Failure category.
    pub kind: FailureKind,
    /// Human readable message, without backtraces.
    pub message: String,
}

impl OCRError {
    /// Creates an error for a failing backend call.
    pub fn artifact_runtime(
        model_name: &str,
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ArtifactRuntime {
            model_name: model_name.to_string(),
            context: context.into(),
            source: Some(Box::new(error)),
        }
    }

    /// Creates an error for an input that does not match the artifact contract.
    pub fn artifact_contract(model_name: &str, context: impl Into<String>) -> Self {
        Self::ArtifactRuntime {
            model_name: model_name.to_string(),
            context: context.into(),
            source: None,
        }
    }

    /// Creates an OCRError for tensor operations.
    pub fn tensor_operation(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind: ProcessingStage::TensorOperation,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an OCRError for post-processing operations.
    pub fn post_processing(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind: ProcessingStage::PostProcessing,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an OCRError for batch assembly.
    pub fn batch_processing(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind: ProcessingStage::BatchProcessing,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates a configuration error.
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Creates a configuration error naming the offending field and value.
    pub fn config_error_with_context(field: &str, value: &str, reason: &str) -> Self {
        Self::ConfigError {
            message: format!("{field} = {value}: {reason}"),
        }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Maps the error onto the user-visible failure category.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OCRError::NoFieldsDetected { .. } => FailureKind::NoFieldsDetected,
            OCRError::DocumentNotLocated { .. } => FailureKind::DocumentNotLocated,
            OCRError::ArtifactRuntime { .. } => FailureKind::BackendUnavailable,
            OCRError::BatchFailed { source, .. } => source.failure_kind(),
            OCRError::ImageLoad(_) | OCRError::InvalidInput { .. } => FailureKind::InvalidImage,
            _ => FailureKind::Internal,
        }
    }

    /// Builds the structured failure body for this error.
    pub fn to_failure_response(&self) -> FailureResponse {
        let message = match self.failure_kind() {
            FailureKind::DocumentNotLocated => "could not locate document".to_string(),
            FailureKind::NoFieldsDetected => "unable to extract information".to_string(),
            FailureKind::BackendUnavailable => "inference backend unavailable".to_string(),
            FailureKind::InvalidImage => format!("invalid image: {self}"),
            FailureKind::Internal => self.to_string(),
        };
        FailureResponse {
            kind: self.failure_kind(),
            message,
        }
    }
}

/// Plain message error used as a `source` when no underlying error exists.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SimpleError(pub String);

impl SimpleError {
    /// Creates a new message error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
