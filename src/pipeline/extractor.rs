//! High-level extraction API.
//!
//! [`DocumentExtractor`] wires the four stages together: it locates the document,
//! detects its fields, reads them and assembles the final record. Build one with
//! [`DocumentExtractorBuilder`] from already loaded handles, or with
//! [`DocumentExtractor::from_config`] from model files on disk.

use super::assembler::FieldAssembler;
use super::debug::{DebugSink, DebugSnapshot, check_request_id, next_request_id};
use super::detector::FieldDetector;
use super::invoker::ModelInvoker;
use super::locator::BoundaryLocator;
use super::recognizer::TextRecognizer;
use super::stats::{
    Deadline, ExtractionStats, RequestOutcome, ResponseLog, STAGE_ASSEMBLY, STAGE_BOUNDARY,
    STAGE_KEY_VALUE, STAGE_RECOGNITION, StatsManager,
};
use crate::core::config::{ArtifactConfig, BatcherConfig, ExtractionConfig};
use crate::core::errors::{FailureResponse, OCRError, OcrResult};
use crate::core::inference::{ArtifactHost, ModelRole};
use crate::domain::{CharTable, DocumentCatalog, FrameSource, NormalizedRecord};
use crate::utils::image::decode_image;
use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Image handed to the extractor.
#[derive(Debug, Clone)]
pub enum DocumentInput {
    /// A decoded image.
    Image(RgbImage),
    /// Encoded image bytes (any format the `image` crate reads).
    Encoded(Vec<u8>),
    /// A multi-page document; only page `index` is processed.
    Pages {
        /// Decoded pages.
        pages: Vec<RgbImage>,
        /// Zero-based page to process.
        index: usize,
    },
}

impl DocumentInput {
    /// Resolves the input into the single image to process.
    pub fn into_image(self) -> OcrResult<RgbImage> {
        let image = match self {
            DocumentInput::Image(image) => image,
            DocumentInput::Encoded(bytes) => decode_image(&bytes)?,
            DocumentInput::Pages { pages, index } => {
                let count = pages.len();
                pages.into_iter().nth(index).ok_or_else(|| {
                    OCRError::invalid_input(format!("page {index} requested from a {count}-page document"))
                })?
            }
        };
        if image.width() == 0 || image.height() == 0 {
            return Err(OCRError::invalid_input("image has no pixels"));
        }
        Ok(image)
    }
}

impl From<RgbImage> for DocumentInput {
    fn from(image: RgbImage) -> Self {
        DocumentInput::Image(image)
    }
}

/// One extraction call.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Image to process.
    pub input: DocumentInput,
    /// Document type hint; inferred from the detected fields when absent.
    pub document_type: Option<String>,
    /// Thresholds and toggles.
    pub config: ExtractionConfig,
    /// Identifier for logs and debug snapshots; generated when absent.
    pub request_id: Option<String>,
}

impl ExtractionRequest {
    /// Creates a request with the default configuration.
    pub fn new(input: impl Into<DocumentInput>) -> Self {
        Self {
            input: input.into(),
            document_type: None,
            config: ExtractionConfig::default(),
            request_id: None,
        }
    }

    /// Sets the document type hint.
    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: ExtractionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the request identifier.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Builder for [`DocumentExtractor`].
///
/// # Example
///
/// ```no_run
/// use oar_kie::core::{ArtifactConfig, ArtifactHost};
/// use oar_kie::pipeline::DocumentExtractorBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ArtifactConfig::new("boundary.onnx", "kv.onnx", "rec.onnx");
/// let extractor = DocumentExtractorBuilder::new(ArtifactHost::load(&config)?)
///     .rec_batch_size(16)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DocumentExtractorBuilder {
    host: ArtifactHost,
    catalog: Option<Arc<DocumentCatalog>>,
    char_table: Option<Arc<CharTable>>,
    boundary_batcher: Option<BatcherConfig>,
    kv_batcher: Option<BatcherConfig>,
    rec_batch_size: Option<usize>,
    debug_sink: Option<Arc<dyn DebugSink>>,
}

impl DocumentExtractorBuilder {
    /// Starts a builder over loaded model handles.
    pub fn new(host: ArtifactHost) -> Self {
        Self {
            host,
            catalog: None,
            char_table: None,
            boundary_batcher: None,
            kv_batcher: None,
            rec_batch_size: None,
            debug_sink: None,
        }
    }

    /// Sets the document catalog. Defaults to [`DocumentCatalog::builtin`].
    pub fn catalog(mut self, catalog: Arc<DocumentCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Sets the recognition character table. Defaults to [`CharTable::builtin`].
    pub fn char_table(mut self, table: Arc<CharTable>) -> Self {
        self.char_table = Some(table);
        self
    }

    /// Puts a micro-batcher in front of the boundary model.
    pub fn boundary_batcher(mut self, config: BatcherConfig) -> Self {
        self.boundary_batcher = Some(config);
        self
    }

    /// Puts a micro-batcher in front of the key-value model.
    pub fn kv_batcher(mut self, config: BatcherConfig) -> Self {
        self.kv_batcher = Some(config);
        self
    }

    /// Recognition batch size, used when the artifact's batch dimension is dynamic.
    pub fn rec_batch_size(mut self, size: usize) -> Self {
        self.rec_batch_size = Some(size);
        self
    }

    /// Sets where debug snapshots go.
    pub fn debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    /// Builds the extractor.
    pub fn build(self) -> OcrResult<DocumentExtractor> {
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(DocumentCatalog::builtin()));
        catalog.validate()?;
        let table = self
            .char_table
            .unwrap_or_else(|| Arc::new(CharTable::builtin()));

        let locator = BoundaryLocator::new(ModelInvoker::new(
            self.host.handle(ModelRole::Boundary).clone(),
            self.boundary_batcher.as_ref(),
        )?);
        let detector = FieldDetector::new(
            ModelInvoker::new(
                self.host.handle(ModelRole::KeyValue).clone(),
                self.kv_batcher.as_ref(),
            )?,
            Arc::clone(&catalog),
        );
        let recognizer = TextRecognizer::new(
            self.host.handle(ModelRole::Recognition).clone(),
            table,
            self.rec_batch_size,
        )?;

        Ok(DocumentExtractor {
            locator,
            detector,
            recognizer,
            assembler: FieldAssembler::new(Arc::clone(&catalog)),
            catalog,
            debug_sink: self.debug_sink,
            stats: StatsManager::new(),
        })
    }
}

/// The extraction cascade.
#[derive(Debug)]
pub struct DocumentExtractor {
    locator: BoundaryLocator,
    detector: FieldDetector,
    recognizer: TextRecognizer,
    assembler: FieldAssembler,
    catalog: Arc<DocumentCatalog>,
    debug_sink: Option<Arc<dyn DebugSink>>,
    stats: StatsManager,
}

impl DocumentExtractor {
    /// Loads the artifacts, dictionary and catalog named by `config`.
    pub fn from_config(config: &ArtifactConfig) -> OcrResult<Self> {
        let host = ArtifactHost::load(config)?;
        let mut builder = DocumentExtractorBuilder::new(host);
        if let Some(path) = &config.char_dict {
            builder = builder.char_table(Arc::new(CharTable::from_dict_file(path)?));
        }
        if let Some(path) = &config.catalog {
            builder = builder.catalog(Arc::new(DocumentCatalog::from_file(path)?));
        }
        if let Some(batcher) = &config.boundary_batcher {
            builder = builder.boundary_batcher(batcher.clone());
        }
        if let Some(batcher) = &config.kv_batcher {
            builder = builder.kv_batcher(batcher.clone());
        }
        builder.build()
    }

    /// The catalog fields are resolved against.
    pub fn catalog(&self) -> &DocumentCatalog {
        &self.catalog
    }

    /// Outcomes accumulated so far.
    pub fn stats(&self) -> ExtractionStats {
        self.stats.get_stats()
    }

    /// Clears the accumulated outcomes.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Runs the cascade on one document.
    ///
    /// # Errors
    ///
    /// * [`OCRError::NoFieldsDetected`] when no field box survives detection.
    /// * [`OCRError::DocumentNotLocated`] when no boundary is found and the
    ///   whole-image fallback is disabled.
    /// * [`OCRError::ArtifactRuntime`] when a model call fails.
    /// * [`OCRError::DeadlineExceeded`] when the request budget runs out.
    pub fn extract(&self, request: ExtractionRequest) -> OcrResult<NormalizedRecord> {
        let started = Instant::now();
        let result = self.run(request);
        let outcome = match &result {
            Ok(record) => match record.frame_source {
                FrameSource::Original => RequestOutcome::Extracted,
                FrameSource::WholeImage => RequestOutcome::ExtractedWholeImage,
                FrameSource::Rotated { .. } | FrameSource::Eroded { .. } => {
                    RequestOutcome::ExtractedAfterRetry
                }
            },
            Err(e) => {
                warn!(error = %e, "extraction failed");
                RequestOutcome::Failed(e.failure_kind())
            }
        };
        self.stats.update(outcome, started.elapsed());
        result
    }

    /// Like [`DocumentExtractor::extract`], reporting failures as a [`FailureResponse`].
    pub fn extract_or_failure(
        &self,
        request: ExtractionRequest,
    ) -> Result<NormalizedRecord, FailureResponse> {
        self.extract(request).map_err(|e| e.to_failure_response())
    }

    fn run(&self, request: ExtractionRequest) -> OcrResult<NormalizedRecord> {
        let ExtractionRequest {
            input,
            document_type,
            config,
            request_id,
        } = request;
        config.validate()?;
        let request_id = request_id.unwrap_or_else(next_request_id);
        check_request_id(&request_id)?;
        let deadline = Deadline::start(config.request_timeout());
        let image = input.into_image()?;
        let mut log = ResponseLog::new();

        let stage = Instant::now();
        let located = self.locator.locate(&image, &config, &deadline)?;
        log.record(STAGE_BOUNDARY, located.attempts.len(), stage.elapsed());

        deadline.check(STAGE_KEY_VALUE)?;
        let stage = Instant::now();
        let detection = self
            .detector
            .detect(&located.image, document_type.as_deref(), &config)?;
        log.record(STAGE_KEY_VALUE, 1, stage.elapsed());

        deadline.check(STAGE_RECOGNITION)?;
        let stage = Instant::now();
        let recognition =
            self.recognizer
                .recognize(&located.image, &detection.boxes, &self.catalog, &config)?;
        log.record(STAGE_RECOGNITION, recognition.calls, stage.elapsed());

        deadline.check(STAGE_ASSEMBLY)?;
        let stage = Instant::now();
        let fields = self.assembler.assemble(
            detection.document_type.as_deref(),
            &recognition.texts,
            &config,
        );
        log.record(STAGE_ASSEMBLY, 0, stage.elapsed());
        log.set_total(deadline.elapsed());

        let mut record = NormalizedRecord {
            document_type: detection
                .document_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            fields,
            savepath: None,
            frame_source: located.source,
            response_log: log,
        };

        if config.debug {
            match &self.debug_sink {
                Some(sink) => {
                    let snapshot = DebugSnapshot {
                        request_id: request_id.clone(),
                        frame: located.image,
                        boxes: detection.boxes,
                        record: record.clone(),
                        attempts: located.attempts,
                        boundary: located.boundary,
                    };
                    match sink.write_snapshot(&snapshot) {
                        Ok(path) => record.savepath = Some(path),
                        Err(e) => warn!(request_id = %request_id, error = %e, "failed to write debug snapshot"),
                    }
                }
                None => warn!(request_id = %request_id, "debug requested but no debug sink is configured"),
            }
        }

        info!(
            request_id = %request_id,
            document_type = %record.document_type,
            frame = %record.frame_source,
            fields = record.fields.len(),
            total_ms = record.response_log.total_ms(),
            "extraction complete"
        );
        Ok(record)
    }
}
