//! Field extraction example using the OAR KIE library.
//!
//! Runs the boundary, key-value and recognition models over one or more document
//! photographs and prints the extracted record of each as JSON.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example extract_fields -- \
//!     --boundary-model path/to/boundary.onnx \
//!     --kv-model path/to/kv.onnx \
//!     --recognition-model path/to/rec.onnx \
//!     --char-dict path/to/dict.txt \
//!     --document-type driver_license \
//!     --debug-dir debug_out \
//!     license.jpg
//! ```

use clap::Parser;
use oar_kie::core::{ArtifactConfig, ArtifactHost, ExtractionConfig, init_tracing};
use oar_kie::domain::{CharTable, DocumentCatalog};
use oar_kie::pipeline::{DocumentExtractorBuilder, ExtractionRequest, FileDebugSink};
use oar_kie::utils::load_image;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Command-line arguments for the extraction example.
#[derive(Parser)]
#[command(name = "extract_fields")]
#[command(about = "OAR KIE Example - key-value extraction from document photographs")]
struct Args {
    /// Images to process.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Path to the document boundary model.
    #[arg(long)]
    boundary_model: PathBuf,

    /// Path to the key-value (field) detection model.
    #[arg(long)]
    kv_model: PathBuf,

    /// Path to the text recognition model.
    #[arg(long)]
    recognition_model: PathBuf,

    /// Recognition dictionary, one symbol per line. The built-in table is used when absent.
    #[arg(long)]
    char_dict: Option<PathBuf>,

    /// Document catalog JSON. The built-in catalog is used when absent.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Extraction configuration JSON.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Document type hint (e.g. `id_card`, `driver_license`, `certificate`).
    #[arg(long)]
    document_type: Option<String>,

    /// Directory for debug snapshots. Enables the `debug` flag.
    #[arg(long)]
    debug_dir: Option<PathBuf>,

    /// Number of ONNX sessions per model.
    #[arg(long, default_value_t = 1)]
    session_pool_size: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let mut artifacts =
        ArtifactConfig::new(&args.boundary_model, &args.kv_model, &args.recognition_model);
    artifacts.session_pool_size = args.session_pool_size;

    let mut builder = DocumentExtractorBuilder::new(ArtifactHost::load(&artifacts)?);
    if let Some(path) = &args.char_dict {
        builder = builder.char_table(Arc::new(CharTable::from_dict_file(path)?));
    }
    if let Some(path) = &args.catalog {
        builder = builder.catalog(Arc::new(DocumentCatalog::from_file(path)?));
    }
    if let Some(dir) = &args.debug_dir {
        builder = builder.debug_sink(Arc::new(FileDebugSink::new(dir)));
    }
    let extractor = builder.build()?;

    let mut config = match &args.config {
        Some(path) => ExtractionConfig::from_file(path)?,
        None => ExtractionConfig::default(),
    };
    if args.debug_dir.is_some() {
        config = config.with_debug(true);
    }

    for path in &args.images {
        if !Path::new(path).exists() {
            error!("Image file not found: {}", path.display());
            continue;
        }
        let image = load_image(path)?;
        let mut request = ExtractionRequest::new(image).with_config(config.clone());
        if let Some(document_type) = &args.document_type {
            request = request.with_document_type(document_type);
        }

        match extractor.extract_or_failure(request) {
            Ok(record) => {
                info!(
                    "{}: {} fields from {} frame",
                    path.display(),
                    record.fields.len(),
                    record.frame_source
                );
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            Err(failure) => {
                error!("{}: {}", path.display(), failure.message);
                println!("{}", serde_json::to_string_pretty(&failure)?);
            }
        }
    }

    info!("{}", extractor.stats());
    Ok(())
}
