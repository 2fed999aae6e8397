//! ONNX Runtime backend with a small round-robin session pool.

use super::host::{ArtifactRef, InferenceBackend, TensorMap, TensorSpec};
use crate::core::errors::{OCRError, OcrResult};
use ndarray::{ArrayD, CowArray, IxDyn};
use ort::logging::LogLevel;
use ort::session::{Session, SessionInputValue};
use ort::value::{DynValue, TensorRef, ValueType};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// [`InferenceBackend`] over ONNX Runtime.
///
/// Holds `session_pool_size` sessions of the same artifact; calls pick one
/// round-robin and lock it for the duration of the forward pass. Integer
/// outputs are widened to `f32`.
pub struct OrtBackend {
    sessions: Vec<Mutex<Session>>,
    next_idx: AtomicUsize,
    inputs: Vec<TensorSpec>,
    output_names: Vec<String>,
    model_path: PathBuf,
    model_name: String,
}

impl std::fmt::Debug for OrtBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtBackend")
            .field("sessions", &self.sessions.len())
            .field("inputs", &self.inputs)
            .field("output_names", &self.output_names)
            .field("model_path", &self.model_path)
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl OrtBackend {
    /// Builds the session pool for `artifact` and reads its declared inputs and outputs.
    pub fn load(artifact: &ArtifactRef) -> OcrResult<Self> {
        let model_name = artifact
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown_model")
            .to_string();
        let pool_size = artifact.session_pool_size.max(1);

        let mut sessions = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            sessions.push(Self::build_session(artifact, &model_name)?);
        }

        let (inputs, output_names) = {
            let first = &sessions[0];
            let inputs = first
                .inputs
                .iter()
                .map(|input| {
                    let shape = match &input.input_type {
                        ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
                        _ => Vec::new(),
                    };
                    TensorSpec::new(input.name.clone(), shape)
                })
                .collect::<Vec<_>>();
            let outputs = first.outputs.iter().map(|o| o.name.clone()).collect();
            (inputs, outputs)
        };

        debug!(
            model = %model_name,
            sessions = pool_size,
            ?inputs,
            ?output_names,
            "created onnx sessions"
        );

        Ok(Self {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            next_idx: AtomicUsize::new(0),
            inputs,
            output_names,
            model_path: artifact.path.clone(),
            model_name,
        })
    }

    fn build_session(artifact: &ArtifactRef, model_name: &str) -> OcrResult<Session> {
        let builder = Session::builder()
            .and_then(|b| b.with_log_level(LogLevel::Error))
            .map_err(|e| OCRError::artifact_runtime(model_name, "create session builder", e))?;
        let builder = match artifact.intra_threads {
            Some(threads) => builder
                .with_intra_threads(threads)
                .map_err(|e| OCRError::artifact_runtime(model_name, "set intra threads", e))?,
            None => builder,
        };
        builder.commit_from_file(&artifact.path).map_err(|e| {
            OCRError::artifact_runtime(
                model_name,
                format!("load artifact '{}'", artifact.path.display()),
                e,
            )
        })
    }

    /// Returns the model path associated with this backend.
    pub fn model_path(&self) -> &std::path::Path {
        &self.model_path
    }
}

/// Reads an output tensor as `f32`, widening `i64` and `i32` heads.
fn extract_output(model_name: &str, name: &str, value: &DynValue) -> OcrResult<ArrayD<f32>> {
    if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        return to_array(shape, data.to_vec());
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<i64>() {
        return to_array(shape, data.iter().map(|&v| v as f32).collect());
    }
    let (shape, data) = value.try_extract_tensor::<i32>().map_err(|e| {
        OCRError::artifact_runtime(
            model_name,
            format!("extract output '{name}' (only f32, i64 and i32 are supported)"),
            e,
        )
    })?;
    to_array(shape, data.iter().map(|&v| v as f32).collect())
}

fn to_array(shape: &[i64], data: Vec<f32>) -> OcrResult<ArrayD<f32>> {
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&dims), data)?)
}

impl InferenceBackend for OrtBackend {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn input_specs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn run(&self, inputs: &TensorMap) -> OcrResult<TensorMap> {
        let contiguous: Vec<(&String, CowArray<'_, f32, IxDyn>)> = inputs
            .iter()
            .map(|(name, tensor)| (name, tensor.as_standard_layout()))
            .collect();

        let mut feeds: Vec<(String, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in &contiguous {
            let tensor_ref = TensorRef::from_array_view(tensor.view()).map_err(|e| {
                OCRError::artifact_runtime(
                    &self.model_name,
                    format!("convert input '{name}' with shape {:?}", tensor.shape()),
                    e,
                )
            })?;
            feeds.push(((*name).clone(), tensor_ref.into()));
        }

        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[idx].lock().map_err(|_| {
            OCRError::artifact_contract(
                &self.model_name,
                format!("session {}/{} lock poisoned", idx, self.sessions.len()),
            )
        })?;

        let outputs = session
            .run(feeds)
            .map_err(|e| OCRError::artifact_runtime(&self.model_name, "forward pass", e))?;

        let mut result = TensorMap::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let array = extract_output(&self.model_name, name, &outputs[name.as_str()])?;
            result.insert(name.clone(), array);
        }
        Ok(result)
    }
}
