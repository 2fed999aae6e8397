//! The inference artifact host: named-tensor calls against opaque model artifacts.
//!
//! Backends implement [`InferenceBackend`]; callers only ever see a [`ModelHandle`],
//! which validates inputs against the artifact's declared tensor specs before
//! every call. Handles are loaded once and are read-only afterwards.

use crate::core::config::ArtifactConfig;
use crate::core::errors::{OCRError, OcrResult};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Named tensors exchanged with an artifact. All tensors are f32, batch-first.
pub type TensorMap = HashMap<String, ArrayD<f32>>;

/// Declared name and shape of an artifact input. Dynamic dimensions are negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    /// Input name.
    pub name: String,
    /// Declared shape, `-1` for dynamic dimensions.
    pub shape: Vec<i64>,
}

impl TensorSpec {
    /// Creates a new tensor spec.
    pub fn new(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Returns true when `shape` is compatible with the declared shape.
    pub fn matches(&self, shape: &[usize]) -> bool {
        if self.shape.is_empty() {
            return true;
        }
        self.shape.len() == shape.len()
            && self
                .shape
                .iter()
                .zip(shape)
                .all(|(&declared, &actual)| declared < 0 || declared as usize == actual)
    }

    /// Returns the compiled batch size when the leading dimension is static.
    pub fn static_batch(&self) -> Option<usize> {
        self.shape
            .first()
            .filter(|&&d| d > 0)
            .map(|&d| d as usize)
    }

    /// Returns the static `(height, width)` of an NCHW input, if declared.
    pub fn static_hw(&self) -> Option<(u32, u32)> {
        match self.shape.as_slice() {
            [_, _, h, w] if *h > 0 && *w > 0 => Some((*h as u32, *w as u32)),
            _ => None,
        }
    }
}

/// A loaded model artifact that can be run on named tensors.
pub trait InferenceBackend: Send + Sync + std::fmt::Debug {
    /// Name of the artifact, used in logs and errors.
    fn model_name(&self) -> &str;

    /// Declared inputs of the artifact.
    fn input_specs(&self) -> &[TensorSpec];

    /// Runs the artifact. Implementations must not return partial outputs.
    fn run(&self, inputs: &TensorMap) -> OcrResult<TensorMap>;
}

/// Shared, read-only handle to a loaded artifact.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    backend: Arc<dyn InferenceBackend>,
}

impl ModelHandle {
    /// Wraps a backend into a handle.
    pub fn new(backend: impl InferenceBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Wraps an already shared backend.
    pub fn from_arc(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }

    /// Name of the underlying artifact.
    pub fn name(&self) -> &str {
        self.backend.model_name()
    }

    /// Declared inputs.
    pub fn input_specs(&self) -> &[TensorSpec] {
        self.backend.input_specs()
    }

    /// Looks up a declared input by name.
    pub fn input_spec(&self, name: &str) -> Option<&TensorSpec> {
        self.input_specs().iter().find(|spec| spec.name == name)
    }

    /// Whether the artifact declares an input with this name.
    pub fn accepts(&self, name: &str) -> bool {
        self.input_spec(name).is_some()
    }

    /// Compiled batch size of the primary input, if the artifact has a static one.
    pub fn static_batch_size(&self) -> Option<usize> {
        self.input_specs().first().and_then(TensorSpec::static_batch)
    }

    /// Validates `inputs` against the declared specs and runs the artifact.
    pub fn run(&self, inputs: &TensorMap) -> OcrResult<TensorMap> {
        self.validate(inputs)?;
        self.backend.run(inputs)
    }

    fn validate(&self, inputs: &TensorMap) -> OcrResult<()> {
        for spec in self.input_specs() {
            let tensor = inputs.get(&spec.name).ok_or_else(|| {
                OCRError::artifact_contract(self.name(), format!("missing input '{}'", spec.name))
            })?;
            if !spec.matches(tensor.shape()) {
                return Err(OCRError::artifact_contract(
                    self.name(),
                    format!(
                        "input '{}' has shape {:?}, artifact declares {:?}",
                        spec.name,
                        tensor.shape(),
                        spec.shape
                    ),
                ));
            }
        }
        if let Some(extra) = inputs.keys().find(|name| !self.accepts(name)) {
            return Err(OCRError::artifact_contract(
                self.name(),
                format!("unexpected input '{extra}'"),
            ));
        }
        Ok(())
    }
}

/// Backend driven by a closure, for in-process models and test doubles.
pub struct FnBackend<F> {
    name: String,
    specs: Vec<TensorSpec>,
    func: F,
}

impl<F> FnBackend<F>
where
    F: Fn(&TensorMap) -> OcrResult<TensorMap> + Send + Sync,
{
    /// Creates a closure backend with the given declared inputs.
    pub fn new(name: impl Into<String>, specs: Vec<TensorSpec>, func: F) -> Self {
        Self {
            name: name.into(),
            specs,
            func,
        }
    }
}

impl<F> std::fmt::Debug for FnBackend<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBackend")
            .field("name", &self.name)
            .field("specs", &self.specs)
            .finish()
    }
}

impl<F> InferenceBackend for FnBackend<F>
where
    F: Fn(&TensorMap) -> OcrResult<TensorMap> + Send + Sync,
{
    fn model_name(&self) -> &str {
        &self.name
    }

    fn input_specs(&self) -> &[TensorSpec] {
        &self.specs
    }

    fn run(&self, inputs: &TensorMap) -> OcrResult<TensorMap> {
        (self.func)(inputs)
    }
}

/// Role of an artifact in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    /// Document boundary model.
    Boundary,
    /// Key-value (field) detection model.
    KeyValue,
    /// Text recognition model.
    Recognition,
}

/// Reference to an artifact file plus session settings.
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    /// Artifact file.
    pub path: PathBuf,
    /// Number of sessions in the pool.
    pub session_pool_size: usize,
    /// Intra-op threads per session.
    pub intra_threads: Option<usize>,
}

impl ArtifactRef {
    /// Creates a reference with a single session.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session_pool_size: 1,
            intra_threads: None,
        }
    }
}

/// Loads an artifact with the ONNX Runtime backend.
pub fn load(artifact: &ArtifactRef) -> OcrResult<ModelHandle> {
    let backend = super::OrtBackend::load(artifact)?;
    Ok(ModelHandle::new(backend))
}

/// The three model handles of the cascade, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ArtifactHost {
    boundary: ModelHandle,
    kv: ModelHandle,
    recognition: ModelHandle,
}

impl ArtifactHost {
    /// Loads all three artifacts described by `config`.
    pub fn load(config: &ArtifactConfig) -> OcrResult<Self> {
        config.validate()?;
        let make_ref = |path: &PathBuf| ArtifactRef {
            path: path.clone(),
            session_pool_size: config.session_pool_size,
            intra_threads: config.intra_threads,
        };
        let host = Self {
            boundary: load(&make_ref(&config.boundary_model))?,
            kv: load(&make_ref(&config.kv_model))?,
            recognition: load(&make_ref(&config.recognition_model))?,
        };
        info!(
            boundary = host.boundary.name(),
            kv = host.kv.name(),
            recognition = host.recognition.name(),
            "loaded model artifacts"
        );
        Ok(host)
    }

    /// Builds a host from already constructed handles.
    pub fn from_handles(boundary: ModelHandle, kv: ModelHandle, recognition: ModelHandle) -> Self {
        Self {
            boundary,
            kv,
            recognition,
        }
    }

    /// Returns the handle for a role.
    pub fn handle(&self, role: ModelRole) -> &ModelHandle {
        match role {
            ModelRole::Boundary => &self.boundary,
            ModelRole::KeyValue => &self.kv,
            ModelRole::Recognition => &self.recognition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn echo_handle() -> ModelHandle {
        ModelHandle::new(FnBackend::new(
            "echo",
            vec![TensorSpec::new("image", vec![-1, 3, 4, 4])],
            |inputs: &TensorMap| {
                let mut out = TensorMap::new();
                out.insert("out".to_string(), inputs["image"].clone());
                Ok(out)
            },
        ))
    }

    #[test]
    fn test_tensor_spec_matching() {
        let spec = TensorSpec::new("x", vec![-1, 3, 32, -1]);
        assert!(spec.matches(&[4, 3, 32, 100]));
        assert!(!spec.matches(&[4, 1, 32, 100]));
        assert!(!spec.matches(&[4, 3, 32]));
        assert_eq!(spec.static_batch(), None);
        assert_eq!(TensorSpec::new("x", vec![8, 3, 32, 128]).static_batch(), Some(8));
        assert_eq!(
            TensorSpec::new("x", vec![8, 3, 32, 128]).static_hw(),
            Some((32, 128))
        );
    }

    #[test]
    fn test_handle_runs_valid_input() {
        let handle = echo_handle();
        let mut inputs = TensorMap::new();
        inputs.insert("image".to_string(), ArrayD::zeros(IxDyn(&[2, 3, 4, 4])));
        let out = handle.run(&inputs).unwrap();
        assert_eq!(out["out"].shape(), &[2, 3, 4, 4]);
    }

    #[test]
    fn test_handle_rejects_shape_mismatch() {
        let handle = echo_handle();
        let mut inputs = TensorMap::new();
        inputs.insert("image".to_string(), ArrayD::zeros(IxDyn(&[1, 3, 5, 4])));
        let err = handle.run(&inputs).unwrap_err();
        assert!(matches!(err, OCRError::ArtifactRuntime { .. }));
    }

    #[test]
    fn test_handle_rejects_missing_and_extra_inputs() {
        let handle = echo_handle();
        let err = handle.run(&TensorMap::new()).unwrap_err();
        assert!(matches!(err, OCRError::ArtifactRuntime { .. }));

        let mut inputs = TensorMap::new();
        inputs.insert("image".to_string(), ArrayD::zeros(IxDyn(&[1, 3, 4, 4])));
        inputs.insert("bogus".to_string(), ArrayD::zeros(IxDyn(&[1])));
        assert!(handle.run(&inputs).is_err());
    }

    #[test]
    fn test_host_returns_handles_by_role() {
        let host = ArtifactHost::from_handles(echo_handle(), echo_handle(), echo_handle());
        assert_eq!(host.handle(ModelRole::KeyValue).name(), "echo");
    }
}
