//! Inference artifact host and the ONNX Runtime backend behind it.

pub mod host;
pub mod ort_infer;

pub use host::{
    ArtifactHost, ArtifactRef, FnBackend, InferenceBackend, ModelHandle, ModelRole, TensorMap,
    TensorSpec, load,
};
pub use ort_infer::OrtBackend;
