//! Single-sample model calls, either direct or through a micro-batcher.

use crate::core::batch::MicroBatcher;
use crate::core::config::BatcherConfig;
use crate::core::errors::OcrResult;
use crate::core::inference::{ModelHandle, TensorMap, TensorSpec};
use std::sync::Arc;

/// How a stage reaches its model.
#[derive(Debug, Clone)]
pub enum ModelInvoker {
    /// Calls the handle on the caller's thread.
    Direct(ModelHandle),
    /// Queues the sample on a shared micro-batcher.
    Batched {
        /// The handle behind the batcher, for input specs.
        handle: ModelHandle,
        /// The batcher.
        batcher: Arc<MicroBatcher>,
    },
}

impl ModelInvoker {
    /// Wraps `handle` in a micro-batcher when `batcher` is set.
    pub fn new(handle: ModelHandle, batcher: Option<&BatcherConfig>) -> OcrResult<Self> {
        Ok(match batcher {
            Some(config) => ModelInvoker::Batched {
                batcher: Arc::new(MicroBatcher::new(handle.clone(), config.clone())?),
                handle,
            },
            None => ModelInvoker::Direct(handle),
        })
    }

    /// The model handle.
    pub fn handle(&self) -> &ModelHandle {
        match self {
            ModelInvoker::Direct(handle) => handle,
            ModelInvoker::Batched { handle, .. } => handle,
        }
    }

    /// Declared spec of an input.
    pub fn input_spec(&self, name: &str) -> Option<&TensorSpec> {
        self.handle().input_spec(name)
    }

    /// Runs one sample (leading dimension 1).
    pub fn run(&self, sample: TensorMap) -> OcrResult<TensorMap> {
        match self {
            ModelInvoker::Direct(handle) => handle.run(&sample),
            ModelInvoker::Batched { batcher, .. } => batcher.run(sample),
        }
    }
}
