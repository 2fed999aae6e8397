//! Micro-batching queue in front of a single model handle.
//!
//! Independent single-sample calls are queued on a bounded channel. One dispatcher
//! thread per batcher collects up to `batch_size` samples, or fewer once the oldest
//! queued sample has waited `max_latency`, runs them as one batched call and sends
//! every slot its own output. Samples submitted while a batch is running wait in
//! the channel for the next batch.

use super::{split_outputs, stack_samples};
use crate::core::config::BatcherConfig;
use crate::core::errors::{OCRError, OcrResult, SimpleError};
use crate::core::inference::{ModelHandle, TensorMap};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type SlotResult = Result<TensorMap, Arc<OCRError>>;

struct Job {
    sample: TensorMap,
    enqueued_at: Instant,
    reply: Sender<SlotResult>,
}

/// Pending result of a submitted sample.
#[derive(Debug)]
pub struct BatchTicket {
    receiver: Receiver<SlotResult>,
    model_name: String,
}

impl BatchTicket {
    /// Blocks until the batch containing this sample has run.
    pub fn wait(self) -> OcrResult<TensorMap> {
        let received = self.receiver.recv().map_err(|_| {
            OCRError::batch_processing(
                "wait for batch result",
                SimpleError::new("dispatcher dropped the request"),
            )
        })?;
        self.unpack(received)
    }

    /// Like [`BatchTicket::wait`], giving up after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> OcrResult<TensorMap> {
        let received = self.receiver.recv_timeout(timeout).map_err(|e| {
            OCRError::batch_processing("wait for batch result", SimpleError::new(e.to_string()))
        })?;
        self.unpack(received)
    }

    fn unpack(self, received: SlotResult) -> OcrResult<TensorMap> {
        received.map_err(|shared| OCRError::BatchFailed {
            model_name: self.model_name,
            source: shared,
        })
    }
}

/// Queue plus dispatcher thread that turns single-sample calls into batched runs.
pub struct MicroBatcher {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    dispatches: Arc<AtomicUsize>,
    model_name: String,
    config: BatcherConfig,
}

impl std::fmt::Debug for MicroBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroBatcher")
            .field("model_name", &self.model_name)
            .field("config", &self.config)
            .field("dispatches", &self.dispatch_count())
            .finish()
    }
}

impl MicroBatcher {
    /// Starts a dispatcher thread for `handle`.
    pub fn new(handle: ModelHandle, config: BatcherConfig) -> OcrResult<Self> {
        config.validate()?;
        if let Some(compiled) = handle.static_batch_size()
            && config.batch_size > compiled
        {
            return Err(OCRError::config_error_with_context(
                "batch_size",
                &config.batch_size.to_string(),
                &format!("artifact '{}' is compiled for batch {compiled}", handle.name()),
            ));
        }

        let (sender, receiver) = bounded::<Job>(config.queue_capacity);
        let dispatches = Arc::new(AtomicUsize::new(0));
        let model_name = handle.name().to_string();

        let worker = {
            let dispatches = Arc::clone(&dispatches);
            let config = config.clone();
            std::thread::Builder::new()
                .name(format!("batcher-{model_name}"))
                .spawn(move || dispatcher_loop(receiver, handle, config, dispatches))?
        };

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            dispatches,
            model_name,
            config,
        })
    }

    /// Queues one sample; every tensor must have a leading batch dimension of 1.
    pub fn submit(&self, sample: TensorMap) -> OcrResult<BatchTicket> {
        if let Some((name, tensor)) = sample
            .iter()
            .find(|(_, t)| t.shape().first().copied() != Some(1))
        {
            return Err(OCRError::invalid_input(format!(
                "sample input '{name}' must have batch dimension 1, got shape {:?}",
                tensor.shape()
            )));
        }

        let sender = self.sender.as_ref().ok_or_else(|| {
            OCRError::batch_processing("submit sample", SimpleError::new("batcher is shut down"))
        })?;
        let (reply, receiver) = bounded(1);
        sender
            .send(Job {
                sample,
                enqueued_at: Instant::now(),
                reply,
            })
            .map_err(|_| {
                OCRError::batch_processing("submit sample", SimpleError::new("dispatcher stopped"))
            })?;

        Ok(BatchTicket {
            receiver,
            model_name: self.model_name.clone(),
        })
    }

    /// Submits a sample and waits for its result.
    pub fn run(&self, sample: TensorMap) -> OcrResult<TensorMap> {
        self.submit(sample)?.wait()
    }

    /// Number of batched runs issued so far.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    /// Batcher settings.
    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Name of the artifact behind this batcher.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl Drop for MicroBatcher {
    fn drop(&mut self) {
        // Closing the queue lets the dispatcher drain what is left and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!(model = %self.model_name, "batch dispatcher panicked");
        }
    }
}

fn dispatcher_loop(
    receiver: Receiver<Job>,
    handle: ModelHandle,
    config: BatcherConfig,
    dispatches: Arc<AtomicUsize>,
) {
    let max_latency = config.max_latency();
    while let Ok(first) = receiver.recv() {
        let deadline = first.enqueued_at + max_latency;
        let mut batch = Vec::with_capacity(config.batch_size);
        batch.push(first);
        while batch.len() < config.batch_size {
            match receiver.recv_deadline(deadline) {
                Ok(job) => batch.push(job),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        dispatches.fetch_add(1, Ordering::SeqCst);
        dispatch(&handle, batch);
    }
    debug!(model = handle.name(), "batch dispatcher stopped");
}

fn dispatch(handle: &ModelHandle, batch: Vec<Job>) {
    let started = Instant::now();
    let oldest_wait = batch
        .first()
        .map(|job| job.enqueued_at.elapsed())
        .unwrap_or_default();
    let (samples, replies): (Vec<TensorMap>, Vec<Sender<SlotResult>>) =
        batch.into_iter().map(|job| (job.sample, job.reply)).unzip();

    let pad_to = handle.static_batch_size();
    let result = stack_samples(&samples, pad_to).and_then(|(inputs, rows)| {
        let batch_rows = pad_to.map_or(rows, |target| target.max(rows));
        Ok((handle.run(&inputs)?, batch_rows))
    });

    match result {
        Ok((outputs, batch_rows)) => {
            for (slot, reply) in split_outputs(&outputs, replies.len(), batch_rows)
                .into_iter()
                .zip(replies.iter())
            {
                // A dropped ticket only means nobody waits for this slot any more.
                let _ = reply.send(Ok(slot));
            }
        }
        Err(err) => {
            warn!(model = handle.name(), error = %err, size = replies.len(), "batched run failed");
            let shared = Arc::new(err);
            for reply in &replies {
                let _ = reply.send(Err(Arc::clone(&shared)));
            }
        }
    }

    debug!(
        model = handle.name(),
        size = samples.len(),
        oldest_wait_ms = oldest_wait.as_secs_f64() * 1000.0,
        run_ms = started.elapsed().as_secs_f64() * 1000.0,
        "dispatched batch"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inference::{FnBackend, TensorSpec};
    use ndarray::{ArrayD, IxDyn};
    use std::sync::Mutex;

    fn sample(value: f32) -> TensorMap {
        let mut map = TensorMap::new();
        map.insert("x".to_string(), ArrayD::from_elem(IxDyn(&[1, 2]), value));
        map
    }

    fn doubling_handle(batch_sizes: Arc<Mutex<Vec<usize>>>, shape: Vec<i64>) -> ModelHandle {
        ModelHandle::new(FnBackend::new(
            "double",
            vec![TensorSpec::new("x", shape)],
            move |inputs: &TensorMap| {
                let x = &inputs["x"];
                batch_sizes.lock().unwrap().push(x.shape()[0]);
                let mut out = TensorMap::new();
                out.insert("y".to_string(), x.mapv(|v| v * 2.0));
                Ok(out)
            },
        ))
    }

    #[test]
    fn test_run_count_is_ceil_n_over_b_and_order_is_kept() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let handle = doubling_handle(Arc::clone(&sizes), vec![-1, 2]);
        let batcher =
            MicroBatcher::new(handle, BatcherConfig::new(4, Duration::from_millis(200))).unwrap();

        let tickets: Vec<BatchTicket> = (0..10)
            .map(|i| batcher.submit(sample(i as f32)).unwrap())
            .collect();
        for (i, ticket) in tickets.into_iter().enumerate() {
            let out = ticket.wait().unwrap();
            assert_eq!(out["y"].shape(), &[1, 2]);
            assert_eq!(out["y"][[0, 0]], i as f32 * 2.0);
        }

        assert_eq!(batcher.dispatch_count(), 3);
        assert_eq!(*sizes.lock().unwrap(), vec![4, 4, 2]);
    }

    #[test]
    fn test_concurrent_submitters_all_get_their_own_result() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let handle = doubling_handle(Arc::clone(&sizes), vec![-1, 2]);
        let batcher = Arc::new(
            MicroBatcher::new(handle, BatcherConfig::new(3, Duration::from_millis(20))).unwrap(),
        );

        let threads: Vec<_> = (0..9)
            .map(|i| {
                let batcher = Arc::clone(&batcher);
                std::thread::spawn(move || batcher.run(sample(i as f32)).unwrap()["y"][[0, 1]])
            })
            .collect();
        for (i, thread) in threads.into_iter().enumerate() {
            assert_eq!(thread.join().unwrap(), i as f32 * 2.0);
        }
        let total: usize = sizes.lock().unwrap().iter().sum();
        assert_eq!(total, 9);
    }

    #[test]
    fn test_lone_sample_dispatches_after_max_latency() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let handle = doubling_handle(Arc::clone(&sizes), vec![-1, 2]);
        let latency = Duration::from_millis(50);
        let batcher = MicroBatcher::new(handle, BatcherConfig::new(8, latency)).unwrap();

        let started = Instant::now();
        let out = batcher.run(sample(1.5)).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(out["y"][[0, 0]], 3.0);
        assert!(elapsed >= Duration::from_millis(45));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(*sizes.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_failure_is_reported_to_every_waiter() {
        let handle = ModelHandle::new(FnBackend::new(
            "broken",
            vec![TensorSpec::new("x", vec![-1, 2])],
            |_: &TensorMap| Err(OCRError::artifact_contract("broken", "device lost")),
        ));
        let batcher =
            MicroBatcher::new(handle, BatcherConfig::new(3, Duration::from_millis(100))).unwrap();

        let tickets: Vec<_> = (0..3).map(|i| batcher.submit(sample(i as f32)).unwrap()).collect();
        for ticket in tickets {
            match ticket.wait() {
                Err(OCRError::BatchFailed { source, .. }) => {
                    assert!(matches!(*source, OCRError::ArtifactRuntime { .. }));
                }
                other => panic!("expected batch failure, got {other:?}"),
            }
        }
        assert_eq!(batcher.dispatch_count(), 1);
    }

    #[test]
    fn test_static_batch_is_padded_and_padding_discarded() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let handle = doubling_handle(Arc::clone(&sizes), vec![4, 2]);
        let batcher =
            MicroBatcher::new(handle, BatcherConfig::new(4, Duration::from_millis(10))).unwrap();

        let out = batcher.run(sample(2.0)).unwrap();
        assert_eq!(out["y"].shape(), &[1, 2]);
        assert_eq!(out["y"][[0, 0]], 4.0);
        assert_eq!(*sizes.lock().unwrap(), vec![4]);
    }

    #[test]
    fn test_batch_size_above_compiled_size_is_rejected() {
        let handle = doubling_handle(Arc::new(Mutex::new(Vec::new())), vec![2, 2]);
        assert!(MicroBatcher::new(handle, BatcherConfig::new(4, Duration::from_millis(10))).is_err());
    }

    #[test]
    fn test_drop_drains_queued_samples() {
        let handle = doubling_handle(Arc::new(Mutex::new(Vec::new())), vec![-1, 2]);
        let batcher =
            MicroBatcher::new(handle, BatcherConfig::new(4, Duration::from_millis(500))).unwrap();
        let ticket = batcher.submit(sample(3.0)).unwrap();
        drop(batcher);
        assert_eq!(ticket.wait().unwrap()["y"][[0, 0]], 6.0);
    }

    #[test]
    fn test_rejects_multi_row_sample() {
        let handle = doubling_handle(Arc::new(Mutex::new(Vec::new())), vec![-1, 2]);
        let batcher = MicroBatcher::new(handle, BatcherConfig::default()).unwrap();
        let mut map = TensorMap::new();
        map.insert("x".to_string(), ArrayD::zeros(IxDyn(&[2, 2])));
        assert!(matches!(
            batcher.submit(map),
            Err(OCRError::InvalidInput { .. })
        ));
    }
}
