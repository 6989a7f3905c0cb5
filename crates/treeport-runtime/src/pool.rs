use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use treeport_core::{IOName, Model, ModelSpec, Tensor};

use crate::{BatchPolicy, Batcher, InferenceRequest, InferenceResponse, Scheduler, Worker};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// One independently loaded model per worker.
    pub workers: usize,
    pub policy: BatchPolicy,
    /// Capacity of the request queue in front of the batcher.
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            policy: BatchPolicy::default(),
            queue_depth: 1024,
        }
    }
}

/// Requests -> batcher -> scheduler -> workers, each worker with its own
/// [`Model`].
pub struct InferencePool;

impl InferencePool {
    /// Load `config.workers` models with `factory(worker_id)` and start the
    /// pipeline on the current multi-threaded tokio runtime.
    ///
    /// The tasks stop once every [`PoolHandle`] has been dropped and the
    /// queued requests have been answered.
    pub fn spawn<F, E>(mut factory: F, config: PoolConfig) -> Result<PoolHandle>
    where
        F: FnMut(usize) -> std::result::Result<Model, E>,
        E: Into<anyhow::Error>,
    {
        if config.workers == 0 {
            bail!("inference pool needs at least one worker");
        }
        if config.policy.max_rows == 0 {
            bail!("batch policy max_rows must be positive");
        }

        let mut workers = Vec::with_capacity(config.workers);
        let mut worker_txs = Vec::with_capacity(config.workers);
        let mut spec: Option<ModelSpec> = None;
        let mut dynamic_batch = true;
        let mut labelled = false;
        for id in 0..config.workers {
            let model = factory(id)
                .map_err(Into::<anyhow::Error>::into)
                .with_context(|| format!("loading model for worker {id}"))?;
            spec.get_or_insert_with(|| model.spec().clone());
            dynamic_batch &= model.capabilities().supports_dynamic_batch;
            labelled |= (0..model.num_outputs()).any(|slot| model.has_output_transform(slot));
            let (tx, rx) = mpsc::channel(128);
            worker_txs.push(tx);
            workers.push(Worker::new(id, rx, model));
        }
        let spec = spec.ok_or_else(|| anyhow!("no worker model was loaded"))?;

        let (batcher_tx, batcher_rx) = mpsc::channel(config.queue_depth.max(1));
        let (sched_tx, sched_rx) = mpsc::channel(config.queue_depth.max(1));
        let scheduler = Scheduler::new(sched_rx, worker_txs);
        let mut policy = config.policy.clone();
        if !dynamic_batch || labelled {
            // Engines without dynamic batching score one row per run, and
            // label text cannot be split back into rows.
            policy.max_rows = 1;
        }
        let max_rows = policy.max_rows;
        let batcher = Batcher::new(policy, batcher_rx, Scheduler::handle(sched_tx));

        tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                error!(error = ?e, "scheduler exited");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = batcher.run().await {
                error!(error = ?e, "batcher exited");
            }
        });
        for worker in workers {
            tokio::spawn(async move {
                let id = worker.id;
                if let Err(e) = worker.run().await {
                    error!(worker_id = id, error = ?e, "worker exited");
                }
            });
        }

        info!(
            workers = config.workers,
            max_rows,
            max_delay_us = config.policy.max_delay.as_micros() as u64,
            "inference pool started"
        );
        Ok(PoolHandle {
            tx: batcher_tx,
            spec,
        })
    }
}

#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<InferenceRequest>,
    spec: ModelSpec,
}

impl PoolHandle {
    /// Static metadata of the pooled model.
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Submit one request and wait for its slice of the batch result.
    pub async fn infer(
        &self,
        inputs: Vec<(IOName, Tensor)>,
        margin: bool,
    ) -> Result<InferenceResponse> {
        if let Err(err) = check_inputs(&inputs) {
            warn!(error = %err, "rejected request");
            return Err(err);
        }

        let (req, resp_rx) = InferenceRequest::new(inputs, margin);
        self.tx
            .send(req)
            .await
            .map_err(|_| anyhow!("inference pool has shut down"))?;
        resp_rx
            .await
            .context("request was dropped before it was answered")?
    }
}

/// Storage length must match the shape before a tensor can be stacked.
fn check_inputs(inputs: &[(IOName, Tensor)]) -> Result<()> {
    for (name, tensor) in inputs {
        let Some(expected) = tensor
            .shape
            .checked_numel()
            .and_then(|n| n.checked_mul(tensor.dtype.byte_size()))
        else {
            bail!(
                "input `{name}` with shape {:?} is too large",
                tensor.shape.0.as_slice()
            );
        };
        if tensor.byte_len() != expected {
            bail!(
                "input `{name}` with shape {:?} needs {expected} bytes, got {}",
                tensor.shape.0.as_slice(),
                tensor.byte_len()
            );
        }
    }
    Ok(())
}
