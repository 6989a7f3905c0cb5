use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use treeport_core::{IOName, Model, Tensor};

use crate::{BatchJob, InferenceRequest, InferenceResponse, Timings};

/// Owns one [`Model`] and runs batch jobs on it.
///
/// `run` blocks inside `tokio::task::block_in_place`, so the worker must
/// live on a multi-threaded runtime.
pub struct Worker {
    pub id: usize,
    pub inbox: mpsc::Receiver<BatchJob>,
    pub model: Model,
}

impl Worker {
    pub fn new(id: usize, inbox: mpsc::Receiver<BatchJob>, model: Model) -> Self {
        Self { id, inbox, model }
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            worker_id = self.id,
            backend = self.model.backend_name(),
            "worker started"
        );
        while let Some(job) = self.inbox.recv().await {
            self.handle(job);
        }
        info!(worker_id = self.id, "worker stopped");
        Ok(())
    }

    fn handle(&mut self, job: BatchJob) {
        let BatchJob {
            requests,
            merged_inputs,
            rows,
            margin,
            created_at,
        } = job;

        let picked_at = Instant::now();
        let model = &mut self.model;
        let result = tokio::task::block_in_place(|| execute(model, merged_inputs, margin));
        let timings = Timings {
            queued_us: 0,
            batched_us: picked_at.saturating_duration_since(created_at).as_micros() as u64,
            backend_us: picked_at.elapsed().as_micros() as u64,
            batch_rows: rows.iter().sum(),
        };

        match result {
            Ok(outputs) => {
                debug!(
                    worker_id = self.id,
                    requests = requests.len(),
                    rows = timings.batch_rows,
                    backend_us = timings.backend_us,
                    "batch complete"
                );
                deliver(requests, &rows, &outputs, timings, created_at);
            }
            Err(err) => {
                warn!(worker_id = self.id, error = %format!("{err:#}"), "batch failed");
                for req in requests {
                    req.fail(anyhow!("{err:#}"));
                }
            }
        }
    }
}

fn execute(
    model: &mut Model,
    inputs: Vec<(IOName, Tensor)>,
    margin: bool,
) -> Result<Vec<(IOName, Tensor)>> {
    // Bound inputs must agree on batch size, so start from a clean slate.
    model.clear_inputs();
    model.set_pred_margin(margin);
    for (name, tensor) in inputs {
        model
            .set_input_tensor(name.as_str(), tensor)
            .with_context(|| format!("binding input `{name}`"))?;
    }
    model.run().context("model run failed")?;

    let mut outputs = Vec::with_capacity(model.num_outputs());
    for slot in 0..model.num_outputs() {
        let name = IOName(model.output_name(slot)?.to_string());
        // Bytes clone: the next run replaces the engine's buffer, this one stays alive.
        outputs.push((name, model.output(slot)?.clone()));
    }
    Ok(outputs)
}

fn deliver(
    requests: Vec<InferenceRequest>,
    rows: &[usize],
    outputs: &[(IOName, Tensor)],
    timings: Timings,
    created_at: Instant,
) {
    if let [_] = rows {
        for req in requests {
            let timings = Timings {
                queued_us: queued_us(&req, created_at),
                ..timings
            };
            let _ = req.resp_tx.send(Ok(InferenceResponse {
                outputs: outputs.to_vec(),
                timings,
            }));
        }
        return;
    }

    let mut offset = 0;
    for (req, &n) in requests.into_iter().zip(rows) {
        let sliced: treeport_core::Result<Vec<_>> = outputs
            .iter()
            .map(|(name, tensor)| Ok((name.clone(), tensor.slice_rows(offset, n)?)))
            .collect();
        offset += n;

        match sliced {
            Ok(outputs) => {
                let timings = Timings {
                    queued_us: queued_us(&req, created_at),
                    ..timings
                };
                let _ = req.resp_tx.send(Ok(InferenceResponse { outputs, timings }));
            }
            Err(err) => req.fail(anyhow::Error::new(err).context("splitting batched output")),
        }
    }
}

fn queued_us(req: &InferenceRequest, created_at: Instant) -> u64 {
    created_at
        .saturating_duration_since(req.enqueued_at)
        .as_micros() as u64
}
