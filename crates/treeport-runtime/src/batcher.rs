use anyhow::Result;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;
use treeport_core::{IOName, Tensor};

use crate::{InferenceRequest, SchedulerHandle};

#[derive(Clone, Debug)]
pub struct BatchPolicy {
    /// Stop collecting once this many rows are pending.
    pub max_rows: usize,
    /// Longest time the first pending request waits for company.
    pub max_delay: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_rows: 64,
            max_delay: Duration::from_millis(2),
        }
    }
}

/// A batch ready to run on a worker.
#[derive(Debug)]
pub struct BatchJob {
    /// Requests in stacking order; their `inputs` have been moved into
    /// `merged_inputs`.
    pub requests: Vec<InferenceRequest>,
    pub merged_inputs: Vec<(IOName, Tensor)>,
    /// Rows contributed by each request.
    pub rows: Vec<usize>,
    pub margin: bool,
    pub created_at: std::time::Instant,
}

pub struct Batcher {
    policy: BatchPolicy,
    rx: mpsc::Receiver<InferenceRequest>,
    scheduler: SchedulerHandle,
}

impl Batcher {
    pub fn new(
        policy: BatchPolicy,
        rx: mpsc::Receiver<InferenceRequest>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            policy,
            rx,
            scheduler,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut pending: Vec<InferenceRequest> = Vec::new();
        let mut pending_rows = 0usize;
        let mut first_seen: Option<Instant> = None;
        let max_rows = self.policy.max_rows;
        let max_delay = self.policy.max_delay;

        loop {
            tokio::select! {
                maybe_req = self.rx.recv() => {
                    let Some(req) = maybe_req else {
                        self.flush(&mut pending).await?;
                        break;
                    };

                    // Requests without a shared batch axis always run alone.
                    let Some(rows) = req.rows() else {
                        self.flush(&mut pending).await?;
                        self.flush(&mut vec![req]).await?;
                        pending_rows = 0;
                        first_seen = None;
                        continue;
                    };

                    let fits = pending_rows.checked_add(rows).is_some_and(|n| n <= max_rows);
                    if pending.first().is_some_and(|head| !fits || !head.stacks_with(&req)) {
                        self.flush(&mut pending).await?;
                        pending_rows = 0;
                    }

                    if pending.is_empty() { first_seen = Some(Instant::now()); }
                    pending.push(req);
                    pending_rows = pending_rows.saturating_add(rows);
                    if pending_rows >= max_rows {
                        self.flush(&mut pending).await?;
                        pending_rows = 0;
                        first_seen = None;
                    }
                }
                _ = async {
                    if let Some(t0) = first_seen {
                        sleep(max_delay.saturating_sub(t0.elapsed())).await;
                    }
                }, if first_seen.is_some() => {
                    self.flush(&mut pending).await?;
                    pending_rows = 0;
                    first_seen = None;
                }
            }
        }

        debug!("batcher stopped");
        Ok(())
    }

    async fn flush(&self, pending: &mut Vec<InferenceRequest>) -> Result<()> {
        let mut requests = std::mem::take(pending);
        if requests.is_empty() {
            return Ok(());
        }

        let rows: Vec<usize> = requests.iter().map(|r| r.rows().unwrap_or(0)).collect();
        let margin = requests[0].margin;
        let merged_inputs = stack_inputs(&mut requests);

        debug!(
            requests = requests.len(),
            rows = rows.iter().sum::<usize>(),
            margin,
            "dispatching batch"
        );
        let job = BatchJob {
            requests,
            merged_inputs,
            rows,
            margin,
            created_at: std::time::Instant::now(),
        };

        self.scheduler.submit(job).await
    }
}

/// Concatenate each input of `requests` along the batch axis, moving the
/// tensors out of the requests.
///
/// The requests must pairwise satisfy [`InferenceRequest::stacks_with`];
/// a single request is passed through without copying.
pub fn stack_inputs(requests: &mut [InferenceRequest]) -> Vec<(IOName, Tensor)> {
    if let [only] = requests {
        return std::mem::take(&mut only.inputs);
    }

    let Some(head) = requests.first() else {
        return Vec::new();
    };
    let mut merged = Vec::with_capacity(head.inputs.len());
    for k in 0..head.inputs.len() {
        let (name, first) = &head.inputs[k];
        let mut shape = first.shape.clone();
        let mut data = BytesMut::with_capacity(
            requests.iter().map(|r| r.inputs[k].1.byte_len()).sum(),
        );
        shape.0[0] = 0;
        for req in requests.iter() {
            let tensor = &req.inputs[k].1;
            shape.0[0] += tensor.shape.0[0];
            data.extend_from_slice(&tensor.data);
        }
        merged.push((
            name.clone(),
            Tensor::from_cpu_bytes(first.dtype, shape, data.freeze()),
        ));
    }

    for req in requests.iter_mut() {
        req.inputs.clear();
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeport_core::Shape;

    fn request(rows: usize, start: f32) -> InferenceRequest {
        let values: Vec<f32> = (0..rows * 2).map(|i| start + i as f32).collect();
        let tensor = Tensor::from_slice(Shape::from_slice(&[rows, 2]), &values);
        InferenceRequest::new(vec![(IOName::from("x"), tensor)], false).0
    }

    #[test]
    fn stacks_rows_in_request_order() {
        let mut reqs = vec![request(1, 0.0), request(2, 10.0)];
        let merged = stack_inputs(&mut reqs);

        assert_eq!(merged.len(), 1);
        let (name, tensor) = &merged[0];
        assert_eq!(name.as_str(), "x");
        assert_eq!(tensor.shape, Shape::from_slice(&[3, 2]));
        assert_eq!(
            tensor.to_vec::<f32>().unwrap(),
            vec![0.0, 1.0, 10.0, 11.0, 12.0, 13.0]
        );
        assert!(reqs.iter().all(|r| r.inputs.is_empty()));
    }

    #[test]
    fn single_request_is_passed_through() {
        let mut reqs = vec![request(2, 0.0)];
        let before = reqs[0].inputs[0].1.data.clone();
        let merged = stack_inputs(&mut reqs);
        assert_eq!(merged[0].1.data.as_ptr(), before.as_ptr());
    }
}
