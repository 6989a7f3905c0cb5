use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::BatchJob;

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<BatchJob>,
}

impl SchedulerHandle {
    pub async fn submit(&self, job: BatchJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow!("scheduler is not running"))
    }
}

/// Hands batch jobs to workers round-robin. A worker whose inbox is closed
/// is taken out of the rotation and the job goes to the next one.
pub struct Scheduler {
    rx: mpsc::Receiver<BatchJob>,
    worker_txs: Vec<mpsc::Sender<BatchJob>>,
    rr: usize,
}

impl Scheduler {
    pub fn new(rx: mpsc::Receiver<BatchJob>, worker_txs: Vec<mpsc::Sender<BatchJob>>) -> Self {
        Self {
            rx,
            worker_txs,
            rr: 0,
        }
    }

    pub fn handle(tx: mpsc::Sender<BatchJob>) -> SchedulerHandle {
        SchedulerHandle { tx }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(job) = self.rx.recv().await {
            self.dispatch(job).await?;
        }
        debug!("scheduler stopped");
        Ok(())
    }

    async fn dispatch(&mut self, mut job: BatchJob) -> Result<()> {
        while !self.worker_txs.is_empty() {
            let idx = self.rr % self.worker_txs.len();
            self.rr = self.rr.wrapping_add(1);
            match self.worker_txs[idx].send(job).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    warn!(worker = idx, "worker inbox closed; removing it from rotation");
                    self.worker_txs.remove(idx);
                    job = returned;
                }
            }
        }

        for req in job.requests {
            req.fail(anyhow!("no inference workers are running"));
        }
        bail!("all workers have stopped")
    }
}
