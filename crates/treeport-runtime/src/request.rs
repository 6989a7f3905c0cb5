use std::time::Instant;

use tokio::sync::oneshot;
use treeport_core::{IOName, Tensor};

#[derive(Debug)]
pub struct InferenceRequest {
    pub inputs: Vec<(IOName, Tensor)>,
    pub margin: bool,
    pub enqueued_at: Instant,
    pub resp_tx: oneshot::Sender<anyhow::Result<InferenceResponse>>,
}

#[derive(Debug)]
pub struct InferenceResponse {
    pub outputs: Vec<(IOName, Tensor)>,
    pub timings: Timings,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    pub queued_us: u64,
    pub batched_us: u64,
    pub backend_us: u64,
    /// Rows in the batch this request ran in, its own rows included.
    pub batch_rows: usize,
}

impl InferenceRequest {
    pub fn new(
        inputs: Vec<(IOName, Tensor)>,
        margin: bool,
    ) -> (Self, oneshot::Receiver<anyhow::Result<InferenceResponse>>) {
        let (resp_tx, resp_rx) = oneshot::channel();
        let req = Self {
            inputs,
            margin,
            enqueued_at: Instant::now(),
            resp_tx,
        };
        (req, resp_rx)
    }

    /// Leading dimension shared by every input, or `None` when the inputs
    /// have no common batch axis and cannot be stacked.
    pub fn rows(&self) -> Option<usize> {
        let mut rows = None;
        for (_, tensor) in &self.inputs {
            let batch = tensor.shape.batch()?;
            match rows {
                None => rows = Some(batch),
                Some(r) if r != batch => return None,
                Some(_) => {}
            }
        }
        rows
    }

    /// Whether `other` can be stacked onto this request along the batch axis.
    pub fn stacks_with(&self, other: &InferenceRequest) -> bool {
        if self.margin != other.margin || self.inputs.len() != other.inputs.len() {
            return false;
        }
        if self.rows().is_none() || other.rows().is_none() {
            return false;
        }
        self.inputs
            .iter()
            .zip(&other.inputs)
            .all(|((a_name, a), (b_name, b))| {
                a_name == b_name && a.dtype == b.dtype && a.shape.0[1..] == b.shape.0[1..]
            })
    }

    /// Answer with an error; a dropped receiver is not a failure.
    pub fn fail(self, err: anyhow::Error) {
        let _ = self.resp_tx.send(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treeport_core::Shape;

    fn request(name: &str, shape: &[usize], margin: bool) -> InferenceRequest {
        let numel = shape.iter().product::<usize>();
        let tensor = Tensor::from_slice(Shape::from_slice(shape), &vec![0f32; numel]);
        InferenceRequest::new(vec![(IOName::from(name), tensor)], margin).0
    }

    #[test]
    fn rows_is_the_shared_leading_dim() {
        assert_eq!(request("x", &[3, 2], false).rows(), Some(3));
        assert_eq!(request("x", &[], false).rows(), None);
        assert_eq!(InferenceRequest::new(Vec::new(), false).0.rows(), None);
    }

    #[test]
    fn stacking_needs_matching_rows_names_and_mode() {
        let a = request("x", &[3, 2], false);
        assert!(a.stacks_with(&request("x", &[1, 2], false)));
        assert!(!a.stacks_with(&request("x", &[1, 3], false)));
        assert!(!a.stacks_with(&request("y", &[1, 2], false)));
        assert!(!a.stacks_with(&request("x", &[1, 2], true)));
    }
}
