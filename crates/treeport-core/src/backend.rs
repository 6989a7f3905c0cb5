use crate::{Context, DataTransform, Error, ModelArtifact, ModelSpec, Result, Tensor};

/// Optional features an engine may or may not offer.
#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    /// The engine keeps bound inputs and can copy them back out.
    pub supports_input_readback: bool,
    /// The engine can report the element count of a bound input.
    pub reports_input_size: bool,
    pub supports_dynamic_batch: bool,
}

pub trait Backend: Send + Sync + 'static {
    type Model: EngineHandle;

    fn name(&self) -> &'static str;
    fn load(&self, artifact: &ModelArtifact, context: Context) -> Result<Self::Model>;
    fn capabilities(&self) -> BackendCapabilities;
}

/// A loaded engine instance.
///
/// Callers go through [`crate::Model`], which validates names, shapes and
/// readiness before anything reaches the engine. Implementations can assume
/// `index`/`slot` are in range and tensors match the declared spec.
pub trait EngineHandle: Send + 'static {
    fn backend_name(&self) -> &'static str;
    fn capabilities(&self) -> BackendCapabilities;
    fn spec(&self) -> &ModelSpec;

    fn set_input(&mut self, index: usize, tensor: Tensor) -> Result<()>;

    /// The tensor currently bound at `index`. Only reachable when
    /// `capabilities().supports_input_readback` is set.
    fn get_input(&self, index: usize) -> Result<&Tensor> {
        let _ = index;
        Err(Error::not_supported("GetInput", self.backend_name()))
    }

    fn set_pred_margin(&mut self, margin: bool);

    /// Blocking inference over the current bindings.
    fn run(&mut self) -> Result<()>;

    /// Output of the last successful `run`, owned by the engine.
    fn output(&self, slot: usize) -> Result<&Tensor>;

    /// Record-level transforms stored alongside the compiled model.
    fn data_transform(&self) -> Option<&DataTransform> {
        None
    }
}
