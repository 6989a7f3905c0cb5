pub mod ensemble;
pub mod format;

use std::fs;

use tracing::debug;
use treeport_core::{
    Backend, BackendCapabilities, Context, DType, DataTransform, DeviceKind, EngineHandle, Error,
    ModelArtifact, ModelSpec, OutputSpec, Result, Shape, Tensor, TensorSpec,
};

pub use ensemble::Ensemble;
pub use format::{ComparisonOp, EnsembleFile, NodeFile, TreeFile};

const BACKEND_NAME: &str = "forest";

/// Inputs are decoded into a feature matrix on bind and not kept.
const CAPABILITIES: BackendCapabilities = BackendCapabilities {
    supports_input_readback: false,
    reports_input_size: true,
    supports_dynamic_batch: true,
};

pub struct ForestBackend;

impl ForestBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ForestBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ForestModel {
    spec: ModelSpec,
    ensemble: Ensemble,
    data_transform: Option<DataTransform>,
    features: Option<(Vec<f32>, usize)>,
    margin: bool,
    output: Option<Tensor>,
}

impl Backend for ForestBackend {
    type Model = ForestModel;

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn load(&self, artifact: &ModelArtifact, context: Context) -> Result<Self::Model> {
        if context.kind != DeviceKind::Cpu || context.device_id != 0 {
            return Err(Error::load(format!(
                "forest backend runs on cpu:0 only, got {context}"
            )));
        }

        let path = artifact.single_with_extension("json")?;
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::load(format!("cannot read {}: {e}", path.display())))?;
        let file: EnsembleFile = serde_json::from_str(&raw)
            .map_err(|e| Error::load(format!("invalid ensemble {}: {e}", path.display())))?;

        ForestModel::from_file(file)
    }

    fn capabilities(&self) -> BackendCapabilities {
        CAPABILITIES
    }
}

impl ForestModel {
    pub fn from_file(mut file: EnsembleFile) -> Result<Self> {
        let input_name = file.input_name.clone();
        let data_transform = file.data_transform.take();
        let ensemble = Ensemble::compile(file)?;
        let spec = ModelSpec {
            inputs: vec![TensorSpec::batched(
                &input_name,
                DType::F32,
                &[ensemble.num_feature()],
            )],
            outputs: vec![OutputSpec::batched(
                "predictions",
                DType::F32,
                &[ensemble.num_class()],
                vec![0],
            )],
        };
        debug!(
            trees = ensemble.num_trees(),
            features = ensemble.num_feature(),
            classes = ensemble.num_class(),
            "ensemble compiled"
        );

        Ok(Self {
            spec,
            ensemble,
            data_transform,
            features: None,
            margin: false,
            output: None,
        })
    }

    pub fn ensemble(&self) -> &Ensemble {
        &self.ensemble
    }
}

impl EngineHandle for ForestModel {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> BackendCapabilities {
        CAPABILITIES
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn set_input(&mut self, _index: usize, tensor: Tensor) -> Result<()> {
        let rows = tensor
            .shape
            .batch()
            .ok_or_else(|| Error::shape_mismatch("forest input needs a batch axis"))?;
        let features = tensor.to_vec::<f32>()?;
        if features.len() != rows * self.ensemble.num_feature() {
            return Err(Error::shape_mismatch(format!(
                "expected {} features per row",
                self.ensemble.num_feature()
            )));
        }
        self.features = Some((features, rows));
        Ok(())
    }

    fn set_pred_margin(&mut self, margin: bool) {
        self.margin = margin;
    }

    fn run(&mut self) -> Result<()> {
        let (features, rows) = self
            .features
            .as_ref()
            .ok_or_else(|| Error::runtime("no input bound"))?;

        let width = self.ensemble.num_class();
        let mut predictions = vec![0f32; rows * width];
        self.ensemble.predict(features, &mut predictions, self.margin);

        self.output = Some(Tensor::from_slice(
            Shape::from_slice(&[*rows, width]),
            &predictions,
        ));
        Ok(())
    }

    fn output(&self, slot: usize) -> Result<&Tensor> {
        if slot != 0 {
            return Err(Error::runtime(format!("forest model has no output {slot}")));
        }
        self.output
            .as_ref()
            .ok_or_else(|| Error::runtime("run has not produced output"))
    }

    fn data_transform(&self) -> Option<&DataTransform> {
        self.data_transform.as_ref()
    }
}
