//! Linear booster engine: `output = x · W + b`.
//!
//! Unlike the forest engine this one keeps the bound tensor, so it reports
//! `supports_input_readback` and `Model::get_input` works.

use std::fs;

use serde::{Deserialize, Serialize};
use tracing::debug;
use treeport_core::{
    Backend, BackendCapabilities, Context, DType, DataTransform, DeviceKind, EngineHandle, Error,
    ModelArtifact, ModelSpec, OutputSpec, Postprocessor, Result, Shape, Tensor, TensorSpec,
};

const BACKEND_NAME: &str = "linear";

const CAPABILITIES: BackendCapabilities = BackendCapabilities {
    supports_input_readback: true,
    reports_input_size: true,
    supports_dynamic_batch: true,
};

fn default_num_output() -> usize {
    1
}

fn default_sigmoid_alpha() -> f32 {
    1.0
}

fn default_input_name() -> String {
    "data".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearFile {
    pub num_feature: usize,
    #[serde(default = "default_num_output")]
    pub num_output: usize,
    /// Feature-major: `weights[feature * num_output + output]`.
    pub weights: Vec<f32>,
    /// Empty means all zeros.
    #[serde(default)]
    pub bias: Vec<f32>,
    #[serde(default)]
    pub postprocessor: Postprocessor,
    #[serde(default = "default_sigmoid_alpha")]
    pub sigmoid_alpha: f32,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_transform: Option<DataTransform>,
}

pub struct LinearBackend;

impl LinearBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinearBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LinearModel {
    spec: ModelSpec,
    num_feature: usize,
    num_output: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
    postprocessor: Postprocessor,
    sigmoid_alpha: f32,
    data_transform: Option<DataTransform>,
    input: Option<Tensor>,
    margin: bool,
    output: Option<Tensor>,
}

impl Backend for LinearBackend {
    type Model = LinearModel;

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn load(&self, artifact: &ModelArtifact, context: Context) -> Result<Self::Model> {
        // Host memory only; pinned host buffers are host memory too.
        let host = matches!(context.kind, DeviceKind::Cpu | DeviceKind::CudaHost);
        if !host || context.device_id != 0 {
            return Err(Error::load(format!(
                "linear backend needs host memory on device 0, got {context}"
            )));
        }

        let path = artifact.single_with_extension("json")?;
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::load(format!("cannot read {}: {e}", path.display())))?;
        let file: LinearFile = serde_json::from_str(&raw)
            .map_err(|e| Error::load(format!("invalid linear model {}: {e}", path.display())))?;

        LinearModel::from_file(file)
    }

    fn capabilities(&self) -> BackendCapabilities {
        CAPABILITIES
    }
}

impl LinearModel {
    pub fn from_file(file: LinearFile) -> Result<Self> {
        if file.num_feature == 0 || file.num_output == 0 {
            return Err(Error::load("linear model needs at least one feature and output"));
        }
        if file.weights.len() != file.num_feature * file.num_output {
            return Err(Error::load(format!(
                "expected {} weights, found {}",
                file.num_feature * file.num_output,
                file.weights.len()
            )));
        }
        let bias = if file.bias.is_empty() {
            vec![0.0; file.num_output]
        } else if file.bias.len() == file.num_output {
            file.bias
        } else {
            return Err(Error::load(format!(
                "expected {} bias terms, found {}",
                file.num_output,
                file.bias.len()
            )));
        };
        if file.postprocessor == Postprocessor::Softmax && file.num_output < 2 {
            return Err(Error::load("softmax postprocessor needs num_output > 1"));
        }

        let spec = ModelSpec {
            inputs: vec![TensorSpec::batched(
                &file.input_name,
                DType::F32,
                &[file.num_feature],
            )],
            outputs: vec![OutputSpec::batched(
                "predictions",
                DType::F32,
                &[file.num_output],
                vec![0],
            )],
        };

        Ok(Self {
            spec,
            num_feature: file.num_feature,
            num_output: file.num_output,
            weights: file.weights,
            bias,
            postprocessor: file.postprocessor,
            sigmoid_alpha: file.sigmoid_alpha,
            data_transform: file.data_transform,
            input: None,
            margin: false,
            output: None,
        })
    }

    fn predict(&self, features: &[f32], out: &mut [f32]) {
        for (row, row_out) in features
            .chunks_exact(self.num_feature)
            .zip(out.chunks_exact_mut(self.num_output))
        {
            row_out.copy_from_slice(&self.bias);
            for (f, &x) in row.iter().enumerate() {
                // NaN marks a missing feature and contributes nothing.
                if x.is_nan() {
                    continue;
                }
                let w = &self.weights[f * self.num_output..(f + 1) * self.num_output];
                for (o, w) in row_out.iter_mut().zip(w) {
                    *o += x * w;
                }
            }
        }
    }
}

impl EngineHandle for LinearModel {
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
        if tensor.shape.row_numel() != self.num_feature {
            return Err(Error::shape_mismatch(format!(
                "expected {} features per row",
                self.num_feature
            )));
        }
        self.input = Some(tensor);
        Ok(())
    }

    fn get_input(&self, _index: usize) -> Result<&Tensor> {
        self.input
            .as_ref()
            .ok_or_else(|| Error::not_ready("no input bound"))
    }

    fn set_pred_margin(&mut self, margin: bool) {
        self.margin = margin;
    }

    fn run(&mut self) -> Result<()> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| Error::runtime("no input bound"))?;
        let rows = input.shape.batch().unwrap_or(1);
        let features = input.to_vec::<f32>()?;

        let mut predictions = vec![0f32; rows * self.num_output];
        self.predict(&features, &mut predictions);
        if !self.margin {
            self.postprocessor
                .transform_inplace(&mut predictions, self.num_output, self.sigmoid_alpha);
        }
        debug!(rows, margin = self.margin, "linear model scored");

        self.output = Some(Tensor::from_slice(
            Shape::from_slice(&[rows, self.num_output]),
            &predictions,
        ));
        Ok(())
    }

    fn output(&self, slot: usize) -> Result<&Tensor> {
        if slot != 0 {
            return Err(Error::runtime(format!("linear model has no output {slot}")));
        }
        self.output
            .as_ref()
            .ok_or_else(|| Error::runtime("run has not produced output"))
    }

    fn data_transform(&self) -> Option<&DataTransform> {
        self.data_transform.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_output_file() -> LinearFile {
        LinearFile {
            num_feature: 2,
            num_output: 2,
            weights: vec![1.0, -1.0, 0.5, 2.0],
            bias: vec![0.0, 1.0],
            postprocessor: Postprocessor::Identity,
            sigmoid_alpha: 1.0,
            input_name: "x".into(),
            data_transform: None,
        }
    }

    #[test]
    fn dot_product_per_output() {
        let model = LinearModel::from_file(two_output_file()).unwrap();
        let mut out = [0f32; 4];
        model.predict(&[1.0, 2.0, f32::NAN, 4.0], &mut out);
        assert_eq!(out, [2.0, 4.0, 2.0, 9.0]);
    }

    #[test]
    fn rejects_inconsistent_sizes() {
        let mut file = two_output_file();
        file.weights.pop();
        assert!(LinearModel::from_file(file).is_err());

        let mut file = two_output_file();
        file.bias = vec![1.0];
        assert!(LinearModel::from_file(file).is_err());

        let mut file = two_output_file();
        file.bias.clear();
        let model = LinearModel::from_file(file).unwrap();
        assert_eq!(model.bias, vec![0.0, 0.0]);
    }
}
