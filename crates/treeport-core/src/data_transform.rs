//! Metadata-driven conversion between JSON records and model tensors.
//!
//! An input transform turns rows of JSON values into a float matrix, one
//! rule per column. An output transform maps integer class ids back to
//! string labels and stores the result as JSON text in a `uint8` tensor.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DType, Dim, Error, ModelSpec, Result, Shape, Tensor};

/// Written for a float column whose value cannot be converted.
pub const BAD_FLOAT_VALUE: f32 = f32::NAN;
/// Written for a categorical column whose string has no mapping entry.
pub const MISSING_CATEGORY_VALUE: f32 = -1.0;
/// Emitted for an output id with no mapping entry.
pub const UNSEEN_LABEL: &str = "<unseen_label>";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataTransform {
    /// Applies to the model's first input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputTransform>,
    /// Keyed by output slot.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output: BTreeMap<usize, OutputTransform>,
}

impl DataTransform {
    /// Checks the transform against the engine's declared tensors.
    pub fn validate(&self, spec: &ModelSpec) -> Result<()> {
        if let Some(input) = &self.input {
            let Some(first) = spec.inputs.first() else {
                return Err(Error::load("input transform declared for a model without inputs"));
            };
            if first.dtype != DType::F32 {
                return Err(Error::load(format!(
                    "input transform needs a float32 input, `{}` is {}",
                    first.name, first.dtype
                )));
            }
            match first.dims.as_slice() {
                [Dim::Unbound, Dim::Known(width)] if *width == input.columns.len() => {}
                _ => {
                    return Err(Error::load(format!(
                        "input transform has {} columns, input `{}` is not [-1, {}]",
                        input.columns.len(),
                        first.name,
                        input.columns.len()
                    )))
                }
            }
        }

        if let Some(&slot) = self.output.keys().find(|&&slot| slot >= spec.outputs.len()) {
            return Err(Error::load(format!(
                "output transform for slot {slot}, model has {} outputs",
                spec.outputs.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputTransform {
    pub columns: Vec<ColumnTransform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnTransform {
    /// Numbers pass through; strings are parsed.
    Float,
    /// Strings are looked up in `mapping`.
    CategoricalString { mapping: HashMap<String, f32> },
}

impl ColumnTransform {
    pub fn apply(&self, value: &Value) -> f32 {
        match self {
            ColumnTransform::Float => match value {
                Value::Number(n) => n.as_f64().map_or(BAD_FLOAT_VALUE, |v| v as f32),
                Value::String(s) => s.trim().parse().unwrap_or(BAD_FLOAT_VALUE),
                _ => BAD_FLOAT_VALUE,
            },
            ColumnTransform::CategoricalString { mapping } => {
                let key = match value {
                    Value::String(s) => Cow::Borrowed(s.as_str()),
                    other => Cow::Owned(other.to_string()),
                };
                mapping
                    .get(key.as_ref())
                    .copied()
                    .unwrap_or(MISSING_CATEGORY_VALUE)
            }
        }
    }
}

impl InputTransform {
    /// Parse `json` as an array of rows and build a `[rows, columns]` float
    /// tensor.
    pub fn to_tensor(&self, json: &str) -> Result<Tensor> {
        let rows: Vec<Vec<Value>> = serde_json::from_str(json).map_err(|e| {
            Error::shape_mismatch(format!("input is not a JSON array of rows: {e}"))
        })?;

        let width = self.columns.len();
        let mut values = Vec::with_capacity(rows.len() * width);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(Error::shape_mismatch(format!(
                    "row {i} has {} values, transform expects {width}",
                    row.len()
                )));
            }
            values.extend(self.columns.iter().zip(row).map(|(col, v)| col.apply(v)));
        }

        Ok(Tensor::from_slice(
            Shape::from_slice(&[rows.len(), width]),
            &values,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTransform {
    pub categorical_string: BTreeMap<i64, String>,
}

impl OutputTransform {
    /// Ids are rounded to the nearest integer; NaN and unmapped ids become
    /// [`UNSEEN_LABEL`].
    pub fn label(&self, id: f64) -> &str {
        if !id.is_finite() {
            return UNSEEN_LABEL;
        }
        self.categorical_string
            .get(&(id.round() as i64))
            .map_or(UNSEEN_LABEL, String::as_str)
    }

    /// Map a rank-1 or rank-2 numeric tensor to a JSON array of labels,
    /// nested per row for rank 2.
    pub fn apply(&self, tensor: &Tensor) -> Result<Tensor> {
        let ids: Vec<f64> = match tensor.dtype {
            DType::F32 => tensor.to_vec::<f32>()?.into_iter().map(f64::from).collect(),
            DType::I32 => tensor.to_vec::<i32>()?.into_iter().map(f64::from).collect(),
            DType::I64 => tensor.to_vec::<i64>()?.into_iter().map(|v| v as f64).collect(),
            other => {
                return Err(Error::runtime(format!(
                    "cannot map {other} output to labels"
                )))
            }
        };
        let labels: Vec<Value> = ids
            .iter()
            .map(|&id| Value::String(self.label(id).to_string()))
            .collect();

        let json = match tensor.shape.0.as_slice() {
            [_] => Value::Array(labels),
            &[rows, width] => Value::Array(
                (0..rows)
                    .map(|r| Value::Array(labels[r * width..(r + 1) * width].to_vec()))
                    .collect(),
            ),
            dims => {
                return Err(Error::runtime(format!(
                    "cannot map output of rank {} to labels",
                    dims.len()
                )))
            }
        };

        let text = serde_json::to_vec(&json)
            .map_err(|e| Error::runtime(format!("cannot encode labels: {e}")))?;
        Ok(Tensor::from_cpu_bytes(
            DType::U8,
            Shape::from_slice(&[text.len()]),
            Bytes::from(text),
        ))
    }
}
