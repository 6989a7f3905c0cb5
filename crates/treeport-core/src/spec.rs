use std::fmt;

use crate::{DType, Error, Result};

/// Value reported for a dimension that is not known yet.
pub const UNBOUND_DIM: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IOName(pub String);

impl IOName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IOName {
    fn from(name: &str) -> Self {
        IOName(name.to_string())
    }
}

impl fmt::Display for IOName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One dimension of a declared shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dim {
    Known(usize),
    /// Depends on the batch size of a bound input.
    Unbound,
}

impl Dim {
    pub fn known(self) -> Option<usize> {
        match self {
            Dim::Known(n) => Some(n),
            Dim::Unbound => None,
        }
    }

    pub fn to_i64(self) -> i64 {
        match self {
            Dim::Known(n) => n as i64,
            Dim::Unbound => UNBOUND_DIM,
        }
    }
}

pub fn dims_to_i64(dims: &[Dim]) -> Vec<i64> {
    dims.iter().map(|d| d.to_i64()).collect()
}

#[derive(Clone, Debug)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub dims: Vec<Dim>,
}

impl TensorSpec {
    /// `[Unbound, row_dims...]`
    pub fn batched(name: &str, dtype: DType, row_dims: &[usize]) -> Self {
        let mut dims = Vec::with_capacity(row_dims.len() + 1);
        dims.push(Dim::Unbound);
        dims.extend(row_dims.iter().map(|d| Dim::Known(*d)));
        Self {
            name: IOName::from(name),
            dtype,
            dims,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

#[derive(Clone, Debug)]
pub struct OutputSpec {
    pub name: IOName,
    pub dtype: DType,
    pub dims: Vec<Dim>,
    /// Inputs whose leading dimension is this output's batch axis.
    pub batch_inputs: Vec<usize>,
}

impl OutputSpec {
    pub fn batched(name: &str, dtype: DType, row_dims: &[usize], batch_inputs: Vec<usize>) -> Self {
        let TensorSpec { name, dtype, dims } = TensorSpec::batched(name, dtype, row_dims);
        Self {
            name,
            dtype,
            dims,
            batch_inputs,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

/// Static metadata of a loaded model.
#[derive(Clone, Debug)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<OutputSpec>,
}

impl ModelSpec {
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|s| s.name.as_str() == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|s| s.name.as_str() == name)
    }

    /// Checks that names are unique and batch bindings point at batched inputs.
    pub fn validate(&self) -> Result<()> {
        for (i, input) in self.inputs.iter().enumerate() {
            if self.inputs[..i].iter().any(|s| s.name == input.name) {
                return Err(Error::load(format!("duplicate input name `{}`", input.name)));
            }
        }

        for output in &self.outputs {
            if output.batch_inputs.is_empty() {
                continue;
            }
            if output.dims.first() != Some(&Dim::Unbound) {
                return Err(Error::load(format!(
                    "output `{}` is tied to a batch axis but declares no batch dimension",
                    output.name
                )));
            }
            for &idx in &output.batch_inputs {
                let input = self.inputs.get(idx).ok_or_else(|| {
                    Error::load(format!(
                        "output `{}` references missing input {idx}",
                        output.name
                    ))
                })?;
                if input.dims.is_empty() {
                    return Err(Error::load(format!(
                        "output `{}` takes its batch from scalar input `{}`",
                        output.name, input.name
                    )));
                }
            }
        }

        Ok(())
    }
}
