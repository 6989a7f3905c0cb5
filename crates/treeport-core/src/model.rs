//! The uniform tensor I/O wrapper around a loaded engine.
//!
//! A [`Model`] has no internal locking. Every call that changes bindings,
//! the prediction mode or the last output takes `&mut self`, so sharing one
//! instance across threads needs an external lock (`Arc<Mutex<Model>>`), or
//! one instance per worker.
//!
//! When the engine carries a [`DataTransform`], mapped output slots are
//! replaced by JSON label text: a `uint8` tensor of rank 1 whose length is
//! unknown until `run`.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::{
    dims_to_i64, Backend, BackendCapabilities, Context, DType, DataTransform, Element,
    EngineHandle, Error, IoKind, ModelArtifact, ModelSpec, Result, ShapeResolver, Tensor,
    UNBOUND_DIM,
};

pub struct Model {
    engine: Box<dyn EngineHandle>,
    spec: ModelSpec,
    capabilities: BackendCapabilities,
    resolver: ShapeResolver,
    data_transform: Option<DataTransform>,
    labels: BTreeMap<usize, Tensor>,
    margin: bool,
    has_output: bool,
}

impl Model {
    pub fn load<B: Backend>(backend: &B, artifact: &ModelArtifact, context: Context) -> Result<Self> {
        let engine = backend.load(artifact, context)?;
        info!(
            backend = backend.name(),
            %context,
            files = artifact.files().len(),
            "model loaded"
        );
        Self::from_engine(Box::new(engine))
    }

    pub fn from_engine(engine: Box<dyn EngineHandle>) -> Result<Self> {
        let spec = engine.spec().clone();
        spec.validate()?;
        let capabilities = engine.capabilities();
        let resolver =
            ShapeResolver::new(&spec).with_dynamic_batch(capabilities.supports_dynamic_batch);
        let data_transform = engine.data_transform().cloned();
        if let Some(transform) = &data_transform {
            transform.validate(&spec)?;
            debug!(
                input = transform.input.is_some(),
                outputs = transform.output.len(),
                "data transform attached"
            );
        }
        Ok(Self {
            engine,
            spec,
            capabilities,
            resolver,
            data_transform,
            labels: BTreeMap::new(),
            margin: false,
            has_output: false,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.engine.backend_name()
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn num_inputs(&self) -> usize {
        self.spec.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.spec.outputs.len()
    }

    pub fn input_name(&self, index: usize) -> Result<&str> {
        self.check_input(index)?;
        Ok(self.spec.inputs[index].name.as_str())
    }

    pub fn input_type(&self, index: usize) -> Result<&'static str> {
        self.check_input(index)?;
        Ok(self.spec.inputs[index].dtype.as_str())
    }

    pub fn input_dim(&self, index: usize) -> Result<usize> {
        self.check_input(index)?;
        Ok(self.spec.inputs[index].rank())
    }

    /// Declared shape with `-1` for the batch axis until the input is bound,
    /// the bound shape afterwards.
    pub fn input_shape(&self, index: usize) -> Result<Vec<i64>> {
        self.check_input(index)?;
        Ok(dims_to_i64(&self.resolver.input_dims(index)))
    }

    /// Element count of the bound input.
    pub fn input_size(&self, index: usize) -> Result<i64> {
        self.check_input(index)?;
        if !self.capabilities.reports_input_size {
            return Err(Error::not_supported("GetInputSize", self.backend_name()));
        }
        let shape = self.resolver.bound_shape(index).ok_or_else(|| {
            Error::not_ready(format!(
                "input `{}` has not been set",
                self.spec.inputs[index].name
            ))
        })?;
        Ok(shape.numel() as i64)
    }

    /// Bind `data` with `shape` to the input called `name`.
    ///
    /// `data` may be longer than the shape requires; the tail is ignored.
    /// On error nothing changes: previous bindings and the last output stay
    /// as they were.
    pub fn set_input<T: Element>(&mut self, name: &str, shape: &[i64], data: &[T]) -> Result<()> {
        let index = self.input_index(name)?;
        self.check_dtype(index, T::DTYPE)?;

        let shape = self.resolver.check(index, shape)?;
        // The resolver has already rejected shapes whose element count overflows.
        let numel = shape.numel();
        if data.len() < numel {
            return Err(Error::shape_mismatch(format!(
                "input `{name}` with shape {:?} needs {numel} elements, got {}",
                shape.0.as_slice(),
                data.len()
            )));
        }

        let tensor = Tensor::from_slice(shape.clone(), &data[..numel]);
        self.bind(index, tensor)
    }

    /// Bind an already-built tensor; same checks as [`Model::set_input`].
    pub fn set_input_tensor(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        let index = self.input_index(name)?;
        self.check_dtype(index, tensor.dtype)?;

        let dims = tensor
            .shape
            .0
            .iter()
            .map(|&d| i64::try_from(d))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::shape_mismatch(format!("input `{name}` has a dimension beyond i64")))?;
        let shape = self.resolver.check(index, &dims)?;
        let expected = shape
            .checked_numel()
            .and_then(|n| n.checked_mul(tensor.dtype.byte_size()))
            .ok_or_else(|| Error::shape_mismatch(format!("input `{name}` is too large")))?;
        if tensor.byte_len() != expected {
            return Err(Error::shape_mismatch(format!(
                "input `{name}` needs {expected} bytes, got {}",
                tensor.byte_len()
            )));
        }
        self.bind(index, tensor)
    }

    /// Bind JSON rows to the first input through the model's input
    /// transform. Each row holds one value per transform column.
    pub fn set_input_json(&mut self, name: &str, json: &str) -> Result<()> {
        let index = self.input_index(name)?;
        let transform = self
            .data_transform
            .as_ref()
            .and_then(|t| t.input.as_ref())
            .filter(|_| index == 0)
            .ok_or_else(|| Error::not_supported("TransformInput", self.backend_name()))?;
        let tensor = transform.to_tensor(json)?;
        self.set_input_tensor(name, tensor)
    }

    pub fn has_input_transform(&self) -> bool {
        self.data_transform
            .as_ref()
            .is_some_and(|t| t.input.is_some())
    }

    pub fn has_output_transform(&self, slot: usize) -> bool {
        self.data_transform
            .as_ref()
            .is_some_and(|t| t.output.contains_key(&slot))
    }

    /// Forget every binding and the last output. Needed before switching a
    /// multi-input model to a different batch size, since bound inputs must
    /// agree on it.
    pub fn clear_inputs(&mut self) {
        self.resolver.clear();
        self.has_output = false;
    }

    /// Copy the bound tensor of input `name` into `out`.
    ///
    /// Engines that do not keep their inputs fail with
    /// [`Error::NotSupported`]; no stale or zeroed data is ever returned.
    pub fn get_input<T: Element>(&self, name: &str, out: &mut [T]) -> Result<()> {
        let index = self.input_index(name)?;
        if !self.capabilities.supports_input_readback {
            return Err(Error::not_supported("GetInput", self.backend_name()));
        }
        if self.resolver.bound_shape(index).is_none() {
            return Err(Error::not_ready(format!("input `{name}` has not been set")));
        }
        self.engine.get_input(index)?.copy_to(out)
    }

    pub fn output_name(&self, slot: usize) -> Result<&str> {
        self.check_output(slot)?;
        Ok(self.spec.outputs[slot].name.as_str())
    }

    pub fn output_type(&self, slot: usize) -> Result<&'static str> {
        Ok(self.output_dtype(slot)?.as_str())
    }

    pub fn output_dtype(&self, slot: usize) -> Result<DType> {
        self.check_output(slot)?;
        if self.has_output_transform(slot) {
            return Ok(DType::U8);
        }
        Ok(self.spec.outputs[slot].dtype)
    }

    pub fn output_dim(&self, slot: usize) -> Result<usize> {
        self.check_output(slot)?;
        if self.has_output_transform(slot) {
            return Ok(1);
        }
        Ok(self.spec.outputs[slot].rank())
    }

    /// Leading entry is `-1` until an input feeding this output is bound.
    /// Label outputs stay `[-1]` until `run` has produced their text.
    pub fn output_shape(&self, slot: usize) -> Result<Vec<i64>> {
        self.check_output(slot)?;
        if self.has_output_transform(slot) {
            return Ok(vec![self.label_len(slot)]);
        }
        Ok(dims_to_i64(&self.resolver.output_dims(slot)))
    }

    /// `(size, dim)`: size is `-1` until the batch is known, dim is the
    /// declared rank.
    pub fn output_size_dim(&self, slot: usize) -> Result<(i64, usize)> {
        self.check_output(slot)?;
        if self.has_output_transform(slot) {
            return Ok((self.label_len(slot), 1));
        }
        let size = self
            .resolver
            .output_size(slot)
            .map_or(UNBOUND_DIM, |n| n as i64);
        Ok((size, self.spec.outputs[slot].rank()))
    }

    pub fn pred_margin(&self) -> bool {
        self.margin
    }

    /// Select raw margins (`true`) or transformed predictions (`false`) for
    /// the next `run`. Shapes are unaffected.
    pub fn set_pred_margin(&mut self, margin: bool) {
        self.margin = margin;
        self.engine.set_pred_margin(margin);
    }

    pub fn run(&mut self) -> Result<()> {
        if let Some(index) = self.resolver.first_unbound() {
            return Err(Error::not_ready(format!(
                "input `{}` has not been set",
                self.spec.inputs[index].name
            )));
        }

        self.has_output = false;
        self.labels.clear();
        self.engine.run()?;
        if let Some(transform) = &self.data_transform {
            for (&slot, mapping) in &transform.output {
                let labels = mapping.apply(self.engine.output(slot)?)?;
                self.labels.insert(slot, labels);
            }
        }
        self.has_output = true;
        debug!(backend = self.backend_name(), margin = self.margin, "run complete");
        Ok(())
    }

    /// Output `slot` of the last run.
    pub fn output(&self, slot: usize) -> Result<&Tensor> {
        self.check_output(slot)?;
        if !self.has_output {
            return Err(Error::not_ready(
                "no output since the last input change; call run first",
            ));
        }
        match self.labels.get(&slot) {
            Some(labels) => Ok(labels),
            None => self.engine.output(slot),
        }
    }

    /// Copy output `slot` of the last run into `out`.
    pub fn copy_output<T: Element>(&self, slot: usize, out: &mut [T]) -> Result<()> {
        let tensor = self.output(slot)?;
        tensor.copy_to(out).map_err(|err| match err {
            Error::TypeMismatch { expected, got, .. } => Error::TypeMismatch {
                name: self.spec.outputs[slot].name.to_string(),
                expected,
                got,
            },
            other => other,
        })
    }

    /// Raw little-endian bytes of output `slot`, owned by the engine. The
    /// borrow ends before the next `run`, `set_input` or drop.
    pub fn output_ptr(&self, slot: usize) -> Result<&[u8]> {
        Ok(self.output(slot)?.data.as_ref())
    }

    fn label_len(&self, slot: usize) -> i64 {
        match self.labels.get(&slot) {
            Some(labels) if self.has_output => labels.byte_len() as i64,
            _ => UNBOUND_DIM,
        }
    }

    fn bind(&mut self, index: usize, tensor: Tensor) -> Result<()> {
        let shape = tensor.shape.clone();
        self.engine.set_input(index, tensor)?;

        debug!(
            input = %self.spec.inputs[index].name,
            shape = ?shape.0.as_slice(),
            "input bound"
        );
        self.resolver.bind(index, shape);
        self.has_output = false;
        Ok(())
    }

    fn input_index(&self, name: &str) -> Result<usize> {
        self.spec.input_index(name).ok_or_else(|| Error::UnknownName {
            kind: IoKind::Input,
            name: name.to_string(),
        })
    }

    fn check_dtype(&self, index: usize, got: DType) -> Result<()> {
        let input = &self.spec.inputs[index];
        if got != input.dtype {
            return Err(Error::TypeMismatch {
                name: input.name.to_string(),
                expected: input.dtype,
                got,
            });
        }
        Ok(())
    }

    fn check_input(&self, index: usize) -> Result<()> {
        if index >= self.spec.inputs.len() {
            return Err(Error::IndexOutOfRange {
                kind: IoKind::Input,
                index,
                count: self.spec.inputs.len(),
            });
        }
        Ok(())
    }

    fn check_output(&self, slot: usize) -> Result<()> {
        if slot >= self.spec.outputs.len() {
            return Err(Error::IndexOutOfRange {
                kind: IoKind::Output,
                index: slot,
                count: self.spec.outputs.len(),
            });
        }
        Ok(())
    }
}
