use crate::{Dim, Error, ModelSpec, Result, Shape};

/// Tracks bound input shapes and derives output shapes from them.
///
/// Before an input is bound its leading dimension stays [`Dim::Unbound`];
/// outputs take their batch dimension from whichever of their
/// `batch_inputs` is bound.
#[derive(Clone, Debug)]
pub struct ShapeResolver {
    spec: ModelSpec,
    bound: Vec<Option<Shape>>,
    dynamic_batch: bool,
}

impl ShapeResolver {
    pub fn new(spec: &ModelSpec) -> Self {
        Self {
            spec: spec.clone(),
            bound: vec![None; spec.inputs.len()],
            dynamic_batch: true,
        }
    }

    /// Engines without dynamic batching accept only a batch of one on
    /// inputs whose leading dimension is unbound.
    pub fn with_dynamic_batch(mut self, dynamic_batch: bool) -> Self {
        self.dynamic_batch = dynamic_batch;
        self
    }

    /// Validate a requested shape for input `index` without binding it.
    pub fn check(&self, index: usize, shape: &[i64]) -> Result<Shape> {
        let input = &self.spec.inputs[index];
        let name = &input.name;

        if shape.len() != input.rank() {
            return Err(Error::shape_mismatch(format!(
                "input `{name}` expects rank {}, got {}",
                input.rank(),
                shape.len()
            )));
        }

        let mut dims = Vec::with_capacity(shape.len());
        for (axis, (&got, declared)) in shape.iter().zip(&input.dims).enumerate() {
            if got < 1 {
                return Err(Error::shape_mismatch(format!(
                    "input `{name}` axis {axis} has non-positive size {got}"
                )));
            }
            let got = got as usize;
            match *declared {
                Dim::Known(want) if want != got => {
                    return Err(Error::shape_mismatch(format!(
                        "input `{name}` axis {axis} must be {want}, got {got}"
                    )));
                }
                Dim::Unbound if !self.dynamic_batch && got != 1 => {
                    return Err(Error::shape_mismatch(format!(
                        "input `{name}` takes a batch of 1 on this engine, got {got}"
                    )));
                }
                _ => {}
            }
            dims.push(got);
        }
        let shape = Shape::from_slice(&dims);
        if shape.checked_numel().is_none() {
            return Err(Error::shape_mismatch(format!(
                "input `{name}` shape {dims:?} has more elements than fit in memory"
            )));
        }
        if let Some(batch) = shape.batch() {
            self.check_output_sizes(index, batch)?;
        }

        if let Some((other, other_batch)) = self.conflicting_batch(index, shape.batch()) {
            return Err(Error::shape_mismatch(format!(
                "batch size {} of input `{name}` disagrees with batch size {other_batch} of bound input `{}`",
                shape.batch().unwrap_or(0),
                self.spec.inputs[other].name
            )));
        }

        Ok(shape)
    }

    pub fn bind(&mut self, index: usize, shape: Shape) {
        self.bound[index] = Some(shape);
    }

    pub fn clear(&mut self) {
        self.bound.iter_mut().for_each(|b| *b = None);
    }

    pub fn bound_shape(&self, index: usize) -> Option<&Shape> {
        self.bound[index].as_ref()
    }

    pub fn first_unbound(&self) -> Option<usize> {
        self.bound.iter().position(Option::is_none)
    }

    pub fn input_dims(&self, index: usize) -> Vec<Dim> {
        match &self.bound[index] {
            Some(shape) => shape.0.iter().map(|d| Dim::Known(*d)).collect(),
            None => self.spec.inputs[index].dims.clone(),
        }
    }

    pub fn output_dims(&self, slot: usize) -> Vec<Dim> {
        let output = &self.spec.outputs[slot];
        let mut dims = output.dims.clone();
        if let Some(first) = dims.first_mut() {
            if *first == Dim::Unbound {
                if let Some(batch) = self.batch_of(&output.batch_inputs) {
                    *first = Dim::Known(batch);
                }
            }
        }
        dims
    }

    /// Element count of output `slot`, or `None` while any dimension is unbound.
    pub fn output_size(&self, slot: usize) -> Option<usize> {
        self.output_dims(slot)
            .into_iter()
            .map(Dim::known)
            .product::<Option<usize>>()
    }

    /// Outputs fed by input `index` must stay addressable at this batch size.
    fn check_output_sizes(&self, index: usize, batch: usize) -> Result<()> {
        for output in self.spec.outputs.iter().filter(|o| o.batch_inputs.contains(&index)) {
            let size = output
                .dims
                .iter()
                .skip(1)
                .filter_map(|d| d.known())
                .try_fold(batch, |acc, d| acc.checked_mul(d));
            if size.is_none() {
                return Err(Error::shape_mismatch(format!(
                    "batch size {batch} makes output `{}` too large",
                    output.name
                )));
            }
        }
        Ok(())
    }

    fn batch_of(&self, inputs: &[usize]) -> Option<usize> {
        inputs
            .iter()
            .find_map(|&i| self.bound[i].as_ref().and_then(Shape::batch))
    }

    /// A bound input sharing an output batch axis with `index` whose batch
    /// differs from `batch`.
    fn conflicting_batch(&self, index: usize, batch: Option<usize>) -> Option<(usize, usize)> {
        let batch = batch?;
        self.spec
            .outputs
            .iter()
            .filter(|o| o.batch_inputs.contains(&index))
            .flat_map(|o| o.batch_inputs.iter().copied())
            .filter(|&j| j != index)
            .find_map(|j| {
                let other = self.bound[j].as_ref()?.batch()?;
                (other != batch).then_some((j, other))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dims_to_i64, DType, OutputSpec, TensorSpec};

    fn two_input_spec() -> ModelSpec {
        ModelSpec {
            inputs: vec![
                TensorSpec::batched("a", DType::F32, &[4]),
                TensorSpec::batched("b", DType::F32, &[2]),
                TensorSpec::batched("side", DType::F32, &[1]),
            ],
            outputs: vec![OutputSpec::batched("y", DType::F32, &[3], vec![0, 1])],
        }
    }

    #[test]
    fn output_batch_is_unbound_until_an_input_binds() {
        let mut r = ShapeResolver::new(&two_input_spec());
        assert_eq!(dims_to_i64(&r.output_dims(0)), vec![-1, 3]);
        assert_eq!(r.output_size(0), None);

        let shape = r.check(1, &[5, 2]).unwrap();
        r.bind(1, shape);
        assert_eq!(dims_to_i64(&r.output_dims(0)), vec![5, 3]);
        assert_eq!(r.output_size(0), Some(15));
        assert_eq!(dims_to_i64(&r.input_dims(0)), vec![-1, 4]);
        assert_eq!(dims_to_i64(&r.input_dims(1)), vec![5, 2]);
    }

    #[test]
    fn disagreeing_batches_fail_at_bind_time() {
        let mut r = ShapeResolver::new(&two_input_spec());
        let a = r.check(0, &[2, 4]).unwrap();
        r.bind(0, a);

        let err = r.check(1, &[3, 2]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));

        // `side` does not feed `y`, so any batch is fine.
        assert!(r.check(2, &[7, 1]).is_ok());
        // Rebinding the same input with a new batch is allowed.
        assert!(r.check(0, &[9, 4]).is_ok());
    }

    #[test]
    fn rejects_bad_rank_and_sizes() {
        let r = ShapeResolver::new(&two_input_spec());
        assert!(r.check(0, &[1, 4, 1]).is_err());
        assert!(r.check(0, &[0, 4]).is_err());
        assert!(r.check(0, &[-1, 4]).is_err());
        assert!(r.check(0, &[1, 5]).is_err());
    }

    #[test]
    fn fixed_batch_engines_take_one_row() {
        let r = ShapeResolver::new(&two_input_spec()).with_dynamic_batch(false);
        assert!(r.check(0, &[1, 4]).is_ok());
        assert!(matches!(r.check(0, &[2, 4]), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn oversized_shapes_are_rejected_not_wrapped() {
        let r = ShapeResolver::new(&two_input_spec());
        assert!(matches!(
            r.check(0, &[i64::MAX, 4]),
            Err(Error::ShapeMismatch(_))
        ));

        // `b` itself fits, but `y` would need batch * 3 elements.
        let batch = (usize::MAX / 2) as i64;
        assert!(matches!(r.check(1, &[batch, 2]), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn first_unbound_tracks_bindings() {
        let mut r = ShapeResolver::new(&two_input_spec());
        assert_eq!(r.first_unbound(), Some(0));
        r.bind(0, Shape::from_slice(&[1, 4]));
        r.bind(1, Shape::from_slice(&[1, 2]));
        assert_eq!(r.first_unbound(), Some(2));
        r.bind(2, Shape::from_slice(&[1, 1]));
        assert_eq!(r.first_unbound(), None);
    }
}
