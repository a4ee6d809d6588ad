use std::{collections::BTreeMap, sync::Arc};

use rayon::prelude::*;

use super::{Optimizer, OptimizerSpec, OptimizerState};
use crate::{
    error::{ActorErr, Result},
    params::{ParameterSet, Schema},
};

/// The optimizer state of every tensor, keyed by tensor name.
pub type ModelOptimizerState = BTreeMap<String, OptimizerState>;

/// One optimizer per model tensor, stepped in parallel.
pub struct OptimizerGroup {
    schema: Arc<Schema>,
    optimizers: Vec<Box<dyn Optimizer>>,
}

impl OptimizerGroup {
    /// Creates a new `OptimizerGroup`.
    ///
    /// # Arguments
    /// * `spec` - The optimizer configuration.
    /// * `schema` - The model the optimizers update.
    ///
    /// # Returns
    /// A new `OptimizerGroup` with fresh state.
    pub fn new(spec: &OptimizerSpec, schema: &Arc<Schema>) -> Self {
        let optimizers = schema
            .descs()
            .iter()
            .map(|desc| spec.build(desc.numel()))
            .collect();

        Self {
            schema: Arc::clone(schema),
            optimizers,
        }
    }

    /// The amount of device bytes the optimizer state takes.
    pub fn state_bytes(spec: &OptimizerSpec, schema: &Schema) -> usize {
        spec.buffers_per_param() * schema.numel() * size_of::<f32>()
    }

    /// Applies `grads` to `params`.
    ///
    /// # Arguments
    /// * `grads` - The reduced gradient of every tensor.
    /// * `params` - The live parameters.
    ///
    /// # Returns
    /// `NumericalDivergence` naming the first tensor whose gradient or updated
    /// values aren't finite.
    pub fn step(&mut self, grads: &ParameterSet, params: &mut ParameterSet) -> Result<()> {
        if let Some(param) = grads.find_non_finite() {
            return Err(ActorErr::NumericalDivergence {
                param: format!("{param}.grad"),
            });
        }

        let descs = self.schema.descs();
        self.optimizers
            .par_iter_mut()
            .zip(params.tensors_mut().par_iter_mut())
            .zip(grads.tensors().par_iter())
            .enumerate()
            .try_for_each(|(i, ((optimizer, params), grad))| {
                optimizer
                    .update_params(grad, params)
                    .map_err(|e| ActorErr::schema(&descs[i].name, e.to_string()))
            })?;

        if let Some(param) = params.find_non_finite() {
            return Err(ActorErr::NumericalDivergence {
                param: param.to_string(),
            });
        }

        params.bump_version();
        Ok(())
    }

    /// Exports the state of every optimizer.
    pub fn export(&self) -> ModelOptimizerState {
        self.schema
            .descs()
            .iter()
            .zip(&self.optimizers)
            .map(|(desc, optimizer)| (desc.name.clone(), optimizer.state()))
            .collect()
    }

    /// Restores an exported state, tensors missing from it keep their fresh state.
    pub fn import(&mut self, mut state: ModelOptimizerState) -> Result<()> {
        for (desc, optimizer) in self.schema.descs().iter().zip(&mut self.optimizers) {
            if let Some(s) = state.remove(&desc.name) {
                optimizer
                    .load_state(s)
                    .map_err(|e| ActorErr::schema(&desc.name, e.to_string()))?;
            }
        }

        if let Some(name) = state.keys().next() {
            return Err(ActorErr::schema(name, "optimizer state for unknown tensor"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Location, TensorDesc};

    fn setup() -> (Arc<Schema>, OptimizerGroup) {
        let schema = Schema::new(vec![
            TensorDesc::new("a", vec![2]),
            TensorDesc::new("b", vec![1]),
        ])
        .unwrap();
        let spec = OptimizerSpec::GradientDescentWithMomentum {
            learning_rate: 0.5,
            momentum: 0.9,
        };
        let group = OptimizerGroup::new(&spec, &schema);
        (schema, group)
    }

    #[test]
    fn steps_every_tensor_and_bumps_version() {
        let (schema, mut group) = setup();
        let mut params = ParameterSet::zeros(&schema, Location::Device);
        let mut grads = ParameterSet::zeros(&schema, Location::Host);
        grads.fill(1.);

        group.step(&grads, &mut params).unwrap();
        assert_eq!(params.tensor(0), &[-0.5, -0.5]);
        assert_eq!(params.tensor(1), &[-0.5]);
        assert_eq!(params.version(), 1);
    }

    #[test]
    fn non_finite_gradient_is_divergence() {
        let (schema, mut group) = setup();
        let mut params = ParameterSet::zeros(&schema, Location::Device);
        let mut grads = ParameterSet::zeros(&schema, Location::Host);
        grads.tensor_mut(1)[0] = f32::INFINITY;

        let err = group.step(&grads, &mut params).unwrap_err();
        assert!(matches!(err, ActorErr::NumericalDivergence { param } if param == "b.grad"));
        assert_eq!(params.version(), 0);
    }

    #[test]
    fn export_import_round_trip() {
        let (schema, mut group) = setup();
        let mut params = ParameterSet::zeros(&schema, Location::Device);
        let grads = ParameterSet::zeros(&schema, Location::Host);
        group.step(&grads, &mut params).unwrap();

        let exported = group.export();
        let (_, mut fresh) = setup();
        fresh.import(exported.clone()).unwrap();
        assert_eq!(fresh.export(), exported);
    }
}
