//! Materialization of registered parameters.
//!
//! Layers only record a [`ParamSpec`] per parameter. `ParameterStore` turns
//! those specs into concrete arrays with a seeded RNG, so the same seed and
//! the same model always produce the same weights.

use crate::asg::{Asg, Value};
use crate::runtime::backend::{bind_by_name, Memo};
use crate::tensor::{GraphContext, ParamInit, ParamSpec};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Concrete values of every parameter registered in a `GraphContext`.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    values: HashMap<String, Value>,
}

impl ParameterStore {
    /// Draws every registered parameter, in registration order, from one
    /// `StdRng` seeded with `seed`.
    pub fn initialize(context: &Rc<RefCell<GraphContext>>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let ctx = context.borrow();
        let values: HashMap<String, Value> = ctx
            .param_specs()
            .iter()
            .map(|spec| (spec.name.clone(), Value::Tensor(materialize(spec, &mut rng))))
            .collect();
        debug!(parameters = values.len(), seed, "initialized parameters");
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.values.get(name).and_then(Value::as_tensor)
    }

    /// Replaces (or adds) one parameter, e.g. after an optimizer step.
    pub fn insert(&mut self, name: &str, value: ArrayD<f32>) {
        self.values.insert(name.to_string(), Value::Tensor(value));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Total number of scalars held.
    pub fn num_elements(&self) -> usize {
        self.values.values().filter_map(Value::as_tensor).map(|t| t.len()).sum()
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Initial memo for `graph`: these parameters plus the named `inputs`.
    pub fn bind(&self, graph: &Asg, inputs: &HashMap<String, Value>) -> Memo<Value> {
        let mut memo = bind_by_name(graph, &self.values);
        memo.extend(bind_by_name(graph, inputs));
        memo
    }
}

fn materialize(spec: &ParamSpec, rng: &mut StdRng) -> ArrayD<f32> {
    let shape = IxDyn(&spec.shape);
    match spec.init {
        ParamInit::Uniform { bound } if bound > 0.0 => {
            ArrayD::random_using(shape, Uniform::new_inclusive(-bound, bound), rng)
        }
        ParamInit::Uniform { .. } | ParamInit::Zeros => ArrayD::zeros(shape),
        ParamInit::Ones => ArrayD::ones(shape),
    }
}
