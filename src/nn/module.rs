//! Module defining the core `Module` traits for all neural network layers.

use crate::tensor::Tensor;

/// Trait defining the common interface for all layers/modules.
///
/// In the graph-based architecture, `Module` is any component that can
/// add a specific pattern of operations and parameters to the graph.
pub trait Module {
    /// Performs a "symbolic" forward pass, building the corresponding part of the graph.
    ///
    /// Takes an input symbolic tensor and returns an output symbolic tensor.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Returns a list of all trainable parameters (as symbolic tensors)
    /// that belong to this module.
    fn parameters(&self) -> Vec<Tensor>;

    /// Number of trainable scalars, from the registered parameter specs.
    fn parameter_count(&self) -> usize {
        count_elements(&self.parameters())
    }
}

/// A module whose forward pass takes a second tensor: a skip connection
/// or a conditioning embedding.
pub trait ConditionedModule {
    fn forward(&self, inputs: &Tensor, condition: &Tensor) -> Tensor;

    fn parameters(&self) -> Vec<Tensor>;

    fn parameter_count(&self) -> usize {
        count_elements(&self.parameters())
    }
}

fn count_elements(params: &[Tensor]) -> usize {
    params.iter().filter_map(Tensor::parameter_spec).map(|spec| spec.numel()).sum()
}
