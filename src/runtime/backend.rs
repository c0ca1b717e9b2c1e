//! Abstract interface (trait) for execution backends.

use crate::asg::{Asg, AsgId, NodeId, NodeType, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur while executing a graph.
/// Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node with ID {0} not found in graph {1}. Check that the graph was built correctly.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Type mismatch: operation expected {expected}, got {actual}.")]
    TypeError { expected: String, actual: String },

    #[error("Tensor shape error: {0}.")]
    ShapeError(String),

    #[error("No value for input '{0}' (node ID: {1}). Bind it before calling backend.run().")]
    MissingInput(String, NodeId),

    #[error("No value for parameter '{0}' (node ID: {1}). Initialize parameters before running the graph.")]
    MissingParameter(String, NodeId),

    #[error("Operation '{0}' is not implemented by this backend.")]
    UnimplementedOperation(String),
}

/// Cache of already computed node values.
/// Key is `(AsgId, NodeId)`.
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Builds an initial memo by binding every `Input` and `Parameter` node of
/// `asg` whose name appears in `data`. Unknown names are ignored.
pub fn bind_by_name<T: Clone>(asg: &Asg, data: &HashMap<String, T>) -> Memo<T> {
    let mut memo = Memo::new();
    for node in asg.nodes.values() {
        let name = match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } => name,
            _ => continue,
        };
        if let Some(value) = data.get(name) {
            memo.insert((asg.id, node.id), value.clone());
        }
    }
    memo
}

/// Common interface of an execution environment (backend).
///
/// Any implementor can take an ASG plus data and execute it.
pub trait Backend {
    /// Device-specific representation of data.
    type DeviceData: std::fmt::Debug;

    /// Prepares host data for execution on the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes the graph, reading and extending the memo.
    ///
    /// # Arguments
    /// * `main_asg` - Graph to execute.
    /// * `initial_memo` - Bound inputs and parameters and, possibly, results
    ///   of an earlier run of a linked graph (read through `External` nodes).
    ///
    /// # Returns
    /// The graph outputs, in order, and the final memo with every
    /// intermediate value.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies results back to the host.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, ParamInit, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn binds_inputs_and_parameters_by_name() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", &[1], ParamInit::Ones);
        let graph = ctx.borrow().main_graph().clone();

        let data = HashMap::from([("x".to_string(), 1.0f32), ("w".to_string(), 2.0), ("other".to_string(), 3.0)]);
        let memo = bind_by_name(&graph, &data);

        assert_eq!(memo.len(), 2);
        assert_eq!(memo[&(graph.id, x.node_id)], 1.0);
        assert_eq!(memo[&(graph.id, w.node_id)], 2.0);
    }
}
