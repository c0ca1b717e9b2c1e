//! ASG: Abstract Semantic Graph.
//!
//! The graph is the only representation of a computation in this crate.
//! Layers append nodes to it, `analysis` annotates it with shapes, `autograd`
//! derives a second graph from it and `runtime` evaluates it.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier, unique within one graph.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
    #[error("Invalid shape on node {0}")]
    InvalidShape(NodeId),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum DType {
    F32,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node ID (duplicates the `HashMap` key for convenience).
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

/// Signed 2-D padding `(left, right, top, bottom)`. Negative values crop.
pub type Pad2d = (isize, isize, isize, isize);

/// Pads that take a `from` spatial size `(h, w)` to `to`.
///
/// The difference is split with floor division, so an odd surplus goes to
/// the right/bottom edge and an odd deficit crops the left/top edge first.
pub fn centered_pads(from: (usize, usize), to: (usize, usize)) -> Pad2d {
    let dy = to.0 as isize - from.0 as isize;
    let dx = to.1 as isize - from.1 as isize;
    let (half_x, half_y) = (dx.div_euclid(2), dy.div_euclid(2));
    (half_x, dx - half_x, half_y, dy - half_y)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(Value),
    /// Value of a node of another graph, read from the execution memo.
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Binary, broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    Power(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Sqrt(NodeId),
    ReLU(NodeId),
    Sin(NodeId),
    Cos(NodeId),

    // Reductions
    Sum(NodeId),
    /// Sum over the given axes, keeping them with length 1.
    SumAxes(NodeId, Vec<usize>),
    /// Mean over the given axes, keeping them with length 1.
    MeanAxes(NodeId, Vec<usize>),

    // Transformations
    /// Second operand is a literal holding the target shape.
    Reshape(NodeId, NodeId),
    /// Reshape to the shape of the second operand.
    ReshapeLike(NodeId, NodeId),
    Unsqueeze(NodeId, usize),
    Transpose(NodeId, usize, usize),
    Broadcast(NodeId, NodeId),
    ReduceSumTo(NodeId, NodeId),
    Concat { inputs: Vec<NodeId>, axis: usize },
    Slice { input: NodeId, axis: usize, start: usize, end: usize },
    Pad2d { input: NodeId, pads: Pad2d },
    /// Pads or crops the last two axes of `input` to those of `reference`,
    /// splitting the difference with [`centered_pads`].
    PadToMatch { input: NodeId, reference: NodeId },

    // Convolution
    Conv2d {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    },
    ConvTranspose2d {
        input: NodeId,
        weight: NodeId,
        bias: Option<NodeId>,
        stride: (usize, usize),
        padding: (usize, usize),
        output_padding: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    },
    Conv2dBackwardInput {
        grad_output: NodeId,
        weight: NodeId,
        input_shape: (usize, usize, usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    },
    Conv2dBackwardWeight {
        grad_output: NodeId,
        input: NodeId,
        weight_shape: (usize, usize, usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    },

    // Pooling
    MaxPool2d { input: NodeId, kernel_size: (usize, usize), stride: (usize, usize) },
    MaxUnpool2d { input: NodeId, original_input: NodeId, kernel_size: (usize, usize), stride: (usize, usize) },
    AvgPool2d { input: NodeId, kernel_size: (usize, usize), stride: (usize, usize), padding: (usize, usize) },
    AvgUnpool2d {
        input: NodeId,
        original_input: NodeId,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    },

    // Resampling
    UpsampleBilinear2d { input: NodeId, scale_factor: usize, align_corners: bool },
    UpsampleBilinear2dBackward { grad_output: NodeId, input_size: (usize, usize), align_corners: bool },
}

impl NodeType {
    /// Operands of this node in evaluation order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::Power(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::Reshape(a, b)
            | NodeType::ReshapeLike(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],
            NodeType::PadToMatch { input, reference } => vec![*input, *reference],

            NodeType::Negate(a)
            | NodeType::Sqrt(a)
            | NodeType::ReLU(a)
            | NodeType::Sin(a)
            | NodeType::Cos(a)
            | NodeType::Sum(a)
            | NodeType::SumAxes(a, _)
            | NodeType::MeanAxes(a, _)
            | NodeType::Unsqueeze(a, _)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::Concat { inputs, .. } => inputs.clone(),
            NodeType::Slice { input, .. }
            | NodeType::Pad2d { input, .. }
            | NodeType::MaxPool2d { input, .. }
            | NodeType::AvgPool2d { input, .. }
            | NodeType::UpsampleBilinear2d { input, .. } => vec![*input],

            NodeType::Conv2d { input, weight, bias, .. }
            | NodeType::ConvTranspose2d { input, weight, bias, .. } => {
                let mut deps = vec![*input, *weight];
                if let Some(b) = bias {
                    deps.push(*b);
                }
                deps
            }
            NodeType::Conv2dBackwardInput { grad_output, weight, .. } => vec![*grad_output, *weight],
            NodeType::Conv2dBackwardWeight { grad_output, input, .. } => vec![*grad_output, *input],
            NodeType::MaxUnpool2d { input, original_input, .. }
            | NodeType::AvgUnpool2d { input, original_input, .. } => vec![*input, *original_input],
            NodeType::UpsampleBilinear2dBackward { grad_output, .. } => vec![*grad_output],
        }
    }

    /// Short operation name used in logs and error messages.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::Literal(_) => "Literal",
            NodeType::External { .. } => "External",
            NodeType::Add(..) => "Add",
            NodeType::Subtract(..) => "Subtract",
            NodeType::Multiply(..) => "Multiply",
            NodeType::Divide(..) => "Divide",
            NodeType::Power(..) => "Power",
            NodeType::GreaterThan(..) => "GreaterThan",
            NodeType::MatrixMultiply(..) => "MatrixMultiply",
            NodeType::Negate(_) => "Negate",
            NodeType::Sqrt(_) => "Sqrt",
            NodeType::ReLU(_) => "ReLU",
            NodeType::Sin(_) => "Sin",
            NodeType::Cos(_) => "Cos",
            NodeType::Sum(_) => "Sum",
            NodeType::SumAxes(..) => "SumAxes",
            NodeType::MeanAxes(..) => "MeanAxes",
            NodeType::Reshape(..) => "Reshape",
            NodeType::ReshapeLike(..) => "ReshapeLike",
            NodeType::Unsqueeze(..) => "Unsqueeze",
            NodeType::Transpose(..) => "Transpose",
            NodeType::Broadcast(..) => "Broadcast",
            NodeType::ReduceSumTo(..) => "ReduceSumTo",
            NodeType::Concat { .. } => "Concat",
            NodeType::Slice { .. } => "Slice",
            NodeType::Pad2d { .. } => "Pad2d",
            NodeType::PadToMatch { .. } => "PadToMatch",
            NodeType::Conv2d { .. } => "Conv2d",
            NodeType::ConvTranspose2d { .. } => "ConvTranspose2d",
            NodeType::Conv2dBackwardInput { .. } => "Conv2dBackwardInput",
            NodeType::Conv2dBackwardWeight { .. } => "Conv2dBackwardWeight",
            NodeType::MaxPool2d { .. } => "MaxPool2d",
            NodeType::MaxUnpool2d { .. } => "MaxUnpool2d",
            NodeType::AvgPool2d { .. } => "AvgPool2d",
            NodeType::AvgUnpool2d { .. } => "AvgUnpool2d",
            NodeType::UpsampleBilinear2d { .. } => "UpsampleBilinear2d",
            NodeType::UpsampleBilinear2dBackward { .. } => "UpsampleBilinear2dBackward",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Borrows the tensor payload, if any.
    pub fn as_tensor(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::Tensor(t) => Some(t),
            Value::ScalarF32(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals know their shape up front, so inference never stalls on them.
        match &node.node_type {
            NodeType::Literal(Value::Tensor(arr)) => {
                node.shape = Some(arr.shape().to_vec());
                node.dtype = Some(DType::F32);
            }
            NodeType::Literal(Value::ScalarF32(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::F32);
            }
            _ => {}
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_nodes_carry_their_shape() {
        let mut asg = Asg::new(0, Some("main".to_string()));
        let data = ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 3]));
        let id = asg.add_node(None, NodeType::Literal(Value::Tensor(data)));
        let node = asg.get_node(id).unwrap();
        assert_eq!(node.shape, Some(vec![2, 3]));
        assert_eq!(node.dtype, Some(DType::F32));
    }

    #[test]
    fn operands_follow_declaration_order() {
        let conv = NodeType::Conv2d {
            input: 0,
            weight: 1,
            bias: Some(2),
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        };
        assert_eq!(conv.operands(), vec![0, 1, 2]);
        let cat = NodeType::Concat { inputs: vec![4, 3], axis: 1 };
        assert_eq!(cat.operands(), vec![4, 3]);
    }

    #[test]
    fn centered_pads_split_with_floor_division() {
        assert_eq!(centered_pads((32, 32), (32, 32)), (0, 0, 0, 0));
        assert_eq!(centered_pads((30, 28), (31, 31)), (1, 2, 0, 1));
        assert_eq!(centered_pads((32, 32), (31, 31)), (-1, 0, -1, 0));
        assert_eq!(centered_pads((34, 34), (31, 31)), (-2, -1, -2, -1));
    }

    #[test]
    fn missing_node_is_an_error() {
        let asg = Asg::new(0, None);
        assert_eq!(asg.get_node(7).unwrap_err(), AsgError::NodeNotFound(7));
    }
}
