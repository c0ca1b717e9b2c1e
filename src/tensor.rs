//! Defines `Tensor` and `GraphContext`.
//!
//! A `Tensor` is not a data container. It is a lightweight handle (a
//! symbolic variable) naming one node of the Abstract Semantic Graph.
//! Every operation on it (`conv2d`, `+`, `relu`, ...) appends a node to the
//! graph instead of computing anything.
//!
//! `GraphContext` owns the graph under construction and the registry of
//! parameter specifications needed to materialize weights later.

use crate::asg::{Asg, DType, NodeId, NodeType, Pad2d, Shape, Value};
use ndarray::{arr0, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

/// How a parameter is filled when it is first materialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamInit {
    /// Uniform in `[-bound, bound]`.
    Uniform { bound: f32 },
    Ones,
    Zeros,
}

impl ParamInit {
    /// The default for convolution and linear weights and biases.
    pub fn fan_in(fan_in: usize) -> Self {
        ParamInit::Uniform { bound: 1.0 / (fan_in.max(1) as f32).sqrt() }
    }
}

/// Shape and initializer recorded for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Shape,
    pub init: ParamInit,
}

impl ParamSpec {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Owns and manages construction of the main ASG.
///
/// Wrapped in `Rc<RefCell<>>` so that many `Tensor` handles can share it.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    param_specs: Vec<ParamSpec>,
    param_index: HashMap<String, usize>,
}

impl GraphContext {
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
            param_specs: Vec::new(),
            param_index: HashMap::new(),
        }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    /// Parameter specs in registration order.
    pub fn param_specs(&self) -> &[ParamSpec] {
        &self.param_specs
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.param_index.get(name).map(|&i| &self.param_specs[i])
    }

    /// Panics if `spec.name` is already taken: two parameters bound by the
    /// same name would receive the same value at run time.
    fn register_param(&mut self, spec: ParamSpec) {
        assert!(
            !self.param_index.contains_key(&spec.name),
            "parameter '{}' is already registered; give each layer a unique name",
            spec.name
        );
        self.param_index.insert(spec.name.clone(), self.param_specs.len());
        self.param_specs.push(spec);
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the ASG.
///
/// Holds no data: only the node ID and a reference to the `GraphContext`
/// the node lives in.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates an input node. Real data is fed in at run time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
        graph.inputs.push(node_id);
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a trainable parameter and records its shape and initializer.
    pub fn new_parameter(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        init: ParamInit,
    ) -> Self {
        let mut ctx = context.borrow_mut();
        ctx.register_param(ParamSpec { name: name.to_string(), shape: shape.to_vec(), init });
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(Some(name.to_string()), NodeType::Parameter { name: name.to_string() });
        if let Ok(node) = graph.get_node_mut(node_id) {
            node.shape = Some(shape.to_vec());
            node.dtype = Some(DType::F32);
        }
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a constant node embedding `data` in the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// Rank-0 constant.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        Self::new_literal(context, arr0(value).into_dyn(), "scalar")
    }

    /// Spec recorded for this tensor, if it is a parameter node.
    pub fn parameter_spec(&self) -> Option<ParamSpec> {
        let ctx = self.context.borrow();
        match &ctx.main_graph().get_node(self.node_id).ok()?.node_type {
            NodeType::Parameter { name } => ctx.param_spec(name).cloned(),
            _ => None,
        }
    }

    fn push_op(&self, node_type: NodeType) -> Self {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self { node_id, context: Rc::clone(&self.context) }
    }

    // --- Math ---

    pub fn pow(&self, power: &Tensor) -> Self {
        self.push_op(NodeType::Power(self.node_id, power.node_id))
    }

    /// Matrix product, `[M, K] x [K, N]`.
    pub fn dot(&self, other: &Tensor) -> Self {
        self.push_op(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.push_op(NodeType::Sqrt(self.node_id))
    }

    pub fn neg(&self) -> Self {
        self.push_op(NodeType::Negate(self.node_id))
    }

    pub fn sin(&self) -> Self {
        self.push_op(NodeType::Sin(self.node_id))
    }

    pub fn cos(&self) -> Self {
        self.push_op(NodeType::Cos(self.node_id))
    }

    pub fn greater_than(&self, other: &Tensor) -> Self {
        self.push_op(NodeType::GreaterThan(self.node_id, other.node_id))
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.push_op(NodeType::ReLU(self.node_id))
    }

    // --- Reductions ---

    /// Sum of all elements, rank 0.
    pub fn sum(&self) -> Self {
        self.push_op(NodeType::Sum(self.node_id))
    }

    /// Sum over `axes`, keeping them with length 1.
    pub fn sum_axes(&self, axes: &[usize]) -> Self {
        self.push_op(NodeType::SumAxes(self.node_id, axes.to_vec()))
    }

    /// Mean over `axes`, keeping them with length 1.
    pub fn mean_axes(&self, axes: &[usize]) -> Self {
        self.push_op(NodeType::MeanAxes(self.node_id, axes.to_vec()))
    }

    // --- Transformations ---

    pub fn reshape(&self, shape: &[usize]) -> Self {
        let shape_data = ArrayD::from_shape_vec(
            IxDyn(&[shape.len()]),
            shape.iter().map(|&d| d as f32).collect(),
        )
        .expect("1-D shape literal always matches its length");
        let shape_node = Tensor::new_literal(&self.context, shape_data, "shape");
        self.push_op(NodeType::Reshape(self.node_id, shape_node.node_id))
    }

    pub fn reshape_like(&self, other: &Tensor) -> Self {
        self.push_op(NodeType::ReshapeLike(self.node_id, other.node_id))
    }

    /// Inserts an axis of length 1 at `axis`.
    pub fn unsqueeze(&self, axis: usize) -> Self {
        self.push_op(NodeType::Unsqueeze(self.node_id, axis))
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.push_op(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    pub fn broadcast_to(&self, target: &Tensor) -> Self {
        self.push_op(NodeType::Broadcast(self.node_id, target.node_id))
    }

    /// Sums away the axes along which `target` was broadcast to this shape.
    pub fn reduce_sum_to(&self, target: &Tensor) -> Self {
        self.push_op(NodeType::ReduceSumTo(self.node_id, target.node_id))
    }

    /// Concatenates `tensors` along `axis`, in the given order.
    pub fn concat(tensors: &[&Tensor], axis: usize) -> Self {
        let first = tensors.first().expect("concat needs at least one tensor");
        first.push_op(NodeType::Concat {
            inputs: tensors.iter().map(|t| t.node_id).collect(),
            axis,
        })
    }

    /// Elements `start..end` along `axis`.
    pub fn slice(&self, axis: usize, start: usize, end: usize) -> Self {
        self.push_op(NodeType::Slice { input: self.node_id, axis, start, end })
    }

    /// Zero-pads the last two axes by `(left, right, top, bottom)`.
    /// Negative amounts crop.
    pub fn pad2d(&self, pads: Pad2d) -> Self {
        self.push_op(NodeType::Pad2d { input: self.node_id, pads })
    }

    /// Pads or crops the last two axes to the spatial size of `reference`.
    pub fn pad_to_match(&self, reference: &Tensor) -> Self {
        self.push_op(NodeType::PadToMatch { input: self.node_id, reference: reference.node_id })
    }

    // --- Convolution and pooling ---

    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    ) -> Self {
        self.push_op(NodeType::Conv2d {
            input: self.node_id,
            weight: weight.node_id,
            bias: bias.map(|b| b.node_id),
            stride,
            padding,
            dilation,
            groups,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn conv_transpose2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
        output_padding: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    ) -> Self {
        self.push_op(NodeType::ConvTranspose2d {
            input: self.node_id,
            weight: weight.node_id,
            bias: bias.map(|b| b.node_id),
            stride,
            padding,
            output_padding,
            dilation,
            groups,
        })
    }

    pub fn max_pool2d(&self, kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        self.push_op(NodeType::MaxPool2d { input: self.node_id, kernel_size, stride })
    }

    pub fn avg_pool2d(
        &self,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        self.push_op(NodeType::AvgPool2d { input: self.node_id, kernel_size, stride, padding })
    }

    pub fn upsample_bilinear2d(&self, scale_factor: usize, align_corners: bool) -> Self {
        self.push_op(NodeType::UpsampleBilinear2d { input: self.node_id, scale_factor, align_corners })
    }
}

// Operator overloads for `a + b` syntax, on references and on owned handles.
macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                self.push_op(NodeType::$variant(self.node_id, rhs.node_id))
            }
        }

        impl $trait<Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                (&self).$method(&rhs)
            }
        }

        impl $trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                (&self).$method(rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Subtract);
impl_binary_op!(Mul, mul, Multiply);
impl_binary_op!(Div, div, Divide);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_append_nodes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = (&x * &x).relu();
        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.inputs, vec![x.node_id]);
        assert!(matches!(graph.get_node(y.node_id).unwrap().node_type, NodeType::ReLU(_)));
    }

    #[test]
    fn parameters_are_registered_with_shape() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let _w = Tensor::new_parameter(&ctx, "fc.weights", &[4, 2], ParamInit::fan_in(4));
        let _b = Tensor::new_parameter(&ctx, "fc.bias", &[2], ParamInit::Zeros);
        let ctx = ctx.borrow();
        let spec = ctx.param_spec("fc.weights").unwrap();
        assert_eq!(spec.shape, vec![4, 2]);
        assert_eq!(spec.numel(), 8);
        assert_eq!(spec.init, ParamInit::Uniform { bound: 0.5 });
        assert_eq!(ctx.param_specs().len(), 2);
    }

    #[test]
    #[should_panic(expected = "parameter 'fc.weights' is already registered")]
    fn duplicate_parameter_name_is_rejected() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        Tensor::new_parameter(&ctx, "fc.weights", &[4, 2], ParamInit::fan_in(4));
        Tensor::new_parameter(&ctx, "fc.weights", &[3, 2], ParamInit::fan_in(3));
    }

    #[test]
    fn only_parameters_have_specs() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let w = Tensor::new_parameter(&ctx, "w", &[3], ParamInit::Ones);
        let x = Tensor::new_input(&ctx, "x");
        assert_eq!(w.parameter_spec().map(|s| s.numel()), Some(3));
        assert!(x.parameter_spec().is_none());
        assert!((&x * &w).parameter_spec().is_none());
    }

    #[test]
    fn concat_keeps_operand_order() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let a = Tensor::new_input(&ctx, "a");
        let b = Tensor::new_input(&ctx, "b");
        let cat = Tensor::concat(&[&b, &a], 1);
        let graph = ctx.borrow().main_graph().clone();
        match &graph.get_node(cat.node_id).unwrap().node_type {
            NodeType::Concat { inputs, axis } => {
                assert_eq!(inputs, &vec![b.node_id, a.node_id]);
                assert_eq!(*axis, 1);
            }
            other => panic!("unexpected node {:?}", other),
        }
    }
}
