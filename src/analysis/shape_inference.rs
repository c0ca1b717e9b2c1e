//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape and data type
//! of the output tensor for each node based on its input shapes and
//! operation type. Channel mismatches between a convolution and its input,
//! or pooling windows larger than the feature map, are reported here,
//! before any data is touched.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': {shape1:?} and {shape2:?}.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}. \
             The node has not been processed yet or the graph contains a cycle.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes HashMap when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Node {0} must be a Literal for shape computation (e.g., for Reshape operation). \
             Dynamic shapes are not supported.")]
    NotALiteral(NodeId),

    #[error("Invalid operand for '{op}' at node {node_id}: {reason}")]
    InvalidOperand {
        node_id: NodeId,
        op: String,
        reason: String,
    },

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Computes the NumPy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the shape inference process for the graph.
    ///
    /// Modifies the graph in-place, filling in the `shape` and `dtype` fields
    /// of every node reachable from the outputs.
    ///
    /// # Arguments
    /// * `asg` - Mutable reference to the graph to analyze.
    /// * `initial_shapes` - Shapes for `Input` nodes (and any `Parameter` or
    ///   `External` node without a recorded shape). Key is the node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let mut node = asg.get_node(node_id)?.clone();
            let (shape, dtype) = Self::infer_node_shape(asg, &node, initial_shapes)?;
            node.shape = Some(shape);
            node.dtype = Some(dtype);
            asg.nodes.insert(node_id, node);
        }

        Ok(())
    }

    /// Main shape inference logic for a single node.
    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name }
            | NodeType::Parameter { name }
            | NodeType::External { name, .. } => {
                if let Some(found) = initial_shapes.get(name) {
                    return Ok(found.clone());
                }
                match (&node.shape, node.dtype) {
                    (Some(shape), dtype) => Ok((shape.clone(), dtype.unwrap_or(DType::F32))),
                    (None, _) => Err(ShapeInferenceError::MissingInitialShape(name.clone())),
                }
            }

            NodeType::Literal(value) => match value {
                Value::Tensor(arr) => Ok((arr.shape().to_vec(), DType::F32)),
                Value::ScalarF32(_) => Ok((vec![], DType::F32)),
            },

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::Power(l, r)
            | NodeType::GreaterThan(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                let out = broadcast_shapes(&ls, &rs).ok_or(ShapeInferenceError::BroadcastError(ls, rs))?;
                Ok((out, ld))
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                if ls.len() != 2 || rs.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: if ls.len() != 2 { ls.len() } else { rs.len() },
                    });
                }
                if ls[1] != rs[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }
                Ok((vec![ls[0], rs[1]], ld))
            }

            // Element-wise operations - shape unchanged
            NodeType::Negate(id)
            | NodeType::Sqrt(id)
            | NodeType::ReLU(id)
            | NodeType::Sin(id)
            | NodeType::Cos(id) => Self::get_shape_dtype(asg, *id),

            NodeType::Sum(_) => Ok((vec![], DType::F32)),

            NodeType::SumAxes(id, axes) | NodeType::MeanAxes(id, axes) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                for &axis in axes {
                    if axis >= shape.len() {
                        return Err(ShapeInferenceError::InvalidRank {
                            node_id: node.id,
                            expected: axis + 1,
                            actual: shape.len(),
                        });
                    }
                    shape[axis] = 1;
                }
                Ok((shape, dtype))
            }

            NodeType::Reshape(data_id, shape_id) => {
                let (data_shape, dtype) = Self::get_shape_dtype(asg, *data_id)?;
                let shape_node = asg.get_node(*shape_id)?;
                if let NodeType::Literal(Value::Tensor(shape_tensor)) = &shape_node.node_type {
                    let new_shape: Shape = shape_tensor.iter().map(|&x| x as usize).collect();
                    Self::check_same_numel(node.id, "Reshape", &data_shape, &new_shape)?;
                    Ok((new_shape, dtype))
                } else {
                    Err(ShapeInferenceError::NotALiteral(*shape_id))
                }
            }

            NodeType::ReshapeLike(data_id, like_id) => {
                let (data_shape, dtype) = Self::get_shape_dtype(asg, *data_id)?;
                let (like_shape, _) = Self::get_shape_dtype(asg, *like_id)?;
                Self::check_same_numel(node.id, "ReshapeLike", &data_shape, &like_shape)?;
                Ok((like_shape, dtype))
            }

            NodeType::Unsqueeze(id, axis) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis > shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: *axis,
                        actual: shape.len(),
                    });
                }
                shape.insert(*axis, 1);
                Ok((shape, dtype))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Broadcast(source_id, target_id) | NodeType::ReduceSumTo(source_id, target_id) => {
                let (_, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                Ok((target_shape, dtype))
            }

            NodeType::Concat { inputs, axis } => {
                let first = inputs.first().ok_or_else(|| ShapeInferenceError::InvalidOperand {
                    node_id: node.id,
                    op: "Concat".to_string(),
                    reason: "no inputs".to_string(),
                })?;
                let (mut out, dtype) = Self::get_shape_dtype(asg, *first)?;
                if *axis >= out.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis + 1,
                        actual: out.len(),
                    });
                }
                for other in &inputs[1..] {
                    let (shape, _) = Self::get_shape_dtype(asg, *other)?;
                    let compatible = shape.len() == out.len()
                        && shape.iter().zip(out.iter()).enumerate().all(|(i, (a, b))| i == *axis || a == b);
                    if !compatible {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Concat".to_string(),
                            shape1: out,
                            shape2: shape,
                        });
                    }
                    out[*axis] += shape[*axis];
                }
                Ok((out, dtype))
            }

            NodeType::Slice { input, axis, start, end } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if *axis >= shape.len() || start > end || *end > shape[*axis] {
                    return Err(ShapeInferenceError::InvalidOperand {
                        node_id: node.id,
                        op: "Slice".to_string(),
                        reason: format!("range {}..{} on axis {} of {:?}", start, end, axis, shape),
                    });
                }
                shape[*axis] = end - start;
                Ok((shape, dtype))
            }

            NodeType::Pad2d { input, pads } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                let rank = shape.len();
                if rank < 2 {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 2, actual: rank });
                }
                let (left, right, top, bottom) = *pads;
                let h = shape[rank - 2] as isize + top + bottom;
                let w = shape[rank - 1] as isize + left + right;
                if h <= 0 || w <= 0 {
                    return Err(ShapeInferenceError::InvalidOperand {
                        node_id: node.id,
                        op: "Pad2d".to_string(),
                        reason: format!("padding {:?} leaves no elements of {:?}", pads, shape),
                    });
                }
                shape[rank - 2] = h as usize;
                shape[rank - 1] = w as usize;
                Ok((shape, dtype))
            }

            NodeType::PadToMatch { input, reference } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                let (ref_shape, _) = Self::get_shape_dtype(asg, *reference)?;
                let (rank, ref_rank) = (shape.len(), ref_shape.len());
                if rank < 2 || ref_rank < 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: rank.min(ref_rank),
                    });
                }
                shape[rank - 2] = ref_shape[ref_rank - 2];
                shape[rank - 1] = ref_shape[ref_rank - 1];
                Ok((shape, dtype))
            }

            // Conv2d: [N, C_in, H, W] -> [N, C_out, H_out, W_out]
            NodeType::Conv2d { input, weight, bias, stride, padding, dilation, groups } => {
                let (input_shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                let (weight_shape, _) = Self::get_shape_dtype(asg, *weight)?;
                Self::expect_rank(node.id, &input_shape, 4)?;
                Self::expect_rank(node.id, &weight_shape, 4)?;

                if input_shape[1] != weight_shape[1] * groups {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Conv2d".to_string(),
                        shape1: input_shape,
                        shape2: weight_shape,
                    });
                }
                if let Some(b) = bias {
                    let (bias_shape, _) = Self::get_shape_dtype(asg, *b)?;
                    if bias_shape != vec![weight_shape[0]] {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Conv2d bias".to_string(),
                            shape1: weight_shape,
                            shape2: bias_shape,
                        });
                    }
                }

                Self::check_conv_window(node.id, "Conv2d", &input_shape, &weight_shape, *stride)?;
                let eff_kh = (weight_shape[2] - 1) * dilation.0 + 1;
                let eff_kw = (weight_shape[3] - 1) * dilation.1 + 1;
                let (h, w) = (input_shape[2] + 2 * padding.0, input_shape[3] + 2 * padding.1);
                if h < eff_kh || w < eff_kw {
                    return Err(ShapeInferenceError::InvalidOperand {
                        node_id: node.id,
                        op: "Conv2d".to_string(),
                        reason: format!("kernel {}x{} larger than padded input {}x{}", eff_kh, eff_kw, h, w),
                    });
                }
                let out_h = (h - eff_kh) / stride.0 + 1;
                let out_w = (w - eff_kw) / stride.1 + 1;
                Ok((vec![input_shape[0], weight_shape[0], out_h, out_w], dtype))
            }

            // ConvTranspose2d: [N, C_in, H, W] -> [N, C_out, H_out, W_out]
            NodeType::ConvTranspose2d { input, weight, stride, padding, output_padding, dilation, groups, .. } => {
                let (input_shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                let (weight_shape, _) = Self::get_shape_dtype(asg, *weight)?;
                Self::expect_rank(node.id, &input_shape, 4)?;
                Self::expect_rank(node.id, &weight_shape, 4)?;

                if input_shape[1] != weight_shape[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "ConvTranspose2d".to_string(),
                        shape1: input_shape,
                        shape2: weight_shape,
                    });
                }

                Self::check_conv_window(node.id, "ConvTranspose2d", &input_shape, &weight_shape, *stride)?;
                let out_channels = weight_shape[1] * groups;
                let span_h = (input_shape[2] - 1) * stride.0 + dilation.0 * (weight_shape[2] - 1) + output_padding.0 + 1;
                let span_w = (input_shape[3] - 1) * stride.1 + dilation.1 * (weight_shape[3] - 1) + output_padding.1 + 1;
                if span_h <= 2 * padding.0 || span_w <= 2 * padding.1 {
                    return Err(ShapeInferenceError::InvalidOperand {
                        node_id: node.id,
                        op: "ConvTranspose2d".to_string(),
                        reason: format!("padding {:?} removes the whole output", padding),
                    });
                }
                Ok((vec![input_shape[0], out_channels, span_h - 2 * padding.0, span_w - 2 * padding.1], dtype))
            }

            NodeType::Conv2dBackwardInput { input_shape, grad_output, .. } => {
                let (_, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                let (n, c, h, w) = *input_shape;
                Ok((vec![n, c, h, w], dtype))
            }

            NodeType::Conv2dBackwardWeight { weight_shape, grad_output, .. } => {
                let (_, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                let (c_out, c_in, kh, kw) = *weight_shape;
                Ok((vec![c_out, c_in, kh, kw], dtype))
            }

            NodeType::MaxPool2d { input, kernel_size, stride } => {
                Self::pooled_shape(asg, node.id, "MaxPool2d", *input, *kernel_size, *stride, (0, 0))
            }

            NodeType::AvgPool2d { input, kernel_size, stride, padding } => {
                Self::pooled_shape(asg, node.id, "AvgPool2d", *input, *kernel_size, *stride, *padding)
            }

            // Unpooling output shape always matches the original pooling input.
            NodeType::MaxUnpool2d { original_input, .. } | NodeType::AvgUnpool2d { original_input, .. } => {
                Self::get_shape_dtype(asg, *original_input)
            }

            NodeType::UpsampleBilinear2d { input, scale_factor, .. } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                Self::expect_rank(node.id, &shape, 4)?;
                Ok((vec![shape[0], shape[1], shape[2] * scale_factor, shape[3] * scale_factor], dtype))
            }

            NodeType::UpsampleBilinear2dBackward { grad_output, input_size, .. } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                Self::expect_rank(node.id, &shape, 4)?;
                Ok((vec![shape[0], shape[1], input_size.0, input_size.1], dtype))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn pooled_shape(
        asg: &Asg,
        node_id: NodeId,
        op: &str,
        input: NodeId,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Result<(Shape, DType)> {
        let (shape, dtype) = Self::get_shape_dtype(asg, input)?;
        Self::expect_rank(node_id, &shape, 4)?;
        let (h, w) = (shape[2] + 2 * padding.0, shape[3] + 2 * padding.1);
        if h < kernel_size.0 || w < kernel_size.1 {
            return Err(ShapeInferenceError::InvalidOperand {
                node_id,
                op: op.to_string(),
                reason: format!("window {:?} larger than input {}x{}", kernel_size, h, w),
            });
        }
        let out_h = (h - kernel_size.0) / stride.0 + 1;
        let out_w = (w - kernel_size.1) / stride.1 + 1;
        Ok((vec![shape[0], shape[1], out_h, out_w], dtype))
    }

    fn expect_rank(node_id: NodeId, shape: &[usize], expected: usize) -> Result<()> {
        if shape.len() != expected {
            return Err(ShapeInferenceError::InvalidRank { node_id, expected, actual: shape.len() });
        }
        Ok(())
    }

    /// Spatial dims, kernel and stride of a convolution must all be non-zero.
    fn check_conv_window(
        node_id: NodeId,
        op: &str,
        input: &[usize],
        weight: &[usize],
        stride: (usize, usize),
    ) -> Result<()> {
        if input[2] == 0 || input[3] == 0 || weight[2] == 0 || weight[3] == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(ShapeInferenceError::InvalidOperand {
                node_id,
                op: op.to_string(),
                reason: format!(
                    "empty window: input {:?}, kernel {:?}, stride {:?}",
                    &input[2..],
                    &weight[2..],
                    stride
                ),
            });
        }
        Ok(())
    }

    fn check_same_numel(node_id: NodeId, op: &str, from: &[usize], to: &[usize]) -> Result<()> {
        if from.iter().product::<usize>() != to.iter().product::<usize>() {
            return Err(ShapeInferenceError::InvalidOperand {
                node_id,
                op: op.to_string(),
                reason: format!("cannot reshape {:?} into {:?}", from, to),
            });
        }
        Ok(())
    }

    /// Helper function to get already computed shape and type for a node.
    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    /// Performs topological sort of the nodes reachable from the outputs.
    /// Returns node IDs in an order suitable for computation.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        for output_id in &asg.outputs {
            Self::build_sorted_graph(*output_id, asg, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }

        let node = asg.get_node(node_id)?;
        for input_id in node.node_type.operands() {
            Self::build_sorted_graph(input_id, asg, visited, sorted)?;
        }

        if visited.insert(node_id) {
            sorted.push(node_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, ParamInit, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn infer(ctx: &Rc<RefCell<GraphContext>>, out: &Tensor, x_shape: &[usize]) -> Result<Shape> {
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let shapes = HashMap::from([("x".to_string(), (x_shape.to_vec(), DType::F32))]);
        ShapeInference::run(&mut graph, &shapes)?;
        Ok(graph.get_node(out.node_id)?.shape.clone().unwrap_or_default())
    }

    #[test]
    fn broadcasting_follows_numpy_rules() {
        assert_eq!(broadcast_shapes(&[2, 3, 4, 4], &[2, 3, 1, 1]), Some(vec![2, 3, 4, 4]));
        assert_eq!(broadcast_shapes(&[5, 4], &[4]), Some(vec![5, 4]));
        assert_eq!(broadcast_shapes(&[], &[2, 2]), Some(vec![2, 2]));
        assert_eq!(broadcast_shapes(&[3], &[4]), None);
    }

    #[test]
    fn conv_channel_mismatch_is_reported() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", &[8, 4, 3, 3], ParamInit::Zeros);
        let y = x.conv2d(&w, None, (1, 1), (1, 1), (1, 1), 1);
        let err = infer(&ctx, &y, &[1, 3, 8, 8]).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::IncompatibleShapes { .. }));
    }

    #[test]
    fn negative_padding_crops() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = x.pad2d((-1, 0, -1, 0));
        assert_eq!(infer(&ctx, &y, &[1, 2, 32, 32]).unwrap(), vec![1, 2, 31, 31]);
    }

    #[test]
    fn concat_sums_the_axis() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = Tensor::concat(&[&x, &x.relu()], 1);
        assert_eq!(infer(&ctx, &y, &[2, 3, 5, 5]).unwrap(), vec![2, 6, 5, 5]);
    }

    #[test]
    fn pooling_window_larger_than_input_fails() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = x.max_pool2d((2, 2), (2, 2));
        assert!(infer(&ctx, &y, &[1, 1, 1, 4]).is_err());
        assert_eq!(infer(&ctx, &y, &[1, 1, 7, 4]).unwrap(), vec![1, 1, 3, 2]);
    }

    #[test]
    fn empty_conv_windows_are_reported() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", &[4, 2, 3, 3], ParamInit::Zeros);
        let empty_kernel = Tensor::new_parameter(&ctx, "empty", &[2, 2, 0, 3], ParamInit::Zeros);
        let conv = x.conv2d(&w, None, (1, 1), (1, 1), (1, 1), 1);
        let up = x.conv_transpose2d(&empty_kernel, None, (2, 2), (0, 0), (0, 0), (1, 1), 1);

        let invalid = |r: Result<Shape>| matches!(r, Err(ShapeInferenceError::InvalidOperand { .. }));
        assert!(invalid(infer(&ctx, &conv, &[1, 2, 0, 5])));
        assert!(invalid(infer(&ctx, &up, &[1, 2, 4, 4])));
        assert_eq!(infer(&ctx, &conv, &[1, 2, 4, 5]).unwrap(), vec![1, 4, 4, 5]);
    }
}
