//! Автоград: построение графа градиентов d(loss)/d(node).
//!
//! Алгоритм:
//!  - обходим прямой граф в обратном топологическом порядке;
//!  - для узлов, где есть dL/dY, считаем вклады в операнды и аккумулируем (суммируем);
//!  - строим отдельный граф `grad` (ASG), его выходы суть градиенты по `wrt`.
//!
//! Значения прямого прохода читаются через узлы `External` с именами
//! `external_{asg}_{node}`. Такой узел несёт форму исходного узла, поэтому
//! shape inference для градиентного графа не требует дополнительных данных.
//! Бродкаст снимается через `ReduceSumTo`.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{centered_pads, Asg, AsgError, DType, NodeId, NodeType, Shape, Value};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("Node {0} has no inferred shape; run shape inference on the forward graph first")]
    MissingShape(NodeId),
    #[error("No gradient rule for '{0}'")]
    Unsupported(&'static str),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Builder of the gradient graph for one forward graph.
///
/// ```ignore
/// let grad_graph = Gradients::new(forward.clone()).build(loss.node_id, &[w.node_id])?;
/// ```
pub struct Gradients {
    /// Прямой граф (формы уже выведены).
    src: Asg,
    /// Граф градиентов.
    grad: Asg,
    /// Исходный узел -> узел градиента (в `grad`).
    gmap: HashMap<NodeId, NodeId>,
    /// Исходный узел -> его `External`-образ в `grad`.
    images: HashMap<NodeId, NodeId>,
}

impl Gradients {
    pub fn new(src: Asg) -> Self {
        let grad = Asg::new(src.id + 1, Some("grad".to_string()));
        Self { src, grad, gmap: HashMap::new(), images: HashMap::new() }
    }

    /// Строит граф градиентов `loss` по каждому узлу из `wrt`.
    ///
    /// У результата по одному выходу на каждый элемент `wrt`, в том же
    /// порядке. Узлы, от которых `loss` не зависит, получают нулевой градиент.
    pub fn build(mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        let order = ShapeInference::topological_sort(&Asg {
            outputs: vec![loss_id],
            ..self.src.clone()
        })?;

        let loss_shape = self.shape_of(loss_id)?;
        let seed = self.literal(ArrayD::ones(IxDyn(&loss_shape)));
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let g_out = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => continue,
            };
            let node_type = self.src.get_node(id)?.node_type.clone();
            self.backward(&node_type, g_out)?;
        }

        let mut outputs = Vec::with_capacity(wrt.len());
        for &target in wrt {
            let g = match self.gmap.get(&target).copied() {
                Some(g) => g,
                None => {
                    let shape = self.shape_of(target)?;
                    self.literal(ArrayD::zeros(IxDyn(&shape)))
                }
            };
            outputs.push(g);
        }

        // Градиенты входов и параметров получают имена `grad_{имя}`.
        for (&target, &g) in wrt.iter().zip(outputs.iter()) {
            if let NodeType::Input { name } | NodeType::Parameter { name } = &self.src.get_node(target)?.node_type {
                let name = format!("grad_{}", name);
                self.grad.get_node_mut(g)?.name = Some(name);
            }
        }

        self.grad.set_outputs(outputs);
        debug!(forward_nodes = order.len(), grad_nodes = self.grad.nodes.len(), "built gradient graph");
        Ok(self.grad)
    }

    /// Вклады одного узла в градиенты его операндов.
    fn backward(&mut self, node_type: &NodeType, g_out: NodeId) -> AutogradResult<()> {
        match node_type {
            // Листья
            NodeType::Input { .. } | NodeType::Parameter { .. } | NodeType::Literal(_) | NodeType::External { .. } => {}

            // -------- БИНАРНЫЕ --------
            NodeType::Add(a, b) => {
                self.acc_reduced(*a, g_out)?;
                self.acc_reduced(*b, g_out)?;
            }
            NodeType::Subtract(a, b) => {
                self.acc_reduced(*a, g_out)?;
                let neg = self.add_node(NodeType::Negate(g_out));
                self.acc_reduced(*b, neg)?;
            }
            NodeType::Multiply(a, b) => {
                let a_im = self.reuse(*a)?;
                let b_im = self.reuse(*b)?;
                let g_a = self.add_node(NodeType::Multiply(g_out, b_im));
                let g_b = self.add_node(NodeType::Multiply(g_out, a_im));
                self.acc_reduced(*a, g_a)?;
                self.acc_reduced(*b, g_b)?;
            }
            NodeType::Divide(a, b) => {
                let a_im = self.reuse(*a)?;
                let b_im = self.reuse(*b)?;
                // g_a = g / b
                let g_a = self.add_node(NodeType::Divide(g_out, b_im));
                // g_b = -g * a / b^2
                let b2 = self.add_node(NodeType::Multiply(b_im, b_im));
                let num = self.add_node(NodeType::Multiply(g_out, a_im));
                let quot = self.add_node(NodeType::Divide(num, b2));
                let g_b = self.add_node(NodeType::Negate(quot));
                self.acc_reduced(*a, g_a)?;
                self.acc_reduced(*b, g_b)?;
            }
            NodeType::Power(a, b) => {
                // Показатель считается константой: g_a = g * b * a^(b-1).
                let a_im = self.reuse(*a)?;
                let b_im = self.reuse(*b)?;
                let one = self.scalar(1.0);
                let b_minus_one = self.add_node(NodeType::Subtract(b_im, one));
                let a_pow = self.add_node(NodeType::Power(a_im, b_minus_one));
                let term = self.add_node(NodeType::Multiply(b_im, a_pow));
                let g_a = self.add_node(NodeType::Multiply(g_out, term));
                self.acc_reduced(*a, g_a)?;
            }
            NodeType::MatrixMultiply(a, b) => {
                // g_a = g @ b^T
                let b_im = self.reuse(*b)?;
                let bt = self.add_node(NodeType::Transpose(b_im, 0, 1));
                let g_a = self.add_node(NodeType::MatrixMultiply(g_out, bt));
                // g_b = a^T @ g
                let a_im = self.reuse(*a)?;
                let at = self.add_node(NodeType::Transpose(a_im, 0, 1));
                let g_b = self.add_node(NodeType::MatrixMultiply(at, g_out));
                self.acc(*a, g_a);
                self.acc(*b, g_b);
            }

            // Сравнение: производная равна нулю.
            NodeType::GreaterThan(_, _) => {}

            // -------- УНАРНЫЕ --------
            NodeType::Negate(x) => {
                let g_x = self.add_node(NodeType::Negate(g_out));
                self.acc(*x, g_x);
            }
            NodeType::Sqrt(x) => {
                let two = self.scalar(2.0);
                let x_im = self.reuse(*x)?;
                let sqrt_x = self.add_node(NodeType::Sqrt(x_im));
                let denom = self.add_node(NodeType::Multiply(two, sqrt_x));
                let g_x = self.add_node(NodeType::Divide(g_out, denom));
                self.acc(*x, g_x);
            }
            NodeType::ReLU(x) => {
                let zero = self.scalar(0.0);
                let x_im = self.reuse(*x)?;
                let mask = self.add_node(NodeType::GreaterThan(x_im, zero));
                let g_x = self.add_node(NodeType::Multiply(g_out, mask));
                self.acc(*x, g_x);
            }
            NodeType::Sin(x) => {
                let x_im = self.reuse(*x)?;
                let cos_x = self.add_node(NodeType::Cos(x_im));
                let g_x = self.add_node(NodeType::Multiply(g_out, cos_x));
                self.acc(*x, g_x);
            }
            NodeType::Cos(x) => {
                let x_im = self.reuse(*x)?;
                let sin_x = self.add_node(NodeType::Sin(x_im));
                let prod = self.add_node(NodeType::Multiply(g_out, sin_x));
                let g_x = self.add_node(NodeType::Negate(prod));
                self.acc(*x, g_x);
            }

            // -------- РЕДУКЦИИ --------
            NodeType::Sum(x) | NodeType::SumAxes(x, _) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(g_out, x_im));
                self.acc(*x, g_x);
            }
            NodeType::MeanAxes(x, axes) => {
                let shape = self.shape_of(*x)?;
                let count: usize = axes.iter().map(|&a| shape.get(a).copied().unwrap_or(1)).product();
                let inv_n = self.scalar(1.0 / count.max(1) as f32);
                let scaled = self.add_node(NodeType::Multiply(g_out, inv_n));
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(scaled, x_im));
                self.acc(*x, g_x);
            }

            // -------- ТРАНСФОРМАЦИИ --------
            NodeType::Reshape(x, _) | NodeType::ReshapeLike(x, _) | NodeType::Unsqueeze(x, _) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::ReshapeLike(g_out, x_im));
                self.acc(*x, g_x);
            }
            NodeType::Transpose(x, a1, a2) => {
                let g_x = self.add_node(NodeType::Transpose(g_out, *a2, *a1));
                self.acc(*x, g_x);
            }
            NodeType::Broadcast(x, _) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::ReduceSumTo(g_out, x_im));
                self.acc(*x, g_x);
            }
            NodeType::ReduceSumTo(x, _) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(g_out, x_im));
                self.acc(*x, g_x);
            }
            NodeType::Concat { inputs, axis } => {
                let mut offset = 0;
                for &input in inputs {
                    let len = self.shape_of(input)?.get(*axis).copied().ok_or(AsgError::InvalidShape(input))?;
                    let g_x = self.add_node(NodeType::Slice { input: g_out, axis: *axis, start: offset, end: offset + len });
                    self.acc(input, g_x);
                    offset += len;
                }
            }
            NodeType::Slice { input, axis, start, end } => {
                // Градиент среза: нули до и после выбранного окна.
                let shape = self.shape_of(*input)?;
                let total = shape.get(*axis).copied().ok_or(AsgError::InvalidShape(*input))?;
                let mut parts = Vec::with_capacity(3);
                if *start > 0 {
                    let mut before = shape.clone();
                    before[*axis] = *start;
                    parts.push(self.literal(ArrayD::zeros(IxDyn(&before))));
                }
                parts.push(g_out);
                if *end < total {
                    let mut after = shape.clone();
                    after[*axis] = total - end;
                    parts.push(self.literal(ArrayD::zeros(IxDyn(&after))));
                }
                let g_x = if parts.len() == 1 {
                    g_out
                } else {
                    self.add_node(NodeType::Concat { inputs: parts, axis: *axis })
                };
                self.acc(*input, g_x);
            }
            NodeType::Pad2d { input, pads } => {
                // Обратная операция: обрезать добавленное, дополнить нулями срезанное.
                let (l, r, t, b) = *pads;
                let g_x = self.add_node(NodeType::Pad2d { input: g_out, pads: (-l, -r, -t, -b) });
                self.acc(*input, g_x);
            }

            NodeType::PadToMatch { input, reference } => {
                let (from, to) = (self.shape_of(*input)?, self.shape_of(*reference)?);
                let hw = |s: &Shape| (s[s.len().saturating_sub(2)], s[s.len().saturating_sub(1)]);
                let (l, r, t, b) = centered_pads(hw(&from), hw(&to));
                let g_x = self.add_node(NodeType::Pad2d { input: g_out, pads: (-l, -r, -t, -b) });
                self.acc(*input, g_x);
            }

            // -------- СВЁРТКИ --------
            NodeType::Conv2d { input, weight, bias, stride, padding, dilation, groups } => {
                let input_shape = self.shape4_of(*input)?;
                let weight_shape = self.shape4_of(*weight)?;
                let w_im = self.reuse(*weight)?;
                let x_im = self.reuse(*input)?;
                let g_x = self.add_node(NodeType::Conv2dBackwardInput {
                    grad_output: g_out,
                    weight: w_im,
                    input_shape,
                    stride: *stride,
                    padding: *padding,
                    dilation: *dilation,
                    groups: *groups,
                });
                let g_w = self.add_node(NodeType::Conv2dBackwardWeight {
                    grad_output: g_out,
                    input: x_im,
                    weight_shape,
                    stride: *stride,
                    padding: *padding,
                    dilation: *dilation,
                    groups: *groups,
                });
                self.acc(*input, g_x);
                self.acc(*weight, g_w);
                if let Some(b) = bias {
                    self.acc_bias(*b, g_out)?;
                }
            }
            NodeType::ConvTranspose2d { input, weight, bias, stride, padding, dilation, groups, .. } => {
                // Транспонированная свёртка сопряжена обычной с тем же весом.
                let weight_shape = self.shape4_of(*weight)?;
                let w_im = self.reuse(*weight)?;
                let x_im = self.reuse(*input)?;
                let g_x = self.add_node(NodeType::Conv2d {
                    input: g_out,
                    weight: w_im,
                    bias: None,
                    stride: *stride,
                    padding: *padding,
                    dilation: *dilation,
                    groups: *groups,
                });
                let g_w = self.add_node(NodeType::Conv2dBackwardWeight {
                    grad_output: x_im,
                    input: g_out,
                    weight_shape,
                    stride: *stride,
                    padding: *padding,
                    dilation: *dilation,
                    groups: *groups,
                });
                self.acc(*input, g_x);
                self.acc(*weight, g_w);
                if let Some(b) = bias {
                    self.acc_bias(*b, g_out)?;
                }
            }

            // -------- ПУЛИНГ И РЕСЕМПЛИНГ --------
            NodeType::MaxPool2d { input, kernel_size, stride } => {
                let x_im = self.reuse(*input)?;
                let g_x = self.add_node(NodeType::MaxUnpool2d {
                    input: g_out,
                    original_input: x_im,
                    kernel_size: *kernel_size,
                    stride: *stride,
                });
                self.acc(*input, g_x);
            }
            NodeType::AvgPool2d { input, kernel_size, stride, padding } => {
                let x_im = self.reuse(*input)?;
                let g_x = self.add_node(NodeType::AvgUnpool2d {
                    input: g_out,
                    original_input: x_im,
                    kernel_size: *kernel_size,
                    stride: *stride,
                    padding: *padding,
                });
                self.acc(*input, g_x);
            }
            NodeType::UpsampleBilinear2d { input, align_corners, .. } => {
                let (_, _, h, w) = self.shape4_of(*input)?;
                let g_x = self.add_node(NodeType::UpsampleBilinear2dBackward {
                    grad_output: g_out,
                    input_size: (h, w),
                    align_corners: *align_corners,
                });
                self.acc(*input, g_x);
            }

            // Узлы обратного прохода: производные второго порядка не строим.
            NodeType::Conv2dBackwardInput { .. }
            | NodeType::Conv2dBackwardWeight { .. }
            | NodeType::MaxUnpool2d { .. }
            | NodeType::AvgUnpool2d { .. }
            | NodeType::UpsampleBilinear2dBackward { .. } => {
                return Err(AutogradError::Unsupported(node_type.op_name()));
            }
        }
        Ok(())
    }

    /// Добавить новый узел в grad-граф.
    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn scalar(&mut self, v: f32) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::ScalarF32(v)))
    }

    fn literal(&mut self, data: ArrayD<f32>) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::Tensor(data)))
    }

    /// «Образ» исходного узла в grad-графе: `External`, читающий значение
    /// прямого прохода. Создаётся один раз на исходный узел.
    fn reuse(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&existing) = self.images.get(&src_id) {
            return Ok(existing);
        }

        let shape = self.shape_of(src_id)?;
        let dtype = self.src.get_node(src_id)?.dtype.unwrap_or(DType::F32);
        let name = format!("external_{}_{}", self.src.id, src_id);
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External { name, source_asg_id: self.src.id, source_node_id: src_id },
        );
        let node = self.grad.get_node_mut(id)?;
        node.shape = Some(shape);
        node.dtype = Some(dtype);
        self.images.insert(src_id, id);
        Ok(id)
    }

    /// Аккумуляция: dL/d(target) += contrib.
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        let total = match self.gmap.get(&target).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contrib)),
            None => contrib,
        };
        self.gmap.insert(target, total);
    }

    /// Привести градиент к форме источника (ReduceSumTo по осям бродкаста)
    /// и аккумулировать.
    fn acc_reduced(&mut self, target: NodeId, g: NodeId) -> AutogradResult<()> {
        let target_im = self.reuse(target)?;
        let reduced = self.add_node(NodeType::ReduceSumTo(g, target_im));
        self.acc(target, reduced);
        Ok(())
    }

    /// Градиент смещения свёртки: сумма по N, H, W.
    fn acc_bias(&mut self, bias: NodeId, g_out: NodeId) -> AutogradResult<()> {
        let summed = self.add_node(NodeType::SumAxes(g_out, vec![0, 2, 3]));
        let b_im = self.reuse(bias)?;
        let g_b = self.add_node(NodeType::ReshapeLike(summed, b_im));
        self.acc(bias, g_b);
        Ok(())
    }

    fn shape_of(&self, src_id: NodeId) -> AutogradResult<Shape> {
        self.src.get_node(src_id)?.shape.clone().ok_or(AutogradError::MissingShape(src_id))
    }

    fn shape4_of(&self, src_id: NodeId) -> AutogradResult<(usize, usize, usize, usize)> {
        match self.shape_of(src_id)?.as_slice() {
            &[n, c, h, w] => Ok((n, c, h, w)),
            _ => Err(AutogradError::Asg(AsgError::InvalidShape(src_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, ParamInit, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn forward_with_shapes(ctx: &Rc<RefCell<GraphContext>>, out: &Tensor, x_shape: &[usize]) -> Asg {
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let shapes = HashMap::from([("x".to_string(), (x_shape.to_vec(), DType::F32))]);
        ShapeInference::run(&mut graph, &shapes).unwrap();
        graph
    }

    #[test]
    fn one_output_per_wrt_with_matching_shape() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w", &[2, 3, 3, 3], ParamInit::Ones);
        let loss = x.conv2d(&w, None, (1, 1), (1, 1), (1, 1), 1).relu().sum();
        let forward = forward_with_shapes(&ctx, &loss, &[1, 3, 5, 5]);

        let mut grad = Gradients::new(forward.clone()).build(loss.node_id, &[w.node_id, x.node_id]).unwrap();
        assert_eq!(grad.outputs.len(), 2);

        let mut shapes = HashMap::new();
        for node in forward.nodes.values() {
            if let Some(shape) = &node.shape {
                shapes.insert(format!("external_{}_{}", forward.id, node.id), (shape.clone(), DType::F32));
            }
        }
        ShapeInference::run(&mut grad, &shapes).unwrap();
        assert_eq!(grad.get_node(grad.outputs[0]).unwrap().shape, Some(vec![2, 3, 3, 3]));
        assert_eq!(grad.get_node(grad.outputs[1]).unwrap().shape, Some(vec![1, 3, 5, 5]));
        assert_eq!(grad.get_node(grad.outputs[0]).unwrap().name.as_deref(), Some("grad_w"));
    }

    #[test]
    fn unreached_parameter_gets_zero_gradient() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let unused = Tensor::new_parameter(&ctx, "unused", &[4], ParamInit::Zeros);
        let loss = x.sin().sum();
        let forward = forward_with_shapes(&ctx, &loss, &[4]);

        let grad = Gradients::new(forward).build(loss.node_id, &[unused.node_id]).unwrap();
        match &grad.get_node(grad.outputs[0]).unwrap().node_type {
            NodeType::Literal(Value::Tensor(t)) => assert!(t.iter().all(|&v| v == 0.0) && t.len() == 4),
            other => panic!("expected a zero literal, got {:?}", other),
        }
    }

    #[test]
    fn forward_values_are_shared_externals() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let loss = (&x * &x).sum();
        let forward = forward_with_shapes(&ctx, &loss, &[3]);

        let grad = Gradients::new(forward).build(loss.node_id, &[x.node_id]).unwrap();
        let images_of_x: Vec<_> = grad
            .nodes
            .values()
            .filter(|n| matches!(n.node_type, NodeType::External { source_node_id, .. } if source_node_id == x.node_id))
            .collect();
        assert_eq!(images_of_x.len(), 1);
        assert_eq!(images_of_x[0].name.as_deref(), Some(format!("external_0_{}", x.node_id).as_str()));
    }

    #[test]
    fn missing_forward_shapes_are_reported() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let loss = x.relu().sum();
        let forward = ctx.borrow().main_graph().clone();
        let err = Gradients::new(forward).build(loss.node_id, &[x.node_id]).unwrap_err();
        assert!(matches!(err, AutogradError::MissingShape(_)));
    }
}
