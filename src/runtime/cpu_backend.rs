//! CPU backend for executing an ASG.
//!
//! Walks the graph in topological order and evaluates each node with
//! `ndarray`. Image kernels work on `[N, C, H, W]` views.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, ShapeInference};
use crate::asg::{centered_pads, Asg, NodeId, NodeType, Pad2d, Value};
use ndarray::{
    arr0, concatenate, Array4, ArrayD, ArrayView4, ArrayViewD, Axis, Ix2, Ix4, IxDyn, Slice, Zip,
};
use std::collections::HashMap;
use tracing::debug;

type Result<T> = std::result::Result<T, RuntimeError>;

/// Execution state for one graph, possibly reading values of linked graphs
/// from the memo.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    /// Global cache of computed values, keyed by `(AsgId, NodeId)`.
    memo: Memo<Value>,
}

impl<'a> ExecutionContext<'a> {
    fn new(asg: &'a Asg, initial_memo: Memo<Value>) -> Self {
        let memo = initial_memo
            .into_iter()
            .map(|(key, value)| (key, normalize(value)))
            .collect();
        Self { asg, memo }
    }

    /// Value of a node of this graph, following `External` links.
    fn lookup(&self, node_id: NodeId) -> Result<&ArrayD<f32>> {
        let key = match self.memo.get(&(self.asg.id, node_id)) {
            Some(value) => return as_array(value),
            None => match self.asg.nodes.get(&node_id).map(|n| &n.node_type) {
                Some(NodeType::External { source_asg_id, source_node_id, .. }) => (*source_asg_id, *source_node_id),
                _ => (self.asg.id, node_id),
            },
        };
        self.memo
            .get(&key)
            .ok_or(RuntimeError::NodeNotFound(key.1, key.0))
            .and_then(as_array)
    }

    fn evaluate_node(&mut self, node_id: NodeId) -> Result<()> {
        if self.memo.contains_key(&(self.asg.id, node_id)) {
            return Ok(());
        }
        let node = self
            .asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, self.asg.id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => return Err(RuntimeError::MissingInput(name.clone(), node.id)),
            NodeType::Parameter { name } => return Err(RuntimeError::MissingParameter(name.clone(), node.id)),
            NodeType::Literal(value) => as_array(&normalize(value.clone()))?.clone(),
            NodeType::External { .. } => {
                // Resolved lazily through `lookup`; only check that it exists.
                self.lookup(node_id)?;
                return Ok(());
            }

            NodeType::Add(l, r) => zip_broadcast(self.lookup(*l)?, self.lookup(*r)?, |a, b| a + b)?,
            NodeType::Subtract(l, r) => zip_broadcast(self.lookup(*l)?, self.lookup(*r)?, |a, b| a - b)?,
            NodeType::Multiply(l, r) => zip_broadcast(self.lookup(*l)?, self.lookup(*r)?, |a, b| a * b)?,
            NodeType::Divide(l, r) => zip_broadcast(self.lookup(*l)?, self.lookup(*r)?, |a, b| a / b)?,
            NodeType::Power(l, r) => zip_broadcast(self.lookup(*l)?, self.lookup(*r)?, f32::powf)?,
            NodeType::GreaterThan(l, r) => {
                zip_broadcast(self.lookup(*l)?, self.lookup(*r)?, |a, b| if a > b { 1.0 } else { 0.0 })?
            }
            NodeType::MatrixMultiply(l, r) => op_matmul(self.lookup(*l)?, self.lookup(*r)?)?,

            NodeType::Negate(x) => self.lookup(*x)?.mapv(|v| -v),
            NodeType::Sqrt(x) => self.lookup(*x)?.mapv(f32::sqrt),
            NodeType::ReLU(x) => self.lookup(*x)?.mapv(|v| v.max(0.0)),
            NodeType::Sin(x) => self.lookup(*x)?.mapv(f32::sin),
            NodeType::Cos(x) => self.lookup(*x)?.mapv(f32::cos),

            NodeType::Sum(x) => arr0(self.lookup(*x)?.sum()).into_dyn(),
            NodeType::SumAxes(x, axes) => op_sum_axes(self.lookup(*x)?, axes)?,
            NodeType::MeanAxes(x, axes) => {
                let source = self.lookup(*x)?;
                let count: usize = axes.iter().map(|&a| source.shape()[a]).product();
                op_sum_axes(source, axes)?.mapv(|v| v / count.max(1) as f32)
            }

            NodeType::Reshape(x, shape_provider) => {
                let shape: Vec<usize> = self.lookup(*shape_provider)?.iter().map(|&d| d as usize).collect();
                op_reshape(self.lookup(*x)?, &shape)?
            }
            NodeType::ReshapeLike(x, like) => {
                let shape = self.lookup(*like)?.shape().to_vec();
                op_reshape(self.lookup(*x)?, &shape)?
            }
            NodeType::Unsqueeze(x, axis) => {
                let source = self.lookup(*x)?;
                if *axis > source.ndim() {
                    return Err(RuntimeError::ShapeError(format!(
                        "cannot unsqueeze axis {} of rank-{} tensor",
                        axis,
                        source.ndim()
                    )));
                }
                source.clone().insert_axis(Axis(*axis))
            }
            NodeType::Transpose(x, axis1, axis2) => {
                let source = self.lookup(*x)?;
                let mut axes: Vec<usize> = (0..source.ndim()).collect();
                axes.swap(*axis1, *axis2);
                source.view().permuted_axes(axes).as_standard_layout().into_owned()
            }
            NodeType::Broadcast(x, target) => {
                let target_shape = self.lookup(*target)?.shape().to_vec();
                let source = self.lookup(*x)?;
                source
                    .broadcast(target_shape.as_slice())
                    .ok_or_else(|| {
                        RuntimeError::ShapeError(format!("Cannot broadcast {:?} to {:?}", source.shape(), target_shape))
                    })?
                    .to_owned()
            }
            NodeType::ReduceSumTo(x, target) => {
                let target_shape = self.lookup(*target)?.shape().to_vec();
                op_reduce_sum_to(self.lookup(*x)?, &target_shape)?
            }
            NodeType::Concat { inputs, axis } => {
                let views = inputs
                    .iter()
                    .map(|id| self.lookup(*id).map(|a| a.view()))
                    .collect::<Result<Vec<ArrayViewD<f32>>>>()?;
                concatenate(Axis(*axis), &views).map_err(|e| RuntimeError::ShapeError(format!("Concat: {}", e)))?
            }
            NodeType::Slice { input, axis, start, end } => {
                let source = self.lookup(*input)?;
                if *axis >= source.ndim() || start > end || *end > source.shape()[*axis] {
                    return Err(RuntimeError::ShapeError(format!(
                        "Slice {}..{} on axis {} of {:?}",
                        start,
                        end,
                        axis,
                        source.shape()
                    )));
                }
                source.slice_axis(Axis(*axis), Slice::from(*start..*end)).to_owned()
            }
            NodeType::Pad2d { input, pads } => op_pad2d(self.lookup(*input)?, *pads)?,
            NodeType::PadToMatch { input, reference } => {
                let source = self.lookup(*input)?;
                let target = self.lookup(*reference)?;
                let pads = spatial_pads(source, target)?;
                op_pad2d(source, pads)?
            }

            NodeType::Conv2d { input, weight, bias, stride, padding, dilation, groups } => {
                let bias = match bias {
                    Some(b) => Some(self.lookup(*b)?),
                    None => None,
                };
                op_conv2d(
                    view4(self.lookup(*input)?, "Conv2d input")?,
                    view4(self.lookup(*weight)?, "Conv2d weight")?,
                    bias,
                    *stride,
                    *padding,
                    *dilation,
                    *groups,
                )?
            }
            NodeType::ConvTranspose2d { input, weight, bias, stride, padding, output_padding, dilation, groups } => {
                let bias = match bias {
                    Some(b) => Some(self.lookup(*b)?),
                    None => None,
                };
                op_conv_transpose2d(
                    view4(self.lookup(*input)?, "ConvTranspose2d input")?,
                    view4(self.lookup(*weight)?, "ConvTranspose2d weight")?,
                    bias,
                    *stride,
                    *padding,
                    *output_padding,
                    *dilation,
                    *groups,
                )?
            }
            NodeType::Conv2dBackwardInput { grad_output, weight, input_shape, stride, padding, dilation, groups } => {
                op_conv2d_backward_input(
                    view4(self.lookup(*grad_output)?, "Conv2dBackwardInput grad")?,
                    view4(self.lookup(*weight)?, "Conv2dBackwardInput weight")?,
                    *input_shape,
                    *stride,
                    *padding,
                    *dilation,
                    *groups,
                )
            }
            NodeType::Conv2dBackwardWeight { grad_output, input, weight_shape, stride, padding, dilation, groups } => {
                op_conv2d_backward_weight(
                    view4(self.lookup(*grad_output)?, "Conv2dBackwardWeight grad")?,
                    view4(self.lookup(*input)?, "Conv2dBackwardWeight input")?,
                    *weight_shape,
                    *stride,
                    *padding,
                    *dilation,
                    *groups,
                )
            }

            NodeType::MaxPool2d { input, kernel_size, stride } => {
                op_max_pool2d(view4(self.lookup(*input)?, "MaxPool2d")?, *kernel_size, *stride)?
            }
            NodeType::MaxUnpool2d { input, original_input, kernel_size, stride } => op_max_unpool2d(
                view4(self.lookup(*input)?, "MaxUnpool2d grad")?,
                view4(self.lookup(*original_input)?, "MaxUnpool2d input")?,
                *kernel_size,
                *stride,
            ),
            NodeType::AvgPool2d { input, kernel_size, stride, padding } => {
                op_avg_pool2d(view4(self.lookup(*input)?, "AvgPool2d")?, *kernel_size, *stride, *padding)?
            }
            NodeType::AvgUnpool2d { input, original_input, kernel_size, stride, padding } => op_avg_unpool2d(
                view4(self.lookup(*input)?, "AvgUnpool2d grad")?,
                view4(self.lookup(*original_input)?, "AvgUnpool2d input")?,
                *kernel_size,
                *stride,
                *padding,
            ),

            NodeType::UpsampleBilinear2d { input, scale_factor, align_corners } => {
                op_upsample_bilinear2d(view4(self.lookup(*input)?, "UpsampleBilinear2d")?, *scale_factor, *align_corners)?
            }
            NodeType::UpsampleBilinear2dBackward { grad_output, input_size, align_corners } => {
                op_upsample_bilinear2d_backward(
                    view4(self.lookup(*grad_output)?, "UpsampleBilinear2dBackward")?,
                    *input_size,
                    *align_corners,
                )?
            }
        };

        self.memo.insert((self.asg.id, node_id), Value::Tensor(result));
        Ok(())
    }
}

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(&self, data: &HashMap<String, Value>) -> Result<HashMap<String, Self::DeviceData>> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>)> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("Topological sort failed: {}", e)))?;
        debug!(graph = main_asg.id, nodes = sorted_nodes.len(), "evaluating graph on cpu");

        let mut context = ExecutionContext::new(main_asg, initial_memo);
        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let results = main_asg
            .outputs
            .iter()
            .map(|id| context.lookup(*id).map(|a| Value::Tensor(a.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>> {
        Ok(device_data.to_vec())
    }
}

// --- Helpers ---

fn normalize(value: Value) -> Value {
    match value {
        Value::ScalarF32(v) => Value::Tensor(arr0(v).into_dyn()),
        tensor => tensor,
    }
}

fn as_array(value: &Value) -> Result<&ArrayD<f32>> {
    value.as_tensor().ok_or_else(|| RuntimeError::TypeError {
        expected: "Tensor".to_string(),
        actual: format!("{:?}", value),
    })
}

fn view4<'a>(a: &'a ArrayD<f32>, what: &str) -> Result<ArrayView4<'a, f32>> {
    a.view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::ShapeError(format!("{}: expected [N, C, H, W], got {:?} ({})", what, a.shape(), e)))
}

fn zip_broadcast(a: &ArrayD<f32>, b: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> Result<ArrayD<f32>> {
    let shape = broadcast_shapes(a.shape(), b.shape())
        .ok_or_else(|| RuntimeError::ShapeError(format!("Cannot broadcast {:?} with {:?}", a.shape(), b.shape())))?;
    let shape = IxDyn(&shape);
    let (av, bv) = match (a.broadcast(shape.clone()), b.broadcast(shape)) {
        (Some(av), Some(bv)) => (av, bv),
        _ => return Err(RuntimeError::ShapeError(format!("Cannot broadcast {:?} with {:?}", a.shape(), b.shape()))),
    };
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

fn op_matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let a2 = a
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("Matmul lhs {:?}: {}", a.shape(), e)))?;
    let b2 = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("Matmul rhs {:?}: {}", b.shape(), e)))?;
    if a2.ncols() != b2.nrows() {
        return Err(RuntimeError::ShapeError(format!(
            "Incompatible matmul shapes: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(a2.dot(&b2).into_dyn())
}

fn op_sum_axes(a: &ArrayD<f32>, axes: &[usize]) -> Result<ArrayD<f32>> {
    let mut out = a.clone();
    for &axis in axes {
        if axis >= out.ndim() {
            return Err(RuntimeError::ShapeError(format!("axis {} out of range for {:?}", axis, a.shape())));
        }
        out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }
    Ok(out)
}

fn op_reshape(a: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    a.to_shape(shape)
        .map(|view| view.into_owned())
        .map_err(|e| RuntimeError::ShapeError(format!("Reshape {:?} -> {:?}: {}", a.shape(), shape, e)))
}

fn op_reduce_sum_to(source: &ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>> {
    let mut reduced = source.clone();
    while reduced.ndim() > target_shape.len() {
        reduced = reduced.sum_axis(Axis(0));
    }
    let rank_diff = target_shape.len() - reduced.ndim();
    for i in (0..reduced.ndim()).rev() {
        if target_shape[i + rank_diff] == 1 && reduced.shape()[i] > 1 {
            reduced = reduced.sum_axis(Axis(i)).insert_axis(Axis(i));
        }
    }
    op_reshape(&reduced, target_shape)
}

fn spatial_pads(source: &ArrayD<f32>, target: &ArrayD<f32>) -> Result<Pad2d> {
    let (s, t) = (source.shape(), target.shape());
    if s.len() < 2 || t.len() < 2 {
        return Err(RuntimeError::ShapeError(format!("PadToMatch needs rank >= 2, got {:?} and {:?}", s, t)));
    }
    let from = (s[s.len() - 2], s[s.len() - 1]);
    let to = (t[t.len() - 2], t[t.len() - 1]);
    Ok(centered_pads(from, to))
}

/// Copies the overlap of `a` into a zero tensor grown (or cropped) by `pads`
/// on the last two axes.
fn op_pad2d(a: &ArrayD<f32>, pads: Pad2d) -> Result<ArrayD<f32>> {
    let rank = a.ndim();
    if rank < 2 {
        return Err(RuntimeError::ShapeError(format!("Pad2d needs rank >= 2, got {:?}", a.shape())));
    }
    let (left, right, top, bottom) = pads;
    let (h, w) = (a.shape()[rank - 2] as isize, a.shape()[rank - 1] as isize);
    let (out_h, out_w) = (h + top + bottom, w + left + right);
    if out_h <= 0 || out_w <= 0 {
        return Err(RuntimeError::ShapeError(format!("Pad2d {:?} leaves nothing of {:?}", pads, a.shape())));
    }

    let mut out_shape = a.shape().to_vec();
    out_shape[rank - 2] = out_h as usize;
    out_shape[rank - 1] = out_w as usize;
    let mut out = ArrayD::<f32>::zeros(IxDyn(&out_shape));

    let (src_y, dst_y) = ((-top).max(0), top.max(0));
    let (src_x, dst_x) = ((-left).max(0), left.max(0));
    let len_y = (h - src_y).min(out_h - dst_y);
    let len_x = (w - src_x).min(out_w - dst_x);
    if len_y <= 0 || len_x <= 0 {
        return Ok(out);
    }

    let mut dst = out.view_mut();
    dst.slice_axis_inplace(Axis(rank - 2), Slice::from(dst_y..dst_y + len_y));
    dst.slice_axis_inplace(Axis(rank - 1), Slice::from(dst_x..dst_x + len_x));
    let mut src = a.view();
    src.slice_axis_inplace(Axis(rank - 2), Slice::from(src_y..src_y + len_y));
    src.slice_axis_inplace(Axis(rank - 1), Slice::from(src_x..src_x + len_x));
    dst.assign(&src);
    Ok(out)
}

/// 2D convolution, direct loops.
/// Input: [N, C_in, H, W], Weight: [C_out, C_in/groups, kH, kW], Bias: [C_out]
fn op_conv2d(
    input: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    bias: Option<&ArrayD<f32>>,
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
    groups: usize,
) -> Result<ArrayD<f32>> {
    let (batch_size, in_channels, in_h, in_w) = input.dim();
    let (out_channels, weight_in_channels, kernel_h, kernel_w) = weight.dim();

    if in_channels != weight_in_channels * groups {
        return Err(RuntimeError::ShapeError(format!(
            "Conv2d: input channels {} != weight_in_channels {} * groups {}",
            in_channels, weight_in_channels, groups
        )));
    }

    let (stride_h, stride_w) = stride;
    let (pad_h, pad_w) = padding;
    let (dil_h, dil_w) = dilation;

    let effective_kernel_h = (kernel_h - 1) * dil_h + 1;
    let effective_kernel_w = (kernel_w - 1) * dil_w + 1;
    if in_h + 2 * pad_h < effective_kernel_h || in_w + 2 * pad_w < effective_kernel_w {
        return Err(RuntimeError::ShapeError(format!(
            "Conv2d: kernel {}x{} larger than padded input {}x{}",
            effective_kernel_h,
            effective_kernel_w,
            in_h + 2 * pad_h,
            in_w + 2 * pad_w
        )));
    }
    let out_h = (in_h + 2 * pad_h - effective_kernel_h) / stride_h + 1;
    let out_w = (in_w + 2 * pad_w - effective_kernel_w) / stride_w + 1;

    let mut output = Array4::<f32>::zeros((batch_size, out_channels, out_h, out_w));

    let out_channels_per_group = out_channels / groups;

    for n in 0..batch_size {
        for out_ch in 0..out_channels {
            let in_ch_start = (out_ch / out_channels_per_group) * weight_in_channels;
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let mut sum = 0.0f32;
                    for ic in 0..weight_in_channels {
                        let in_ch = in_ch_start + ic;
                        for kh in 0..kernel_h {
                            let ih = (oh * stride_h + kh * dil_h) as isize - pad_h as isize;
                            if ih < 0 || ih >= in_h as isize {
                                continue;
                            }
                            for kw in 0..kernel_w {
                                let iw = (ow * stride_w + kw * dil_w) as isize - pad_w as isize;
                                if iw >= 0 && iw < in_w as isize {
                                    sum += input[[n, in_ch, ih as usize, iw as usize]] * weight[[out_ch, ic, kh, kw]];
                                }
                            }
                        }
                    }
                    output[[n, out_ch, oh, ow]] = sum;
                }
            }
        }
    }

    if let Some(bias_arr) = bias {
        add_channel_bias(&mut output, bias_arr)?;
    }

    Ok(output.into_dyn())
}

fn add_channel_bias(output: &mut Array4<f32>, bias: &ArrayD<f32>) -> Result<()> {
    let channels = output.dim().1;
    if bias.len() != channels {
        return Err(RuntimeError::ShapeError(format!(
            "bias of {} elements for {} output channels",
            bias.len(),
            channels
        )));
    }
    for (c, &b) in bias.iter().enumerate() {
        output.index_axis_mut(Axis(1), c).mapv_inplace(|v| v + b);
    }
    Ok(())
}

/// Transposed 2D convolution (deconvolution).
/// Input: [N, C_in, H, W], Weight: [C_in, C_out/groups, kH, kW], Bias: [C_out]
#[allow(clippy::too_many_arguments)]
fn op_conv_transpose2d(
    input: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    bias: Option<&ArrayD<f32>>,
    stride: (usize, usize),
    padding: (usize, usize),
    output_padding: (usize, usize),
    dilation: (usize, usize),
    groups: usize,
) -> Result<ArrayD<f32>> {
    let (batch_size, in_channels, in_h, in_w) = input.dim();
    let (weight_in_channels, out_channels_per_group, kernel_h, kernel_w) = weight.dim();

    if in_channels != weight_in_channels {
        return Err(RuntimeError::ShapeError(format!(
            "ConvTranspose2d: input channels {} != weight channels {}",
            in_channels, weight_in_channels
        )));
    }

    let (stride_h, stride_w) = stride;
    let (pad_h, pad_w) = padding;
    let (dil_h, dil_w) = dilation;

    let out_channels = out_channels_per_group * groups;
    let span_h = (in_h - 1) * stride_h + dil_h * (kernel_h - 1) + output_padding.0 + 1;
    let span_w = (in_w - 1) * stride_w + dil_w * (kernel_w - 1) + output_padding.1 + 1;
    if span_h <= 2 * pad_h || span_w <= 2 * pad_w {
        return Err(RuntimeError::ShapeError(format!("ConvTranspose2d: padding {:?} removes the output", padding)));
    }
    let out_h = span_h - 2 * pad_h;
    let out_w = span_w - 2 * pad_w;

    let mut output = Array4::<f32>::zeros((batch_size, out_channels, out_h, out_w));
    let in_channels_per_group = in_channels / groups;

    for n in 0..batch_size {
        for ic in 0..in_channels {
            let out_ch_start = (ic / in_channels_per_group) * out_channels_per_group;
            for ih in 0..in_h {
                for iw in 0..in_w {
                    let in_val = input[[n, ic, ih, iw]];
                    for oc_rel in 0..out_channels_per_group {
                        let oc = out_ch_start + oc_rel;
                        for kh in 0..kernel_h {
                            let oh = ih * stride_h + kh * dil_h;
                            if oh < pad_h || oh - pad_h >= out_h {
                                continue;
                            }
                            for kw in 0..kernel_w {
                                let ow = iw * stride_w + kw * dil_w;
                                if ow >= pad_w && ow - pad_w < out_w {
                                    output[[n, oc, oh - pad_h, ow - pad_w]] += in_val * weight[[ic, oc_rel, kh, kw]];
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    if let Some(bias_arr) = bias {
        add_channel_bias(&mut output, bias_arr)?;
    }

    Ok(output.into_dyn())
}

/// Gradient of `Conv2d` with respect to its input.
fn op_conv2d_backward_input(
    grad_output: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    input_shape: (usize, usize, usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
    groups: usize,
) -> ArrayD<f32> {
    let (n_size, _, in_h, in_w) = input_shape;
    let (_, out_channels, out_h, out_w) = grad_output.dim();
    let (_, weight_in_channels, kernel_h, kernel_w) = weight.dim();
    let out_channels_per_group = out_channels / groups;

    let mut grad_input = Array4::<f32>::zeros(input_shape);
    for n in 0..n_size {
        for oc in 0..out_channels {
            let in_ch_start = (oc / out_channels_per_group) * weight_in_channels;
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let g = grad_output[[n, oc, oh, ow]];
                    if g == 0.0 {
                        continue;
                    }
                    for ic in 0..weight_in_channels {
                        for kh in 0..kernel_h {
                            let ih = (oh * stride.0 + kh * dilation.0) as isize - padding.0 as isize;
                            if ih < 0 || ih >= in_h as isize {
                                continue;
                            }
                            for kw in 0..kernel_w {
                                let iw = (ow * stride.1 + kw * dilation.1) as isize - padding.1 as isize;
                                if iw >= 0 && iw < in_w as isize {
                                    grad_input[[n, in_ch_start + ic, ih as usize, iw as usize]] +=
                                        g * weight[[oc, ic, kh, kw]];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    grad_input.into_dyn()
}

/// Gradient of `Conv2d` with respect to its weight.
fn op_conv2d_backward_weight(
    grad_output: ArrayView4<f32>,
    input: ArrayView4<f32>,
    weight_shape: (usize, usize, usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
    groups: usize,
) -> ArrayD<f32> {
    let (n_size, _, in_h, in_w) = input.dim();
    let (_, out_channels, out_h, out_w) = grad_output.dim();
    let (_, weight_in_channels, kernel_h, kernel_w) = weight_shape;
    let out_channels_per_group = out_channels / groups;

    let mut grad_weight = Array4::<f32>::zeros(weight_shape);
    for n in 0..n_size {
        for oc in 0..out_channels {
            let in_ch_start = (oc / out_channels_per_group) * weight_in_channels;
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let g = grad_output[[n, oc, oh, ow]];
                    if g == 0.0 {
                        continue;
                    }
                    for ic in 0..weight_in_channels {
                        for kh in 0..kernel_h {
                            let ih = (oh * stride.0 + kh * dilation.0) as isize - padding.0 as isize;
                            if ih < 0 || ih >= in_h as isize {
                                continue;
                            }
                            for kw in 0..kernel_w {
                                let iw = (ow * stride.1 + kw * dilation.1) as isize - padding.1 as isize;
                                if iw >= 0 && iw < in_w as isize {
                                    grad_weight[[oc, ic, kh, kw]] +=
                                        g * input[[n, in_ch_start + ic, ih as usize, iw as usize]];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    grad_weight.into_dyn()
}

fn pooled_dims(
    h: usize,
    w: usize,
    kernel_size: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<(usize, usize)> {
    let (ph, pw) = (h + 2 * padding.0, w + 2 * padding.1);
    if ph < kernel_size.0 || pw < kernel_size.1 {
        return Err(RuntimeError::ShapeError(format!(
            "pooling window {:?} larger than input {}x{}",
            kernel_size, ph, pw
        )));
    }
    Ok(((ph - kernel_size.0) / stride.0 + 1, (pw - kernel_size.1) / stride.1 + 1))
}

fn op_max_pool2d(input: ArrayView4<f32>, kernel_size: (usize, usize), stride: (usize, usize)) -> Result<ArrayD<f32>> {
    let (n, c, h, w) = input.dim();
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    let (out_h, out_w) = pooled_dims(h, w, kernel_size, stride, (0, 0))?;
    let mut output = Array4::<f32>::zeros((n, c, out_h, out_w));
    for n_idx in 0..n {
        for c_idx in 0..c {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let (h_start, w_start) = (oh * sh, ow * sw);
                    let window = input.slice(ndarray::s![n_idx, c_idx, h_start..h_start + kh, w_start..w_start + kw]);
                    output[[n_idx, c_idx, oh, ow]] = window.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                }
            }
        }
    }
    Ok(output.into_dyn())
}

/// Backward of `MaxPool2d`: routes each gradient to the first maximum of
/// its window.
fn op_max_unpool2d(
    grad: ArrayView4<f32>,
    original: ArrayView4<f32>,
    kernel_size: (usize, usize),
    stride: (usize, usize),
) -> ArrayD<f32> {
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    let mut output = Array4::<f32>::zeros(original.dim());
    let (gn, gc, gh, gw) = grad.dim();
    for n_idx in 0..gn {
        for c_idx in 0..gc {
            for oh in 0..gh {
                for ow in 0..gw {
                    let (h_start, w_start) = (oh * sh, ow * sw);
                    let mut max_val = f32::NEG_INFINITY;
                    let mut max_pos = (h_start, w_start);
                    for r in h_start..h_start + kh {
                        for col in w_start..w_start + kw {
                            if original[[n_idx, c_idx, r, col]] > max_val {
                                max_val = original[[n_idx, c_idx, r, col]];
                                max_pos = (r, col);
                            }
                        }
                    }
                    output[[n_idx, c_idx, max_pos.0, max_pos.1]] += grad[[n_idx, c_idx, oh, ow]];
                }
            }
        }
    }
    output.into_dyn()
}

/// Average pooling; padded positions count towards the window area.
fn op_avg_pool2d(
    input: ArrayView4<f32>,
    kernel_size: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<ArrayD<f32>> {
    let (n, c, h, w) = input.dim();
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    let (pad_h, pad_w) = padding;
    let (out_h, out_w) = pooled_dims(h, w, kernel_size, stride, padding)?;
    let kernel_area = (kh * kw) as f32;

    let mut output = Array4::<f32>::zeros((n, c, out_h, out_w));
    for n_idx in 0..n {
        for c_idx in 0..c {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let mut sum = 0.0f32;
                    for khh in 0..kh {
                        for kww in 0..kw {
                            let ih = (oh * sh + khh) as isize - pad_h as isize;
                            let iw = (ow * sw + kww) as isize - pad_w as isize;
                            if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                                sum += input[[n_idx, c_idx, ih as usize, iw as usize]];
                            }
                        }
                    }
                    output[[n_idx, c_idx, oh, ow]] = sum / kernel_area;
                }
            }
        }
    }
    Ok(output.into_dyn())
}

/// Backward of `AvgPool2d`: spreads each gradient evenly over its window.
fn op_avg_unpool2d(
    grad: ArrayView4<f32>,
    original: ArrayView4<f32>,
    kernel_size: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> ArrayD<f32> {
    let (_, _, in_h, in_w) = original.dim();
    let (gn, gc, out_h, out_w) = grad.dim();
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    let (ph, pw) = padding;
    let window_size = (kh * kw) as f32;

    let mut output = Array4::<f32>::zeros(original.dim());
    for n_idx in 0..gn {
        for c_idx in 0..gc {
            for oh in 0..out_h {
                for ow in 0..out_w {
                    let distributed = grad[[n_idx, c_idx, oh, ow]] / window_size;
                    for kh_idx in 0..kh {
                        for kw_idx in 0..kw {
                            let ih = oh * sh + kh_idx;
                            let iw = ow * sw + kw_idx;
                            if ih >= ph && ih - ph < in_h && iw >= pw && iw - pw < in_w {
                                output[[n_idx, c_idx, ih - ph, iw - pw]] += distributed;
                            }
                        }
                    }
                }
            }
        }
    }
    output.into_dyn()
}

/// Source taps `(i0, i1, weight_of_i1)` for every output position of a
/// linear resize from `in_size` to `out_size`.
fn interp_coords(in_size: usize, out_size: usize, align_corners: bool) -> Vec<(usize, usize, f32)> {
    (0..out_size)
        .map(|o| {
            let src = if align_corners {
                if out_size > 1 {
                    (o * (in_size - 1)) as f32 / (out_size - 1) as f32
                } else {
                    0.0
                }
            } else {
                ((o as f32 + 0.5) * in_size as f32 / out_size as f32 - 0.5).max(0.0)
            };
            let i0 = (src.floor() as usize).min(in_size - 1);
            let i1 = (i0 + 1).min(in_size - 1);
            (i0, i1, src - i0 as f32)
        })
        .collect()
}

fn op_upsample_bilinear2d(input: ArrayView4<f32>, scale_factor: usize, align_corners: bool) -> Result<ArrayD<f32>> {
    let (n, c, h, w) = input.dim();
    if h == 0 || w == 0 || scale_factor == 0 {
        return Err(RuntimeError::ShapeError(format!(
            "UpsampleBilinear2d: cannot resize {:?} by {}",
            input.shape(),
            scale_factor
        )));
    }
    let (out_h, out_w) = (h * scale_factor, w * scale_factor);
    let ys = interp_coords(h, out_h, align_corners);
    let xs = interp_coords(w, out_w, align_corners);

    let mut output = Array4::<f32>::zeros((n, c, out_h, out_w));
    for n_idx in 0..n {
        for c_idx in 0..c {
            for (oy, &(y0, y1, ly)) in ys.iter().enumerate() {
                for (ox, &(x0, x1, lx)) in xs.iter().enumerate() {
                    let top = (1.0 - lx) * input[[n_idx, c_idx, y0, x0]] + lx * input[[n_idx, c_idx, y0, x1]];
                    let bottom = (1.0 - lx) * input[[n_idx, c_idx, y1, x0]] + lx * input[[n_idx, c_idx, y1, x1]];
                    output[[n_idx, c_idx, oy, ox]] = (1.0 - ly) * top + ly * bottom;
                }
            }
        }
    }
    Ok(output.into_dyn())
}

fn op_upsample_bilinear2d_backward(
    grad: ArrayView4<f32>,
    input_size: (usize, usize),
    align_corners: bool,
) -> Result<ArrayD<f32>> {
    let (n, c, out_h, out_w) = grad.dim();
    let (h, w) = input_size;
    if h == 0 || w == 0 {
        return Err(RuntimeError::ShapeError("UpsampleBilinear2dBackward: empty input size".to_string()));
    }
    let ys = interp_coords(h, out_h, align_corners);
    let xs = interp_coords(w, out_w, align_corners);

    let mut output = Array4::<f32>::zeros((n, c, h, w));
    for n_idx in 0..n {
        for c_idx in 0..c {
            for (oy, &(y0, y1, ly)) in ys.iter().enumerate() {
                for (ox, &(x0, x1, lx)) in xs.iter().enumerate() {
                    let g = grad[[n_idx, c_idx, oy, ox]];
                    output[[n_idx, c_idx, y0, x0]] += g * (1.0 - ly) * (1.0 - lx);
                    output[[n_idx, c_idx, y0, x1]] += g * (1.0 - ly) * lx;
                    output[[n_idx, c_idx, y1, x0]] += g * ly * (1.0 - lx);
                    output[[n_idx, c_idx, y1, x1]] += g * ly * lx;
                }
            }
        }
    }
    Ok(output.into_dyn())
}
