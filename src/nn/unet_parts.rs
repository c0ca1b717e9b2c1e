//! U-Net building blocks.
//!
//! Every block is a thin composition of the primitive layers: convolutions,
//! batch norm, ReLU, pooling and upsampling. Parameter names are dotted
//! paths under the block's `name` (`down1.conv.bn1.gamma`).

use crate::nn::activations::ReLU;
use crate::nn::batchnorm::BatchNorm2d;
use crate::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d};
use crate::nn::linear::Linear;
use crate::nn::module::{ConditionedModule, Module};
use crate::nn::pooling::MixPool2d;
use crate::nn::upsample::Upsample;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// 3x3 convolution, padding 1, no bias: keeps H and W.
fn conv3x3(context: &Rc<RefCell<GraphContext>>, name: &str, in_channels: usize, out_channels: usize) -> Conv2d {
    let config = Conv2dConfig::new(in_channels, out_channels, (3, 3)).with_padding((1, 1)).with_bias(false);
    Conv2d::from_config(context, name, config)
}

/// `(conv 3x3 => BN => ReLU) * 2`.
pub struct DoubleConv {
    pub conv1: Conv2d,
    pub bn1: BatchNorm2d,
    pub conv2: Conv2d,
    pub bn2: BatchNorm2d,
    act: ReLU,
}

impl DoubleConv {
    /// `mid_channels` defaults to `out_channels`.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        mid_channels: Option<usize>,
    ) -> Self {
        let mid = mid_channels.filter(|&m| m > 0).unwrap_or(out_channels);
        Self {
            conv1: conv3x3(context, &format!("{}.conv1", name), in_channels, mid),
            bn1: BatchNorm2d::new(context, &format!("{}.bn1", name), mid),
            conv2: conv3x3(context, &format!("{}.conv2", name), mid, out_channels),
            bn2: BatchNorm2d::new(context, &format!("{}.bn2", name), out_channels),
            act: ReLU,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.bn1.training = training;
        self.bn2.training = training;
    }
}

impl Module for DoubleConv {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let x = self.act.forward(&self.bn1.forward(&self.conv1.forward(inputs)));
        self.act.forward(&self.bn2.forward(&self.conv2.forward(&x)))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.bn1.parameters());
        params.extend(self.conv2.parameters());
        params.extend(self.bn2.parameters());
        params
    }
}

/// `DoubleConv` whose stages are gated by a time embedding.
///
/// Each stage computes `out = relu(bn(conv(x)))` and then
/// `out = out + out * proj(emb)[:, :, None, None]`, where `proj` is a
/// `Linear(n_emb -> stage channels)`.
pub struct DoubleConvTime {
    pub time1: Linear,
    pub time2: Linear,
    pub c1: Conv2d,
    pub bn1: BatchNorm2d,
    pub c2: Conv2d,
    pub bn2: BatchNorm2d,
    act: ReLU,
    name: String,
}

impl DoubleConvTime {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        mid_channels: Option<usize>,
        n_emb: usize,
    ) -> Self {
        let mid = mid_channels.filter(|&m| m > 0).unwrap_or(out_channels);
        Self {
            time1: Linear::new(context, n_emb, mid, &format!("{}.time1", name)),
            time2: Linear::new(context, n_emb, out_channels, &format!("{}.time2", name)),
            c1: conv3x3(context, &format!("{}.c1", name), in_channels, mid),
            bn1: BatchNorm2d::new(context, &format!("{}.bn1", name), mid),
            c2: conv3x3(context, &format!("{}.c2", name), mid, out_channels),
            bn2: BatchNorm2d::new(context, &format!("{}.bn2", name), out_channels),
            act: ReLU,
            name: name.to_string(),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.bn1.training = training;
        self.bn2.training = training;
    }

    /// `out + out * proj(condition)`, the `[B, C]` gate broadcast over H and W.
    fn modulate(&self, stage: usize, out: &Tensor, proj: &Linear, condition: &Tensor) -> Tensor {
        trace!(
            block = %self.name,
            stage,
            channels = proj.out_features,
            n_emb = proj.in_features,
            "time gate: out [B, C, H, W], t [B, C]"
        );
        let gate = proj.forward(condition).unsqueeze(2).unsqueeze(3);
        out + &(out * &gate)
    }
}

impl ConditionedModule for DoubleConvTime {
    /// `inputs: [B, C_in, H, W]`, `condition: [B, n_emb]`.
    fn forward(&self, inputs: &Tensor, condition: &Tensor) -> Tensor {
        let out = self.act.forward(&self.bn1.forward(&self.c1.forward(inputs)));
        let out = self.modulate(1, &out, &self.time1, condition);

        let out = self.act.forward(&self.bn2.forward(&self.c2.forward(&out)));
        self.modulate(2, &out, &self.time2, condition)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.time1.parameters();
        params.extend(self.time2.parameters());
        params.extend(self.c1.parameters());
        params.extend(self.bn1.parameters());
        params.extend(self.c2.parameters());
        params.extend(self.bn2.parameters());
        params
    }
}

/// Downscaling: `MixPool2d` then `DoubleConv`. Halves H and W.
pub struct Down {
    pub pool: MixPool2d,
    pub conv: DoubleConv,
}

impl Down {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, in_channels: usize, out_channels: usize) -> Self {
        Self {
            pool: MixPool2d::new(context, &format!("{}.pool", name), in_channels),
            conv: DoubleConv::new(context, &format!("{}.conv", name), in_channels, out_channels, None),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.conv.set_training(training);
    }
}

impl Module for Down {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.conv.forward(&self.pool.forward(inputs))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.pool.parameters();
        params.extend(self.conv.parameters());
        params
    }
}

/// How `Up` doubles the resolution of the decoder tensor.
pub enum Upsampling {
    /// Bilinear, corners aligned. Channels unchanged.
    Bilinear(Upsample),
    /// 2x2 stride-2 transposed convolution halving the channels.
    Transposed(ConvTranspose2d),
}

/// Upscaling, alignment with the skip tensor, concat, `DoubleConv`.
pub struct Up {
    pub up: Upsampling,
    pub conv: DoubleConv,
}

impl Up {
    /// `in_channels` is the channel count after concatenation with the skip.
    ///
    /// In bilinear mode the decoder tensor keeps its channels and the
    /// `DoubleConv` narrows through `in_channels / 2`. Otherwise the
    /// transposed convolution maps `in_channels -> in_channels / 2` first.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        bilinear: bool,
    ) -> Self {
        let conv_name = format!("{}.conv", name);
        if bilinear {
            Self {
                up: Upsampling::Bilinear(Upsample::bilinear(2, true)),
                conv: DoubleConv::new(context, &conv_name, in_channels, out_channels, Some(in_channels / 2)),
            }
        } else {
            let up = ConvTranspose2d::new(context, &format!("{}.up", name), in_channels, in_channels / 2, (2, 2))
                .with_stride((2, 2));
            Self {
                up: Upsampling::Transposed(up),
                conv: DoubleConv::new(context, &conv_name, in_channels, out_channels, None),
            }
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.conv.set_training(training);
    }
}

impl ConditionedModule for Up {
    /// `inputs` is the decoder tensor `x1`, `condition` the skip tensor `x2`.
    ///
    /// After upsampling, `x1` is padded (or cropped, when it overshoots) to
    /// the spatial size of `x2` with the floor/ceil split, then `[x2, x1]`
    /// are concatenated along channels. The output has `x2`'s H and W.
    fn forward(&self, inputs: &Tensor, condition: &Tensor) -> Tensor {
        let x1 = match &self.up {
            Upsampling::Bilinear(up) => up.forward(inputs),
            Upsampling::Transposed(up) => up.forward(inputs),
        };
        let x1 = x1.pad_to_match(condition);
        self.conv.forward(&Tensor::concat(&[condition, &x1], 1))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = match &self.up {
            Upsampling::Bilinear(up) => up.parameters(),
            Upsampling::Transposed(up) => up.parameters(),
        };
        params.extend(self.conv.parameters());
        params
    }
}

/// Final 1x1 convolution with bias.
pub struct OutConv {
    pub conv: Conv2d,
}

impl OutConv {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, in_channels: usize, out_channels: usize) -> Self {
        Self { conv: Conv2d::new(context, &format!("{}.conv", name), in_channels, out_channels, (1, 1)) }
    }
}

impl Module for OutConv {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.conv.forward(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.conv.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::shape_inference::ShapeInference;
    use crate::asg::{DType, Shape, Value};
    use crate::nn::init::ParameterStore;
    use crate::nn::test_util::infer_shape;
    use crate::runtime::backend::Backend;
    use crate::runtime::cpu_backend::CpuBackend;
    use ndarray::{ArrayD, Ix2, Ix4, IxDyn};
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn context() -> Rc<RefCell<GraphContext>> {
        Rc::new(RefCell::new(GraphContext::new()))
    }

    #[test]
    fn double_conv_preserves_spatial_size() {
        let ctx = context();
        let x = Tensor::new_input(&ctx, "x");
        let y = DoubleConv::new(&ctx, "dc", 3, 6, None).forward(&x);
        for (h, w) in [(5, 5), (8, 13), (1, 1)] {
            assert_eq!(infer_shape(&ctx, &y, &[("x", &[2, 3, h, w])]).unwrap(), vec![2, 6, h, w]);
        }
    }

    #[test]
    fn double_conv_mid_channels() {
        let ctx = context();
        let dc = DoubleConv::new(&ctx, "dc", 4, 2, Some(8));
        assert_eq!(dc.conv1.config.out_channels, 8);
        assert_eq!(dc.conv2.config.in_channels, 8);
        assert_eq!(dc.parameter_count(), 8 * 4 * 9 + 2 * 8 + 2 * 8 * 9 + 2 * 2);
        assert!(dc.conv1.bias.is_none());
    }

    #[test]
    fn double_conv_time_keeps_shape() {
        let ctx = context();
        let x = Tensor::new_input(&ctx, "x");
        let emb = Tensor::new_input(&ctx, "emb");
        let block = DoubleConvTime::new(&ctx, "dct", 3, 4, None, 10);
        let y = block.forward(&x, &emb);

        let shape = infer_shape(&ctx, &y, &[("x", &[2, 3, 6, 6]), ("emb", &[2, 10])]).unwrap();
        assert_eq!(shape, vec![2, 4, 6, 6]);
        assert_eq!(ctx.borrow().param_spec("dct.time1.weights").unwrap().shape, vec![10, 4]);
    }

    /// Runs several outputs of one graph against the same parameters.
    fn run_outputs(
        ctx: &Rc<RefCell<GraphContext>>,
        outputs: &[&Tensor],
        inputs: &[(&str, ArrayD<f32>)],
        store: &ParameterStore,
    ) -> Vec<ArrayD<f32>> {
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(outputs.iter().map(|t| t.node_id).collect());
        let shapes: HashMap<String, (Shape, DType)> = inputs
            .iter()
            .map(|(name, data)| (name.to_string(), (data.shape().to_vec(), DType::F32)))
            .collect();
        ShapeInference::run(&mut graph, &shapes).unwrap();
        let data: HashMap<String, Value> =
            inputs.iter().map(|(name, data)| (name.to_string(), Value::Tensor(data.clone()))).collect();
        let (values, _) = CpuBackend::new().run(&graph, store.bind(&graph, &data)).unwrap();
        values.iter().map(|v| v.as_tensor().unwrap().clone()).collect()
    }

    /// `out[b, c, h, w] * (1 + gate[b, c])`, computed directly on arrays.
    fn gated(out: &ArrayD<f32>, gate: &ArrayD<f32>) -> ArrayD<f32> {
        let gate = gate.view().into_dimensionality::<Ix2>().unwrap();
        let mut result = out.clone();
        for ((b, c, _, _), v) in result.view_mut().into_dimensionality::<Ix4>().unwrap().indexed_iter_mut() {
            *v += *v * gate[[b, c]];
        }
        result
    }

    fn ramp(shape: &[usize], scale: f32) -> ArrayD<f32> {
        let n: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|i| ((i * 7 % 11) as f32 - 5.0) * scale).collect()).unwrap()
    }

    #[test]
    fn double_conv_time_gates_each_stage_per_channel() {
        let ctx = context();
        let x = Tensor::new_input(&ctx, "x");
        let emb = Tensor::new_input(&ctx, "emb");
        let stage2_in = Tensor::new_input(&ctx, "stage2_in");
        let block = DoubleConvTime::new(&ctx, "dct", 2, 4, Some(3), 5);
        let y = block.forward(&x, &emb);

        // Ungated stages and gates, built from the block's own layers.
        let stage1 = block.bn1.forward(&block.c1.forward(&x)).relu();
        let gate1 = block.time1.forward(&emb);
        let stage2 = block.bn2.forward(&block.c2.forward(&stage2_in)).relu();
        let gate2 = block.time2.forward(&emb);

        let store = ParameterStore::initialize(&ctx, 11);
        let (x_data, emb_data) = (ramp(&[2, 2, 3, 4], 0.3), ramp(&[2, 5], 0.5));
        let first = run_outputs(
            &ctx,
            &[&y, &stage1, &gate1, &gate2],
            &[("x", x_data.clone()), ("emb", emb_data.clone())],
            &store,
        );
        let (actual, gate2_data) = (&first[0], &first[3]);
        let stage2_input = gated(&first[1], &first[2]);
        assert!(first[2].iter().any(|g| g.abs() > 1e-3));

        let second =
            run_outputs(&ctx, &[&stage2], &[("emb", emb_data), ("stage2_in", stage2_input)], &store);
        let expected = gated(&second[0], gate2_data);

        assert_eq!(actual.shape(), &[2, 4, 3, 4]);
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-4, "{} != {}", a, e);
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn double_conv_time_traces_stage_channels() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let ctx = context();
        let x = Tensor::new_input(&ctx, "x");
        let emb = Tensor::new_input(&ctx, "emb");
        let block = DoubleConvTime::new(&ctx, "dct", 2, 4, Some(3), 5);
        tracing::subscriber::with_default(subscriber, || block.forward(&x, &emb));

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("stage=1 channels=3 n_emb=5"), "{}", logs);
        assert!(logs.contains("stage=2 channels=4 n_emb=5"), "{}", logs);
    }

    #[test]
    fn double_conv_time_rejects_wrong_embedding_width() {
        let ctx = context();
        let x = Tensor::new_input(&ctx, "x");
        let emb = Tensor::new_input(&ctx, "emb");
        let y = DoubleConvTime::new(&ctx, "dct", 3, 4, None, 10).forward(&x, &emb);
        assert!(infer_shape(&ctx, &y, &[("x", &[2, 3, 6, 6]), ("emb", &[2, 9])]).is_err());
    }

    #[test]
    fn down_halves_even_inputs() {
        let ctx = context();
        let x = Tensor::new_input(&ctx, "x");
        let y = Down::new(&ctx, "down", 3, 8).forward(&x);
        assert_eq!(infer_shape(&ctx, &y, &[("x", &[1, 3, 64, 64])]).unwrap(), vec![1, 8, 32, 32]);
        assert_eq!(infer_shape(&ctx, &y, &[("x", &[2, 3, 10, 6])]).unwrap(), vec![2, 8, 5, 3]);
    }

    #[test]
    fn up_matches_skip_size() {
        for bilinear in [true, false] {
            // Bilinear: x1 keeps 8 channels, 8 + 8 = 16. Transposed: x1 16 -> 8.
            let ctx = context();
            let x1 = Tensor::new_input(&ctx, "x1");
            let x2 = Tensor::new_input(&ctx, "x2");
            let y = Up::new(&ctx, "up", 16, 4, bilinear).forward(&x1, &x2);
            let c1 = if bilinear { 8 } else { 16 };
            for (h2, w2) in [(16, 16), (17, 15), (15, 14)] {
                let shape = infer_shape(&ctx, &y, &[("x1", &[1, c1, 8, 8]), ("x2", &[1, 8, h2, w2])]).unwrap();
                assert_eq!(shape, vec![1, 4, h2, w2]);
            }
        }
    }

    #[test]
    fn up_channel_layout() {
        let ctx = context();
        let up = Up::new(&ctx, "up", 16, 8, false);
        match &up.up {
            Upsampling::Transposed(t) => assert_eq!(t.stride, (2, 2)),
            Upsampling::Bilinear(_) => panic!("expected transposed upsampling"),
        }
        assert_eq!(ctx.borrow().param_spec("up.up.weight").unwrap().shape, vec![16, 8, 2, 2]);

        let ctx = context();
        let up = Up::new(&ctx, "up", 16, 8, true);
        assert_eq!(up.conv.conv1.config.out_channels, 8);
        assert!(ctx.borrow().param_spec("up.up.weight").is_none());
    }

    #[test]
    #[should_panic(expected = "parameter 'head.conv.weight' is already registered")]
    fn blocks_with_the_same_name_do_not_share_weights() {
        let ctx = context();
        let _first = OutConv::new(&ctx, "head", 8, 2);
        let _second = OutConv::new(&ctx, "head", 4, 2);
    }

    #[test]
    fn out_conv_projects_channels() {
        let ctx = context();
        let x = Tensor::new_input(&ctx, "x");
        let head = OutConv::new(&ctx, "outc", 8, 2);
        let y = head.forward(&x);
        assert_eq!(infer_shape(&ctx, &y, &[("x", &[1, 8, 32, 32])]).unwrap(), vec![1, 2, 32, 32]);
        assert_eq!(head.parameter_count(), 8 * 2 + 2);
    }
}
