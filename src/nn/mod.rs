//! # Neural Network Layers Module
//!
//! Building blocks of U-Net style segmentation and denoising models.
//!
//! In the graph-based architecture, each "layer" is a constructor that adds
//! a specific pattern of nodes (operations and parameters) to the ASG.
//! Concrete weights live outside the graph, in a [`ParameterStore`].
//!
//! ## Available Layers
//!
//! ### Core Layers
//! - [`Linear`]: Fully connected / dense layer
//! - [`Conv2d`]: 2D convolution with configurable stride, padding, dilation
//! - [`ConvTranspose2d`]: Transposed 2D convolution
//! - [`BatchNorm2d`]: Per-channel batch normalization
//!
//! ### Sampling
//! - [`MaxPool2d`], [`AvgPool2d`]: Standard pooling
//! - [`MixPool2d`]: Learned blend of average and max pooling
//! - [`Upsample`]: Bilinear upsampling
//!
//! ### U-Net
//! - [`DoubleConv`], [`DoubleConvTime`]: Two 3x3 conv/BN/ReLU stages
//! - [`Down`], [`Up`], [`OutConv`]: Encoder, decoder and head stages
//! - [`TemporalEncoding`]: Embedding of a scalar conditioning signal
//! - [`UNet`], [`ConditionedUNet`]: Assembled models
//!
//! ## Example
//!
//! ```ignore
//! use rustyunet::nn::{Module, UNet};
//! use rustyunet::tensor::{GraphContext, Tensor};
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let unet = UNet::new(&ctx, 3, 2, 64, true);
//!
//! let x = Tensor::new_input(&ctx, "image");
//! let logits = unet.forward(&x);
//! ```

pub mod activations;
pub mod batchnorm;
pub mod conv;
pub mod init;
pub mod linear;
pub mod module;
pub mod pooling;
pub mod temporal;
pub mod unet;
pub mod unet_parts;
pub mod upsample;

pub use activations::{ReLU, Sin};
pub use batchnorm::BatchNorm2d;
pub use conv::{Conv2d, Conv2dConfig, ConvTranspose2d};
pub use init::ParameterStore;
pub use linear::Linear;
pub use pooling::{AvgPool2d, MaxPool2d, MixPool2d};
pub use temporal::{TemporalEncoding, DEFAULT_N_EMB};
pub use unet::{ConditionedUNet, UNet};
pub use unet_parts::{DoubleConv, DoubleConvTime, Down, OutConv, Up, Upsampling};
pub use upsample::Upsample;

// Base traits
pub use module::{ConditionedModule, Module};

#[cfg(test)]
pub(crate) mod test_util {
    use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
    use crate::asg::{DType, Shape, Value};
    use crate::nn::init::ParameterStore;
    use crate::runtime::backend::Backend;
    use crate::runtime::cpu_backend::CpuBackend;
    use crate::tensor::{GraphContext, Tensor};
    use ndarray::ArrayD;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    /// Infers the shape of `out` given the shapes of the named inputs.
    /// Parameter shapes come from their registered specs.
    pub fn infer_shape(
        ctx: &Rc<RefCell<GraphContext>>,
        out: &Tensor,
        inputs: &[(&str, &[usize])],
    ) -> Result<Shape, ShapeInferenceError> {
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let shapes: HashMap<String, (Shape, DType)> = inputs
            .iter()
            .map(|(name, shape)| (name.to_string(), (shape.to_vec(), DType::F32)))
            .collect();
        ShapeInference::run(&mut graph, &shapes)?;
        Ok(graph
            .get_node(out.node_id)
            .ok()
            .and_then(|n| n.shape.clone())
            .unwrap_or_default())
    }

    /// Evaluates `out` on the CPU with parameters drawn from `seed`.
    pub fn evaluate(
        ctx: &Rc<RefCell<GraphContext>>,
        out: &Tensor,
        inputs: &[(&str, ArrayD<f32>)],
        seed: u64,
    ) -> ArrayD<f32> {
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let shapes: HashMap<String, (Shape, DType)> = inputs
            .iter()
            .map(|(name, data)| (name.to_string(), (data.shape().to_vec(), DType::F32)))
            .collect();
        ShapeInference::run(&mut graph, &shapes).unwrap();

        let store = ParameterStore::initialize(ctx, seed);
        let data: HashMap<String, Value> = inputs
            .iter()
            .map(|(name, data)| (name.to_string(), Value::Tensor(data.clone())))
            .collect();
        let (outputs, _) = CpuBackend::new().run(&graph, store.bind(&graph, &data)).unwrap();
        outputs[0].as_tensor().unwrap().clone()
    }
}
