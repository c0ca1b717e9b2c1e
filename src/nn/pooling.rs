//! Module implementing pooling layers for CNNs.

use crate::nn::conv::{Conv2d, Conv2dConfig};
use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Max Pooling 2D layer.
///
/// Applies max pooling to input tensor of shape [N, C, H, W].
/// Selects maximum value from each window.
///
/// # Example
///
/// ```rust,ignore
/// let pool = MaxPool2d::new((2, 2), (2, 2));
/// let output = pool.forward(&input); // Reduces H and W by half
/// ```
pub struct MaxPool2d {
    /// Window size (kH, kW).
    pub kernel_size: (usize, usize),
    /// Stride (stride_h, stride_w).
    pub stride: (usize, usize),
}

impl MaxPool2d {
    /// Creates MaxPool2d layer.
    ///
    /// # Arguments
    ///
    /// * `kernel_size` - Pooling window size
    /// * `stride` - Pooling stride (usually equals kernel_size)
    pub fn new(kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        Self { kernel_size, stride }
    }

    /// Creates MaxPool2d with equal kernel_size and stride.
    pub fn square(size: usize) -> Self {
        Self { kernel_size: (size, size), stride: (size, size) }
    }
}

impl Module for MaxPool2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.max_pool2d(self.kernel_size, self.stride)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![] // Pooling layers have no trainable parameters
    }
}

/// Average Pooling 2D layer.
///
/// Applies average pooling to input tensor of shape [N, C, H, W].
/// Padded positions count as zeros and the divisor is always the window area.
pub struct AvgPool2d {
    /// Window size (kH, kW).
    pub kernel_size: (usize, usize),
    /// Stride (stride_h, stride_w).
    pub stride: (usize, usize),
    /// Padding (pad_h, pad_w).
    pub padding: (usize, usize),
}

impl AvgPool2d {
    /// Creates AvgPool2d layer.
    pub fn new(kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        Self { kernel_size, stride, padding: (0, 0) }
    }

    /// Creates AvgPool2d with equal kernel_size and stride.
    pub fn square(size: usize) -> Self {
        Self::new((size, size), (size, size))
    }

    /// Sets padding.
    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }
}

impl Module for AvgPool2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.avg_pool2d(self.kernel_size, self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// Mixed pooling: 2x2 average and max pooling fused by a learned 1x1 conv.
///
/// `[N, C, H, W]` -> concat(avg, max) `[N, 2C, H/2, W/2]` -> `[N, C, H/2, W/2]`.
pub struct MixPool2d {
    pub avg: AvgPool2d,
    pub max: MaxPool2d,
    /// 1x1 convolution `2C -> C` with bias.
    pub mix: Conv2d,
}

impl MixPool2d {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, channels: usize) -> Self {
        let config = Conv2dConfig::new(2 * channels, channels, (1, 1));
        Self {
            avg: AvgPool2d::square(2),
            max: MaxPool2d::square(2),
            mix: Conv2d::from_config(context, &format!("{}.mix", name), config),
        }
    }
}

impl Module for MixPool2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let avg = self.avg.forward(inputs);
        let max = self.max.forward(inputs);
        self.mix.forward(&Tensor::concat(&[&avg, &max], 1))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.mix.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::test_util::{evaluate, infer_shape};
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_max_pool2d() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let input = Tensor::new_input(&context, "x");
        let pool = MaxPool2d::new((2, 2), (2, 2));

        let output = pool.forward(&input);
        assert!(pool.parameters().is_empty());
        assert_eq!(infer_shape(&context, &output, &[("x", &[1, 3, 8, 6])]).unwrap(), vec![1, 3, 4, 3]);
    }

    #[test]
    fn test_max_pool2d_square() {
        let pool = MaxPool2d::square(2);
        assert_eq!(pool.kernel_size, (2, 2));
        assert_eq!(pool.stride, (2, 2));
    }

    #[test]
    fn test_avg_pool2d_padding() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let input = Tensor::new_input(&context, "x");
        let pool = AvgPool2d::new((2, 2), (2, 2)).with_padding((1, 1));

        let output = pool.forward(&input);
        assert_eq!(pool.padding, (1, 1));
        assert_eq!(infer_shape(&context, &output, &[("x", &[1, 1, 4, 4])]).unwrap(), vec![1, 1, 3, 3]);
    }

    #[test]
    fn mix_pool_keeps_channels_and_halves_space() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let input = Tensor::new_input(&context, "x");
        let pool = MixPool2d::new(&context, "pool", 5);
        let output = pool.forward(&input);

        assert_eq!(infer_shape(&context, &output, &[("x", &[2, 5, 12, 8])]).unwrap(), vec![2, 5, 6, 4]);
        assert_eq!(pool.parameter_count(), 10 * 5 + 5);
    }

    #[test]
    fn mix_pool_of_constant_map_is_affine_in_the_constant() {
        // On a constant map avg == max == c, so every output is c * sum(w) + b.
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let input = Tensor::new_input(&context, "x");
        let output = MixPool2d::new(&context, "pool", 1).forward(&input);

        let zero = evaluate(&context, &output, &[("x", ArrayD::zeros(IxDyn(&[1, 1, 4, 4])))], 3);
        let one = evaluate(&context, &output, &[("x", ArrayD::ones(IxDyn(&[1, 1, 4, 4])))], 3);
        let two = evaluate(&context, &output, &[("x", ArrayD::from_elem(IxDyn(&[1, 1, 4, 4]), 2.0))], 3);
        for ((z, o), t) in zero.iter().zip(one.iter()).zip(two.iter()) {
            assert!(((t - o) - (o - z)).abs() < 1e-5);
        }
        assert!(zero.iter().all(|&v| (v - zero[[0, 0, 0, 0]]).abs() < 1e-6));
    }
}
