//! Module implementing convolutional layers for image processing.

use crate::nn::module::Module;
use crate::tensor::{GraphContext, ParamInit, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for Conv2d layer.
#[derive(Debug, Clone)]
pub struct Conv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels (filters).
    pub out_channels: usize,
    /// Convolution kernel size.
    pub kernel_size: (usize, usize),
    /// Convolution stride.
    pub stride: (usize, usize),
    /// Padding.
    pub padding: (usize, usize),
    /// Dilation (kernel expansion).
    pub dilation: (usize, usize),
    /// Number of groups for grouped/depthwise convolution.
    pub groups: usize,
    /// Use bias.
    pub bias: bool,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: (3, 3),
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
            bias: true,
        }
    }
}

impl Conv2dConfig {
    /// Creates Conv2d configuration.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self { in_channels, out_channels, kernel_size, ..Default::default() }
    }

    /// Sets convolution stride.
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    /// Sets padding.
    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    /// Sets dilation.
    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    /// Sets number of groups.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Enables/disables bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Weight shape `[C_out, C_in/groups, kH, kW]`.
    pub fn weight_shape(&self) -> [usize; 4] {
        [self.out_channels, self.in_channels / self.groups, self.kernel_size.0, self.kernel_size.1]
    }
}

/// 2D Convolutional layer.
///
/// Applies 2D convolution to input tensor of shape [N, C_in, H, W].
/// Output tensor has shape [N, C_out, H_out, W_out].
///
/// # Example
///
/// ```rust,ignore
/// use rustyunet::nn::{Conv2d, Conv2dConfig, Module};
///
/// let config = Conv2dConfig::new(3, 64, (3, 3)).with_padding((1, 1));
/// let conv = Conv2d::from_config(&context, "conv1", config);
/// let output = conv.forward(&input);
/// ```
pub struct Conv2d {
    /// Symbolic descriptor for weight tensor [C_out, C_in/groups, kH, kW].
    pub weight: Tensor,
    /// Optional symbolic descriptor for bias [C_out].
    pub bias: Option<Tensor>,
    /// Layer configuration.
    pub config: Conv2dConfig,
}

impl Conv2d {
    /// Creates a new Conv2d layer with stride 1, no padding and a bias.
    ///
    /// # Arguments
    ///
    /// * `context` - Reference to GraphContext
    /// * `name` - Base name for parameters
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `kernel_size` - Kernel size (kH, kW)
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
    ) -> Self {
        let config = Conv2dConfig::new(in_channels, out_channels, kernel_size);
        Self::from_config(context, name, config)
    }

    /// Creates Conv2d layer from configuration.
    ///
    /// Parameters are registered with shapes taken from `config`, so the
    /// configuration must be final at this point.
    pub fn from_config(context: &Rc<RefCell<GraphContext>>, name: &str, config: Conv2dConfig) -> Self {
        let shape = config.weight_shape();
        let init = ParamInit::fan_in(shape[1] * shape[2] * shape[3]);
        let weight = Tensor::new_parameter(context, &format!("{}.weight", name), &shape, init);

        let bias = if config.bias {
            Some(Tensor::new_parameter(context, &format!("{}.bias", name), &[config.out_channels], init))
        } else {
            None
        };

        Self { weight, bias, config }
    }
}

impl Module for Conv2d {
    /// Applies convolution to input.
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.conv2d(
            &self.weight,
            self.bias.as_ref(),
            self.config.stride,
            self.config.padding,
            self.config.dilation,
            self.config.groups,
        )
    }

    /// Returns trainable parameters of the layer.
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }
}

/// Transposed 2D convolutional layer (deconvolution).
///
/// Used for increasing spatial dimensions (learned upsampling in a decoder).
pub struct ConvTranspose2d {
    /// Weights [C_in, C_out/groups, kH, kW].
    pub weight: Tensor,
    /// Optional bias [C_out].
    pub bias: Option<Tensor>,
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    /// Extra rows/columns added on the bottom/right of the output.
    pub output_padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl ConvTranspose2d {
    /// Creates a new ConvTranspose2d layer with a bias, stride 1 and no padding.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
    ) -> Self {
        let init = ParamInit::fan_in(out_channels * kernel_size.0 * kernel_size.1);
        let weight = Tensor::new_parameter(
            context,
            &format!("{}.weight", name),
            &[in_channels, out_channels, kernel_size.0, kernel_size.1],
            init,
        );
        let bias = Some(Tensor::new_parameter(context, &format!("{}.bias", name), &[out_channels], init));

        Self { weight, bias, stride: (1, 1), padding: (0, 0), output_padding: (0, 0), dilation: (1, 1), groups: 1 }
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_output_padding(mut self, output_padding: (usize, usize)) -> Self {
        self.output_padding = output_padding;
        self
    }

    /// Drops the bias from the forward pass and from `parameters()`.
    /// Its spec stays registered in the context.
    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }
}

impl Module for ConvTranspose2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.conv_transpose2d(
            &self.weight,
            self.bias.as_ref(),
            self.stride,
            self.padding,
            self.output_padding,
            self.dilation,
            self.groups,
        )
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::test_util::infer_shape;

    #[test]
    fn test_conv2d_creation() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let config = Conv2dConfig::new(3, 64, (3, 3)).with_padding((1, 1)).with_stride((1, 1));
        let conv = Conv2d::from_config(&context, "conv1", config);

        assert_eq!(conv.config.in_channels, 3);
        assert_eq!(conv.config.out_channels, 64);
        assert_eq!(conv.config.kernel_size, (3, 3));
        assert_eq!(conv.config.padding, (1, 1));
        assert!(conv.bias.is_some());
        assert_eq!(conv.parameter_count(), 64 * 3 * 9 + 64);
    }

    #[test]
    fn test_conv2d_forward_shape() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let input = Tensor::new_input(&context, "x");
        let config = Conv2dConfig::new(3, 8, (3, 3)).with_padding((1, 1)).with_stride((2, 2));
        let output = Conv2d::from_config(&context, "conv1", config).forward(&input);

        assert_eq!(infer_shape(&context, &output, &[("x", &[2, 3, 16, 15])]).unwrap(), vec![2, 8, 8, 8]);
    }

    #[test]
    fn test_conv2d_no_bias() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let config = Conv2dConfig::new(3, 64, (3, 3)).with_bias(false);
        let conv = Conv2d::from_config(&context, "conv1", config);

        assert!(conv.bias.is_none());
        assert_eq!(conv.parameters().len(), 1);
        assert!(context.borrow().param_spec("conv1.bias").is_none());
    }

    #[test]
    fn test_grouped_weight_shape() {
        let config = Conv2dConfig::new(8, 16, (3, 3)).with_groups(4);
        assert_eq!(config.weight_shape(), [16, 2, 3, 3]);
    }

    #[test]
    fn test_conv_transpose2d() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let input = Tensor::new_input(&context, "x");
        let deconv = ConvTranspose2d::new(&context, "deconv1", 64, 3, (4, 4)).with_stride((2, 2)).with_padding((1, 1));

        let output = deconv.forward(&input);
        assert_eq!(deconv.parameters().len(), 2); // weight + bias
        assert_eq!(infer_shape(&context, &output, &[("x", &[1, 64, 8, 8])]).unwrap(), vec![1, 3, 16, 16]);
    }
}
