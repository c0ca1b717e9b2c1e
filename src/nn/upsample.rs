//! Bilinear upsampling layer.

use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Upsamples `[N, C, H, W]` to `[N, C, H*s, W*s]` by bilinear interpolation.
///
/// With `align_corners` the corner pixels of input and output coincide, so
/// the corners are reproduced exactly.
pub struct Upsample {
    pub scale_factor: usize,
    pub align_corners: bool,
}

impl Upsample {
    pub fn bilinear(scale_factor: usize, align_corners: bool) -> Self {
        Self { scale_factor, align_corners }
    }
}

impl Module for Upsample {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.upsample_bilinear2d(self.scale_factor, self.align_corners)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}
