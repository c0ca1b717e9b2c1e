//! Assembled U-Net models.

use crate::nn::module::{ConditionedModule, Module};
use crate::nn::temporal::TemporalEncoding;
use crate::nn::unet_parts::{DoubleConv, DoubleConvTime, Down, OutConv, Up};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Channel widths of the five encoder levels for a base width `b`:
/// `b, 2b, 4b, 8b, 16b / factor`, where `factor` is 2 in bilinear mode.
fn level_widths(base: usize, bilinear: bool) -> [usize; 5] {
    let factor = if bilinear { 2 } else { 1 };
    [base, base * 2, base * 4, base * 8, base * 16 / factor]
}

/// Encoder/decoder shared by both models: downs, ups and the head.
struct Trunk {
    downs: [Down; 4],
    ups: [Up; 4],
    outc: OutConv,
}

impl Trunk {
    fn new(context: &Rc<RefCell<GraphContext>>, n_classes: usize, base: usize, bilinear: bool) -> Self {
        let w = level_widths(base, bilinear);
        let factor = if bilinear { 2 } else { 1 };
        Self {
            downs: [
                Down::new(context, "down1", w[0], w[1]),
                Down::new(context, "down2", w[1], w[2]),
                Down::new(context, "down3", w[2], w[3]),
                Down::new(context, "down4", w[3], w[4]),
            ],
            ups: [
                Up::new(context, "up1", base * 16, base * 8 / factor, bilinear),
                Up::new(context, "up2", base * 8, base * 4 / factor, bilinear),
                Up::new(context, "up3", base * 4, base * 2 / factor, bilinear),
                Up::new(context, "up4", base * 2, base, bilinear),
            ],
            outc: OutConv::new(context, "outc", base, n_classes),
        }
    }

    /// Runs the encoder from the stem output. Returns the skip tensors,
    /// shallowest first, and the bottleneck.
    fn encode(&self, stem: Tensor) -> (Vec<Tensor>, Tensor) {
        let mut skips = Vec::with_capacity(self.downs.len());
        let mut x = stem;
        for down in &self.downs {
            let next = down.forward(&x);
            skips.push(x);
            x = next;
        }
        (skips, x)
    }

    /// Decodes `bottleneck` against the skips (shallowest first).
    fn decode(&self, bottleneck: Tensor, skips: &[Tensor]) -> Tensor {
        let mut x = bottleneck;
        for (up, skip) in self.ups.iter().zip(skips.iter().rev()) {
            x = up.forward(&x, skip);
        }
        self.outc.forward(&x)
    }

    fn set_training(&mut self, training: bool) {
        self.downs.iter_mut().for_each(|d| d.set_training(training));
        self.ups.iter_mut().for_each(|u| u.set_training(training));
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params: Vec<Tensor> = self.downs.iter().flat_map(Module::parameters).collect();
        params.extend(self.ups.iter().flat_map(ConditionedModule::parameters));
        params.extend(self.outc.parameters());
        params
    }
}

/// Classic U-Net: `inc`, four `Down`, four `Up`, `outc`.
pub struct UNet {
    pub inc: DoubleConv,
    trunk: Trunk,
    pub n_channels: usize,
    pub n_classes: usize,
    pub bilinear: bool,
}

impl UNet {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        n_channels: usize,
        n_classes: usize,
        base: usize,
        bilinear: bool,
    ) -> Self {
        Self {
            inc: DoubleConv::new(context, "inc", n_channels, base, None),
            trunk: Trunk::new(context, n_classes, base, bilinear),
            n_channels,
            n_classes,
            bilinear,
        }
    }

    /// Switches every batch norm between batch and running statistics.
    /// Affects graphs built after the call.
    pub fn set_training(&mut self, training: bool) {
        self.inc.set_training(training);
        self.trunk.set_training(training);
    }
}

impl Module for UNet {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let (skips, bottleneck) = self.trunk.encode(self.inc.forward(inputs));
        self.trunk.decode(bottleneck, &skips)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.inc.parameters();
        params.extend(self.trunk.parameters());
        params
    }
}

/// U-Net conditioned on a scalar per sample (e.g. a diffusion timestep).
///
/// The scalar is embedded by `TemporalEncoding`. The stem and an extra
/// bottleneck block are `DoubleConvTime` blocks gated by the embedding.
pub struct ConditionedUNet {
    pub time: TemporalEncoding,
    pub inc: DoubleConvTime,
    pub mid: DoubleConvTime,
    trunk: Trunk,
    pub n_channels: usize,
    pub n_classes: usize,
    pub bilinear: bool,
}

impl ConditionedUNet {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        n_channels: usize,
        n_classes: usize,
        base: usize,
        bilinear: bool,
        n_emb: usize,
    ) -> Self {
        let bottom = level_widths(base, bilinear)[4];
        Self {
            time: TemporalEncoding::new(context, "time", n_emb),
            inc: DoubleConvTime::new(context, "inc", n_channels, base, None, n_emb),
            mid: DoubleConvTime::new(context, "mid", bottom, bottom, None, n_emb),
            trunk: Trunk::new(context, n_classes, base, bilinear),
            n_channels,
            n_classes,
            bilinear,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.inc.set_training(training);
        self.mid.set_training(training);
        self.trunk.set_training(training);
    }
}

impl ConditionedModule for ConditionedUNet {
    /// `inputs: [B, C, H, W]`, `condition: [B, 1]`.
    fn forward(&self, inputs: &Tensor, condition: &Tensor) -> Tensor {
        let emb = self.time.forward(condition);
        let (skips, bottleneck) = self.trunk.encode(self.inc.forward(inputs, &emb));
        let bottleneck = self.mid.forward(&bottleneck, &emb);
        self.trunk.decode(bottleneck, &skips)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.time.parameters();
        params.extend(self.inc.parameters());
        params.extend(self.mid.parameters());
        params.extend(self.trunk.parameters());
        params
    }
}
