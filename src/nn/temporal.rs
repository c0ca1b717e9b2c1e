//! Encoding of a scalar time/conditioning signal into an embedding vector.

use crate::nn::activations::Sin;
use crate::nn::linear::Linear;
use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Default embedding width.
pub const DEFAULT_N_EMB: usize = 100;

/// `[B, 1] -> Linear(1, 2n) -> sin -> Linear(2n, n) -> [B, n]`.
///
/// The forward pass has no randomness: equal inputs and parameters always
/// give equal embeddings.
pub struct TemporalEncoding {
    pub inp: Linear,
    pub act: Sin,
    pub out: Linear,
    pub n_emb: usize,
}

impl TemporalEncoding {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, n_emb: usize) -> Self {
        Self {
            inp: Linear::new(context, 1, 2 * n_emb, &format!("{}.inp", name)),
            act: Sin,
            out: Linear::new(context, 2 * n_emb, n_emb, &format!("{}.out", name)),
            n_emb,
        }
    }
}

impl Module for TemporalEncoding {
    fn forward(&self, t: &Tensor) -> Tensor {
        self.out.forward(&self.act.forward(&self.inp.forward(t)))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.inp.parameters();
        params.extend(self.out.parameters());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::test_util::{evaluate, infer_shape};
    use ndarray::{array, Axis};

    #[test]
    fn embeds_each_scalar() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let t = Tensor::new_input(&ctx, "t");
        let enc = TemporalEncoding::new(&ctx, "time", 16);
        let emb = enc.forward(&t);

        assert_eq!(infer_shape(&ctx, &emb, &[("t", &[3, 1])]).unwrap(), vec![3, 16]);
        assert_eq!(enc.parameter_count(), (32 + 32) + (32 * 16 + 16));
    }

    #[test]
    fn equal_times_give_equal_embeddings() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let t = Tensor::new_input(&ctx, "t");
        let emb = TemporalEncoding::new(&ctx, "time", DEFAULT_N_EMB).forward(&t);

        let times = array![[0.25f32], [0.25], [0.75]].into_dyn();
        let first = evaluate(&ctx, &emb, &[("t", times.clone())], 9);
        let second = evaluate(&ctx, &emb, &[("t", times)], 9);

        assert_eq!(first, second);
        assert_eq!(first.index_axis(Axis(0), 0), first.index_axis(Axis(0), 1));
        assert_ne!(first.index_axis(Axis(0), 0), first.index_axis(Axis(0), 2));
    }
}
