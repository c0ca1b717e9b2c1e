//! BatchNorm2d слой для графовой архитектуры.
//!
//! Нормализация по каналам тензора `[N, C, H, W]` с режимами train/eval,
//! буферами running statistics и обучаемыми параметрами gamma/beta.

use crate::nn::Module;
use crate::tensor::{GraphContext, ParamInit, Tensor};
use ndarray::arr0;
use std::cell::RefCell;
use std::rc::Rc;

/// Малая константа для численной стабильности.
pub const EPS: f32 = 1e-5;

/// Оси, по которым считаются статистики: N, H, W.
const STAT_AXES: [usize; 3] = [0, 2, 3];

/// Слой Batch Normalization для карт признаков.
///
/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`, статистики по осям N, H, W
/// (одна пара mean/var на канал).
///
/// В режиме обучения использует статистики текущего батча (смещённая
/// дисперсия), в режиме inference использует буферы `running_mean`/`running_var`.
/// Буферы регистрируются в контексте как параметры (нули и единицы), но не
/// входят в `parameters()` и градиентом не обучаются.
pub struct BatchNorm2d {
    /// Обучаемый масштаб `[C]`, инициализируется единицами.
    pub gamma: Tensor,
    /// Обучаемый сдвиг `[C]`, инициализируется нулями.
    pub beta: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    eps: Tensor,
    pub num_features: usize,
    pub training: bool,
    pub name: String,
}

impl BatchNorm2d {
    /// Создаёт новый слой BatchNorm2d в режиме обучения.
    ///
    /// # Аргументы
    /// * `ctx` - Контекст графа для регистрации параметров
    /// * `name` - Уникальное имя слоя
    /// * `num_features` - Число каналов `C`
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, name: &str, num_features: usize) -> Self {
        let gamma = Tensor::new_parameter(ctx, &format!("{}.gamma", name), &[num_features], ParamInit::Ones);
        let beta = Tensor::new_parameter(ctx, &format!("{}.beta", name), &[num_features], ParamInit::Zeros);
        let running_mean =
            Tensor::new_parameter(ctx, &format!("{}.running_mean", name), &[num_features], ParamInit::Zeros);
        let running_var = Tensor::new_parameter(ctx, &format!("{}.running_var", name), &[num_features], ParamInit::Ones);
        let eps = Tensor::new_literal(ctx, arr0(EPS).into_dyn(), &format!("{}.eps", name));

        Self {
            gamma,
            beta,
            running_mean,
            running_var,
            eps,
            num_features,
            training: true,
            name: name.to_string(),
        }
    }

    /// Устанавливает режим обучения.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Устанавливает режим inference.
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// `[C]` -> `[1, C, 1, 1]` для бродкаста по карте признаков.
    fn per_channel(&self, t: &Tensor) -> Tensor {
        t.reshape(&[1, self.num_features, 1, 1])
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let (centered, variance) = if self.training {
            let centered = x - &x.mean_axes(&STAT_AXES);
            let variance = (&centered * &centered).mean_axes(&STAT_AXES);
            (centered, variance)
        } else {
            (x - &self.per_channel(&self.running_mean), self.per_channel(&self.running_var))
        };

        let std = (&variance + &self.eps).sqrt();
        let normalized = &centered / &std;
        &(&normalized * &self.per_channel(&self.gamma)) + &self.per_channel(&self.beta)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::shape_inference::ShapeInference;
    use crate::asg::{DType, Value};
    use crate::nn::init::ParameterStore;
    use crate::nn::test_util::evaluate;
    use crate::runtime::backend::Backend;
    use crate::runtime::cpu_backend::CpuBackend;
    use ndarray::{array, ArrayD, Axis, IxDyn};
    use std::collections::HashMap;

    #[test]
    fn test_batchnorm_creation() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let bn = BatchNorm2d::new(&ctx, "bn1", 4);

        assert_eq!(bn.name, "bn1");
        assert!(bn.training);
        assert_eq!(bn.parameters().len(), 2);
        assert_eq!(bn.parameter_count(), 8);
        assert_eq!(ctx.borrow().param_spec("bn1.running_var").unwrap().init, ParamInit::Ones);
    }

    #[test]
    fn test_batchnorm_train_eval() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let mut bn = BatchNorm2d::new(&ctx, "bn1", 4);

        bn.eval();
        assert!(!bn.training);

        bn.train();
        assert!(bn.training);
    }

    #[test]
    fn training_output_is_standardized_per_channel() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = BatchNorm2d::new(&ctx, "bn", 2).forward(&x);

        let data = ArrayD::from_shape_fn(IxDyn(&[2, 2, 3, 3]), |idx| (idx[1] * 10 + idx[2] * 3 + idx[3] + idx[0]) as f32);
        let out = evaluate(&ctx, &y, &[("x", data)], 0);

        for channel in out.axis_iter(Axis(1)) {
            let n = channel.len() as f32;
            let mean = channel.sum() / n;
            let var = channel.mapv(|v| (v - mean) * (v - mean)).sum() / n;
            assert!(mean.abs() < 1e-4, "mean {}", mean);
            assert!((var - 1.0).abs() < 1e-3, "var {}", var);
        }
    }

    #[test]
    fn eval_mode_uses_fresh_running_stats() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let mut bn = BatchNorm2d::new(&ctx, "bn", 3);
        bn.eval();
        let y = bn.forward(&x);

        // mean 0, var 1: y = x / sqrt(1 + eps).
        let data = ArrayD::from_elem(IxDyn(&[1, 3, 2, 2]), 2.0f32);
        let out = evaluate(&ctx, &y, &[("x", data)], 0);
        let expected = 2.0 / (1.0 + EPS).sqrt();
        assert!(out.iter().all(|&v| (v - expected).abs() < 1e-6));
    }

    #[test]
    fn eval_mode_reads_running_buffers_from_store() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let mut bn = BatchNorm2d::new(&ctx, "bn", 2);
        bn.eval();
        let y = bn.forward(&x);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(y.node_id);
        let shapes = HashMap::from([("x".to_string(), (vec![1, 2, 1, 2], DType::F32))]);
        ShapeInference::run(&mut graph, &shapes).unwrap();

        let mut store = ParameterStore::initialize(&ctx, 0);
        store.insert("bn.running_mean", array![1.0f32, -2.0].into_dyn());
        store.insert("bn.running_var", array![4.0f32, 0.25].into_dyn());
        let data = array![[[[3.0f32, 5.0]], [[-2.0, 0.0]]]].into_dyn();
        let inputs = HashMap::from([("x".to_string(), Value::Tensor(data))]);
        let (outputs, _) = CpuBackend::new().run(&graph, store.bind(&graph, &inputs)).unwrap();

        // (x - mean) / sqrt(var + eps), gamma = 1, beta = 0.
        let out = outputs[0].as_tensor().unwrap();
        let expected = [2.0 / (4.0 + EPS).sqrt(), 4.0 / (4.0 + EPS).sqrt(), 0.0, 2.0 / (0.25 + EPS).sqrt()];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{} != {}", got, want);
        }
    }
}
