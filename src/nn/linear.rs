//! Модуль, реализующий полносвязный (линейный) слой в графовой парадигме.

use crate::nn::module::Module;
use crate::tensor::{GraphContext, ParamInit, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Полносвязный (линейный) слой.
///
/// В графовой архитектуре этот слой не хранит реальных данных. Вместо этого
/// он владеет символьными `Tensor`-дескрипторами, которые представляют его
/// веса (`weights`, форма `[in, out]`) и смещения (`bias`, форма `[out]`)
/// как узлы `Parameter` в ASG.
///
/// Метод `forward` добавляет в граф операции, соответствующие формуле `y = xW + b`.
pub struct Linear {
    pub weights: Tensor,
    pub bias: Tensor,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    /// Создает новый полносвязный слой, регистрируя его параметры в графе.
    ///
    /// # Аргументы
    ///
    /// * `context` - Ссылка на `GraphContext`, в котором будет строиться граф.
    /// * `in_features` - Количество входных признаков.
    /// * `out_features` - Количество выходных признаков.
    /// * `name` - Базовое имя слоя, чтобы параметры имели уникальные
    ///   имена в графе (например, "layer1.weights", "layer1.bias").
    pub fn new(context: &Rc<RefCell<GraphContext>>, in_features: usize, out_features: usize, name: &str) -> Self {
        // Оба параметра: U(-1/sqrt(in), 1/sqrt(in)).
        let init = ParamInit::fan_in(in_features);
        let weights = Tensor::new_parameter(context, &format!("{}.weights", name), &[in_features, out_features], init);
        let bias = Tensor::new_parameter(context, &format!("{}.bias", name), &[out_features], init);

        Self { weights, bias, in_features, out_features }
    }
}

impl Module for Linear {
    /// Добавляет в граф `inputs.dot(weights) + bias` для входа `[B, in]`.
    fn forward(&self, inputs: &Tensor) -> Tensor {
        &inputs.dot(&self.weights) + &self.bias
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}
