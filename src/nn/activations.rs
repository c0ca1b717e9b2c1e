//! Модуль, содержащий слои-активации, реализованные для графовой архитектуры.

use crate::nn::module::Module;
use crate::tensor::Tensor;

// --- Слой ReLU ---

/// Слой активации ReLU (Rectified Linear Unit) в графовой парадигме.
///
/// Применяет поэлементную функцию `max(0, x)`.
/// Этот слой не имеет обучаемых параметров.
pub struct ReLU;

impl ReLU {
    pub fn new() -> Self {
        ReLU {}
    }
}

impl Default for ReLU {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ReLU {
    /// Прямой проход добавляет в граф узел `ReLU`.
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.relu()
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

// --- Слой Sin ---

/// Периодическая активация `sin(x)`, используется во временном кодировании.
pub struct Sin;

impl Module for Sin {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.sin()
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn activations_add_one_node_and_no_parameters() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = Sin.forward(&ReLU::new().forward(&x));
        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(graph.nodes.len(), 3);
        assert!(matches!(graph.get_node(y.node_id).unwrap().node_type, NodeType::Sin(_)));
        assert_eq!(Sin.parameter_count() + ReLU.parameter_count(), 0);
    }
}
