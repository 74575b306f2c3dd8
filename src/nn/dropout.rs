//! Dropout слой для регуляризации.
//!
//! Случайно обнуляет элементы выхода во время обучения. Маска строится узлом
//! `DropoutMask` и сэмплируется бэкендом при каждом исполнении графа.

use crate::nn::Module;
use crate::tensor::Tensor;

/// Слой Dropout для регуляризации.
///
/// Во время обучения обнуляет элементы с вероятностью `p`,
/// масштабируя остальные на 1/(1-p) для сохранения математического ожидания.
///
/// В режиме inference в граф не добавляется ни одного узла.
///
/// # Пример
/// ```ignore
/// let dropout = Dropout::from_keep_prob(0.5);
/// let y = dropout.forward(&x); // x * mask
/// ```
#[derive(Debug, Clone)]
pub struct Dropout {
    /// Вероятность обнуления (0.0 - 1.0)
    pub p: f32,
    /// Флаг режима обучения
    pub training: bool,
}

impl Dropout {
    /// Создаёт новый слой Dropout.
    ///
    /// # Panics
    /// Паникует если `p` не в диапазоне [0, 1)
    pub fn new(p: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&p),
            "Dropout probability must be in [0, 1), got {}",
            p
        );
        Self { p, training: true }
    }

    /// Dropout, заданный вероятностью сохранения элемента.
    pub fn from_keep_prob(keep_prob: f32) -> Self {
        Self::new(1.0 - keep_prob)
    }

    /// Устанавливает режим обучения.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Устанавливает режим inference.
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Проверяет, включен ли dropout.
    pub fn is_training(&self) -> bool {
        self.training && self.p > 0.0
    }
}

impl Default for Dropout {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Module for Dropout {
    fn forward(&self, x: &Tensor) -> Tensor {
        if !self.is_training() {
            return x.clone();
        }
        let mask = x.dropout_mask(1.0 - self.p);
        x * &mask
    }

    fn parameters(&self) -> Vec<Tensor> {
        // Dropout не имеет обучаемых параметров
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
    fn test_dropout_modes() {
        let mut dropout = Dropout::from_keep_prob(0.7);
        assert!((dropout.p - 0.3).abs() < 1e-6);

        dropout.eval();
        assert!(!dropout.is_training());

        dropout.train();
        assert!(dropout.is_training());
    }

    #[test]
    fn test_eval_mode_adds_no_nodes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let mut dropout = Dropout::new(0.5);
        dropout.eval();
        let y = dropout.forward(&x);
        assert_eq!(y.node_id, x.node_id);
        assert_eq!(ctx.borrow().main_graph().nodes.len(), 1);
    }

    #[test]
    fn test_training_mode_multiplies_by_mask() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = Dropout::new(0.25).forward(&x);
        let graph = ctx.borrow().main_graph().clone();
        assert!(graph
            .nodes
            .values()
            .any(|n| matches!(n.node_type, NodeType::DropoutMask { keep_prob, .. } if (keep_prob - 0.75).abs() < 1e-6)));
        assert!(matches!(graph.get_node(y.node_id).unwrap().node_type, NodeType::Multiply(..)));
    }

    #[test]
    #[should_panic(expected = "Dropout probability must be in [0, 1)")]
    fn test_dropout_invalid_p() {
        Dropout::new(1.5);
    }
}
