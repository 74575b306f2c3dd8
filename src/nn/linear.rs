//! Модуль, реализующий полносвязный (линейный) слой в графовой парадигме.

use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Полносвязный (линейный) слой.
///
/// В графовой архитектуре этот слой не хранит реальных данных. Вместо этого
/// он владеет символьными `Tensor`-дескрипторами, которые представляют его
/// веса (`weights`, форма `[in, out]`) и смещения (`bias`, форма `[1, out]`)
/// как узлы `Parameter` в ASG.
///
/// Метод `forward` добавляет в граф операции, соответствующие формуле `y = xW + b`.
/// Вход может иметь любой ранг `>= 2`: последняя ось умножается на `W`.
pub struct Linear {
    /// Символьный дескриптор для тензора весов.
    pub weights: Tensor,
    /// Символьный дескриптор для тензора смещений (если есть).
    pub bias: Option<Tensor>,
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
    /// * `name` - Базовое имя для этого слоя, чтобы параметры имели уникальные
    ///   имена в графе (например, "logits.weights", "logits.bias").
    pub fn new(context: &Rc<RefCell<GraphContext>>, in_features: usize, out_features: usize, name: &str) -> Self {
        let mut layer = Self::without_bias(context, in_features, out_features, name);
        layer.bias = Some(Tensor::new_parameter_with_shape(
            context,
            &format!("{}.bias", name),
            vec![1, out_features],
        ));
        layer
    }

    /// Линейное отображение без смещения.
    pub fn without_bias(
        context: &Rc<RefCell<GraphContext>>,
        in_features: usize,
        out_features: usize,
        name: &str,
    ) -> Self {
        // Формы объявляются сразу: по ним анализ форм проверяет граф,
        // а хранилище параметров инициализирует веса.
        let weights = Tensor::new_parameter_with_shape(
            context,
            &format!("{}.weights", name),
            vec![in_features, out_features],
        );
        Self { weights, bias: None, in_features, out_features }
    }
}

impl Module for Linear {
    /// Добавляет в граф операции для прямого прохода через линейный слой.
    ///
    /// Конструирует подграф, соответствующий `inputs.dot(weights) + bias`.
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let dot_product = inputs.dot(&self.weights);
        match &self.bias {
            Some(bias) => &dot_product + bias,
            None => dot_product,
        }
    }

    /// Возвращает список символьных дескрипторов для обучаемых параметров слоя.
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weights.clone()];
        params.extend(self.bias.clone());
        params
    }
}
