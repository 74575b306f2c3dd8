//! Модуль, содержащий реализации оптимизаторов для обновления весов модели.
//!
//! Оптимизаторы работают с реальными числовыми данными (`Value`) на CPU.
//! Они получают текущие веса и вычисленные градиенты и применяют
//! алгоритм обновления.

use crate::asg::Value;
use ndarray::ArrayD;
use std::collections::HashMap;

/// Трейт, определяющий общий интерфейс для всех оптимизаторов.
pub trait Optimizer {
    /// Выполняет один шаг оптимизации, обновляя веса.
    ///
    /// # Аргументы
    ///
    /// * `parameters` - Изменяемый `HashMap`, содержащий текущие значения весов модели.
    ///   Ключ - это имя параметра (например, "logits.weights").
    /// * `gradients` - `HashMap`, содержащий вычисленные значения градиентов для этих весов.
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>);
}

/// Оптимизатор Adam с коррекцией смещения моментов.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    /// Номер шага (для коррекции смещения).
    t: i32,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self::with_betas(lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self { lr, beta1, beta2, epsilon, t: 0, m: HashMap::new(), v: HashMap::new() }
    }

    /// Количество выполненных шагов.
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>) {
        self.t += 1;
        // lr_t = lr * sqrt(1 - b2^t) / (1 - b1^t)
        let lr_t = self.lr * (1.0 - self.beta2.powi(self.t)).sqrt() / (1.0 - self.beta1.powi(self.t));
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for (param_name, grad_value) in gradients {
            if let (Some(Value::Tensor(param_value)), Value::Tensor(grad_tensor)) =
                (parameters.get_mut(param_name), grad_value)
            {
                let m = self
                    .m
                    .entry(param_name.clone())
                    .or_insert_with(|| ArrayD::zeros(grad_tensor.raw_dim()));
                let v = self
                    .v
                    .entry(param_name.clone())
                    .or_insert_with(|| ArrayD::zeros(grad_tensor.raw_dim()));
                ndarray::azip!((p in param_value, m in m, v in v, &g in grad_tensor) {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + epsilon);
                });
            }
        }
    }
}

/// L2-норма тензора.
pub fn l2_norm(tensor: &ArrayD<f32>) -> f32 {
    tensor.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Ограничивает норму каждого градиента по отдельности: градиент с нормой
/// больше `max_norm` масштабируется до `max_norm`.
///
/// Возвращает глобальную норму до ограничения (для логирования).
pub fn clip_gradient_norms(gradients: &mut HashMap<String, Value>, max_norm: f32) -> f32 {
    let mut global = 0.0f32;
    for grad in gradients.values_mut() {
        if let Value::Tensor(tensor) = grad {
            let norm = l2_norm(tensor);
            global += norm * norm;
            if max_norm > 0.0 && norm > max_norm {
                let scale = max_norm / norm;
                tensor.mapv_inplace(|g| g * scale);
            }
        }
    }
    global.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        // На первом шаге |Δp| ≈ lr независимо от масштаба градиента.
        let mut params = HashMap::from([("w".to_string(), Value::Tensor(array![1.0f32, -1.0].into_dyn()))]);
        let grads = HashMap::from([("w".to_string(), Value::Tensor(array![100.0f32, -0.01].into_dyn()))]);
        let mut adam = Adam::new(0.1);
        adam.step(&mut params, &grads);
        let w = params["w"].as_tensor().unwrap();
        assert!((w[[0]] - 0.9).abs() < 1e-4);
        assert!((w[[1]] + 0.9).abs() < 1e-3);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_clip_each_gradient_by_own_norm() {
        let mut grads = HashMap::from([
            ("a".to_string(), Value::Tensor(array![3.0f32, 4.0].into_dyn())),
            ("b".to_string(), Value::Tensor(array![0.3f32, 0.4].into_dyn())),
        ]);
        clip_gradient_norms(&mut grads, 1.0);
        let a = grads["a"].as_tensor().unwrap();
        assert!((l2_norm(a) - 1.0).abs() < 1e-6);
        // норма 0.5 < 1.0: градиент не меняется
        assert_eq!(grads["b"].as_tensor().unwrap(), &array![0.3f32, 0.4].into_dyn());
    }
}
