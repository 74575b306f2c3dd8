//! Модуль метрик для оценки качества моделей.
//!
//! Все метрики потоковые: состояние накапливается между вызовами `update`
//! и сбрасывается `reset`.
//! - **Классификация**: Accuracy, MeanPerClassAccuracy, Recall
//! - **Агрегаты**: RunningMean
//!
//! # Пример использования
//!
//! ```rust,ignore
//! use structured_melody_rnn::metrics::{Accuracy, Metric};
//!
//! let mut accuracy = Accuracy::new();
//! accuracy.update(&predictions, &targets);
//! println!("Accuracy: {:.4}", accuracy.compute());
//! accuracy.reset();
//! ```

pub mod classification;
pub mod running;

pub use classification::{Accuracy, MeanPerClassAccuracy, Recall};
pub use running::RunningMean;

/// Базовый трейт для всех метрик.
pub trait Metric: Send + Sync {
    /// Тип предсказания
    type Prediction;
    /// Тип целевого значения
    type Target;
    /// Тип результата метрики
    type Output;

    /// Обновляет состояние метрики новыми данными.
    fn update(&mut self, predictions: &Self::Prediction, targets: &Self::Target);

    /// Вычисляет текущее значение метрики.
    fn compute(&self) -> Self::Output;

    /// Сбрасывает состояние метрики.
    fn reset(&mut self);

    /// Возвращает имя метрики.
    fn name(&self) -> &str;
}
