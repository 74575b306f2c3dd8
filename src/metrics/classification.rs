//! Метрики для задач классификации.
//!
//! Предсказания и метки: индексы классов, записанные как `f32`.
//! Если у предсказаний есть ось классов, берётся argmax по ней.

use super::Metric;
use ndarray::{ArrayD, Axis};

fn class_indices(values: &ArrayD<f32>) -> Vec<usize> {
    if values.ndim() > 1 && values.shape().last().copied().unwrap_or(1) > 1 {
        let last = Axis(values.ndim() - 1);
        values
            .map_axis(last, |lane| {
                let mut best = 0;
                for (i, &v) in lane.iter().enumerate() {
                    if v > lane[best] {
                        best = i;
                    }
                }
                best
            })
            .iter()
            .copied()
            .collect()
    } else {
        values.iter().map(|&v| v.round().max(0.0) as usize).collect()
    }
}

/// Метрика точности (Accuracy) для классификации.
///
/// Accuracy = correct / total
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for Accuracy {
    type Prediction = ArrayD<f32>;
    type Target = ArrayD<f32>;
    type Output = f64;

    fn update(&mut self, predictions: &Self::Prediction, targets: &Self::Target) {
        for (pred, target) in class_indices(predictions).into_iter().zip(class_indices(targets)) {
            if pred == target {
                self.correct += 1;
            }
            self.total += 1;
        }
    }

    fn compute(&self) -> Self::Output {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }

    fn name(&self) -> &str {
        "Accuracy"
    }
}

/// Средняя по классам точность.
///
/// Для каждого класса считается доля верных предсказаний среди позиций с
/// этой меткой; среднее берётся по классам, встретившимся в метках.
#[derive(Debug, Clone)]
pub struct MeanPerClassAccuracy {
    correct: Vec<usize>,
    total: Vec<usize>,
}

impl MeanPerClassAccuracy {
    pub fn new(num_classes: usize) -> Self {
        Self { correct: vec![0; num_classes], total: vec![0; num_classes] }
    }

    /// Точность по каждому классу; `None` для классов без примеров.
    pub fn per_class(&self) -> Vec<Option<f64>> {
        self.correct
            .iter()
            .zip(&self.total)
            .map(|(&c, &t)| if t == 0 { None } else { Some(c as f64 / t as f64) })
            .collect()
    }
}

impl Metric for MeanPerClassAccuracy {
    type Prediction = ArrayD<f32>;
    type Target = ArrayD<f32>;
    type Output = f64;

    fn update(&mut self, predictions: &Self::Prediction, targets: &Self::Target) {
        for (pred, target) in class_indices(predictions).into_iter().zip(class_indices(targets)) {
            if target >= self.total.len() {
                continue;
            }
            self.total[target] += 1;
            if pred == target {
                self.correct[target] += 1;
            }
        }
    }

    /// Среднее по всем `num_classes`: отсутствующие классы дают 0.
    fn compute(&self) -> Self::Output {
        if self.total.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.per_class().into_iter().flatten().sum();
        sum / self.total.len() as f64
    }

    fn reset(&mut self) {
        self.correct.iter_mut().for_each(|c| *c = 0);
        self.total.iter_mut().for_each(|t| *t = 0);
    }

    fn name(&self) -> &str {
        "MeanPerClassAccuracy"
    }
}

/// Recall = TP / (TP + FN) для бинарных меток и предсказаний (порог 0.5).
#[derive(Debug, Clone, Default)]
pub struct Recall {
    true_positives: usize,
    false_negatives: usize,
}

impl Recall {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for Recall {
    type Prediction = ArrayD<f32>;
    type Target = ArrayD<f32>;
    type Output = f64;

    fn update(&mut self, predictions: &Self::Prediction, targets: &Self::Target) {
        for (pred, target) in predictions.iter().zip(targets.iter()) {
            if *target >= 0.5 {
                if *pred >= 0.5 {
                    self.true_positives += 1;
                } else {
                    self.false_negatives += 1;
                }
            }
        }
    }

    fn compute(&self) -> Self::Output {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    fn reset(&mut self) {
        self.true_positives = 0;
        self.false_negatives = 0;
    }

    fn name(&self) -> &str {
        "Recall"
    }
}
