// --- Файл: src/data/dataset.rs ---

//! Источники последовательностей для обучения и оценки.

use ndarray::Array2;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DataError {
    #[error("Пример {index}: {inputs} шагов входа, но {labels} меток")]
    LengthMismatch { index: usize, inputs: usize, labels: usize },

    #[error("Пример {index}: ширина признаков {actual}, ожидалась {expected}")]
    FeatureMismatch { index: usize, expected: usize, actual: usize },

    #[error("Датасет не содержит ни одного примера")]
    Empty,
}

/// Одна последовательность: входы `[len, input_size]` и метка на каждом шаге.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceExample {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
}

impl SequenceExample {
    /// Истинная длина последовательности.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Трейт для источников последовательностей.
///
/// Каждый источник должен уметь:
/// - Возвращать количество последовательностей
/// - Возвращать последовательность по индексу
/// - Сообщать ширину вектора признаков
pub trait SequenceSource: Send + Sync {
    /// Возвращает количество последовательностей.
    fn len(&self) -> usize;

    /// Проверяет, пуст ли источник.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Возвращает последовательность по индексу.
    fn get(&self, index: usize) -> Option<SequenceExample>;

    /// Ширина вектора признаков одного шага.
    fn input_size(&self) -> usize;
}

/// Датасет, хранящий последовательности в памяти.
#[derive(Debug, Clone)]
pub struct InMemorySequenceDataset {
    examples: Arc<Vec<SequenceExample>>,
    input_size: usize,
}

impl InMemorySequenceDataset {
    /// Создает датасет, проверяя согласованность примеров.
    pub fn new(examples: Vec<SequenceExample>) -> Result<Self, DataError> {
        let input_size = examples.first().ok_or(DataError::Empty)?.inputs.ncols();
        for (index, example) in examples.iter().enumerate() {
            if example.inputs.nrows() != example.labels.len() {
                return Err(DataError::LengthMismatch {
                    index,
                    inputs: example.inputs.nrows(),
                    labels: example.labels.len(),
                });
            }
            if example.inputs.ncols() != input_size {
                return Err(DataError::FeatureMismatch {
                    index,
                    expected: input_size,
                    actual: example.inputs.ncols(),
                });
            }
        }
        Ok(Self { examples: Arc::new(examples), input_size })
    }
}

impl SequenceSource for InMemorySequenceDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> Option<SequenceExample> {
        self.examples.get(index).cloned()
    }

    fn input_size(&self) -> usize {
        self.input_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(len: usize, width: usize) -> SequenceExample {
        SequenceExample { inputs: Array2::zeros((len, width)), labels: vec![0; len] }
    }

    #[test]
    fn test_in_memory_dataset() {
        let dataset = InMemorySequenceDataset::new(vec![example(3, 2), example(5, 2)]).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.input_size(), 2);
        assert_eq!(dataset.get(1).unwrap().len(), 5);
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn test_rejects_inconsistent_examples() {
        assert_eq!(InMemorySequenceDataset::new(vec![]).unwrap_err(), DataError::Empty);

        let mut bad = example(3, 2);
        bad.labels.pop();
        let err = InMemorySequenceDataset::new(vec![example(1, 2), bad]).unwrap_err();
        assert_eq!(err, DataError::LengthMismatch { index: 1, inputs: 3, labels: 2 });

        let err = InMemorySequenceDataset::new(vec![example(1, 2), example(1, 3)]).unwrap_err();
        assert_eq!(err, DataError::FeatureMismatch { index: 1, expected: 2, actual: 3 });
    }
}
