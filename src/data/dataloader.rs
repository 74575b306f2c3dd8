// --- Файл: src/data/dataloader.rs ---

//! PaddedBatchLoader - итератор по дополненным батчам последовательностей.

use super::dataset::{SequenceExample, SequenceSource};
use ndarray::{s, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Батч последовательностей, приведённых к одной длине.
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    /// Входы `[batch, num_steps, input_size]`, нули после конца последовательности
    pub inputs: ArrayD<f32>,
    /// Метки `[batch, num_steps]`, нули после конца последовательности
    pub labels: ArrayD<f32>,
    /// Истинные длины `[batch]`, не больше `num_steps`
    pub lengths: ArrayD<f32>,
    /// Индексы примеров в этом батче
    pub indices: Vec<usize>,
}

impl PaddedBatch {
    /// Собирает батч из примеров, дополняя нулями или обрезая до `num_steps`.
    pub fn from_examples(examples: &[SequenceExample], num_steps: usize, input_size: usize) -> Self {
        let batch = examples.len();
        let mut inputs = ArrayD::zeros(IxDyn(&[batch, num_steps, input_size]));
        let mut labels = ArrayD::zeros(IxDyn(&[batch, num_steps]));
        let mut lengths = ArrayD::zeros(IxDyn(&[batch]));

        for (b, example) in examples.iter().enumerate() {
            let len = example.len().min(num_steps);
            inputs
                .slice_mut(s![b, ..len, ..])
                .assign(&example.inputs.slice(s![..len, ..]));
            for (t, &label) in example.labels.iter().take(len).enumerate() {
                labels[[b, t]] = label as f32;
            }
            lengths[[b]] = len as f32;
        }

        Self { inputs, labels, lengths, indices: (0..batch).collect() }
    }

    /// Возвращает размер батча.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Проверяет, пуст ли батч.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Загрузчик полных батчей фиксированной длины.
///
/// Неполный последний батч всегда отбрасывается: граф строится под
/// фиксированный `batch_size`.
///
/// # Пример
///
/// ```rust,ignore
/// let loader = PaddedBatchLoader::new(dataset, 64, 128).shuffle(true).seed(1);
/// for batch in loader.iter() {
///     println!("Batch size: {}", batch.len());
/// }
/// ```
pub struct PaddedBatchLoader<S: SequenceSource> {
    source: S,
    batch_size: usize,
    num_steps: usize,
    shuffle: bool,
    seed: Option<u64>,
}

impl<S: SequenceSource> PaddedBatchLoader<S> {
    /// Создает новый загрузчик.
    ///
    /// # Аргументы
    ///
    /// * `source` - Источник последовательностей
    /// * `batch_size` - Размер батча
    /// * `num_steps` - Длина, к которой приводится каждая последовательность
    pub fn new(source: S, batch_size: usize, num_steps: usize) -> Self {
        Self { source, batch_size, num_steps, shuffle: false, seed: None }
    }

    /// Включает/выключает перемешивание данных.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Устанавливает seed для воспроизводимости.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Возвращает количество полных батчей.
    pub fn num_batches(&self) -> usize {
        if self.batch_size == 0 {
            0
        } else {
            self.source.len() / self.batch_size
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Создает итератор по батчам.
    pub fn iter(&self) -> PaddedBatchIter<'_, S> {
        let mut order: Vec<usize> = (0..self.source.len()).collect();
        if self.shuffle {
            let mut rng = match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            order.shuffle(&mut rng);
        }
        PaddedBatchIter { loader: self, order, position: 0 }
    }
}

/// Итератор по батчам.
pub struct PaddedBatchIter<'a, S: SequenceSource> {
    loader: &'a PaddedBatchLoader<S>,
    order: Vec<usize>,
    position: usize,
}

impl<'a, S: SequenceSource> Iterator for PaddedBatchIter<'a, S> {
    type Item = PaddedBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let batch_size = self.loader.batch_size;
        if batch_size == 0 || self.position + batch_size > self.order.len() {
            return None;
        }
        let indices = self.order[self.position..self.position + batch_size].to_vec();
        self.position += batch_size;

        let examples = indices
            .iter()
            .map(|&i| self.loader.source.get(i))
            .collect::<Option<Vec<_>>>()?;
        let mut batch =
            PaddedBatch::from_examples(&examples, self.loader.num_steps, self.loader.source.input_size());
        batch.indices = indices;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemorySequenceDataset;
    use ndarray::Array2;

    fn dataset() -> InMemorySequenceDataset {
        let examples = (1..=5)
            .map(|len| SequenceExample {
                inputs: Array2::from_elem((len, 2), len as f32),
                labels: vec![len; len],
            })
            .collect();
        InMemorySequenceDataset::new(examples).unwrap()
    }

    #[test]
    fn test_batches_are_full_and_padded() {
        let loader = PaddedBatchLoader::new(dataset(), 2, 3);
        assert_eq!(loader.num_batches(), 2);

        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 2);

        let first = &batches[0];
        assert_eq!(first.inputs.shape(), &[2, 3, 2]);
        assert_eq!(first.lengths.as_slice().unwrap(), &[1.0, 2.0]);
        // первый пример длины 1: после него нули
        assert_eq!(first.inputs[[0, 0, 0]], 1.0);
        assert_eq!(first.inputs[[0, 1, 0]], 0.0);
        assert_eq!(first.labels[[1, 1]], 2.0);
        assert_eq!(first.labels[[1, 2]], 0.0);

        // пример длины 4 обрезан до 3 шагов
        assert_eq!(batches[1].lengths.as_slice().unwrap(), &[3.0, 3.0]);
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let a: Vec<_> = PaddedBatchLoader::new(dataset(), 1, 2).shuffle(true).seed(3).iter().map(|b| b.indices).collect();
        let b: Vec<_> = PaddedBatchLoader::new(dataset(), 1, 2).shuffle(true).seed(3).iter().map(|b| b.indices).collect();
        assert_eq!(a, b);
        let mut sorted: Vec<usize> = a.into_iter().flatten().collect();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    }
}
