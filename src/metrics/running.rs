//! Утилиты для отслеживания статистик в реальном времени.

/// Онлайн вычисление среднего значения.
///
/// Использует инкрементальный алгоритм для численной стабильности.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    mean: f64,
    count: usize,
}

impl RunningMean {
    /// Создает новый RunningMean.
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавляет значение.
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
    }

    /// Добавляет несколько значений.
    pub fn update_batch(&mut self, values: &[f64]) {
        for &v in values {
            self.update(v);
        }
    }

    /// Возвращает текущее среднее.
    pub fn compute(&self) -> f64 {
        self.mean
    }

    /// Возвращает количество добавленных значений.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Сбрасывает состояние.
    pub fn reset(&mut self) {
        self.mean = 0.0;
        self.count = 0;
    }
}
