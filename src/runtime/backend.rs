//! Модуль, определяющий абстрактный интерфейс (трейт) для исполнительных бэкендов.

use crate::asg::{Asg, AsgId, NodeId, NodeType};
use std::collections::HashMap;
use thiserror::Error;

/// Ошибки, которые могут возникнуть во время выполнения (интерпретации) графа.
/// Этот тип ошибок является общим для всех бэкендов.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Узел с ID {0} не найден в графе {1}. Проверьте, что граф был корректно построен и все узлы существуют.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Граф с ID {0} не найден в контексте выполнения. Убедитесь, что граф был зарегистрирован перед выполнением.")]
    GraphNotFound(AsgId),

    #[error("Несоответствие типов: операция ожидала {expected}, но получила {actual}. Проверьте типы входных данных.")]
    TypeError { expected: String, actual: String },

    #[error("Ошибка формы тензора: {0}. Проверьте размерности входных тензоров.")]
    ShapeError(String),

    #[error("Отсутствует значение для входа '{0}' (узел ID: {1}). Добавьте это значение в initial_data при вызове backend.run().")]
    MissingInput(String, NodeId),

    #[error("Отсутствует значение для параметра '{0}' (узел ID: {1}). Инициализируйте параметр перед выполнением графа.")]
    MissingParameter(String, NodeId),

    #[error("Операция '{0}' не реализована в текущем бэкенде. Рассмотрите использование альтернативной операции или реализуйте поддержку.")]
    UnimplementedOperation(String),

    #[error("Ошибка вычисления: {0}")]
    ComputationError(String),

}

/// Кэш для хранения уже вычисленных значений узлов.
/// Ключ - это (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Трейт, определяющий общий интерфейс для исполнительной среды (бэкенда).
///
/// Любая структура, реализующая этот трейт, может взять ASG и данные
/// и выполнить вычисления, возвращая результат.
pub trait Backend {
    /// Тип, представляющий данные, специфичные для устройства.
    type DeviceData: std::fmt::Debug;

    /// Выполняет граф, используя и обновляя кэш вычислений.
    ///
    /// # Аргументы
    /// * `main_asg` - Основной граф для выполнения.
    /// * `initial_memo` - Кэш с начальными данными (входы, параметры) и, возможно,
    ///   результатами предыдущих вычислений (для связанных графов).
    ///
    /// # Возвращает
    /// Кортеж, содержащий:
    /// 1. Вектор с выходными данными графа.
    /// 2. Финальное состояние кэша `Memo` со всеми промежуточными результатами.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;
}

/// Строит начальный кэш, связывая значения с узлами `Input`/`Parameter` по имени.
///
/// Имена, которых нет в графе, пропускаются: один и тот же набор параметров
/// подаётся в графы разных режимов.
pub fn bind_named<T: Clone>(asg: &Asg, data: &HashMap<String, T>) -> Memo<T> {
    let mut memo = Memo::new();
    for node in asg.nodes.values() {
        if let NodeType::Input { name } | NodeType::Parameter { name } = &node.node_type {
            if let Some(value) = data.get(name) {
                memo.insert((asg.id, node.id), value.clone());
            }
        }
    }
    memo
}
