//! ASG: Абстрактный семантический граф

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Идентификатор узла
pub type NodeId = usize;
/// Идентификатор графа
pub type AsgId = usize;
/// Форма тензора
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Узел с ID {0} не найден")]
    NodeNotFound(NodeId),
    #[error("Граф с ID {0} не найден")]
    AsgNotFound(AsgId),
    #[error("Неверная форма у узла {0}")]
    InvalidShape(NodeId),
    #[error("Операция не поддерживается: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum DType {
    F32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// ID узла (дублируем ключ HashMap для удобства вызовов в других модулях)
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

/// Операции графа.
///
/// Индексы классов, длины последовательностей и маски хранятся как `f32`,
/// как и все остальные значения графа.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Данные
    Input { name: String },
    Parameter { name: String },
    Literal(Value),
    /// Значение узла другого графа, берётся из кэша выполнения.
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Бинарные (с трансляцией)
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    /// 2D x 2D, [.., m, k] x [k, n] или пакетное [.., m, k] x [.., k, n].
    MatrixMultiply(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),
    Equal(NodeId, NodeId),

    // Унарные
    Negate(NodeId),
    Exp(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Tanh(NodeId),
    /// Softmax по последней оси.
    Softmax(NodeId),
    /// Softmax по префиксу последней оси: для строки запроса `i` из `Q`
    /// допустимы ключи `< K - Q + i + 1`, остальные обнуляются.
    CausalSoftmax(NodeId),
    /// Индекс максимума по последней оси.
    ArgMax(NodeId),

    // Редукции
    Sum(NodeId),

    // Трансформации
    Reshape(NodeId, NodeId),         // второй аргумент: литерал формы (допускается -1)
    ReshapeLike(NodeId, NodeId),     // форма берётся у второго аргумента
    /// Перестановка двух последних осей (ранг не важен).
    MatrixTranspose(NodeId),
    Broadcast(NodeId, NodeId),
    ReduceSumTo(NodeId, NodeId),
    Concat { inputs: Vec<NodeId>, axis: usize },
    Stack { inputs: Vec<NodeId>, axis: usize },
    /// Срез по оси в стиле Python: отрицательные границы считаются с конца.
    Slice { input: NodeId, axis: usize, start: isize, end: Option<isize> },
    /// Выбор одного индекса по оси (ось удаляется).
    Select { input: NodeId, axis: usize, index: usize },

    // Специализированные
    /// [B, W-1+T, F] -> [B, T, F, W]
    ExtractWindows { input: NodeId, window_size: usize },
    OneHot { indices: NodeId, depth: usize },
    /// lengths [B] -> маска [B, maxlen]
    SequenceMask { lengths: NodeId, maxlen: usize },
    /// Маска 0 или 1/keep_prob той же формы, что и вход.
    DropoutMask { like: NodeId, keep_prob: f32 },
    /// logits [N, C], labels [N] -> [N]
    SparseSoftmaxCrossEntropy { logits: NodeId, labels: NodeId },

    // Узлы графа градиентов
    SoftmaxGrad { output: NodeId, grad: NodeId },
    SparseSoftmaxCrossEntropyGrad { logits: NodeId, labels: NodeId, grad: NodeId },
    ExtractWindowsGrad { grad: NodeId, window_size: usize },
    SliceGrad { grad: NodeId, like: NodeId, axis: usize, start: isize, end: Option<isize> },
    SelectGrad { grad: NodeId, like: NodeId, axis: usize, index: usize },
    /// Часть градиента Concat, соответствующая входу `index`.
    ConcatGrad { grad: NodeId, parts: Vec<NodeId>, axis: usize, index: usize },
}

impl NodeType {
    /// Узлы, от которых зависит данный.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::Equal(a, b)
            | NodeType::Reshape(a, b)
            | NodeType::ReshapeLike(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Tanh(a)
            | NodeType::Softmax(a)
            | NodeType::CausalSoftmax(a)
            | NodeType::ArgMax(a)
            | NodeType::Sum(a)
            | NodeType::MatrixTranspose(a) => vec![*a],

            NodeType::Concat { inputs, .. } | NodeType::Stack { inputs, .. } => inputs.clone(),
            NodeType::Slice { input, .. }
            | NodeType::Select { input, .. }
            | NodeType::ExtractWindows { input, .. } => vec![*input],
            NodeType::OneHot { indices, .. } => vec![*indices],
            NodeType::SequenceMask { lengths, .. } => vec![*lengths],
            NodeType::DropoutMask { like, .. } => vec![*like],
            NodeType::SparseSoftmaxCrossEntropy { logits, labels } => vec![*logits, *labels],

            NodeType::SoftmaxGrad { output, grad } => vec![*output, *grad],
            NodeType::SparseSoftmaxCrossEntropyGrad { logits, labels, grad } => {
                vec![*logits, *labels, *grad]
            }
            NodeType::ExtractWindowsGrad { grad, .. } => vec![*grad],
            NodeType::SliceGrad { grad, like, .. } | NodeType::SelectGrad { grad, like, .. } => {
                vec![*grad, *like]
            }
            NodeType::ConcatGrad { grad, parts, .. } => {
                let mut deps = vec![*grad];
                deps.extend(parts.iter().copied());
                deps
            }
        }
    }
}

/// Переводит границы среза в стиле Python в полуинтервал `[start, end)` внутри `0..len`.
pub fn slice_bounds(len: usize, start: isize, end: Option<isize>) -> (usize, usize) {
    let resolve = |i: isize| -> usize {
        if i < 0 {
            (len as isize + i).max(0) as usize
        } else {
            (i as usize).min(len)
        }
    };
    let lo = resolve(start);
    let hi = end.map(resolve).unwrap_or(len);
    (lo, hi.max(lo))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Приводит значение к тензору (скаляр становится тензором нулевого ранга).
    pub fn into_tensor(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    /// Ссылка на тензор, если значение им является.
    pub fn as_tensor(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::Tensor(arr) => Some(arr),
            Value::ScalarF32(_) => None,
        }
    }

    /// Первый элемент значения (для скалярных результатов вроде loss).
    pub fn scalar(&self) -> Option<f32> {
        match self {
            Value::Tensor(arr) => arr.first().copied(),
            Value::ScalarF32(v) => Some(*v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Автопроставление shape/dtype для литералов, чтобы инференс не падал на MissingShapeInfo
        match &node.node_type {
            NodeType::Literal(Value::Tensor(arr)) => {
                node.shape = Some(arr.shape().to_vec());
                node.dtype = Some(DType::F32);
            }
            NodeType::Literal(Value::ScalarF32(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::F32);
            }
            _ => {}
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_inputs(&mut self, inputs: Vec<NodeId>) { self.inputs = inputs; }
    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) { self.outputs = outputs; }

    /// Шорткат для проектов, где вызывается `set_output(node_id)`.
    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }
    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Ищет узел `Input`/`Parameter` по имени.
    pub fn find_named(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find_map(|node| match &node.node_type {
            NodeType::Input { name: n } | NodeType::Parameter { name: n } if n == name => Some(node.id),
            _ => None,
        })
    }

    /// Имена всех параметров графа в порядке их ID.
    pub fn parameter_names(&self) -> Vec<(NodeId, String)> {
        let mut params: Vec<(NodeId, String)> = self
            .nodes
            .values()
            .filter_map(|node| match &node.node_type {
                NodeType::Parameter { name } => Some((node.id, name.clone())),
                _ => None,
            })
            .collect();
        params.sort_by_key(|(id, _)| *id);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_gets_shape() {
        let mut asg = Asg::new(0, None);
        let id = asg.add_node(None, NodeType::Literal(Value::Tensor(ArrayD::zeros(ndarray::IxDyn(&[2, 3])))));
        assert_eq!(asg.get_node(id).unwrap().shape, Some(vec![2, 3]));
    }

    #[test]
    fn test_find_named_and_parameters() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(Some("x".into()), NodeType::Input { name: "x".into() });
        let w = asg.add_node(Some("w".into()), NodeType::Parameter { name: "w".into() });
        asg.add_node(None, NodeType::MatrixMultiply(x, w));
        assert_eq!(asg.find_named("x"), Some(x));
        assert_eq!(asg.parameter_names(), vec![(w, "w".to_string())]);
        assert_eq!(asg.find_named("missing"), None);
    }

    #[test]
    fn test_slice_bounds() {
        assert_eq!(slice_bounds(5, 0, Some(-1)), (0, 4));
        assert_eq!(slice_bounds(5, -2, None), (3, 5));
        assert_eq!(slice_bounds(1, 0, Some(-1)), (0, 0));
        assert_eq!(slice_bounds(0, 0, Some(-1)), (0, 0));
        assert_eq!(slice_bounds(3, 2, Some(1)), (2, 2));
    }
}
