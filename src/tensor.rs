//! Модуль, определяющий `Tensor` и `GraphContext`.
//!
//! `Tensor` не является контейнером для данных. Это легковесный
//! "дескриптор" (handle), который представляет узел в `Абстрактном
//! Семантическом Графе` (ASG).
//!
//! Все операции над тензорами (`add`, `dot` и т.д.) не выполняют вычисления
//! немедленно, а добавляют соответствующие узлы в граф.
//!
//! `GraphContext` - это центральный объект, который владеет и управляет
//! построением ASG.

use crate::asg::{Asg, DType, NodeId, NodeType, Shape, Value};
use ndarray::{ArrayD, IxDyn};
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

/// Контекст, который владеет и управляет построением ASG.
///
/// Этот объект обернут в `Rc<RefCell<>>`, чтобы его можно было
/// разделять между множеством `Tensor` дескрипторов.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
}

impl GraphContext {
    /// Создает новый, пустой контекст графа.
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
        }
    }

    /// Получает изменяемую ссылку на основной граф для его построения.
    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    /// Получает иммутабельную ссылку на основной граф.
    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Символьный дескриптор, представляющий узел в графе вычислений (ASG).
///
/// Любая операция над этим объектом приводит к добавлению нового узла в граф.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// ID узла в ASG, который представляет этот тензор.
    pub node_id: NodeId,
    /// Разделяемая ссылка на контекст, в котором строится граф.
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Создает новый "входной" узел в графе. Данные подаются во время выполнения.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();

        let node_id = graph.add_node(
            Some(name.to_string()),
            NodeType::Input {
                name: name.to_string(),
            },
        );

        // Регистрируем этот узел как один из входов графа.
        graph.inputs.push(node_id);

        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Входной узел с заранее известной формой (используется анализом форм).
    pub fn new_input_with_shape(context: &Rc<RefCell<GraphContext>>, name: &str, shape: Shape) -> Self {
        let tensor = Self::new_input(context, name);
        tensor.declare_shape(shape);
        tensor
    }

    /// Создает новый "параметр" в графе (обучаемый вес модели).
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(
            Some(name.to_string()),
            NodeType::Parameter {
                name: name.to_string(),
            },
        );
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Параметр с известной формой.
    pub fn new_parameter_with_shape(context: &Rc<RefCell<GraphContext>>, name: &str, shape: Shape) -> Self {
        let tensor = Self::new_parameter(context, name);
        tensor.declare_shape(shape);
        tensor
    }

    /// Создает новый узел-константу (литерал) из реальных данных.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(
            Some(name.to_string()),
            NodeType::Literal(Value::Tensor(data)),
        );
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Скалярная константа.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Literal(Value::Tensor(ndarray::arr0(value).into_dyn())));
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Константа из нулей заданной формы.
    pub fn zeros(context: &Rc<RefCell<GraphContext>>, shape: &[usize], name: &str) -> Self {
        Self::new_literal(context, ArrayD::zeros(IxDyn(shape)), name)
    }

    fn declare_shape(&self, shape: Shape) {
        let mut ctx = self.context.borrow_mut();
        if let Ok(node) = ctx.main_graph_mut().get_node_mut(self.node_id) {
            node.shape = Some(shape);
            node.dtype = Some(DType::F32);
        }
    }

    /// Присваивает узлу имя, под которым его можно найти в графе.
    pub fn named(self, name: &str) -> Self {
        if let Ok(node) = self.context.borrow_mut().main_graph_mut().get_node_mut(self.node_id) {
            node.name = Some(name.to_string());
        }
        self
    }

    /// Имя узла, если оно задано.
    pub fn name(&self) -> Option<String> {
        self.context
            .borrow()
            .main_graph()
            .get_node(self.node_id)
            .ok()
            .and_then(|node| node.name.clone())
    }

    /// Добавляет узел в тот же граф, что и `self`.
    fn push(&self, node_type: NodeType) -> Self {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self {
            node_id,
            context: Rc::clone(&self.context),
        }
    }

    // --- Математические операции ---

    pub fn dot(&self, other: &Tensor) -> Self {
        self.push(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn exp(&self) -> Self {
        self.push(NodeType::Exp(self.node_id))
    }

    /// 1.0 там, где элементы равны, иначе 0.0.
    pub fn equal(&self, other: &Tensor) -> Self {
        self.push(NodeType::Equal(self.node_id, other.node_id))
    }

    // --- Функции активации ---

    pub fn relu(&self) -> Self {
        self.push(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.push(NodeType::Sigmoid(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.push(NodeType::Tanh(self.node_id))
    }

    pub fn softmax(&self) -> Self {
        self.push(NodeType::Softmax(self.node_id))
    }

    /// Softmax только по допустимому (прошлому) префиксу ключей.
    pub fn causal_softmax(&self) -> Self {
        self.push(NodeType::CausalSoftmax(self.node_id))
    }

    pub fn argmax(&self) -> Self {
        self.push(NodeType::ArgMax(self.node_id))
    }

    // --- Операции редукции ---

    pub fn sum(&self) -> Self {
        self.push(NodeType::Sum(self.node_id))
    }

    // --- Операции трансформации ---

    /// Изменение формы; `-1` означает "вычислить по остатку".
    pub fn reshape(&self, shape: Vec<i64>) -> Self {
        let shape_data: ArrayD<f32> = ArrayD::from_shape_fn(IxDyn(&[shape.len()]), |idx| shape[idx[0]] as f32);
        let shape_node = self
            .context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Literal(Value::Tensor(shape_data)));
        self.push(NodeType::Reshape(self.node_id, shape_node))
    }

    pub fn matrix_transpose(&self) -> Self {
        self.push(NodeType::MatrixTranspose(self.node_id))
    }

    pub fn concat(tensors: &[Tensor], axis: usize) -> Self {
        let inputs = tensors.iter().map(|t| t.node_id).collect();
        tensors[0].push(NodeType::Concat { inputs, axis })
    }

    pub fn stack(tensors: &[Tensor], axis: usize) -> Self {
        let inputs = tensors.iter().map(|t| t.node_id).collect();
        tensors[0].push(NodeType::Stack { inputs, axis })
    }

    /// Срез `[start, end)` по оси, границы в стиле Python.
    pub fn slice(&self, axis: usize, start: isize, end: Option<isize>) -> Self {
        self.push(NodeType::Slice { input: self.node_id, axis, start, end })
    }

    pub fn select(&self, axis: usize, index: usize) -> Self {
        self.push(NodeType::Select { input: self.node_id, axis, index })
    }

    // --- Специализированные операции ---

    pub fn extract_windows(&self, window_size: usize) -> Self {
        self.push(NodeType::ExtractWindows { input: self.node_id, window_size })
    }

    pub fn one_hot(&self, depth: usize) -> Self {
        self.push(NodeType::OneHot { indices: self.node_id, depth })
    }

    pub fn sequence_mask(&self, maxlen: usize) -> Self {
        self.push(NodeType::SequenceMask { lengths: self.node_id, maxlen })
    }

    pub fn dropout_mask(&self, keep_prob: f32) -> Self {
        self.push(NodeType::DropoutMask { like: self.node_id, keep_prob })
    }

    /// Покомпонентная кросс-энтропия; `self` это логиты `[N, C]`.
    pub fn sparse_softmax_cross_entropy(&self, labels: &Tensor) -> Self {
        self.push(NodeType::SparseSoftmaxCrossEntropy {
            logits: self.node_id,
            labels: labels.node_id,
        })
    }
}

// Реализация операторов для удобного синтаксиса `a + b`.
macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Self::Output {
                self.push(NodeType::$variant(self.node_id, rhs.node_id))
            }
        }

        impl $trait<Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Self::Output {
                (&self).$method(&rhs)
            }
        }

        impl $trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Self::Output {
                (&self).$method(rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Subtract);
impl_binary_op!(Mul, mul, Multiply);
impl_binary_op!(Div, div, Divide);
