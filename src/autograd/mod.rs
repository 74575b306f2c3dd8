//! Автоград: построение графа градиентов d(loss)/d(param)
//!
//! Алгоритм:
//!  - обходим прямой граф в обратном топологическом порядке;
//!  - градиент распространяется только через узлы, зависящие от параметров;
//!  - вклады в один и тот же операнд аккумулируются (суммируются);
//!  - строим отдельный граф `grad` (ASG), выходы которого суть градиенты
//!    параметров в порядке `param_ids`.
//!
//! Значения прямого прохода (активации, маски dropout и т.д.) в графе градиентов
//! представлены узлами `External`, которые бэкенд читает из кэша выполнения
//! прямого графа. Поэтому граф градиентов исполняется с тем же memo.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, NodeId, NodeType, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0:?}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0:?}")]
    Shape(#[from] ShapeInferenceError),
    #[error("Нет правила дифференцирования для {0}")]
    Unsupported(String),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Построитель графа градиентов.
pub struct Gradients<'a> {
    /// Исходный (прямой) граф
    src: &'a Asg,
    /// Граф градиентов
    grad: Asg,
    /// Карта: исходный узел -> узел градиента (в `grad`)
    gmap: HashMap<NodeId, NodeId>,
    /// Карта: исходный узел -> External-узел с его значением
    externals: HashMap<NodeId, NodeId>,
    /// Узлы прямого графа, зависящие хотя бы от одного параметра
    requires_grad: HashSet<NodeId>,
}

impl<'a> Gradients<'a> {
    pub fn new(src: &'a Asg) -> Self {
        Self {
            src,
            grad: Asg::new(1, Some("grad".to_string())),
            gmap: HashMap::new(),
            externals: HashMap::new(),
            requires_grad: HashSet::new(),
        }
    }

    /// Строит граф градиентов `loss_id` по параметрам `param_ids` (seed = 1.0).
    pub fn build(mut self, loss_id: NodeId, param_ids: &[NodeId]) -> AutogradResult<Asg> {
        let order = ShapeInference::topological_sort_from(self.src, &[loss_id])?;

        let params: HashSet<NodeId> = param_ids.iter().copied().collect();
        for &id in &order {
            let node = self.src.get_node(id)?;
            let depends = params.contains(&id)
                || node.node_type.inputs().iter().any(|i| self.requires_grad.contains(i));
            if depends {
                self.requires_grad.insert(id);
            }
        }

        let seed = self.lit_scalar(1.0);
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let g_out = match self.gmap.get(&id).copied() {
                Some(g) if self.requires_grad.contains(&id) => g,
                _ => continue,
            };
            let node_type = self.src.get_node(id)?.node_type.clone();
            self.backprop(id, &node_type, g_out)?;
        }

        let mut outputs = Vec::with_capacity(param_ids.len());
        for &pid in param_ids {
            let g = match self.gmap.get(&pid).copied() {
                Some(g) => g,
                // Параметр не влияет на loss: нулевой градиент нужной формы.
                None => {
                    let p = self.reuse(pid)?;
                    let zero = self.lit_scalar(0.0);
                    self.add_node(NodeType::Multiply(p, zero))
                }
            };
            outputs.push(g);
        }
        self.grad.set_outputs(outputs);
        Ok(self.grad)
    }

    fn backprop(&mut self, id: NodeId, node_type: &NodeType, g_out: NodeId) -> AutogradResult<()> {
        match node_type {
            // Листья
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => {}

            // -------- БИНАРНЫЕ --------
            NodeType::Add(a, b) => {
                if self.needs(*a) {
                    let ra = self.reduce_to(g_out, *a)?;
                    self.acc(*a, ra);
                }
                if self.needs(*b) {
                    let rb = self.reduce_to(g_out, *b)?;
                    self.acc(*b, rb);
                }
            }
            NodeType::Subtract(a, b) => {
                if self.needs(*a) {
                    let ra = self.reduce_to(g_out, *a)?;
                    self.acc(*a, ra);
                }
                if self.needs(*b) {
                    let neg = self.add_node(NodeType::Negate(g_out));
                    let rb = self.reduce_to(neg, *b)?;
                    self.acc(*b, rb);
                }
            }
            NodeType::Multiply(a, b) => {
                if self.needs(*a) {
                    let b_im = self.reuse(*b)?;
                    let g_a = self.add_node(NodeType::Multiply(g_out, b_im));
                    let ra = self.reduce_to(g_a, *a)?;
                    self.acc(*a, ra);
                }
                if self.needs(*b) {
                    let a_im = self.reuse(*a)?;
                    let g_b = self.add_node(NodeType::Multiply(g_out, a_im));
                    let rb = self.reduce_to(g_b, *b)?;
                    self.acc(*b, rb);
                }
            }
            NodeType::Divide(a, b) => {
                let b_im = self.reuse(*b)?;
                if self.needs(*a) {
                    // g_a = g_out / b
                    let g_a = self.add_node(NodeType::Divide(g_out, b_im));
                    let ra = self.reduce_to(g_a, *a)?;
                    self.acc(*a, ra);
                }
                if self.needs(*b) {
                    // g_b = -g_out * y / b, где y = a / b
                    let y = self.reuse(id)?;
                    let num = self.add_node(NodeType::Multiply(g_out, y));
                    let div = self.add_node(NodeType::Divide(num, b_im));
                    let g_b = self.add_node(NodeType::Negate(div));
                    let rb = self.reduce_to(g_b, *b)?;
                    self.acc(*b, rb);
                }
            }
            NodeType::MatrixMultiply(a, b) => {
                if self.needs(*a) {
                    let b_im = self.reuse(*b)?;
                    let b_t = self.add_node(NodeType::MatrixTranspose(b_im));
                    let g_a = self.add_node(NodeType::MatrixMultiply(g_out, b_t));
                    let ra = self.reduce_to(g_a, *a)?;
                    self.acc(*a, ra);
                }
                if self.needs(*b) {
                    // Для 2D-веса при пакетном `a` суммируем по пакетным осям.
                    let a_im = self.reuse(*a)?;
                    let a_t = self.add_node(NodeType::MatrixTranspose(a_im));
                    let g_b = self.add_node(NodeType::MatrixMultiply(a_t, g_out));
                    let rb = self.reduce_to(g_b, *b)?;
                    self.acc(*b, rb);
                }
            }

            // -------- УНАРНЫЕ --------
            NodeType::Negate(x) => {
                let g = self.add_node(NodeType::Negate(g_out));
                self.acc(*x, g);
            }
            NodeType::Exp(x) => {
                let y = self.reuse(id)?;
                let g = self.add_node(NodeType::Multiply(g_out, y));
                self.acc(*x, g);
            }
            NodeType::ReLU(x) => {
                let x_im = self.reuse(*x)?;
                let zero = self.lit_scalar(0.0);
                let mask = self.add_node(NodeType::GreaterThan(x_im, zero));
                let g = self.add_node(NodeType::Multiply(g_out, mask));
                self.acc(*x, g);
            }
            NodeType::Sigmoid(x) => {
                // y * (1 - y)
                let y = self.reuse(id)?;
                let one = self.lit_scalar(1.0);
                let one_minus = self.add_node(NodeType::Subtract(one, y));
                let dy = self.add_node(NodeType::Multiply(y, one_minus));
                let g = self.add_node(NodeType::Multiply(g_out, dy));
                self.acc(*x, g);
            }
            NodeType::Tanh(x) => {
                // 1 - y^2
                let y = self.reuse(id)?;
                let y2 = self.add_node(NodeType::Multiply(y, y));
                let one = self.lit_scalar(1.0);
                let dy = self.add_node(NodeType::Subtract(one, y2));
                let g = self.add_node(NodeType::Multiply(g_out, dy));
                self.acc(*x, g);
            }
            NodeType::Softmax(x) | NodeType::CausalSoftmax(x) => {
                // Замаскированные позиции имеют y = 0, поэтому их градиент тоже 0.
                let y = self.reuse(id)?;
                let g = self.add_node(NodeType::SoftmaxGrad { output: y, grad: g_out });
                self.acc(*x, g);
            }
            NodeType::Sum(x) => {
                let x_im = self.reuse(*x)?;
                let g = self.add_node(NodeType::Broadcast(g_out, x_im));
                self.acc(*x, g);
            }

            // -------- ТРАНСФОРМАЦИИ --------
            NodeType::Reshape(x, _) | NodeType::ReshapeLike(x, _) => {
                let x_im = self.reuse(*x)?;
                let g = self.add_node(NodeType::ReshapeLike(g_out, x_im));
                self.acc(*x, g);
            }
            NodeType::MatrixTranspose(x) => {
                let g = self.add_node(NodeType::MatrixTranspose(g_out));
                self.acc(*x, g);
            }
            NodeType::Broadcast(x, _) => {
                let x_im = self.reuse(*x)?;
                let g = self.add_node(NodeType::ReduceSumTo(g_out, x_im));
                self.acc(*x, g);
            }
            NodeType::ReduceSumTo(x, _) => {
                let x_im = self.reuse(*x)?;
                let g = self.add_node(NodeType::Broadcast(g_out, x_im));
                self.acc(*x, g);
            }
            NodeType::Concat { inputs, axis } => {
                let mut parts = Vec::with_capacity(inputs.len());
                for &input in inputs {
                    parts.push(self.reuse(input)?);
                }
                for (index, &input) in inputs.iter().enumerate() {
                    if self.needs(input) {
                        let g = self.add_node(NodeType::ConcatGrad {
                            grad: g_out,
                            parts: parts.clone(),
                            axis: *axis,
                            index,
                        });
                        self.acc(input, g);
                    }
                }
            }
            NodeType::Stack { inputs, axis } => {
                for (index, &input) in inputs.iter().enumerate() {
                    if self.needs(input) {
                        let g = self.add_node(NodeType::Select { input: g_out, axis: *axis, index });
                        self.acc(input, g);
                    }
                }
            }
            NodeType::Slice { input, axis, start, end } => {
                let like = self.reuse(*input)?;
                let g = self.add_node(NodeType::SliceGrad {
                    grad: g_out,
                    like,
                    axis: *axis,
                    start: *start,
                    end: *end,
                });
                self.acc(*input, g);
            }
            NodeType::Select { input, axis, index } => {
                let like = self.reuse(*input)?;
                let g = self.add_node(NodeType::SelectGrad { grad: g_out, like, axis: *axis, index: *index });
                self.acc(*input, g);
            }

            // -------- СПЕЦИАЛИЗИРОВАННЫЕ --------
            NodeType::ExtractWindows { input, window_size } => {
                let g = self.add_node(NodeType::ExtractWindowsGrad { grad: g_out, window_size: *window_size });
                self.acc(*input, g);
            }
            NodeType::SparseSoftmaxCrossEntropy { logits, labels } => {
                if self.needs(*logits) {
                    let logits_im = self.reuse(*logits)?;
                    let labels_im = self.reuse(*labels)?;
                    let g = self.add_node(NodeType::SparseSoftmaxCrossEntropyGrad {
                        logits: logits_im,
                        labels: labels_im,
                        grad: g_out,
                    });
                    self.acc(*logits, g);
                }
            }

            // Кусочно-постоянные: нулевая производная
            NodeType::GreaterThan(..)
            | NodeType::Equal(..)
            | NodeType::ArgMax(_)
            | NodeType::OneHot { .. }
            | NodeType::SequenceMask { .. }
            | NodeType::DropoutMask { .. } => {}

            NodeType::SoftmaxGrad { .. }
            | NodeType::SparseSoftmaxCrossEntropyGrad { .. }
            | NodeType::ExtractWindowsGrad { .. }
            | NodeType::SliceGrad { .. }
            | NodeType::SelectGrad { .. }
            | NodeType::ConcatGrad { .. } => {
                return Err(AutogradError::Unsupported(format!("{:?}", node_type)));
            }
        }
        Ok(())
    }

    // --------------------------- Вспомогательные ---------------------------

    fn needs(&self, src_id: NodeId) -> bool {
        self.requires_grad.contains(&src_id)
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::Tensor(ndarray::arr0(v).into_dyn())))
    }

    /// External-узел со значением исходного узла из прямого прохода.
    fn reuse(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&id) = self.externals.get(&src_id) {
            return Ok(id);
        }
        let src_node = self.src.get_node(src_id)?;
        let name = src_node.name.clone().unwrap_or_else(|| format!("node_{}", src_id));
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External { name, source_asg_id: self.src.id, source_node_id: src_id },
        );
        self.externals.insert(src_id, id);
        Ok(id)
    }

    fn acc(&mut self, target_src_id: NodeId, contrib: NodeId) {
        if !self.requires_grad.contains(&target_src_id) {
            return;
        }
        if let Some(prev) = self.gmap.get(&target_src_id).copied() {
            let sum = self.add_node(NodeType::Add(prev, contrib));
            self.gmap.insert(target_src_id, sum);
        } else {
            self.gmap.insert(target_src_id, contrib);
        }
    }

    /// Привести градиент `g` к форме источника `src_id` (ReduceSumTo по бродкаст-осям).
    fn reduce_to(&mut self, g: NodeId, src_id: NodeId) -> AutogradResult<NodeId> {
        let src_im = self.reuse(src_id)?;
        Ok(self.add_node(NodeType::ReduceSumTo(g, src_im)))
    }
}
