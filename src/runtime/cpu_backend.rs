//! Модуль, реализующий бэкенд для выполнения ASG на CPU.
//!
//! Этот бэкенд обходит граф вычислений (ASG) в топологическом порядке и для
//! каждого узла выполняет соответствующую операцию с помощью `ndarray`.
//! Все операции не зависят от конкретных размеров входов, поэтому один и тот же
//! граф можно исполнять с историей произвольной длины.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, resolve_reshape, ShapeInference};
use crate::asg::{slice_bounds, Asg, AsgId, NodeId, NodeType, Value};
use ndarray::{
    s, Array1, Array2, Array3, Array4, ArrayD, ArrayViewD, Axis, Ix1, Ix2, Ix3, Ix4, IxDyn,
    Slice as AxisSlice, Zip,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use tracing::trace;

type OpResult = Result<ArrayD<f32>, RuntimeError>;

/// Контекст выполнения для одного или нескольких связанных графов на CPU.
struct ExecutionContext<'a> {
    /// Граф, который исполняется сейчас.
    asg: &'a Asg,
    /// Глобальный кэш для уже вычисленных значений узлов.
    /// Ключ - это (AsgId, NodeId).
    memo: Memo<Value>,
    rng: &'a RefCell<StdRng>,
}

impl<'a> ExecutionContext<'a> {
    /// Создает новый контекст выполнения.
    fn new(asg: &'a Asg, initial_memo: Memo<Value>, rng: &'a RefCell<StdRng>) -> Self {
        // Скаляры приводим к тензорам нулевого ранга, чтобы все операции работали с `ArrayD`.
        let memo = initial_memo
            .into_iter()
            .map(|(key, value)| (key, Value::Tensor(value.into_tensor())))
            .collect();
        Self { asg, memo, rng }
    }

    /// Значение уже вычисленного узла текущего графа.
    fn get(&self, node_id: NodeId) -> Result<&ArrayD<f32>, RuntimeError> {
        self.get_from(self.asg.id, node_id)
    }

    fn get_from(&self, asg_id: AsgId, node_id: NodeId) -> Result<&ArrayD<f32>, RuntimeError> {
        match self.memo.get(&(asg_id, node_id)) {
            Some(Value::Tensor(arr)) => Ok(arr),
            Some(Value::ScalarF32(_)) => Err(RuntimeError::TypeError {
                expected: "Tensor".to_string(),
                actual: "ScalarF32".to_string(),
            }),
            None => Err(RuntimeError::NodeNotFound(node_id, asg_id)),
        }
    }

    /// Вычисляет значение узла. Все его входы уже должны быть в кэше.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<(), RuntimeError> {
        let asg = self.asg;
        let asg_id = asg.id;
        if self.memo.contains_key(&(asg_id, node_id)) {
            return Ok(());
        }

        let node = asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => {
                return Err(RuntimeError::MissingInput(name.clone(), node.id));
            }
            NodeType::Parameter { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id));
            }
            NodeType::Literal(value) => Ok(value.clone().into_tensor()),
            NodeType::External { source_asg_id, source_node_id, .. } => {
                self.get_from(*source_asg_id, *source_node_id).cloned()
            }

            NodeType::Add(l, r) => zip_broadcast(self.get(*l)?, self.get(*r)?, |a, b| a + b),
            NodeType::Subtract(l, r) => zip_broadcast(self.get(*l)?, self.get(*r)?, |a, b| a - b),
            NodeType::Multiply(l, r) => zip_broadcast(self.get(*l)?, self.get(*r)?, |a, b| a * b),
            NodeType::Divide(l, r) => zip_broadcast(self.get(*l)?, self.get(*r)?, |a, b| a / b),
            NodeType::GreaterThan(l, r) => {
                zip_broadcast(self.get(*l)?, self.get(*r)?, |a, b| if a > b { 1.0 } else { 0.0 })
            }
            NodeType::Equal(l, r) => {
                zip_broadcast(self.get(*l)?, self.get(*r)?, |a, b| if a == b { 1.0 } else { 0.0 })
            }
            NodeType::MatrixMultiply(l, r) => op_matmul(self.get(*l)?, self.get(*r)?),

            NodeType::Negate(op) => Ok(self.get(*op)?.mapv(|x| -x)),
            NodeType::Exp(op) => Ok(self.get(*op)?.mapv(f32::exp)),
            NodeType::ReLU(op) => Ok(self.get(*op)?.mapv(|x| x.max(0.0))),
            NodeType::Sigmoid(op) => Ok(self.get(*op)?.mapv(|x| 1.0 / (1.0 + (-x).exp()))),
            NodeType::Tanh(op) => Ok(self.get(*op)?.mapv(f32::tanh)),
            NodeType::Softmax(op) => Ok(op_softmax(self.get(*op)?)),
            NodeType::CausalSoftmax(op) => op_causal_softmax(self.get(*op)?),
            NodeType::ArgMax(op) => op_argmax(self.get(*op)?),
            NodeType::Sum(op) => Ok(ndarray::arr0(self.get(*op)?.sum()).into_dyn()),

            NodeType::Reshape(data, shape) => op_reshape(self.get(*data)?, self.get(*shape)?),
            NodeType::ReshapeLike(data, like) => to_shape(self.get(*data)?, self.get(*like)?.shape()),
            NodeType::MatrixTranspose(op) => {
                let operand = self.get(*op)?;
                let rank = operand.ndim();
                if rank < 2 {
                    return Err(RuntimeError::ShapeError(format!(
                        "MatrixTranspose требует ранг >= 2, получено {:?}",
                        operand.shape()
                    )));
                }
                op_transpose(operand, rank - 2, rank - 1)
            }
            NodeType::Broadcast(source, target) => op_broadcast(self.get(*source)?, self.get(*target)?.shape()),
            NodeType::ReduceSumTo(source, target) => {
                op_reduce_sum_to(self.get(*source)?, self.get(*target)?.shape())
            }
            NodeType::Concat { inputs, axis } => {
                let views = self.views(inputs)?;
                check_axis(&views[0], *axis)?;
                ndarray::concatenate(Axis(*axis), &views).map_err(shape_err)
            }
            NodeType::Stack { inputs, axis } => {
                let views = self.views(inputs)?;
                ndarray::stack(Axis(*axis), &views).map_err(shape_err)
            }
            NodeType::Slice { input, axis, start, end } => {
                let operand = self.get(*input)?;
                check_axis(&operand.view(), *axis)?;
                let (lo, hi) = slice_bounds(operand.shape()[*axis], *start, *end);
                Ok(operand.slice_axis(Axis(*axis), AxisSlice::from(lo..hi)).to_owned())
            }
            NodeType::Select { input, axis, index } => {
                let operand = self.get(*input)?;
                check_axis(&operand.view(), *axis)?;
                if *index >= operand.shape()[*axis] {
                    return Err(RuntimeError::ShapeError(format!(
                        "индекс {} вне оси {} формы {:?}",
                        index,
                        axis,
                        operand.shape()
                    )));
                }
                Ok(operand.index_axis(Axis(*axis), *index).to_owned())
            }

            NodeType::ExtractWindows { input, window_size } => op_extract_windows(self.get(*input)?, *window_size),
            NodeType::OneHot { indices, depth } => op_one_hot(self.get(*indices)?, *depth),
            NodeType::SequenceMask { lengths, maxlen } => op_sequence_mask(self.get(*lengths)?, *maxlen),
            NodeType::DropoutMask { like, keep_prob } => {
                let shape = self.get(*like)?.shape().to_vec();
                Ok(op_dropout_mask(&shape, *keep_prob, &mut self.rng.borrow_mut()))
            }
            NodeType::SparseSoftmaxCrossEntropy { logits, labels } => {
                op_sparse_softmax_xent(self.get(*logits)?, self.get(*labels)?)
            }

            NodeType::SoftmaxGrad { output, grad } => op_softmax_grad(self.get(*output)?, self.get(*grad)?),
            NodeType::SparseSoftmaxCrossEntropyGrad { logits, labels, grad } => {
                op_sparse_softmax_xent_grad(self.get(*logits)?, self.get(*labels)?, self.get(*grad)?)
            }
            NodeType::ExtractWindowsGrad { grad, window_size } => {
                op_extract_windows_grad(self.get(*grad)?, *window_size)
            }
            NodeType::SliceGrad { grad, like, axis, start, end } => {
                let grad = self.get(*grad)?;
                let like = self.get(*like)?;
                check_axis(&like.view(), *axis)?;
                let (lo, hi) = slice_bounds(like.shape()[*axis], *start, *end);
                let mut out = ArrayD::zeros(like.raw_dim());
                let mut window = out.slice_axis_mut(Axis(*axis), AxisSlice::from(lo..hi));
                assign_checked(&mut window, grad)?;
                Ok(out)
            }
            NodeType::SelectGrad { grad, like, axis, index } => {
                let grad = self.get(*grad)?;
                let like = self.get(*like)?;
                check_axis(&like.view(), *axis)?;
                let mut out = ArrayD::zeros(like.raw_dim());
                let mut window = out.index_axis_mut(Axis(*axis), *index);
                assign_checked(&mut window, grad)?;
                Ok(out)
            }
            NodeType::ConcatGrad { grad, parts, axis, index } => {
                let grad = self.get(*grad)?;
                let mut offset = 0;
                for part in &parts[..*index] {
                    offset += self.get(*part)?.shape()[*axis];
                }
                let len = self.get(parts[*index])?.shape()[*axis];
                check_axis(&grad.view(), *axis)?;
                Ok(grad.slice_axis(Axis(*axis), AxisSlice::from(offset..offset + len)).to_owned())
            }
        }?;

        self.memo.insert((asg_id, node_id), Value::Tensor(result));
        Ok(())
    }

    fn views(&self, inputs: &[NodeId]) -> Result<Vec<ArrayViewD<'_, f32>>, RuntimeError> {
        if inputs.is_empty() {
            return Err(RuntimeError::ShapeError("пустой список входов".to_string()));
        }
        inputs.iter().map(|id| self.get(*id).map(|a| a.view())).collect()
    }
}

/// CPU-бэкенд. Генератор случайных чисел используется только масками dropout.
pub struct CpuBackend {
    rng: RefCell<StdRng>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self { rng: RefCell::new(StdRng::from_entropy()) }
    }

    /// Бэкенд с воспроизводимыми масками dropout.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: RefCell::new(StdRng::seed_from_u64(seed)) }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("Topological sort failed: {:?}", e)))?;
        trace!(graph = main_asg.id, nodes = sorted_nodes.len(), "исполнение графа на CPU");

        let mut context = ExecutionContext::new(main_asg, initial_memo, &self.rng);

        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let mut results = Vec::with_capacity(main_asg.outputs.len());
        for output_node_id in &main_asg.outputs {
            let result = context
                .memo
                .get(&(main_asg.id, *output_node_id))
                .ok_or(RuntimeError::NodeNotFound(*output_node_id, main_asg.id))?
                .clone();
            results.push(result);
        }
        Ok((results, context.memo))
    }
}

// --------------------------- Операции ---------------------------

fn shape_err(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::ShapeError(e.to_string())
}

fn check_axis(a: &ArrayViewD<'_, f32>, axis: usize) -> Result<(), RuntimeError> {
    if axis >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!("ось {} вне тензора формы {:?}", axis, a.shape())));
    }
    Ok(())
}

fn assign_checked(target: &mut ndarray::ArrayViewMutD<'_, f32>, value: &ArrayD<f32>) -> Result<(), RuntimeError> {
    if target.shape() != value.shape() {
        return Err(RuntimeError::ShapeError(format!(
            "форма градиента {:?} не совпадает с {:?}",
            value.shape(),
            target.shape()
        )));
    }
    target.assign(value);
    Ok(())
}

fn to_shape(a: &ArrayD<f32>, shape: &[usize]) -> OpResult {
    a.to_shape(shape).map(|view| view.into_owned()).map_err(shape_err)
}

/// Поэлементная бинарная операция с NumPy-трансляцией.
fn zip_broadcast(a: &ArrayD<f32>, b: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> OpResult {
    if a.shape() == b.shape() {
        return Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)));
    }
    let shape = broadcast_shapes(a.shape(), b.shape()).map_err(shape_err)?;
    let av = a
        .broadcast(shape.as_slice())
        .ok_or_else(|| RuntimeError::ShapeError(format!("broadcast {:?} -> {:?}", a.shape(), shape)))?;
    let bv = b
        .broadcast(shape.as_slice())
        .ok_or_else(|| RuntimeError::ShapeError(format!("broadcast {:?} -> {:?}", b.shape(), shape)))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

fn op_matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> OpResult {
    if a.ndim() == 0 || b.ndim() == 0 {
        return zip_broadcast(a, b, |x, y| x * y);
    }
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(RuntimeError::UnimplementedOperation(format!(
            "Matmul for dims {} and {}",
            a.ndim(),
            b.ndim()
        )));
    }
    let (m, k) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let (k2, n) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
    if k != k2 {
        return Err(RuntimeError::ShapeError(format!(
            "Incompatible matmul shapes: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let lead = &a.shape()[..a.ndim() - 2];
    let batch: usize = lead.iter().product();
    let mut out_shape = lead.to_vec();
    out_shape.extend([m, n]);

    if b.ndim() == 2 {
        // [.., m, k] x [k, n]: сворачиваем пакетные оси в строки
        let a2 = a.to_shape((batch * m, k)).map_err(shape_err)?;
        let b2 = b.to_shape((k, n)).map_err(shape_err)?;
        return to_shape(&a2.dot(&b2).into_dyn(), &out_shape);
    }

    if b.shape()[..b.ndim() - 2] != *lead {
        return Err(RuntimeError::ShapeError(format!(
            "Incompatible batch dims for matmul: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let a3 = a.to_shape((batch, m, k)).map_err(shape_err)?;
    let b3 = b.to_shape((batch, k, n)).map_err(shape_err)?;
    let mut out = Array3::<f32>::zeros((batch, m, n));
    for i in 0..batch {
        out.index_axis_mut(Axis(0), i)
            .assign(&a3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i)));
    }
    to_shape(&out.into_dyn(), &out_shape)
}

fn op_transpose(a: &ArrayD<f32>, axis1: usize, axis2: usize) -> OpResult {
    if axis1 >= a.ndim() || axis2 >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "Transpose осей {} и {} для формы {:?}",
            axis1,
            axis2,
            a.shape()
        )));
    }
    let mut axes: Vec<_> = (0..a.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(a.clone().permuted_axes(axes).as_standard_layout().into_owned())
}

fn op_reshape(source: &ArrayD<f32>, shape_provider: &ArrayD<f32>) -> OpResult {
    let requested: Vec<i64> = shape_provider.iter().map(|&x| x as i64).collect();
    let shape = resolve_reshape(source.len(), &requested).ok_or_else(|| {
        RuntimeError::ShapeError(format!("нельзя привести {:?} к {:?}", source.shape(), requested))
    })?;
    to_shape(source, &shape)
}

fn op_broadcast(source: &ArrayD<f32>, target_shape: &[usize]) -> OpResult {
    source
        .broadcast(target_shape)
        .map(|view| view.to_owned())
        .ok_or_else(|| RuntimeError::ShapeError(format!("broadcast {:?} -> {:?}", source.shape(), target_shape)))
}

fn op_reduce_sum_to(source: &ArrayD<f32>, target_shape: &[usize]) -> OpResult {
    if source.shape() == target_shape {
        return Ok(source.clone());
    }
    let target_rank = target_shape.len();
    if source.ndim() < target_rank {
        return op_broadcast(source, target_shape);
    }

    let mut source_tensor = source.clone();
    while source_tensor.ndim() > target_rank {
        source_tensor = source_tensor.sum_axis(Axis(0));
    }

    for (axis, &dim) in target_shape.iter().enumerate() {
        if dim == 1 && source_tensor.shape()[axis] > 1 {
            source_tensor = source_tensor.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }

    to_shape(&source_tensor, target_shape)
}

fn op_softmax(a: &ArrayD<f32>) -> ArrayD<f32> {
    if a.ndim() == 0 {
        return ArrayD::ones(a.raw_dim());
    }
    let mut result = a.to_owned();
    let last_axis = Axis(a.ndim() - 1);
    for mut row in result.lanes_mut(last_axis) {
        let max_val = row.iter().fold(f32::NEG_INFINITY, |max, &val| max.max(val));
        if max_val.is_infinite() {
            // Переполнение логитов: масса делится поровну между максимумами.
            row.mapv_inplace(|x| if x == max_val { 1.0 } else { 0.0 });
        } else {
            row.mapv_inplace(|x| (x - max_val).exp());
        }
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    result
}

/// Для строки запроса `i` из `Q` допустимы ключи `j < K - Q + 1 + i`.
/// Строки без допустимых ключей целиком нулевые.
fn op_causal_softmax(a: &ArrayD<f32>) -> OpResult {
    let rank = a.ndim();
    if rank < 2 {
        return Err(RuntimeError::ShapeError(format!("CausalSoftmax требует ранг >= 2, получено {:?}", a.shape())));
    }
    let (q, k) = (a.shape()[rank - 2], a.shape()[rank - 1]);
    let batch: usize = a.shape()[..rank - 2].iter().product();
    let mut scores = a.to_shape((batch, q, k)).map_err(shape_err)?.into_owned();

    for mut matrix in scores.outer_iter_mut() {
        for (i, mut row) in matrix.outer_iter_mut().enumerate() {
            let allowed = (k as isize - q as isize + 1 + i as isize).clamp(0, k as isize) as usize;
            if allowed == 0 {
                row.fill(0.0);
                continue;
            }
            let max_val = row.slice(s![..allowed]).fold(f32::NEG_INFINITY, |max, &val| max.max(val));
            let mut sum = 0.0;
            for j in 0..allowed {
                row[j] = (row[j] - max_val).exp();
                sum += row[j];
            }
            for j in 0..k {
                row[j] = if j < allowed { row[j] / sum } else { 0.0 };
            }
        }
    }
    to_shape(&scores.into_dyn(), a.shape())
}

fn op_argmax(a: &ArrayD<f32>) -> OpResult {
    if a.ndim() == 0 {
        return Err(RuntimeError::ShapeError("ArgMax скаляра".to_string()));
    }
    let last_axis = Axis(a.ndim() - 1);
    Ok(a.map_axis(last_axis, |lane| {
        let mut best = 0;
        for (i, &v) in lane.iter().enumerate() {
            if v > lane[best] {
                best = i;
            }
        }
        best as f32
    }))
}

/// `[B, L, F]` -> `[B, L - W + 1, F, W]`, где `out[b, t, f, w] = x[b, t + w, f]`.
fn op_extract_windows(a: &ArrayD<f32>, window_size: usize) -> OpResult {
    let x = a.view().into_dimensionality::<Ix3>().map_err(shape_err)?;
    let (batch, len, features) = x.dim();
    if window_size == 0 || len + 1 < window_size {
        return Err(RuntimeError::ShapeError(format!(
            "последовательность длины {} короче окна {}",
            len, window_size
        )));
    }
    let steps = len + 1 - window_size;
    let out = Array4::from_shape_fn((batch, steps, features, window_size), |(b, t, f, w)| x[[b, t + w, f]]);
    Ok(out.into_dyn())
}

fn op_extract_windows_grad(grad: &ArrayD<f32>, window_size: usize) -> OpResult {
    let g = grad.view().into_dimensionality::<Ix4>().map_err(shape_err)?;
    let (batch, steps, features, w) = g.dim();
    if w != window_size || w == 0 {
        return Err(RuntimeError::ShapeError(format!("ожидалось окно {}, получено {:?}", window_size, g.shape())));
    }
    let mut out = Array3::<f32>::zeros((batch, steps + w - 1, features));
    for ((b, t, f, wi), &v) in g.indexed_iter() {
        out[[b, t + wi, f]] += v;
    }
    Ok(out.into_dyn())
}

fn op_one_hot(indices: &ArrayD<f32>, depth: usize) -> OpResult {
    let mut out = Array2::<f32>::zeros((indices.len(), depth));
    for (row, &v) in indices.iter().enumerate() {
        let class = v.round();
        // Индексы вне диапазона дают нулевую строку.
        if class >= 0.0 && (class as usize) < depth {
            out[[row, class as usize]] = 1.0;
        }
    }
    let mut shape = indices.shape().to_vec();
    shape.push(depth);
    to_shape(&out.into_dyn(), &shape)
}

fn op_sequence_mask(lengths: &ArrayD<f32>, maxlen: usize) -> OpResult {
    let mut out = Array2::<f32>::zeros((lengths.len(), maxlen));
    for (row, &len) in lengths.iter().enumerate() {
        let valid = len.max(0.0) as usize;
        out.row_mut(row).slice_mut(s![..valid.min(maxlen)]).fill(1.0);
    }
    let mut shape = lengths.shape().to_vec();
    shape.push(maxlen);
    to_shape(&out.into_dyn(), &shape)
}

fn op_dropout_mask(shape: &[usize], keep_prob: f32, rng: &mut StdRng) -> ArrayD<f32> {
    if keep_prob >= 1.0 {
        return ArrayD::ones(IxDyn(shape));
    }
    let scale = 1.0 / keep_prob;
    ArrayD::from_shape_simple_fn(IxDyn(shape), || if rng.gen::<f32>() < keep_prob { scale } else { 0.0 })
}

fn class_index(label: f32, num_classes: usize) -> Result<usize, RuntimeError> {
    let class = label.round();
    if class < 0.0 || class as usize >= num_classes {
        return Err(RuntimeError::ComputationError(format!(
            "метка {} вне диапазона [0, {})",
            label, num_classes
        )));
    }
    Ok(class as usize)
}

fn op_sparse_softmax_xent(logits: &ArrayD<f32>, labels: &ArrayD<f32>) -> OpResult {
    let logits = logits.view().into_dimensionality::<Ix2>().map_err(shape_err)?;
    let labels = labels.view().into_dimensionality::<Ix1>().map_err(shape_err)?;
    let (n, classes) = logits.dim();
    if labels.len() != n {
        return Err(RuntimeError::ShapeError(format!("{} логитов и {} меток", n, labels.len())));
    }
    let mut out = Array1::<f32>::zeros(n);
    for (i, row) in logits.outer_iter().enumerate() {
        let class = class_index(labels[i], classes)?;
        let max_val = row.fold(f32::NEG_INFINITY, |max, &val| max.max(val));
        let log_sum_exp = max_val + row.mapv(|x| (x - max_val).exp()).sum().ln();
        out[i] = log_sum_exp - row[class];
    }
    Ok(out.into_dyn())
}

fn op_sparse_softmax_xent_grad(logits: &ArrayD<f32>, labels: &ArrayD<f32>, grad: &ArrayD<f32>) -> OpResult {
    let probs = op_softmax(logits);
    let mut out = probs.into_dimensionality::<Ix2>().map_err(shape_err)?;
    let labels = labels.view().into_dimensionality::<Ix1>().map_err(shape_err)?;
    let (n, classes) = out.dim();
    let grad = grad
        .broadcast(n)
        .ok_or_else(|| RuntimeError::ShapeError(format!("градиент {:?} для {} строк", grad.shape(), n)))?;
    for (i, mut row) in out.outer_iter_mut().enumerate() {
        let class = class_index(labels[i], classes)?;
        row[class] -= 1.0;
        row *= grad[i];
    }
    Ok(out.into_dyn())
}

/// dL/dx = y * (g - sum(g * y)) по последней оси.
fn op_softmax_grad(output: &ArrayD<f32>, grad: &ArrayD<f32>) -> OpResult {
    if output.ndim() == 0 {
        return Ok(ArrayD::zeros(output.raw_dim()));
    }
    let last_axis = Axis(output.ndim() - 1);
    let gy = zip_broadcast(grad, output, |g, y| g * y)?;
    let dot = gy.sum_axis(last_axis).insert_axis(last_axis);
    let centered = zip_broadcast(grad, &dot, |g, d| g - d)?;
    zip_broadcast(output, &centered, |y, c| y * c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_softmax_with_overflowed_logits_stays_finite() {
        let x = array![[f32::INFINITY, 1.0, f32::INFINITY], [f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY]]
            .into_dyn();
        let y = op_softmax(&x);
        assert!(y.iter().all(|v| v.is_finite()));
        for row in y.lanes(Axis(1)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert_eq!(y[[0, 0]], 0.5);
        assert_eq!(y[[0, 1]], 0.0);
        assert!((y[[1, 2]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_causal_softmax_masks_future_keys() {
        // Q = 2, K = 3: строке 0 доступны 2 ключа, строке 1 все три.
        let x = array![[[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]]].into_dyn();
        let y = op_causal_softmax(&x).unwrap();
        assert_eq!(y[[0, 0, 2]], 0.0);
        assert!((y[[0, 0, 0]] + y[[0, 0, 1]] - 1.0).abs() < 1e-6);
        assert!((y[[0, 1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_causal_softmax_without_keys_is_zero() {
        // K = Q - 1: первая строка не видит ни одного ключа.
        let x = ArrayD::<f32>::ones(IxDyn(&[1, 3, 2]));
        let y = op_causal_softmax(&x).unwrap();
        assert_eq!(y.slice(s![0, 0, ..]).sum(), 0.0);
        assert!((y.slice(s![0, 1, ..]).sum() - 1.0).abs() < 1e-6);
        assert_eq!(y[[0, 1, 1]], 0.0);
    }

    #[test]
    fn test_extract_windows_layout() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 4, 2]), (0..8).map(|v| v as f32).collect()).unwrap();
        let w = op_extract_windows(&x, 3).unwrap();
        assert_eq!(w.shape(), &[1, 2, 2, 3]);
        // окно 1, признак 0: шаги 1, 2, 3
        assert_eq!(w.slice(s![0, 1, 0, ..]).to_vec(), vec![2.0, 4.0, 6.0]);
        let back = op_extract_windows_grad(&ArrayD::ones(w.raw_dim()), 3).unwrap();
        assert_eq!(back.slice(s![0, .., 0]).to_vec(), vec![1.0, 2.0, 2.0, 1.0]);
    }

    #[test]
    fn test_extract_windows_identity_for_size_one() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 3, 1]), vec![1.0, 2.0, 3.0]).unwrap();
        let w = op_extract_windows(&x, 1).unwrap();
        assert_eq!(w.shape(), &[1, 3, 1, 1]);
        assert_eq!(w.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_matmul_batched_and_shared_weight() {
        let a = ArrayD::<f32>::ones(IxDyn(&[2, 3, 4]));
        let w = ArrayD::<f32>::ones(IxDyn(&[4, 5]));
        assert_eq!(op_matmul(&a, &w).unwrap().shape(), &[2, 3, 5]);
        let b = ArrayD::<f32>::ones(IxDyn(&[2, 4, 6]));
        let c = op_matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 3, 6]);
        assert_eq!(c[[1, 2, 5]], 4.0);
    }

    #[test]
    fn test_xent_matches_manual_value() {
        let logits = array![[0.0f32, 0.0]].into_dyn();
        let labels = array![1.0f32].into_dyn();
        let xent = op_sparse_softmax_xent(&logits, &labels).unwrap();
        assert!((xent[[0]] - 2.0f32.ln()).abs() < 1e-6);
        assert!(op_sparse_softmax_xent(&logits, &array![2.0f32].into_dyn()).is_err());
    }

    #[test]
    fn test_one_hot_and_sequence_mask() {
        let oh = op_one_hot(&array![[2.0f32, 0.0]].into_dyn(), 3).unwrap();
        assert_eq!(oh.shape(), &[1, 2, 3]);
        assert_eq!(oh[[0, 0, 2]], 1.0);
        let mask = op_sequence_mask(&array![1.0f32, 3.0].into_dyn(), 2).unwrap();
        assert_eq!(mask, array![[1.0f32, 0.0], [1.0, 1.0]].into_dyn());
    }

    #[test]
    fn test_reduce_sum_to_leading_axes() {
        let g = ArrayD::<f32>::ones(IxDyn(&[2, 3, 4]));
        let r = op_reduce_sum_to(&g, &[4]).unwrap();
        assert_eq!(r, ArrayD::from_elem(IxDyn(&[4]), 6.0));
        let r = op_reduce_sum_to(&g, &[1, 4]).unwrap();
        assert_eq!(r.shape(), &[1, 4]);
    }

    #[test]
    fn test_dropout_mask_is_seeded() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let m1 = op_dropout_mask(&[4, 4], 0.5, &mut a);
        let m2 = op_dropout_mask(&[4, 4], 0.5, &mut b);
        assert_eq!(m1, m2);
        assert!(m1.iter().all(|&v| v == 0.0 || v == 2.0));
    }
}
