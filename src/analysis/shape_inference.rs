//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape
//! and data type of the output tensor for each node based on its input shapes and operation type.

use crate::asg::{slice_bounds, Asg, AsgError, DType, Node, NodeId, NodeType, Shape, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}. \
             Ensure dimensions are compatible for broadcasting or matrix multiplication.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}. \
             This may mean the node has not been processed by shape inference yet or the graph contains a cyclic dependency.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Declare the shape when creating the input or add it to the initial_shapes HashMap.")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D. \
             Check input data dimensions.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Node {0} must be a Literal for shape computation (e.g., for Reshape operation). \
             Dynamic shapes are not supported.")]
    NotALiteral(NodeId),

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),

    #[error("Matrix multiplication error: incompatible inner dimensions {0} and {1}.")]
    MatmulDimensionError(usize, usize),

    #[error("Sequence of length {len} is too short for windows of size {window_size}.")]
    WindowTooLarge { len: usize, window_size: usize },

    #[error("Cannot reshape {from:?} into {to:?}.")]
    InvalidReshape { from: Shape, to: Vec<i64> },
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the shape inference process for the graph.
    ///
    /// Modifies the graph in-place, filling in the `shape` and `dtype` fields for each node.
    ///
    /// # Arguments
    /// * `asg` - Mutable reference to the graph to analyze.
    /// * `initial_shapes` - Shapes for `Input`, `Parameter` and `External` nodes that
    ///   were not declared at creation time. Key is the node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let mut node = asg.get_node(node_id)?.clone();

            let (shape, dtype) = Self::infer_node_shape(asg, &node, initial_shapes)?;

            node.shape = Some(shape);
            node.dtype = Some(dtype);
            asg.nodes.insert(node_id, node);
        }

        Ok(())
    }

    /// Main shape inference logic for a single node.
    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name }
            | NodeType::Parameter { name }
            | NodeType::External { name, .. } => initial_shapes
                .get(name)
                .cloned()
                .or_else(|| node.shape.clone().map(|s| (s, DType::F32)))
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::Literal(value) => match value {
                Value::Tensor(arr) => Ok((arr.shape().to_vec(), DType::F32)),
                Value::ScalarF32(_) => Ok((vec![], DType::F32)),
            },

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::GreaterThan(l, r)
            | NodeType::Equal(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                Ok((broadcast_shapes(&ls, &rs)?, ld))
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;

                if ls.is_empty() || rs.is_empty() {
                    return Ok((broadcast_shapes(&ls, &rs)?, ld));
                }
                if ls.len() < 2 || rs.len() < 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: ls.len().min(rs.len()),
                    });
                }

                let k1 = ls[ls.len() - 1];
                let k2 = rs[rs.len() - 2];
                if k1 != k2 {
                    return Err(ShapeInferenceError::MatmulDimensionError(k1, k2));
                }
                let n = rs[rs.len() - 1];

                if rs.len() > 2 && ls[..ls.len() - 2] != rs[..rs.len() - 2] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }

                let mut out_shape = ls[..ls.len() - 1].to_vec();
                out_shape.push(n);
                Ok((out_shape, ld))
            }

            // Element-wise operations - shape unchanged
            NodeType::Negate(id)
            | NodeType::Exp(id)
            | NodeType::ReLU(id)
            | NodeType::Sigmoid(id)
            | NodeType::Tanh(id)
            | NodeType::Softmax(id)
            | NodeType::CausalSoftmax(id) => Self::get_shape_dtype(asg, *id),

            NodeType::ArgMax(id) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                shape.pop();
                Ok((shape, dtype))
            }

            NodeType::Sum(_) => Ok((vec![], DType::F32)),

            NodeType::Reshape(data_id, shape_id) => {
                let (data_shape, dtype) = Self::get_shape_dtype(asg, *data_id)?;
                let shape_node = asg.get_node(*shape_id)?;
                if let NodeType::Literal(Value::Tensor(shape_tensor)) = &shape_node.node_type {
                    let requested: Vec<i64> = shape_tensor.iter().map(|&x| x as i64).collect();
                    let total: usize = data_shape.iter().product();
                    let new_shape = resolve_reshape(total, &requested).ok_or_else(|| {
                        ShapeInferenceError::InvalidReshape { from: data_shape.clone(), to: requested.clone() }
                    })?;
                    Ok((new_shape, dtype))
                } else {
                    Err(ShapeInferenceError::NotALiteral(*shape_id))
                }
            }

            NodeType::ReshapeLike(data_id, like_id) => {
                let (_, dtype) = Self::get_shape_dtype(asg, *data_id)?;
                let (like_shape, _) = Self::get_shape_dtype(asg, *like_id)?;
                Ok((like_shape, dtype))
            }

            NodeType::MatrixTranspose(id) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                let rank = shape.len();
                if rank < 2 {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 2, actual: rank });
                }
                shape.swap(rank - 2, rank - 1);
                Ok((shape, dtype))
            }

            NodeType::Broadcast(source_id, target_id) | NodeType::ReduceSumTo(source_id, target_id) => {
                let (_, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                Ok((target_shape, dtype))
            }

            NodeType::Concat { inputs, axis } => {
                let (mut out, dtype) = Self::get_shape_dtype(asg, inputs[0])?;
                if *axis >= out.len() {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: axis + 1, actual: out.len() });
                }
                for id in &inputs[1..] {
                    let (shape, _) = Self::get_shape_dtype(asg, *id)?;
                    let compatible = shape.len() == out.len()
                        && shape.iter().zip(out.iter()).enumerate().all(|(i, (a, b))| i == *axis || a == b);
                    if !compatible {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Concat".to_string(),
                            shape1: out,
                            shape2: shape,
                        });
                    }
                    out[*axis] += shape[*axis];
                }
                Ok((out, dtype))
            }

            NodeType::Stack { inputs, axis } => {
                let (first, dtype) = Self::get_shape_dtype(asg, inputs[0])?;
                for id in &inputs[1..] {
                    let (shape, _) = Self::get_shape_dtype(asg, *id)?;
                    if shape != first {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Stack".to_string(),
                            shape1: first,
                            shape2: shape,
                        });
                    }
                }
                if *axis > first.len() {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: *axis, actual: first.len() });
                }
                let mut out = first;
                out.insert(*axis, inputs.len());
                Ok((out, dtype))
            }

            NodeType::Slice { input, axis, start, end } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if *axis >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: axis + 1, actual: shape.len() });
                }
                let (lo, hi) = slice_bounds(shape[*axis], *start, *end);
                shape[*axis] = hi - lo;
                Ok((shape, dtype))
            }

            NodeType::Select { input, axis, .. } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if *axis >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: axis + 1, actual: shape.len() });
                }
                shape.remove(*axis);
                Ok((shape, dtype))
            }

            NodeType::ExtractWindows { input, window_size } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if shape.len() != 3 {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 3, actual: shape.len() });
                }
                if shape[1] + 1 < *window_size {
                    return Err(ShapeInferenceError::WindowTooLarge { len: shape[1], window_size: *window_size });
                }
                Ok((vec![shape[0], shape[1] + 1 - window_size, shape[2], *window_size], dtype))
            }

            NodeType::OneHot { indices, depth } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *indices)?;
                shape.push(*depth);
                Ok((shape, dtype))
            }

            NodeType::SequenceMask { lengths, maxlen } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *lengths)?;
                shape.push(*maxlen);
                Ok((shape, dtype))
            }

            NodeType::DropoutMask { like, .. } => Self::get_shape_dtype(asg, *like),

            NodeType::SparseSoftmaxCrossEntropy { logits, labels } => {
                let (ls, dtype) = Self::get_shape_dtype(asg, *logits)?;
                let (ys, _) = Self::get_shape_dtype(asg, *labels)?;
                if ls.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 2, actual: ls.len() });
                }
                if ys != [ls[0]] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "SparseSoftmaxCrossEntropy".to_string(),
                        shape1: ls,
                        shape2: ys,
                    });
                }
                Ok((vec![ls[0]], dtype))
            }

            NodeType::SoftmaxGrad { output, .. } => Self::get_shape_dtype(asg, *output),
            NodeType::SparseSoftmaxCrossEntropyGrad { logits, .. } => Self::get_shape_dtype(asg, *logits),

            NodeType::ExtractWindowsGrad { grad, window_size } => {
                let (shape, dtype) = Self::get_shape_dtype(asg, *grad)?;
                if shape.len() != 4 {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 4, actual: shape.len() });
                }
                Ok((vec![shape[0], shape[1] + window_size - 1, shape[2]], dtype))
            }

            NodeType::SliceGrad { like, .. } | NodeType::SelectGrad { like, .. } => {
                Self::get_shape_dtype(asg, *like)
            }

            NodeType::ConcatGrad { parts, index, .. } => Self::get_shape_dtype(asg, parts[*index]),
        }
    }

    /// Helper function to get already computed shape and type for a node.
    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    /// Performs topological sort of the graph.
    /// Returns a vector of node IDs in order suitable for computation.
    ///
    /// Unrolled recurrences produce very deep graphs, so the traversal keeps an
    /// explicit stack instead of recursing.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        Self::topological_sort_from(asg, &asg.outputs)
    }

    /// Topological order of everything reachable from `roots`.
    pub fn topological_sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();

        // IMPORTANT: need to traverse all roots, not just one
        for &output_id in roots {
            if visited.contains(&output_id) {
                continue;
            }
            let mut stack: Vec<(NodeId, bool)> = vec![(output_id, false)];
            while let Some((node_id, expanded)) = stack.pop() {
                if expanded {
                    on_path.remove(&node_id);
                    if visited.insert(node_id) {
                        sorted.push(node_id);
                    }
                    continue;
                }
                if visited.contains(&node_id) {
                    continue;
                }
                if !on_path.insert(node_id) {
                    return Err(ShapeInferenceError::MissingShapeInfo(node_id));
                }
                stack.push((node_id, true));
                let node = asg.get_node(node_id)?;
                for input_id in node.node_type.inputs().into_iter().rev() {
                    if !visited.contains(&input_id) {
                        stack.push((input_id, false));
                    }
                }
            }
        }
        Ok(sorted)
    }
}

/// NumPy-style broadcasting of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(ShapeInferenceError::BroadcastError(a.to_vec(), b.to_vec())),
        };
    }
    Ok(out)
}

/// Resolves a reshape request with at most one `-1` entry.
pub fn resolve_reshape(total: usize, requested: &[i64]) -> Option<Shape> {
    let known: i64 = requested.iter().filter(|&&d| d >= 0).product();
    let unknown = requested.iter().filter(|&&d| d < 0).count();
    match unknown {
        0 if known as usize == total => Some(requested.iter().map(|&d| d as usize).collect()),
        1 if known > 0 && total % known as usize == 0 => {
            let inferred = total / known as usize;
            Some(requested.iter().map(|&d| if d < 0 { inferred } else { d as usize }).collect())
        }
        1 if known == 0 && total == 0 => Some(requested.iter().map(|&d| if d < 0 { 0 } else { d as usize }).collect()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[2, 3], &[1, 3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_shapes(&[4, 1, 5], &[3, 1]).unwrap(), vec![4, 3, 5]);
        assert_eq!(broadcast_shapes(&[], &[2]).unwrap(), vec![2]);
        assert!(broadcast_shapes(&[2], &[3]).is_err());
    }

    #[test]
    fn test_resolve_reshape() {
        assert_eq!(resolve_reshape(12, &[3, -1]), Some(vec![3, 4]));
        assert_eq!(resolve_reshape(12, &[5, -1]), None);
        assert_eq!(resolve_reshape(6, &[2, 3]), Some(vec![2, 3]));
    }

    #[test]
    fn test_window_and_attention_shapes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input_with_shape(&ctx, "x", vec![2, 6, 3]);
        let windows = x.extract_windows(3);
        let enc = windows.reshape(vec![2, 4, 9]);
        let keys = enc.slice(1, 0, Some(-1));
        let sim = enc.dot(&keys.matrix_transpose()).causal_softmax();
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![sim.node_id]);
        ShapeInference::run(&mut graph, &HashMap::new()).unwrap();
        assert_eq!(graph.get_node(windows.node_id).unwrap().shape, Some(vec![2, 4, 3, 3]));
        assert_eq!(graph.get_node(sim.node_id).unwrap().shape, Some(vec![2, 4, 3]));
    }

    #[test]
    fn test_matmul_mismatch_is_reported() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let a = Tensor::new_input_with_shape(&ctx, "a", vec![2, 3]);
        let b = Tensor::new_input_with_shape(&ctx, "b", vec![4, 5]);
        let c = a.dot(&b);
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(c.node_id);
        let err = ShapeInference::run(&mut graph, &HashMap::new()).unwrap_err();
        assert_eq!(err, ShapeInferenceError::MatmulDimensionError(3, 4));
    }

    #[test]
    fn test_topological_sort_deep_chain() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let mut x = Tensor::new_input_with_shape(&ctx, "x", vec![1]);
        for _ in 0..20_000 {
            x = x.tanh();
        }
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(x.node_id);
        let order = ShapeInference::topological_sort(&graph).unwrap();
        assert_eq!(order.len(), 20_001);
        assert_eq!(*order.last().unwrap(), x.node_id);
    }
}
