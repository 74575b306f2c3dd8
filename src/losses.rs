//! Module containing implementations of loss functions in graph paradigm.
//!
//! Loss functions here are regular Rust functions that take
//! symbolic `Tensor` descriptors and add nodes to the graph necessary
//! for computing the error value.
//!
//! # Available Loss Functions
//!
//! - **Sparse Cross-Entropy**: `sparse_softmax_cross_entropy`
//! - **Masked mean**: `masked_mean`, `masked_sparse_softmax_cross_entropy`

use crate::tensor::Tensor;

/// Per-position cross-entropy between logits and integer class labels.
///
/// # Arguments
///
/// * `logits` - Symbolic `Tensor` of shape `[N, C]` (unnormalized).
/// * `labels` - Symbolic `Tensor` of shape `[N]` holding class indices as `f32`.
///
/// # Returns
///
/// Symbolic `Tensor` of shape `[N]`: `logsumexp(logits[i]) - logits[i, labels[i]]`.
pub fn sparse_softmax_cross_entropy(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits.sparse_softmax_cross_entropy(labels)
}

/// Mean of `values` over positions where `mask` is 1.
///
/// Formula: `sum(values * mask) / sum(mask)`.
pub fn masked_mean(values: &Tensor, mask: &Tensor) -> Tensor {
    let total = (values * mask).sum();
    &total / &mask.sum()
}

/// Cross-entropy averaged over the valid (unpadded) positions only.
///
/// Returns `(loss, per_position)`; `per_position` is unmasked and is what
/// streaming evaluation accumulates.
pub fn masked_sparse_softmax_cross_entropy(logits: &Tensor, labels: &Tensor, mask: &Tensor) -> (Tensor, Tensor) {
    let per_position = sparse_softmax_cross_entropy(logits, labels);
    (masked_mean(&per_position, mask), per_position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::backend::{bind_named, Backend};
    use crate::runtime::cpu_backend::CpuBackend;
    use crate::tensor::GraphContext;
    use ndarray::array;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[test]
    fn test_padding_does_not_change_loss() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let logits = Tensor::new_input(&ctx, "logits");
        let labels = Tensor::new_input(&ctx, "labels");
        let mask = Tensor::new_input(&ctx, "mask");
        let (loss, _) = masked_sparse_softmax_cross_entropy(&logits, &labels, &mask);
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(loss.node_id);

        // вторая позиция: паддинг с заведомо плохим предсказанием
        let data = HashMap::from([
            ("logits".to_string(), Value::Tensor(array![[0.0f32, 0.0], [10.0, -10.0]].into_dyn())),
            ("labels".to_string(), Value::Tensor(array![1.0f32, 1.0].into_dyn())),
            ("mask".to_string(), Value::Tensor(array![1.0f32, 0.0].into_dyn())),
        ]);
        let (results, _) = CpuBackend::new().run(&graph, bind_named(&graph, &data)).unwrap();
        let loss = results[0].scalar().unwrap();
        assert!((loss - 2.0f32.ln()).abs() < 1e-6);
    }
}
