//! Self-similarity between window encodings and the label attention it drives.

use crate::tensor::Tensor;

/// Keys for the self-similarity: all past encodings followed by the current
/// encodings except the most recent one.
pub fn target_encodings(past_encodings: &Tensor, encodings: &Tensor) -> Tensor {
    Tensor::concat(&[past_encodings.clone(), encodings.slice(1, 0, Some(-1))], 1)
}

/// `similarity[b, i, j] = encodings[b, i] . targets[b, j]`, shape `[B, Q, K]`.
///
/// No masking is applied here.
pub fn self_similarity(encodings: &Tensor, targets: &Tensor) -> Tensor {
    encodings.dot(&targets.matrix_transpose())
}

/// Soft label distribution per query step, `[B, Q, num_classes]`.
///
/// Query step `i` attends to the first `K - Q + i + 1` label positions. The
/// last label immediately precedes the last query, so the final step sees
/// every label. Steps with nothing to attend to get an all-zero row.
pub fn similarity_weighted_attention(labels: &Tensor, self_similarity: &Tensor, num_classes: usize) -> Tensor {
    let attention = self_similarity.causal_softmax();
    attention.dot(&labels.one_hot(num_classes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::backend::{bind_named, Backend};
    use crate::runtime::cpu_backend::CpuBackend;
    use crate::tensor::GraphContext;
    use ndarray::{array, ArrayD};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn run(similarity: ArrayD<f32>, labels: ArrayD<f32>, num_classes: usize) -> (ArrayD<f32>, ArrayD<f32>) {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let sim = Tensor::new_input(&ctx, "sim");
        let lbl = Tensor::new_input(&ctx, "labels");
        let weights = sim.causal_softmax();
        let attention = similarity_weighted_attention(&lbl, &sim, num_classes);
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![weights.node_id, attention.node_id]);
        let data = HashMap::from([
            ("sim".to_string(), Value::Tensor(similarity)),
            ("labels".to_string(), Value::Tensor(labels)),
        ]);
        let (results, _) = CpuBackend::new().run(&graph, bind_named(&graph, &data)).unwrap();
        (results[0].clone().into_tensor(), results[1].clone().into_tensor())
    }

    #[test]
    fn test_causal_mask_mass() {
        // Q = 4, K = 3: шаг i видит i ключей
        let sim = ArrayD::from_shape_fn(ndarray::IxDyn(&[1, 4, 3]), |idx| (idx[1] * 3 + idx[2]) as f32 * 0.3);
        let (weights, attention) = run(sim, array![[1.0f32, 2.0, 0.0]].into_dyn(), 3);
        for i in 0..4 {
            let row = weights.slice(ndarray::s![0, i, ..]);
            let valid: f32 = row.iter().take(i).sum();
            let masked: f32 = row.iter().skip(i).sum();
            assert_eq!(masked, 0.0);
            if i == 0 {
                assert_eq!(valid, 0.0);
            } else {
                assert!((valid - 1.0).abs() < 1e-6);
            }
            let feature_mass: f32 = attention.slice(ndarray::s![0, i, ..]).sum();
            assert!((feature_mass - valid).abs() < 1e-6);
        }
        assert!(attention.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_dominant_similarity_selects_label() {
        let sim = array![[[0.0f32, 50.0, 0.0]]].into_dyn();
        let (_, attention) = run(sim, array![[0.0f32, 3.0, 1.0]].into_dyn(), 4);
        let row: ndarray::Array1<f32> = attention.slice(ndarray::s![0, 0, ..]).to_owned();
        assert!((row[[3]] - 1.0).abs() < 1e-6);
        assert!(row[[0]] < 1e-6 && row[[1]] < 1e-6);
    }

    #[test]
    fn test_self_similarity_is_dot_product() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let enc = Tensor::new_input(&ctx, "enc");
        let past = Tensor::new_input(&ctx, "past");
        let targets = target_encodings(&past, &enc);
        let sim = self_similarity(&enc, &targets);
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![targets.node_id, sim.node_id]);
        let data = HashMap::from([
            ("enc".to_string(), Value::Tensor(array![[[1.0f32, 0.0], [0.0, 2.0], [1.0, 1.0]]].into_dyn())),
            ("past".to_string(), Value::Tensor(array![[[3.0f32, 1.0]]].into_dyn())),
        ]);
        let (results, _) = CpuBackend::new().run(&graph, bind_named(&graph, &data)).unwrap();
        let targets = results[0].as_tensor().unwrap();
        assert_eq!(targets.shape(), &[1, 3, 2]);
        let sim = results[1].as_tensor().unwrap();
        assert_eq!(sim.shape(), &[1, 3, 3]);
        // enc[2] . past[0] = 4, enc[2] . enc[1] = 2
        assert_eq!(sim[[0, 2, 0]], 4.0);
        assert_eq!(sim[[0, 2, 2]], 2.0);
    }
}
