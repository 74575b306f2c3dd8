//! Sliding input windows and their shared encoder.

use super::ConfigurationError;
use crate::nn::{Linear, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Slices `[batch, window_size - 1 + T, features]` into `T` overlapping
/// windows laid out as `[batch, T, features, window_size]`.
///
/// Window `i` holds steps `[i, i + window_size)`, so it ends at output step `i`.
pub fn extract_input_windows(inputs: &Tensor, window_size: usize) -> Result<Tensor, ConfigurationError> {
    if window_size == 0 {
        return Err(ConfigurationError::NonPositiveWindowSize(window_size));
    }
    Ok(inputs.extract_windows(window_size))
}

/// Affine map + ReLU applied to every flattened window, shared over batch and
/// time. Parameters are `window_encoder.weights` and `window_encoder.bias`.
pub struct WindowEncoder {
    projection: Linear,
    batch_size: usize,
    input_size: usize,
    window_size: usize,
}

impl WindowEncoder {
    pub const NAME: &'static str = "window_encoder";

    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        batch_size: usize,
        input_size: usize,
        window_size: usize,
        encoding_size: usize,
    ) -> Self {
        let projection = Linear::new(context, input_size * window_size, encoding_size, Self::NAME);
        Self { projection, batch_size, input_size, window_size }
    }

    pub fn encoding_size(&self) -> usize {
        self.projection.out_features
    }
}

impl Module for WindowEncoder {
    /// `[batch, T, features, window_size]` -> `[batch, T, encoding_size]`.
    fn forward(&self, windows: &Tensor) -> Tensor {
        let flat = windows.reshape(vec![
            self.batch_size as i64,
            -1,
            (self.input_size * self.window_size) as i64,
        ]);
        self.projection.forward(&flat).relu()
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.projection.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::backend::{bind_named, Backend};
    use crate::runtime::cpu_backend::CpuBackend;
    use ndarray::{ArrayD, IxDyn};
    use std::collections::HashMap;

    fn run_windows(padded: ArrayD<f32>, window_size: usize) -> ArrayD<f32> {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let windows = extract_input_windows(&x, window_size).unwrap();
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(windows.node_id);
        let data = HashMap::from([("x".to_string(), Value::Tensor(padded))]);
        let (results, _) = CpuBackend::new().run(&graph, bind_named(&graph, &data)).unwrap();
        results[0].clone().into_tensor()
    }

    #[test]
    fn test_window_count_matches_output_steps() {
        let steps = 5;
        for window_size in 1..=4 {
            let len = window_size - 1 + steps;
            let padded = ArrayD::from_shape_fn(IxDyn(&[2, len, 3]), |idx| (idx[1] * 10 + idx[2]) as f32);
            let windows = run_windows(padded, window_size);
            assert_eq!(windows.shape(), &[2, steps, 3, window_size]);
            // окно i заканчивается на шаге i + window_size - 1
            for i in 0..steps {
                let last = (i + window_size - 1) * 10;
                assert_eq!(windows[[1, i, 2, window_size - 1]], (last + 2) as f32);
            }
        }
    }

    #[test]
    fn test_unit_window_is_identity() {
        let padded = ArrayD::from_shape_fn(IxDyn(&[1, 3, 2]), |idx| (idx[1] + idx[2]) as f32);
        let windows = run_windows(padded.clone(), 1);
        assert_eq!(windows.into_shape(IxDyn(&[1, 3, 2])).unwrap(), padded);
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        assert_eq!(
            extract_input_windows(&x, 0).unwrap_err(),
            ConfigurationError::NonPositiveWindowSize(0)
        );
    }

    #[test]
    fn test_encoder_output_is_non_negative() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let encoder = WindowEncoder::new(&ctx, 2, 3, 2, 4);
        let encodings = encoder.forward(&extract_input_windows(&x, 2).unwrap());
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(encodings.node_id);

        let data = HashMap::from([
            ("x".to_string(), Value::Tensor(ArrayD::from_shape_fn(IxDyn(&[2, 6, 3]), |idx| idx[1] as f32 - 2.5))),
            (
                "window_encoder.weights".to_string(),
                Value::Tensor(ArrayD::from_shape_fn(IxDyn(&[6, 4]), |idx| idx[0] as f32 - idx[1] as f32)),
            ),
            ("window_encoder.bias".to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[1, 4])))),
        ]);
        let (results, _) = CpuBackend::new().run(&graph, bind_named(&graph, &data)).unwrap();
        let encodings = results[0].as_tensor().unwrap();
        assert_eq!(encodings.shape(), &[2, 5, 4]);
        assert!(encodings.iter().all(|&v| v >= 0.0));
        assert_eq!(encoder.encoding_size(), 4);
    }
}
