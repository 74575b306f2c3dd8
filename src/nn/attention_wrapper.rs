//! Bounded-length attention over a cell's own recent outputs.
//!
//! The wrapper keeps the last `attn_length` outputs of the wrapped LSTM in its
//! state and, at every step, attends over them with the new cell state as the
//! query. The attention read is mixed into both the next input and the output.

use crate::nn::lstm::{BasicLstmCell, LstmState};
use crate::nn::{Linear, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Extra state carried by [`AttentionCellWrapper`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionState<T> {
    /// Last attention read, `[batch, units]`.
    pub attns: T,
    /// Last `attn_length` outputs, flattened to `[batch, attn_length * units]`.
    pub attn_states: T,
}

pub struct AttentionCellWrapper {
    pub cell: BasicLstmCell,
    pub attn_length: usize,
    input_projection: Linear,
    keys: Linear,
    query: Linear,
    scores: Tensor,
    output_projection: Linear,
}

impl AttentionCellWrapper {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        input_size: usize,
        units: usize,
        attn_length: usize,
        name: &str,
    ) -> Self {
        let cell = BasicLstmCell::new(context, input_size, units, &format!("{}.lstm", name));
        let input_projection = Linear::new(context, input_size + units, input_size, &format!("{}.attention.input", name));
        let keys = Linear::without_bias(context, units, units, &format!("{}.attention.keys", name));
        let query = Linear::new(context, 2 * units, units, &format!("{}.attention.query", name));
        let scores = Tensor::new_parameter_with_shape(context, &format!("{}.attention.v", name), vec![units, 1]);
        let output_projection = Linear::new(context, 2 * units, units, &format!("{}.attention.output", name));
        Self { cell, attn_length, input_projection, keys, query, scores, output_projection }
    }

    pub fn units(&self) -> usize {
        self.cell.units
    }

    pub fn step(
        &self,
        inputs: &Tensor,
        state: &LstmState<Tensor>,
        attention: &AttentionState<Tensor>,
    ) -> (Tensor, LstmState<Tensor>, AttentionState<Tensor>) {
        let units = self.units() as i64;
        let length = self.attn_length as i64;

        let x = self
            .input_projection
            .forward(&Tensor::concat(&[inputs.clone(), attention.attns.clone()], 1));
        let (cell_output, new_state) = self.cell.step(&x, state);

        // Additive attention: v . tanh(K h_k + Q q)
        let history = attention.attn_states.reshape(vec![-1, length, units]);
        let query = Tensor::concat(&[new_state.c.clone(), new_state.h.clone()], 1);
        let hidden_features = self.keys.forward(&history);
        let y = self.query.forward(&query).reshape(vec![-1, 1, units]);
        let energies = (&hidden_features + &y).tanh().dot(&self.scores).reshape(vec![-1, length]);
        let weights = energies.softmax().reshape(vec![-1, 1, length]);
        let new_attns = weights.dot(&history).reshape(vec![-1, units]);

        let output = self
            .output_projection
            .forward(&Tensor::concat(&[cell_output, new_attns.clone()], 1));

        let shifted = history.slice(1, 1, None);
        let appended = Tensor::concat(&[shifted, output.reshape(vec![-1, 1, units])], 1);
        let new_attn_states = appended.reshape(vec![-1, length * units]);

        (output, new_state, AttentionState { attns: new_attns, attn_states: new_attn_states })
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.cell.parameters();
        params.extend(self.input_projection.parameters());
        params.extend(self.keys.parameters());
        params.extend(self.query.parameters());
        params.push(self.scores.clone());
        params.extend(self.output_projection.parameters());
        params
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

    #[test]
    fn test_attention_history_shifts_in_new_output() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let wrapper = AttentionCellWrapper::new(&ctx, 2, 3, 4, "cell");
        let x = Tensor::new_input(&ctx, "x");
        let lstm = LstmState { c: Tensor::new_input(&ctx, "c"), h: Tensor::new_input(&ctx, "h") };
        let attention = AttentionState {
            attns: Tensor::new_input(&ctx, "attns"),
            attn_states: Tensor::new_input(&ctx, "attn_states"),
        };
        let (output, _, new_attention) = wrapper.step(&x, &lstm, &attention);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_outputs(vec![output.node_id, new_attention.attn_states.node_id, new_attention.attns.node_id]);

        let mut data: HashMap<String, Value> = HashMap::new();
        for (_, name) in graph.parameter_names() {
            let node = graph.get_node(graph.find_named(&name).unwrap()).unwrap();
            let shape = node.shape.clone().unwrap();
            data.insert(name, Value::Tensor(ArrayD::from_elem(IxDyn(&shape), 0.1)));
        }
        data.insert("x".into(), Value::Tensor(ArrayD::ones(IxDyn(&[2, 2]))));
        data.insert("c".into(), Value::Tensor(ArrayD::zeros(IxDyn(&[2, 3]))));
        data.insert("h".into(), Value::Tensor(ArrayD::zeros(IxDyn(&[2, 3]))));
        data.insert("attns".into(), Value::Tensor(ArrayD::zeros(IxDyn(&[2, 3]))));
        let history = ArrayD::from_shape_fn(IxDyn(&[2, 12]), |idx| idx[1] as f32);
        data.insert("attn_states".into(), Value::Tensor(history));

        let backend = CpuBackend::new();
        let (results, _) = backend.run(&graph, bind_named(&graph, &data)).unwrap();
        let output = results[0].as_tensor().unwrap();
        let states = results[1].as_tensor().unwrap();
        assert_eq!(output.shape(), &[2, 3]);
        assert_eq!(states.shape(), &[2, 12]);
        // oldest output dropped, newest appended
        assert_eq!(states[[0, 0]], 3.0);
        assert_eq!(states[[1, 8]], 11.0);
        assert!((states[[0, 9]] - output[[0, 0]]).abs() < 1e-6);
        assert_eq!(results[2].as_tensor().unwrap().shape(), &[2, 3]);
    }
}
