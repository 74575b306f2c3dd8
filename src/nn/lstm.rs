//! Basic LSTM cell built from graph operations.

use crate::nn::{Linear, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Bias added to the forget gate before the sigmoid.
pub const FORGET_BIAS: f32 = 1.0;

/// `(c, h)` pair of one LSTM layer. Generic so the same layout describes both
/// symbolic tensors and concrete arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmState<T> {
    pub c: T,
    pub h: T,
}

/// LSTM cell without peepholes or projections.
///
/// All four gates come from one linear map over `[x, h]`, split as
/// `i, j, f, o`:
///
/// ```text
/// c' = c * sigmoid(f + forget_bias) + sigmoid(i) * tanh(j)
/// h' = tanh(c') * sigmoid(o)
/// ```
pub struct BasicLstmCell {
    pub units: usize,
    gates: Linear,
    context: Rc<RefCell<GraphContext>>,
}

impl BasicLstmCell {
    pub fn new(context: &Rc<RefCell<GraphContext>>, input_size: usize, units: usize, name: &str) -> Self {
        let gates = Linear::new(context, input_size + units, 4 * units, name);
        Self { units, gates, context: Rc::clone(context) }
    }

    /// One time step. `inputs` is `[batch, input_size]`.
    pub fn step(&self, inputs: &Tensor, state: &LstmState<Tensor>) -> (Tensor, LstmState<Tensor>) {
        let joined = Tensor::concat(&[inputs.clone(), state.h.clone()], 1);
        let gates = self.gates.forward(&joined);

        let u = self.units as isize;
        let i = gates.slice(1, 0, Some(u));
        let j = gates.slice(1, u, Some(2 * u));
        let f = gates.slice(1, 2 * u, Some(3 * u));
        let o = gates.slice(1, 3 * u, None);

        let forget_bias = Tensor::scalar(&self.context, FORGET_BIAS);
        let new_c = &state.c * &(&f + &forget_bias).sigmoid() + &i.sigmoid() * &j.tanh();
        let new_h = &new_c.tanh() * &o.sigmoid();

        (new_h.clone(), LstmState { c: new_c, h: new_h })
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.gates.parameters()
    }
}
