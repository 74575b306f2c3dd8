//! Stacked recurrent cells, their state, and static unrolling over time.
//!
//! State is an ordered list of per-layer blocks. Flattening yields, in layer
//! order, `c, h` for a plain LSTM layer and `c, h, attns, attn_states` for an
//! attention-wrapped one. [`RnnState::unflatten`] is the inverse given the
//! [`StateLayout`] of the cell.

use crate::nn::attention_wrapper::{AttentionCellWrapper, AttentionState};
use crate::nn::lstm::{BasicLstmCell, LstmState};
use crate::nn::{Dropout, Module};
use crate::tensor::{GraphContext, Tensor};
use ndarray::{ArrayD, IxDyn};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("expected {expected} state blocks, got {actual}")]
    BlockCount { expected: usize, actual: usize },
    #[error("state of layer {0} does not match the cell layout")]
    LayoutMismatch(usize),
}

/// Shape description of one layer's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerLayout {
    pub units: usize,
    /// `0` for a plain LSTM layer.
    pub attn_length: usize,
}

impl LayerLayout {
    pub fn has_attention(&self) -> bool {
        self.attn_length > 0
    }

    /// Widths of this layer's blocks in flattening order.
    pub fn block_widths(&self) -> Vec<usize> {
        let mut widths = vec![self.units, self.units];
        if self.has_attention() {
            widths.extend([self.units, self.attn_length * self.units]);
        }
        widths
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    pub layers: Vec<LayerLayout>,
}

impl StateLayout {
    pub fn num_blocks(&self) -> usize {
        self.layers.iter().map(|l| l.block_widths().len()).sum()
    }

    /// Stable names of the flattened blocks: `state.{layer}.{c|h|attns|attn_states}`.
    pub fn block_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.num_blocks());
        for (layer, l) in self.layers.iter().enumerate() {
            names.push(format!("state.{}.c", layer));
            names.push(format!("state.{}.h", layer));
            if l.has_attention() {
                names.push(format!("state.{}.attns", layer));
                names.push(format!("state.{}.attn_states", layer));
            }
        }
        names
    }

    /// Concrete all-zero state for `batch` sequences.
    pub fn zeros(&self, batch: usize) -> RnnState<ArrayD<f32>> {
        let blocks = self
            .layers
            .iter()
            .flat_map(|l| l.block_widths())
            .map(|width| ArrayD::zeros(IxDyn(&[batch, width])))
            .collect();
        // Block count always matches the layout it was generated from.
        RnnState::unflatten(self, blocks).unwrap_or(RnnState { layers: Vec::new() })
    }
}

/// State of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerState<T> {
    pub lstm: LstmState<T>,
    pub attention: Option<AttentionState<T>>,
}

/// Full state of a [`MultiRnnCell`], generic over symbolic tensors and arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct RnnState<T> {
    pub layers: Vec<LayerState<T>>,
}

impl<T: Clone> RnnState<T> {
    pub fn flatten(&self) -> Vec<T> {
        let mut blocks = Vec::new();
        for layer in &self.layers {
            blocks.push(layer.lstm.c.clone());
            blocks.push(layer.lstm.h.clone());
            if let Some(attention) = &layer.attention {
                blocks.push(attention.attns.clone());
                blocks.push(attention.attn_states.clone());
            }
        }
        blocks
    }

    pub fn unflatten(layout: &StateLayout, blocks: Vec<T>) -> Result<Self, StateError> {
        let expected = layout.num_blocks();
        if blocks.len() != expected {
            return Err(StateError::BlockCount { expected, actual: blocks.len() });
        }
        let mut blocks = blocks.into_iter();
        let mut layers = Vec::with_capacity(layout.layers.len());
        for l in &layout.layers {
            // Length was checked above.
            let mut next = || blocks.next().ok_or(StateError::BlockCount { expected, actual: expected - 1 });
            let lstm = LstmState { c: next()?, h: next()? };
            let attention = if l.has_attention() {
                Some(AttentionState { attns: next()?, attn_states: next()? })
            } else {
                None
            };
            layers.push(LayerState { lstm, attention });
        }
        Ok(Self { layers })
    }
}

/// One layer of the stack.
pub enum RnnLayer {
    Lstm(BasicLstmCell),
    Attention(AttentionCellWrapper),
}

impl RnnLayer {
    fn layout(&self) -> LayerLayout {
        match self {
            RnnLayer::Lstm(cell) => LayerLayout { units: cell.units, attn_length: 0 },
            RnnLayer::Attention(wrapper) => LayerLayout { units: wrapper.units(), attn_length: wrapper.attn_length },
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        match self {
            RnnLayer::Lstm(cell) => cell.parameters(),
            RnnLayer::Attention(wrapper) => wrapper.parameters(),
        }
    }
}

/// Stack of LSTM layers with output dropout after every layer.
pub struct MultiRnnCell {
    pub layers: Vec<RnnLayer>,
    dropout: Dropout,
    context: Rc<RefCell<GraphContext>>,
}

impl MultiRnnCell {
    /// Builds one layer per entry of `layer_sizes`. When `attn_length > 0` the
    /// first layer is attention-wrapped.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        input_size: usize,
        layer_sizes: &[usize],
        attn_length: usize,
        dropout: Dropout,
        name: &str,
    ) -> Self {
        let mut layers = Vec::with_capacity(layer_sizes.len());
        let mut size_in = input_size;
        for (i, &units) in layer_sizes.iter().enumerate() {
            let cell_name = format!("{}.cell_{}", name, i);
            let layer = if i == 0 && attn_length > 0 {
                RnnLayer::Attention(AttentionCellWrapper::new(context, size_in, units, attn_length, &cell_name))
            } else {
                RnnLayer::Lstm(BasicLstmCell::new(context, size_in, units, &cell_name))
            };
            layers.push(layer);
            size_in = units;
        }
        Self { layers, dropout, context: Rc::clone(context) }
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout { layers: self.layers.iter().map(RnnLayer::layout).collect() }
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.layout().units).unwrap_or(0)
    }

    /// Zero initial state as graph literals.
    pub fn zero_state(&self, batch: usize) -> RnnState<Tensor> {
        let blocks = self.layout().zeros(batch).flatten();
        let names = self.layout().block_names();
        let tensors = blocks
            .into_iter()
            .zip(names)
            .map(|(block, name)| Tensor::new_literal(&self.context, block, &name))
            .collect();
        RnnState::unflatten(&self.layout(), tensors).unwrap_or(RnnState { layers: Vec::new() })
    }

    /// Initial state fed from outside, one graph input per flattened block.
    pub fn state_inputs(&self) -> RnnState<Tensor> {
        let tensors = self
            .layout()
            .block_names()
            .iter()
            .map(|name| Tensor::new_input(&self.context, name))
            .collect();
        RnnState::unflatten(&self.layout(), tensors).unwrap_or(RnnState { layers: Vec::new() })
    }

    /// One step through every layer. `inputs` is `[batch, input_size]`.
    pub fn step(&self, inputs: &Tensor, state: &RnnState<Tensor>) -> Result<(Tensor, RnnState<Tensor>), StateError> {
        if state.layers.len() != self.layers.len() {
            return Err(StateError::LayoutMismatch(state.layers.len()));
        }
        let mut x = inputs.clone();
        let mut new_layers = Vec::with_capacity(self.layers.len());
        for (i, (layer, layer_state)) in self.layers.iter().zip(&state.layers).enumerate() {
            let (output, new_state) = match (layer, &layer_state.attention) {
                (RnnLayer::Lstm(cell), None) => {
                    let (output, lstm) = cell.step(&x, &layer_state.lstm);
                    (output, LayerState { lstm, attention: None })
                }
                (RnnLayer::Attention(wrapper), Some(attention)) => {
                    let (output, lstm, attention) = wrapper.step(&x, &layer_state.lstm, attention);
                    (output, LayerState { lstm, attention: Some(attention) })
                }
                _ => return Err(StateError::LayoutMismatch(i)),
            };
            x = self.dropout.forward(&output);
            new_layers.push(new_state);
        }
        Ok((x, RnnState { layers: new_layers }))
    }

    /// Statically unrolls `num_steps` steps over `inputs` `[batch, time, features]`.
    ///
    /// With `mask` `[batch, time]`, outputs at invalid steps are zero and the
    /// state is carried through unchanged. Returns outputs `[batch, time, units]`.
    pub fn unroll(
        &self,
        inputs: &Tensor,
        num_steps: usize,
        initial_state: RnnState<Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, RnnState<Tensor>), StateError> {
        let one = Tensor::scalar(&self.context, 1.0);
        let mut state = initial_state;
        let mut outputs = Vec::with_capacity(num_steps);

        for t in 0..num_steps {
            let x_t = inputs.select(1, t);
            let (output, new_state) = self.step(&x_t, &state)?;
            match mask {
                Some(mask) => {
                    let valid = mask.select(1, t).reshape(vec![-1, 1]);
                    let invalid = &one - &valid;
                    let carry = |new: &Tensor, old: &Tensor| &(new * &valid) + &(old * &invalid);
                    let blocks: Vec<Tensor> = new_state
                        .flatten()
                        .iter()
                        .zip(state.flatten().iter())
                        .map(|(new, old)| carry(new, old))
                        .collect();
                    state = RnnState::unflatten(&self.layout(), blocks)?;
                    outputs.push(&output * &valid);
                }
                None => {
                    state = new_state;
                    outputs.push(output);
                }
            }
        }

        Ok((Tensor::stack(&outputs, 1), state))
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(RnnLayer::parameters).collect()
    }
}
