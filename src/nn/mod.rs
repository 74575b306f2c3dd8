//! # Neural Network Layers Module
//!
//! This module contains building blocks for constructing neural networks.
//!
//! In the graph-based architecture, each "layer" is a constructor that adds
//! a specific pattern of nodes (operations and parameters) to the ASG.
//!
//! ## Available Layers
//!
//! ### Core Layers
//! - [`Linear`]: Fully connected / dense layer
//!
//! ### Recurrent
//! - [`BasicLstmCell`]: LSTM cell with forget bias
//! - [`AttentionCellWrapper`]: Attention over the cell's own recent outputs
//! - [`MultiRnnCell`]: Layer stack with static unrolling and [`RnnState`]
//!
//! ### Regularization
//! - [`Dropout`]: Standard dropout
//!
//! ## Example
//!
//! ```ignore
//! use structured_melody_rnn::nn::{Dropout, MultiRnnCell};
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let rnn = MultiRnnCell::new(&ctx, 38, &[64, 64], 40, Dropout::from_keep_prob(0.5), "rnn");
//! let state = rnn.zero_state(batch_size);
//! let (outputs, final_state) = rnn.unroll(&inputs, num_steps, state, Some(&mask))?;
//! ```

pub mod attention_wrapper;
pub mod dropout;
pub mod linear;
pub mod lstm;
pub mod module;
pub mod rnn;

pub use attention_wrapper::{AttentionCellWrapper, AttentionState};
pub use dropout::Dropout;
pub use linear::Linear;
pub use lstm::{BasicLstmCell, LstmState};
pub use rnn::{LayerLayout, LayerState, MultiRnnCell, RnnLayer, RnnState, StateError, StateLayout};

// Base trait
pub use module::Module;
