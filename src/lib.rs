//! # Structured Melody RNN
//!
//! A melody language model with **structured attention**: every step looks
//! back over the whole melody, measures how similar the current window of
//! events is to every earlier window, and uses those similarities to attend
//! to the labels that followed the earlier windows. The attention read is fed
//! to a stack of LSTM cells next to the raw input.
//!
//! The model is expressed as an **Abstract Semantic Graph (ASG)**: symbolic
//! [`tensor::Tensor`] handles record operations, [`autograd`] derives the
//! gradient graph, and [`runtime::cpu_backend::CpuBackend`] executes both.
//!
//! ## Usage Example
//!
//! ```no_run
//! use structured_melody_rnn::melody::{build_graph, BuiltGraph, MelodyRnnConfig, Mode, ParamStore};
//! use structured_melody_rnn::data::PaddedBatch;
//!
//! let config = MelodyRnnConfig::default();
//! let mut params = ParamStore::initialize(&config, 0)?;
//! if let BuiltGraph::Train(mut train) = build_graph(Mode::Train { num_steps: 16 }, &config)? {
//!     let batch: PaddedBatch = todo!();
//!     let result = train.train_step.run(&mut params, &batch)?;
//!     println!("loss = {}", result.loss);
//! }
//! # Ok::<(), structured_melody_rnn::melody::MelodyError>(())
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod data;
pub mod losses;
pub mod melody;
pub mod metrics;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod tensor;
