//! # Structured Melody RNN
//!
//! Builds and runs the structured melody graph: sliding input windows are
//! encoded, compared against every earlier window, and the resulting
//! similarities weight a soft attention over past labels that is fed to the
//! recurrent core together with the raw input.
//!
//! ```text
//! inputs -> windows -> encodings -> self-similarity -> label attention
//!        \_____________________________________________/
//!                              |
//!                     concat -> LSTM stack -> logits
//! ```
//!
//! - [`config`]: hyperparameters and encoder/decoder sizes
//! - [`windows`]: window extraction and encoding
//! - [`similarity`]: self-similarity and causal label attention
//! - [`graph`]: mode-specific graph assembly
//! - [`session`]: parameter store and train/eval/generate steps

pub mod config;
pub mod graph;
pub mod session;
pub mod similarity;
pub mod windows;

pub use config::{EncoderDecoderSpec, HParams, MelodyRnnConfig};
pub use graph::{build_graph, BuiltGraph, EvalArtifacts, GenerateArtifacts, Mode, TrainArtifacts};
pub use session::{
    EvalMetrics, EvalStep, GenerateFeed, GenerateOutput, GenerateStep, ParamStore, TrainStep, TrainStepResult,
};

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::asg::AsgError;
use crate::autograd::AutogradError;
use crate::data::DataError;
use crate::nn::StateError;
use crate::runtime::backend::RuntimeError;
use thiserror::Error;

/// Invalid configuration or invocation arguments. Always raised before any
/// graph is returned or executed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("The mode parameter must be 'train', 'eval', or 'generate'. The mode parameter was: {0}")]
    InvalidMode(String),

    #[error("window_size must be positive, got {0}")]
    NonPositiveWindowSize(usize),

    #[error("temperature must be positive, got {0}")]
    NonPositiveTemperature(f32),

    #[error("invalid hparam '{name}': {reason}")]
    InvalidHParam { name: String, reason: String },

    #[error("rnn_layer_sizes must contain at least one positive size")]
    EmptyLayerSizes,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug)]
pub enum MelodyError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Graph error: {0}")]
    Asg(#[from] AsgError),

    #[error("Shape inference failed: {0}")]
    Shape(#[from] ShapeInferenceError),

    #[error("Autograd failed: {0}")]
    Autograd(#[from] AutogradError),

    #[error("Execution failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Recurrent state error: {0}")]
    State(#[from] StateError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("graph output '{0}' is missing or malformed")]
    MissingOutput(&'static str),

    #[error("feed '{name}' has shape {actual:?}, expected {expected}")]
    FeedShape { name: &'static str, expected: String, actual: Vec<usize> },
}

pub type MelodyResult<T> = Result<T, MelodyError>;
