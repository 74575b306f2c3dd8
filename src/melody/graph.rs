//! Mode-specific assembly of the structured melody graph.
//!
//! Every mode shares the same forward computation: windows of the padded
//! input are encoded, compared against all earlier encodings, and the
//! similarities weight an attention over past labels that is concatenated to
//! the raw input before the recurrent stack. The modes differ in what is fed
//! from outside and what is exposed:
//!
//! | mode     | fed                                                      | exposed                       |
//! |----------|----------------------------------------------------------|-------------------------------|
//! | train    | `inputs`, `labels`, `lengths`                            | loss, metrics, [`TrainStep`]  |
//! | eval     | `inputs`, `labels`, `lengths`                            | per-position values, [`EvalStep`] |
//! | generate | `inputs`, `input_buffer`, `labels`, `past_encodings`, `temperature`, state | `softmax`, `encodings`, final state |

use super::config::MelodyRnnConfig;
use super::session::{EvalStep, GenerateStep, TrainStep};
use super::similarity::{self_similarity, similarity_weighted_attention, target_encodings};
use super::windows::{extract_input_windows, WindowEncoder};
use super::{ConfigurationError, MelodyResult};
use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, NodeType};
use crate::autograd::Gradients;
use crate::losses::masked_sparse_softmax_cross_entropy;
use crate::nn::{Dropout, Linear, Module, MultiRnnCell, RnnState, StateLayout};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info};

/// Stable names of fed inputs and exposed values.
pub mod names {
    pub const INPUTS: &str = "inputs";
    pub const LABELS: &str = "labels";
    pub const LENGTHS: &str = "lengths";
    pub const INPUT_BUFFER: &str = "input_buffer";
    pub const PAST_ENCODINGS: &str = "past_encodings";
    pub const TEMPERATURE: &str = "temperature";

    pub const ENCODINGS: &str = "encodings";
    pub const SOFTMAX: &str = "softmax";
    pub const SELF_SIMILARITY: &str = "self-similarity";

    pub const LOSS: &str = "loss";
    pub const PERPLEXITY: &str = "metrics/perplexity";
    pub const ACCURACY: &str = "metrics/accuracy";
    pub const PER_CLASS_ACCURACY: &str = "metrics/per_class_accuracy";
    pub const EVENT_ACCURACY: &str = "metrics/event_accuracy";
    pub const NO_EVENT_ACCURACY: &str = "metrics/no_event_accuracy";

    pub const CROSS_ENTROPY: &str = "cross_entropy";
    pub const PREDICTIONS: &str = "predictions";
    pub const LABELS_FLAT: &str = "labels_flat";
    pub const MASK: &str = "mask";
}

/// Which graph to build. `num_steps` fixes the unrolled length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train { num_steps: usize },
    Eval { num_steps: usize },
    Generate { num_steps: usize },
}

impl Mode {
    pub fn parse(mode: &str, num_steps: usize) -> Result<Self, ConfigurationError> {
        match mode {
            "train" => Ok(Mode::Train { num_steps }),
            "eval" => Ok(Mode::Eval { num_steps }),
            "generate" => Ok(Mode::Generate { num_steps }),
            other => Err(ConfigurationError::InvalidMode(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Train { .. } => "train",
            Mode::Eval { .. } => "eval",
            Mode::Generate { .. } => "generate",
        }
    }

    pub fn num_steps(&self) -> usize {
        match *self {
            Mode::Train { num_steps } | Mode::Eval { num_steps } | Mode::Generate { num_steps } => num_steps,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Trainable parts of the model. Parameter names do not depend on the mode,
/// so one [`ParamStore`](super::ParamStore) serves every graph.
pub struct MelodyModel {
    pub encoder: WindowEncoder,
    pub rnn: MultiRnnCell,
    pub logits: Linear,
}

impl MelodyModel {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: &MelodyRnnConfig, dropout_keep_prob: f32) -> Self {
        let hparams = &config.hparams;
        let spec = &config.encoder_decoder;
        let encoder = WindowEncoder::new(
            context,
            hparams.batch_size,
            spec.input_size,
            hparams.window_size,
            hparams.encoding_size,
        );
        let rnn = MultiRnnCell::new(
            context,
            spec.input_size + spec.num_classes,
            &hparams.rnn_layer_sizes,
            hparams.attn_length,
            Dropout::from_keep_prob(dropout_keep_prob),
            "rnn",
        );
        let logits = Linear::new(context, rnn.output_size(), spec.num_classes, "logits");
        Self { encoder, rnn, logits }
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.encoder.parameters();
        params.extend(self.rnn.parameters());
        params.extend(self.logits.parameters());
        params
    }
}

/// Symbolic values shared by every mode.
struct Forward {
    encodings: Tensor,
    self_similarity: Tensor,
    logits_flat: Tensor,
    final_state: RnnState<Tensor>,
}

struct ForwardInputs<'a> {
    inputs: &'a Tensor,
    input_buffer: &'a Tensor,
    past_encodings: &'a Tensor,
    target_labels: &'a Tensor,
    initial_state: RnnState<Tensor>,
    mask: Option<&'a Tensor>,
}

fn forward(model: &MelodyModel, config: &MelodyRnnConfig, num_steps: usize, feed: ForwardInputs<'_>) -> MelodyResult<Forward> {
    let padded_inputs = Tensor::concat(&[feed.input_buffer.clone(), feed.inputs.clone()], 1);
    let windows = extract_input_windows(&padded_inputs, config.hparams.window_size)?;
    let encodings = model.encoder.forward(&windows);

    let targets = target_encodings(feed.past_encodings, &encodings);
    let similarity = self_similarity(&encodings, &targets);
    let attention = similarity_weighted_attention(feed.target_labels, &similarity, config.encoder_decoder.num_classes);
    let combined = Tensor::concat(&[feed.inputs.clone(), attention], 2);

    let (outputs, final_state) = model.rnn.unroll(&combined, num_steps, feed.initial_state, feed.mask)?;
    let outputs_flat = outputs.reshape(vec![-1, model.rnn.output_size() as i64]);
    let logits_flat = model.logits.forward(&outputs_flat);

    Ok(Forward { encodings, self_similarity: similarity, logits_flat, final_state })
}

/// `num / den`, or 0 when `den == 0`.
fn safe_ratio(num: &Tensor, den: &Tensor) -> Tensor {
    let zero = Tensor::scalar(&den.context, 0.0);
    num / &(den + &den.equal(&zero))
}

fn parameter_names(graph: &Asg, params: &[Tensor]) -> MelodyResult<Vec<String>> {
    params
        .iter()
        .map(|p| match &graph.get_node(p.node_id)?.node_type {
            NodeType::Parameter { name } => Ok(name.clone()),
            _ => Err(crate::asg::AsgError::UnsupportedOperation(format!("node {} is not a parameter", p.node_id)).into()),
        })
        .collect()
}

/// Values produced by the train graph.
pub struct TrainArtifacts {
    pub inputs: Tensor,
    pub labels: Tensor,
    pub lengths: Tensor,
    pub loss: Tensor,
    pub perplexity: Tensor,
    pub accuracy: Tensor,
    pub event_accuracy: Tensor,
    pub no_event_accuracy: Tensor,
    /// Self-similarity as an image batch `[B, Q, K, 1]`.
    pub self_similarity: Tensor,
    pub train_step: TrainStep,
}

/// Values produced by the eval graph. Streaming aggregation happens in
/// [`EvalStep::run`].
pub struct EvalArtifacts {
    pub inputs: Tensor,
    pub labels: Tensor,
    pub lengths: Tensor,
    pub cross_entropy: Tensor,
    pub predictions: Tensor,
    pub labels_flat: Tensor,
    pub mask: Tensor,
    pub eval_step: EvalStep,
}

pub struct GenerateArtifacts {
    pub inputs: Tensor,
    pub input_buffer: Tensor,
    pub labels: Tensor,
    pub past_encodings: Tensor,
    pub temperature: Tensor,
    pub encodings: Tensor,
    /// `[B, T, num_classes]`
    pub softmax: Tensor,
    /// Flattened state inputs, see [`StateLayout::block_names`].
    pub initial_state: Vec<Tensor>,
    pub final_state: Vec<Tensor>,
    pub state_layout: StateLayout,
    pub generate_step: GenerateStep,
}

pub enum BuiltGraph {
    Train(TrainArtifacts),
    Eval(EvalArtifacts),
    Generate(GenerateArtifacts),
}

impl BuiltGraph {
    pub fn mode_name(&self) -> &'static str {
        match self {
            BuiltGraph::Train(_) => "train",
            BuiltGraph::Eval(_) => "eval",
            BuiltGraph::Generate(_) => "generate",
        }
    }

    /// The executable forward graph.
    pub fn graph(&self) -> &Asg {
        match self {
            BuiltGraph::Train(a) => a.train_step.forward_graph(),
            BuiltGraph::Eval(a) => a.eval_step.graph(),
            BuiltGraph::Generate(a) => a.generate_step.graph(),
        }
    }
}

/// Builds the graph for `mode`. Configuration errors are raised before any
/// node is created.
pub fn build_graph(mode: Mode, config: &MelodyRnnConfig) -> MelodyResult<BuiltGraph> {
    config.validate()?;
    if mode.num_steps() == 0 {
        return Err(ConfigurationError::InvalidConfig("num_steps must be positive".into()).into());
    }
    info!(mode = mode.name(), num_steps = mode.num_steps(), "hparams = {:?}", config.hparams);

    let built = match mode {
        Mode::Train { num_steps } => BuiltGraph::Train(build_train(config, num_steps)?),
        Mode::Eval { num_steps } => BuiltGraph::Eval(build_eval(config, num_steps)?),
        Mode::Generate { num_steps } => BuiltGraph::Generate(build_generate(config, num_steps)?),
    };
    debug!(mode = built.mode_name(), nodes = built.graph().nodes.len(), "graph built");
    Ok(built)
}

/// Inputs and shared values of the train and eval graphs.
struct Supervised {
    context: Rc<RefCell<GraphContext>>,
    model: MelodyModel,
    inputs: Tensor,
    labels: Tensor,
    lengths: Tensor,
    forward: Forward,
    labels_flat: Tensor,
    mask_flat: Tensor,
    loss: Tensor,
    cross_entropy: Tensor,
    predictions: Tensor,
}

fn build_supervised(config: &MelodyRnnConfig, num_steps: usize) -> MelodyResult<Supervised> {
    let hparams = &config.hparams;
    let spec = &config.encoder_decoder;
    let batch = hparams.batch_size;

    let context = Rc::new(RefCell::new(GraphContext::new()));
    let model = MelodyModel::new(&context, config, hparams.dropout_keep_prob);

    let inputs = Tensor::new_input_with_shape(&context, names::INPUTS, vec![batch, num_steps, spec.input_size]);
    let labels = Tensor::new_input_with_shape(&context, names::LABELS, vec![batch, num_steps]);
    let lengths = Tensor::new_input_with_shape(&context, names::LENGTHS, vec![batch]);

    // Full sequences are fed, so windows are padded with zeros and nothing
    // precedes the first step.
    let input_buffer =
        Tensor::zeros(&context, &[batch, hparams.window_size - 1, spec.input_size], names::INPUT_BUFFER);
    let past_encodings = Tensor::zeros(&context, &[batch, 0, hparams.encoding_size], names::PAST_ENCODINGS);
    // The final label is never attended to.
    let target_labels = labels.slice(1, 0, Some(-1));
    let mask = lengths.sequence_mask(num_steps);

    let forward = forward(
        &model,
        config,
        num_steps,
        ForwardInputs {
            inputs: &inputs,
            input_buffer: &input_buffer,
            past_encodings: &past_encodings,
            target_labels: &target_labels,
            initial_state: model.rnn.zero_state(batch),
            mask: Some(&mask),
        },
    )?;

    let labels_flat = labels.reshape(vec![-1]).named(names::LABELS_FLAT);
    let mask_flat = mask.reshape(vec![-1]).named(names::MASK);
    let (loss, cross_entropy) = masked_sparse_softmax_cross_entropy(&forward.logits_flat, &labels_flat, &mask_flat);
    let loss = loss.named(names::LOSS);
    let cross_entropy = cross_entropy.named(names::CROSS_ENTROPY);
    let predictions = forward.logits_flat.argmax().named(names::PREDICTIONS);

    Ok(Supervised {
        context,
        model,
        inputs,
        labels,
        lengths,
        forward,
        labels_flat,
        mask_flat,
        loss,
        cross_entropy,
        predictions,
    })
}

fn build_train(config: &MelodyRnnConfig, num_steps: usize) -> MelodyResult<TrainArtifacts> {
    let s = build_supervised(config, num_steps)?;
    let ctx = &s.context;
    let batch = config.hparams.batch_size as i64;

    let correct = s.predictions.equal(&s.labels_flat);
    let no_event_label = Tensor::scalar(ctx, config.encoder_decoder.default_event_label as f32);
    let no_event_positions = &s.labels_flat.equal(&no_event_label) * &s.mask_flat;
    let event_positions = &s.mask_flat - &no_event_positions;

    let perplexity = s.loss.exp().named(names::PERPLEXITY);
    let accuracy = safe_ratio(&(&correct * &s.mask_flat).sum(), &s.mask_flat.sum()).named(names::ACCURACY);
    let event_accuracy =
        safe_ratio(&(&correct * &event_positions).sum(), &event_positions.sum()).named(names::EVENT_ACCURACY);
    let no_event_accuracy = safe_ratio(&(&correct * &no_event_positions).sum(), &no_event_positions.sum())
        .named(names::NO_EVENT_ACCURACY);

    let num_keys = num_steps as i64 - 1;
    let self_similarity = s
        .forward
        .self_similarity
        .reshape(vec![batch, num_steps as i64, num_keys, 1])
        .named(names::SELF_SIMILARITY);

    let mut graph = ctx.borrow().main_graph().clone();
    graph.set_outputs(vec![
        s.loss.node_id,
        perplexity.node_id,
        accuracy.node_id,
        event_accuracy.node_id,
        no_event_accuracy.node_id,
        self_similarity.node_id,
    ]);
    ShapeInference::run(&mut graph, &HashMap::new())?;

    let params = s.model.parameters();
    let param_ids: Vec<_> = params.iter().map(|p| p.node_id).collect();
    let param_names = parameter_names(&graph, &params)?;
    let gradients = Gradients::new(&graph).build(s.loss.node_id, &param_ids)?;
    debug!(parameters = param_names.len(), grad_nodes = gradients.nodes.len(), "gradient graph built");

    let train_step = TrainStep::new(graph, gradients, param_names, &config.hparams);
    Ok(TrainArtifacts {
        inputs: s.inputs,
        labels: s.labels,
        lengths: s.lengths,
        loss: s.loss,
        perplexity,
        accuracy,
        event_accuracy,
        no_event_accuracy,
        self_similarity,
        train_step,
    })
}

fn build_eval(config: &MelodyRnnConfig, num_steps: usize) -> MelodyResult<EvalArtifacts> {
    let s = build_supervised(config, num_steps)?;

    let mut graph = s.context.borrow().main_graph().clone();
    graph.set_outputs(vec![
        s.cross_entropy.node_id,
        s.predictions.node_id,
        s.labels_flat.node_id,
        s.mask_flat.node_id,
    ]);
    ShapeInference::run(&mut graph, &HashMap::new())?;

    let eval_step = EvalStep::new(graph);
    Ok(EvalArtifacts {
        inputs: s.inputs,
        labels: s.labels,
        lengths: s.lengths,
        cross_entropy: s.cross_entropy,
        predictions: s.predictions,
        labels_flat: s.labels_flat,
        mask: s.mask_flat,
        eval_step,
    })
}

fn build_generate(config: &MelodyRnnConfig, num_steps: usize) -> MelodyResult<GenerateArtifacts> {
    let batch = config.hparams.batch_size as i64;
    let num_classes = config.encoder_decoder.num_classes as i64;

    let context = Rc::new(RefCell::new(GraphContext::new()));
    // No dropout node is emitted at all while generating.
    let model = MelodyModel::new(&context, config, 1.0);

    // History lengths vary between calls, so these shapes are left open and
    // checked by the backend on first run.
    let inputs = Tensor::new_input(&context, names::INPUTS);
    let input_buffer = Tensor::new_input(&context, names::INPUT_BUFFER);
    let labels = Tensor::new_input(&context, names::LABELS);
    let past_encodings = Tensor::new_input(&context, names::PAST_ENCODINGS);
    let temperature = Tensor::new_input(&context, names::TEMPERATURE);
    let initial_state = model.rnn.state_inputs();

    let forward = forward(
        &model,
        config,
        num_steps,
        ForwardInputs {
            inputs: &inputs,
            input_buffer: &input_buffer,
            past_encodings: &past_encodings,
            // All past labels can be attended to.
            target_labels: &labels,
            initial_state: initial_state.clone(),
            mask: None,
        },
    )?;

    let encodings = forward.encodings.named(names::ENCODINGS);
    let softmax = (&forward.logits_flat / &temperature)
        .softmax()
        .reshape(vec![batch, -1, num_classes])
        .named(names::SOFTMAX);

    let initial_state = initial_state.flatten();
    let final_state = forward.final_state.flatten();
    let state_layout = model.rnn.layout();

    let mut graph = context.borrow().main_graph().clone();
    let mut outputs = vec![softmax.node_id, encodings.node_id];
    outputs.extend(final_state.iter().map(|t| t.node_id));
    graph.set_outputs(outputs);

    let generate_step = GenerateStep::new(graph, state_layout.clone(), num_steps);
    Ok(GenerateArtifacts {
        inputs,
        input_buffer,
        labels,
        past_encodings,
        temperature,
        encodings,
        softmax,
        initial_state,
        final_state,
        state_layout,
        generate_step,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::melody::config::{EncoderDecoderSpec, HParams};
    use crate::melody::MelodyError;

    fn config() -> MelodyRnnConfig {
        MelodyRnnConfig::new(
            EncoderDecoderSpec { input_size: 3, num_classes: 5, default_event_label: 0 },
            HParams {
                batch_size: 2,
                window_size: 3,
                encoding_size: 4,
                rnn_layer_sizes: vec![6, 5],
                attn_length: 2,
                ..HParams::default()
            },
        )
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::parse("train", 4).unwrap(), Mode::Train { num_steps: 4 });
        assert_eq!(Mode::parse("generate", 1).unwrap().name(), "generate");
        assert_eq!(
            Mode::parse("infer", 4).unwrap_err(),
            ConfigurationError::InvalidMode("infer".to_string())
        );
    }

    #[test]
    fn test_train_graph_shapes() {
        let built = build_graph(Mode::Train { num_steps: 4 }, &config()).unwrap();
        let BuiltGraph::Train(train) = built else { panic!("expected train artifacts") };
        let graph = train.train_step.forward_graph();
        let shape = |t: &Tensor| graph.get_node(t.node_id).unwrap().shape.clone().unwrap();
        assert_eq!(shape(&train.loss), Vec::<usize>::new());
        assert_eq!(shape(&train.self_similarity), vec![2, 4, 3, 1]);
        assert_eq!(train.loss.name().as_deref(), Some(names::LOSS));
        assert_eq!(train.train_step.parameter_names().len(), train.train_step.gradient_graph().outputs.len());
    }

    #[test]
    fn test_generate_exposes_state_blocks() {
        let built = build_graph(Mode::Generate { num_steps: 1 }, &config()).unwrap();
        let BuiltGraph::Generate(generate) = built else { panic!("expected generate artifacts") };
        // attention layer: c, h, attns, attn_states; plain layer: c, h
        assert_eq!(generate.initial_state.len(), 6);
        assert_eq!(generate.final_state.len(), 6);
        assert_eq!(generate.initial_state[3].name().as_deref(), Some("state.0.attn_states"));
        let graph = generate.generate_step.graph();
        assert!(!graph.nodes.values().any(|n| matches!(n.node_type, NodeType::DropoutMask { .. })));
    }

    #[test]
    fn test_invalid_configuration_fails_before_building() {
        let mut bad = config();
        bad.hparams.window_size = 0;
        assert!(matches!(
            build_graph(Mode::Eval { num_steps: 4 }, &bad),
            Err(MelodyError::Configuration(ConfigurationError::NonPositiveWindowSize(0)))
        ));
        assert!(matches!(
            build_graph(Mode::Eval { num_steps: 0 }, &config()),
            Err(MelodyError::Configuration(_))
        ));
    }
}
