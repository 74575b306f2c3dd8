//! Parameter store and the executable train, eval and generate steps.

use super::config::{HParams, MelodyRnnConfig};
use super::graph::{names, MelodyModel};
use super::{ConfigurationError, MelodyError, MelodyResult};
use crate::asg::{Asg, AsgError, NodeType, Value};
use crate::data::PaddedBatch;
use crate::metrics::{Accuracy, MeanPerClassAccuracy, Metric, Recall, RunningMean};
use crate::nn::{StateError, StateLayout};
use crate::optimizers::{clip_gradient_norms, Adam, Optimizer};
use crate::runtime::backend::{bind_named, Backend, Memo, RuntimeError};
use crate::runtime::cpu_backend::CpuBackend;
use crate::tensor::GraphContext;
use ndarray::{concatenate, Array1, ArrayD, Axis, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, trace};

/// Caller-owned values of every trainable parameter, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    values: HashMap<String, Value>,
}

impl ParamStore {
    /// Creates every parameter of the model with seeded Glorot-uniform weights
    /// and zero biases.
    pub fn initialize(config: &MelodyRnnConfig, seed: u64) -> MelodyResult<Self> {
        config.validate()?;
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let model = MelodyModel::new(&context, config, 1.0);
        let mut rng = StdRng::seed_from_u64(seed);

        let ctx = context.borrow();
        let graph = ctx.main_graph();
        let mut values = HashMap::new();
        for param in model.parameters() {
            let node = graph.get_node(param.node_id)?;
            let name = match &node.node_type {
                NodeType::Parameter { name } => name.clone(),
                _ => return Err(AsgError::UnsupportedOperation(format!("node {} is not a parameter", node.id)).into()),
            };
            let shape = node.shape.clone().ok_or(AsgError::InvalidShape(node.id))?;
            let value = if name.ends_with(".bias") {
                ArrayD::zeros(IxDyn(&shape))
            } else {
                glorot_uniform(&shape, &mut rng)
            };
            values.insert(name, Value::Tensor(value));
        }
        debug!(parameters = values.len(), seed, "parameters initialized");
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.values.get(name).and_then(Value::as_tensor)
    }

    pub fn insert(&mut self, name: &str, value: ArrayD<f32>) {
        self.values.insert(name.to_string(), Value::Tensor(value));
    }

    /// Sorted parameter names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }
}

fn glorot_uniform(shape: &[usize], rng: &mut StdRng) -> ArrayD<f32> {
    let fan_in = shape.first().copied().unwrap_or(1);
    let fan_out = shape.last().copied().unwrap_or(1);
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    ArrayD::random_using(IxDyn(shape), Uniform::new(-limit, limit), rng)
}

/// Binds parameters and fed values to the graph's named inputs.
fn feed_memo(graph: &Asg, params: &ParamStore, feeds: &HashMap<String, Value>) -> Memo<Value> {
    let mut memo = bind_named(graph, &params.values);
    memo.extend(bind_named(graph, feeds));
    memo
}

fn batch_feeds(batch: &PaddedBatch) -> HashMap<String, Value> {
    HashMap::from([
        (names::INPUTS.to_string(), Value::Tensor(batch.inputs.clone())),
        (names::LABELS.to_string(), Value::Tensor(batch.labels.clone())),
        (names::LENGTHS.to_string(), Value::Tensor(batch.lengths.clone())),
    ])
}

fn scalar_output(outputs: &[Value], index: usize, name: &'static str) -> MelodyResult<f32> {
    outputs.get(index).and_then(Value::scalar).ok_or(MelodyError::MissingOutput(name))
}

fn tensor_output(outputs: &[Value], index: usize, name: &'static str) -> MelodyResult<ArrayD<f32>> {
    outputs
        .get(index)
        .and_then(Value::as_tensor)
        .cloned()
        .ok_or(MelodyError::MissingOutput(name))
}

#[derive(Debug, Clone)]
pub struct TrainStepResult {
    pub loss: f32,
    pub perplexity: f32,
    pub accuracy: f32,
    pub event_accuracy: f32,
    pub no_event_accuracy: f32,
    /// Global gradient norm before clipping.
    pub gradient_norm: f32,
    /// `[B, Q, K, 1]`
    pub self_similarity: ArrayD<f32>,
}

/// One optimizer update: forward pass, gradient graph, per-gradient norm
/// clipping and an Adam step.
pub struct TrainStep {
    forward: Asg,
    gradients: Asg,
    param_names: Vec<String>,
    optimizer: Adam,
    clip_norm: f32,
    backend: CpuBackend,
}

impl TrainStep {
    pub(crate) fn new(forward: Asg, gradients: Asg, param_names: Vec<String>, hparams: &HParams) -> Self {
        Self {
            forward,
            gradients,
            param_names,
            optimizer: Adam::new(hparams.learning_rate),
            clip_norm: hparams.clip_norm,
            backend: CpuBackend::new(),
        }
    }

    /// Makes dropout masks reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.backend = CpuBackend::with_seed(seed);
        self
    }

    pub fn forward_graph(&self) -> &Asg {
        &self.forward
    }

    pub fn gradient_graph(&self) -> &Asg {
        &self.gradients
    }

    /// Parameter names in the order of the gradient graph's outputs.
    pub fn parameter_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn run(&mut self, params: &mut ParamStore, batch: &PaddedBatch) -> MelodyResult<TrainStepResult> {
        let memo = feed_memo(&self.forward, params, &batch_feeds(batch));
        let (outputs, memo) = self.backend.run(&self.forward, memo)?;
        let (grad_values, _) = self.backend.run(&self.gradients, memo)?;

        let mut gradients: HashMap<String, Value> =
            self.param_names.iter().cloned().zip(grad_values).collect();
        let gradient_norm = clip_gradient_norms(&mut gradients, self.clip_norm);
        self.optimizer.step(&mut params.values, &gradients);

        let result = TrainStepResult {
            loss: scalar_output(&outputs, 0, names::LOSS)?,
            perplexity: scalar_output(&outputs, 1, names::PERPLEXITY)?,
            accuracy: scalar_output(&outputs, 2, names::ACCURACY)?,
            event_accuracy: scalar_output(&outputs, 3, names::EVENT_ACCURACY)?,
            no_event_accuracy: scalar_output(&outputs, 4, names::NO_EVENT_ACCURACY)?,
            gradient_norm,
            self_similarity: tensor_output(&outputs, 5, names::SELF_SIMILARITY)?,
        };
        debug!(
            step = self.optimizer.steps(),
            loss = result.loss,
            accuracy = result.accuracy,
            gradient_norm,
            "train step"
        );
        Ok(result)
    }
}

/// Streaming aggregates over every valid position seen since the last reset.
#[derive(Debug, Clone)]
pub struct EvalMetrics {
    loss: RunningMean,
    accuracy: Accuracy,
    per_class_accuracy: MeanPerClassAccuracy,
    event_accuracy: Recall,
    no_event_accuracy: Recall,
    default_event_label: usize,
}

impl EvalMetrics {
    pub fn new(num_classes: usize, default_event_label: usize) -> Self {
        Self {
            loss: RunningMean::new(),
            accuracy: Accuracy::new(),
            per_class_accuracy: MeanPerClassAccuracy::new(num_classes),
            event_accuracy: Recall::new(),
            no_event_accuracy: Recall::new(),
            default_event_label,
        }
    }

    pub fn for_config(config: &MelodyRnnConfig) -> Self {
        Self::new(config.encoder_decoder.num_classes, config.encoder_decoder.default_event_label)
    }

    /// Adds one batch of flattened per-position values. Positions with
    /// `mask == 0` are padding and ignored.
    pub fn update(
        &mut self,
        cross_entropy: &ArrayD<f32>,
        predictions: &ArrayD<f32>,
        labels: &ArrayD<f32>,
        mask: &ArrayD<f32>,
    ) {
        let valid: Vec<usize> = mask.iter().enumerate().filter(|&(_, &m)| m > 0.5).map(|(i, _)| i).collect();
        let pick = |values: &ArrayD<f32>| -> ArrayD<f32> {
            let flat: Vec<f32> = values.iter().copied().collect();
            Array1::from_iter(valid.iter().map(|&i| flat[i])).into_dyn()
        };
        let xent = pick(cross_entropy);
        let predictions = pick(predictions);
        let labels = pick(labels);

        self.loss.update_batch(&xent.iter().map(|&v| v as f64).collect::<Vec<_>>());
        self.accuracy.update(&predictions, &labels);
        self.per_class_accuracy.update(&predictions, &labels);

        let no_event_label = self.default_event_label as f32;
        let correct = ndarray::Zip::from(&predictions)
            .and(&labels)
            .map_collect(|&p, &l| if p == l { 1.0f32 } else { 0.0 });
        let no_event_positions = labels.mapv(|l| if l == no_event_label { 1.0f32 } else { 0.0 });
        let event_positions = no_event_positions.mapv(|v| 1.0 - v);
        self.event_accuracy.update(&correct, &event_positions);
        self.no_event_accuracy.update(&correct, &no_event_positions);
    }

    /// Number of valid positions aggregated so far.
    pub fn count(&self) -> usize {
        self.loss.count()
    }

    /// Named scalar aggregates. Perplexity is `exp(loss)` and has no state of
    /// its own.
    pub fn summary(&self) -> BTreeMap<&'static str, f64> {
        let loss = self.loss.compute();
        BTreeMap::from([
            (names::LOSS, loss),
            (names::PERPLEXITY, loss.exp()),
            (names::ACCURACY, self.accuracy.compute()),
            (names::PER_CLASS_ACCURACY, self.per_class_accuracy.compute()),
            (names::EVENT_ACCURACY, self.event_accuracy.compute()),
            (names::NO_EVENT_ACCURACY, self.no_event_accuracy.compute()),
        ])
    }

    /// Accuracy of each class, `None` for classes not seen yet.
    pub fn per_class(&self) -> Vec<Option<f64>> {
        self.per_class_accuracy.per_class()
    }

    pub fn reset(&mut self) {
        self.loss.reset();
        self.accuracy.reset();
        self.per_class_accuracy.reset();
        self.event_accuracy.reset();
        self.no_event_accuracy.reset();
    }
}

/// Executes the eval graph and folds its per-position outputs into
/// [`EvalMetrics`].
pub struct EvalStep {
    graph: Asg,
    backend: CpuBackend,
}

impl EvalStep {
    pub(crate) fn new(graph: Asg) -> Self {
        Self { graph, backend: CpuBackend::new() }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.backend = CpuBackend::with_seed(seed);
        self
    }

    pub fn graph(&self) -> &Asg {
        &self.graph
    }

    pub fn run(&self, params: &ParamStore, batch: &PaddedBatch, metrics: &mut EvalMetrics) -> MelodyResult<()> {
        let memo = feed_memo(&self.graph, params, &batch_feeds(batch));
        let (outputs, _) = self.backend.run(&self.graph, memo)?;
        let cross_entropy = tensor_output(&outputs, 0, names::CROSS_ENTROPY)?;
        let predictions = tensor_output(&outputs, 1, names::PREDICTIONS)?;
        let labels = tensor_output(&outputs, 2, names::LABELS_FLAT)?;
        let mask = tensor_output(&outputs, 3, names::MASK)?;
        metrics.update(&cross_entropy, &predictions, &labels, &mask);
        trace!(positions = metrics.count(), "eval batch aggregated");
        Ok(())
    }
}

/// Everything fed to one generate call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateFeed {
    /// `[B, T, input_size]`
    pub inputs: ArrayD<f32>,
    /// Last `window_size - 1` inputs before this call, `[B, W-1, input_size]`.
    pub input_buffer: ArrayD<f32>,
    /// Labels of every attendable position, `[B, P + T - 1]`.
    pub labels: ArrayD<f32>,
    /// Encodings from earlier calls, `[B, P, encoding_size]`.
    pub past_encodings: ArrayD<f32>,
    pub temperature: f32,
    /// Flattened recurrent state, see [`StateLayout::block_names`].
    pub state: Vec<ArrayD<f32>>,
}

impl GenerateFeed {
    /// Feed for the first call: zero input buffer, no history, zero state.
    /// `labels` `[B, T - 1]` are the labels of every primer step but the
    /// last, i.e. the next event after each of them.
    pub fn initial(
        config: &MelodyRnnConfig,
        layout: &StateLayout,
        inputs: ArrayD<f32>,
        labels: ArrayD<f32>,
        temperature: f32,
    ) -> Self {
        let hparams = &config.hparams;
        let batch = hparams.batch_size;
        let input_size = config.encoder_decoder.input_size;
        Self {
            inputs,
            input_buffer: ArrayD::zeros(IxDyn(&[batch, hparams.window_size.saturating_sub(1), input_size])),
            labels,
            past_encodings: ArrayD::zeros(IxDyn(&[batch, 0, hparams.encoding_size])),
            temperature,
            state: layout.zeros(batch).flatten(),
        }
    }

    /// Feed for the next call: the buffer keeps the most recent inputs, this
    /// call's encodings join the history and its final state becomes the
    /// initial state. `new_labels` `[B, n]` are appended to the attendable
    /// labels.
    pub fn advance(&self, output: &GenerateOutput, new_labels: &ArrayD<f32>, next_inputs: ArrayD<f32>) -> MelodyResult<Self> {
        let shape_err = |e: ndarray::ShapeError| MelodyError::Runtime(RuntimeError::ShapeError(e.to_string()));

        let history = concatenate(Axis(1), &[self.input_buffer.view(), self.inputs.view()]).map_err(shape_err)?;
        let keep = self.input_buffer.shape()[1];
        let len = history.shape()[1];
        let input_buffer = history.slice_axis(Axis(1), ndarray::Slice::from(len - keep..)).to_owned();

        Ok(Self {
            inputs: next_inputs,
            input_buffer,
            labels: concatenate(Axis(1), &[self.labels.view(), new_labels.view()]).map_err(shape_err)?,
            past_encodings: concatenate(Axis(1), &[self.past_encodings.view(), output.encodings.view()])
                .map_err(shape_err)?,
            temperature: self.temperature,
            state: output.final_state.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOutput {
    /// `[B, T, num_classes]`
    pub softmax: ArrayD<f32>,
    /// `[B, T, encoding_size]`
    pub encodings: ArrayD<f32>,
    pub final_state: Vec<ArrayD<f32>>,
}

impl GenerateOutput {
    /// Samples one label per sequence from the last step's distribution.
    pub fn sample_last<R: Rng + ?Sized>(&self, rng: &mut R) -> MelodyResult<ArrayD<f32>> {
        let steps = self.softmax.shape()[1];
        if steps == 0 {
            return Err(MelodyError::MissingOutput(names::SOFTMAX));
        }
        let last = self.softmax.index_axis(Axis(1), steps - 1);
        let mut labels = Vec::with_capacity(last.len_of(Axis(0)));
        for row in last.axis_iter(Axis(0)) {
            let dist = WeightedIndex::new(row.iter().map(|&p| p.max(0.0)))
                .map_err(|_| MelodyError::MissingOutput(names::SOFTMAX))?;
            labels.push(dist.sample(rng) as f32);
        }
        Ok(Array1::from(labels).into_dyn())
    }
}

/// Executes one generation call.
pub struct GenerateStep {
    graph: Asg,
    layout: StateLayout,
    num_steps: usize,
    backend: CpuBackend,
}

impl GenerateStep {
    pub(crate) fn new(graph: Asg, layout: StateLayout, num_steps: usize) -> Self {
        Self { graph, layout, num_steps, backend: CpuBackend::new() }
    }

    /// Steps the graph was unrolled for; every call feeds exactly this many.
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn graph(&self) -> &Asg {
        &self.graph
    }

    pub fn state_layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn run(&self, params: &ParamStore, feed: &GenerateFeed) -> MelodyResult<GenerateOutput> {
        // `!(t > 0)` also rejects NaN.
        if !(feed.temperature > 0.0) {
            return Err(ConfigurationError::NonPositiveTemperature(feed.temperature).into());
        }
        let expected = self.layout.num_blocks();
        if feed.state.len() != expected {
            return Err(StateError::BlockCount { expected, actual: feed.state.len() }.into());
        }
        self.check_feed_shapes(feed)?;

        let mut feeds = HashMap::from([
            (names::INPUTS.to_string(), Value::Tensor(feed.inputs.clone())),
            (names::INPUT_BUFFER.to_string(), Value::Tensor(feed.input_buffer.clone())),
            (names::LABELS.to_string(), Value::Tensor(feed.labels.clone())),
            (names::PAST_ENCODINGS.to_string(), Value::Tensor(feed.past_encodings.clone())),
            (names::TEMPERATURE.to_string(), Value::ScalarF32(feed.temperature)),
        ]);
        for (name, block) in self.layout.block_names().into_iter().zip(&feed.state) {
            feeds.insert(name, Value::Tensor(block.clone()));
        }

        let memo = feed_memo(&self.graph, params, &feeds);
        let (outputs, _) = self.backend.run(&self.graph, memo)?;

        let softmax = tensor_output(&outputs, 0, names::SOFTMAX)?;
        let encodings = tensor_output(&outputs, 1, names::ENCODINGS)?;
        let final_state = (0..expected)
            .map(|i| tensor_output(&outputs, 2 + i, "final_state"))
            .collect::<MelodyResult<Vec<_>>>()?;
        trace!(history = feed.past_encodings.shape()[1], steps = feed.inputs.shape()[1], "generate call");
        Ok(GenerateOutput { softmax, encodings, final_state })
    }

    /// The graph leaves these shapes open, so the time axes are matched here:
    /// `inputs` carries `num_steps` steps and `labels` covers `P + T - 1`
    /// attendable positions.
    fn check_feed_shapes(&self, feed: &GenerateFeed) -> MelodyResult<()> {
        let inputs = feed.inputs.shape();
        if inputs.len() != 3 || inputs[1] != self.num_steps {
            return Err(MelodyError::FeedShape {
                name: names::INPUTS,
                expected: format!("[batch, {}, input_size]", self.num_steps),
                actual: inputs.to_vec(),
            });
        }
        let past = feed.past_encodings.shape();
        if past.len() != 3 {
            return Err(MelodyError::FeedShape {
                name: names::PAST_ENCODINGS,
                expected: "[batch, history, encoding_size]".to_string(),
                actual: past.to_vec(),
            });
        }
        let attendable = past[1] + self.num_steps - 1;
        let labels = feed.labels.shape();
        if labels.len() != 2 || labels[1] != attendable {
            return Err(MelodyError::FeedShape {
                name: names::LABELS,
                expected: format!("[batch, {}]", attendable),
                actual: labels.to_vec(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_eval_metrics_ignore_padding() {
        let mut metrics = EvalMetrics::new(3, 0);
        metrics.update(
            &array![1.0f32, 3.0, 100.0].into_dyn(),
            &array![2.0f32, 1.0, 0.0].into_dyn(),
            &array![2.0f32, 0.0, 0.0].into_dyn(),
            &array![1.0f32, 1.0, 0.0].into_dyn(),
        );
        let summary = metrics.summary();
        assert_eq!(metrics.count(), 2);
        assert!((summary[names::LOSS] - 2.0).abs() < 1e-9);
        assert!((summary[names::PERPLEXITY] - 2.0f64.exp()).abs() < 1e-9);
        assert!((summary[names::ACCURACY] - 0.5).abs() < 1e-9);
        assert!((summary[names::EVENT_ACCURACY] - 1.0).abs() < 1e-9);
        assert_eq!(summary[names::NO_EVENT_ACCURACY], 0.0);
        // class 2 right, class 0 wrong, class 1 never seen: (1 + 0 + 0) / 3
        assert!((summary[names::PER_CLASS_ACCURACY] - 1.0 / 3.0).abs() < 1e-9);
        metrics.reset();
        assert_eq!(metrics.count(), 0);
    }

    #[test]
    fn test_glorot_limits() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = glorot_uniform(&[4, 2], &mut rng);
        let limit = 1.0f32;
        assert_eq!(w.shape(), &[4, 2]);
        assert!(w.iter().all(|&v| v.abs() <= limit));
    }

    #[test]
    fn test_sample_last_follows_distribution() {
        let output = GenerateOutput {
            softmax: array![[[0.5f32, 0.5, 0.0], [0.0, 0.0, 1.0]]].into_dyn(),
            encodings: ArrayD::zeros(IxDyn(&[1, 2, 1])),
            final_state: vec![],
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(output.sample_last(&mut rng).unwrap(), array![2.0f32].into_dyn());
    }
}
