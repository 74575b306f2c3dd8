//! Сквозные тесты: обучение, оценка и генерация на маленькой модели.

use ndarray::{s, Array2, ArrayD, Axis, IxDyn};
use std::collections::HashMap;
use structured_melody_rnn::asg::Value;
use structured_melody_rnn::data::{InMemorySequenceDataset, PaddedBatch, PaddedBatchLoader, SequenceExample};
use structured_melody_rnn::melody::config::{EncoderDecoderSpec, HParams};
use structured_melody_rnn::melody::graph::names;
use structured_melody_rnn::melody::{
    build_graph, BuiltGraph, ConfigurationError, EvalMetrics, GenerateFeed, GenerateStep, MelodyError,
    MelodyRnnConfig, Mode, ParamStore,
};
use structured_melody_rnn::nn::{RnnState, StateError};
use structured_melody_rnn::runtime::backend::{bind_named, Backend};
use structured_melody_rnn::runtime::cpu_backend::CpuBackend;

const INPUT_SIZE: usize = 5;
const NUM_CLASSES: usize = 5;

fn config(batch_size: usize, attn_length: usize) -> MelodyRnnConfig {
    MelodyRnnConfig::new(
        EncoderDecoderSpec { input_size: INPUT_SIZE, num_classes: NUM_CLASSES, default_event_label: 0 },
        HParams {
            batch_size,
            window_size: 3,
            encoding_size: 4,
            rnn_layer_sizes: vec![6],
            attn_length,
            learning_rate: 0.01,
            ..HParams::default()
        },
    )
}

/// Нулевые входы и метки [2, 2, 2, 0].
fn constant_melody() -> PaddedBatch {
    let example = SequenceExample { inputs: Array2::zeros((4, INPUT_SIZE)), labels: vec![2, 2, 2, 0] };
    PaddedBatch::from_examples(&[example], 4, INPUT_SIZE)
}

fn one_hot_inputs(batch: usize, events: &[usize]) -> ArrayD<f32> {
    let mut inputs = ArrayD::zeros(IxDyn(&[batch, events.len(), INPUT_SIZE]));
    for b in 0..batch {
        for (t, &event) in events.iter().enumerate() {
            inputs[[b, t, (event + b) % INPUT_SIZE]] = 1.0;
        }
    }
    inputs
}

/// Метки затравки из одного шага: предшествующих позиций нет.
fn no_labels(batch: usize) -> ArrayD<f32> {
    ArrayD::zeros(IxDyn(&[batch, 0]))
}

fn generate_step(config: &MelodyRnnConfig, num_steps: usize) -> GenerateStep {
    match build_graph(Mode::Generate { num_steps }, config).unwrap() {
        BuiltGraph::Generate(artifacts) => artifacts.generate_step,
        _ => panic!("expected generate artifacts"),
    }
}

fn assert_close(a: &ArrayD<f32>, b: &ArrayD<f32>, tolerance: f32) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tolerance, "{} != {}", x, y);
    }
}

#[test]
fn test_train_step_on_constant_melody() {
    let config = config(1, 0);
    let BuiltGraph::Train(train) = build_graph(Mode::Train { num_steps: 4 }, &config).unwrap() else {
        panic!("expected train artifacts")
    };
    let mut train_step = train.train_step;
    let mut params = ParamStore::initialize(&config, 7).unwrap();

    let result = train_step.run(&mut params, &constant_melody()).unwrap();
    assert!(result.loss.is_finite() && result.loss >= 0.0);
    assert!((result.perplexity - result.loss.exp()).abs() < 1e-3 * result.perplexity);
    assert!(result.gradient_norm.is_finite());
    assert_eq!(result.self_similarity.shape(), &[1, 4, 3, 1]);

    // 3 событийные позиции и 1 позиция без события
    let decomposed = (3.0 * result.event_accuracy + result.no_event_accuracy) / 4.0;
    assert!((result.accuracy - decomposed).abs() < 1e-5);
}

#[test]
fn test_training_lowers_loss() {
    let config = config(1, 0);
    let BuiltGraph::Train(train) = build_graph(Mode::Train { num_steps: 4 }, &config).unwrap() else {
        panic!("expected train artifacts")
    };
    let mut train_step = train.train_step;
    let mut params = ParamStore::initialize(&config, 3).unwrap();
    let batch = constant_melody();

    let first = train_step.run(&mut params, &batch).unwrap().loss;
    let mut last = first;
    for _ in 0..30 {
        last = train_step.run(&mut params, &batch).unwrap().loss;
    }
    assert_eq!(train_step.optimizer().steps(), 31);
    assert!(last < first, "loss did not decrease: {} -> {}", first, last);
}

#[test]
fn test_eval_graph_and_streaming_metrics() {
    let config = config(1, 0);
    let BuiltGraph::Eval(eval) = build_graph(Mode::Eval { num_steps: 4 }, &config).unwrap() else {
        panic!("expected eval artifacts")
    };
    let params = ParamStore::initialize(&config, 11).unwrap();
    let batch = constant_melody();

    // Прямой прогон графа: значения по позициям
    let graph = eval.eval_step.graph();
    let feeds = HashMap::from([
        (names::INPUTS.to_string(), Value::Tensor(batch.inputs.clone())),
        (names::LABELS.to_string(), Value::Tensor(batch.labels.clone())),
        (names::LENGTHS.to_string(), Value::Tensor(batch.lengths.clone())),
    ]);
    let mut memo = bind_named(graph, params.values());
    memo.extend(bind_named(graph, &feeds));
    let (outputs, _) = CpuBackend::new().run(graph, memo).unwrap();
    assert_eq!(outputs[1].as_tensor().unwrap().shape(), &[4]);
    assert_eq!(outputs[3].as_tensor().unwrap().iter().sum::<f32>(), 4.0);

    let mut metrics = EvalMetrics::for_config(&config);
    eval.eval_step.run(&params, &batch, &mut metrics).unwrap();
    eval.eval_step.run(&params, &batch, &mut metrics).unwrap();
    assert_eq!(metrics.count(), 8);

    let summary = metrics.summary();
    assert!(summary[names::LOSS].is_finite());
    assert!((summary[names::PERPLEXITY] - summary[names::LOSS].exp()).abs() < 1e-9);
    let per_class = metrics.per_class();
    assert!(per_class[0].is_some());
    assert!(per_class[2].is_some());
    assert!(per_class[1].is_none());
    let accuracy = summary[names::ACCURACY];
    let decomposed = (3.0 * summary[names::EVENT_ACCURACY] + summary[names::NO_EVENT_ACCURACY]) / 4.0;
    assert!((accuracy - decomposed).abs() < 1e-9);
}

#[test]
fn test_padding_is_ignored_by_eval() {
    let config = config(2, 0);
    let BuiltGraph::Eval(eval) = build_graph(Mode::Eval { num_steps: 5 }, &config).unwrap() else {
        panic!("expected eval artifacts")
    };
    let params = ParamStore::initialize(&config, 5).unwrap();
    let example = |events: &[usize], labels: Vec<usize>| SequenceExample {
        inputs: one_hot_inputs(1, events).index_axis_move(Axis(0), 0).into_dimensionality().unwrap(),
        labels,
    };
    let examples = vec![example(&[1, 2, 3], vec![2, 3, 4]), example(&[4, 3, 2, 1, 0], vec![3, 2, 1, 0, 0])];
    let loader = PaddedBatchLoader::new(InMemorySequenceDataset::new(examples).unwrap(), 2, 5);
    let mut metrics = EvalMetrics::for_config(&config);
    for batch in loader.iter() {
        eval.eval_step.run(&params, &batch, &mut metrics).unwrap();
    }
    assert_eq!(metrics.count(), 8);
}

#[test]
fn test_generate_is_deterministic() {
    let config = config(2, 2);
    let step = generate_step(&config, 3);
    let params = ParamStore::initialize(&config, 1).unwrap();
    // Метки первых двух шагов затравки [1, 4, 2] равны следующим событиям.
    let labels = ArrayD::from_shape_fn(IxDyn(&[2, 2]), |idx| [4.0f32, 2.0][idx[1]]);
    let feed = GenerateFeed::initial(&config, step.state_layout(), one_hot_inputs(2, &[1, 4, 2]), labels, 1.0);

    let first = step.run(&params, &feed).unwrap();
    let second = step.run(&params, &feed).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.softmax.shape(), &[2, 3, NUM_CLASSES]);
    assert_eq!(first.encodings.shape(), &[2, 3, 4]);
    for row in first.softmax.lanes(Axis(2)) {
        assert!((row.sum() - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_temperature_sharpens_distribution() {
    let config = config(1, 0);
    let step = generate_step(&config, 1);
    let params = ParamStore::initialize(&config, 9).unwrap();
    let inputs = one_hot_inputs(1, &[3]);

    let feed = |inputs, temperature| GenerateFeed::initial(&config, step.state_layout(), inputs, no_labels(1), temperature);
    let warm = step.run(&params, &feed(inputs.clone(), 1.0)).unwrap();
    let cold = step.run(&params, &feed(inputs, 0.1)).unwrap();
    let max = |a: &ArrayD<f32>| a.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    assert!(max(&cold.softmax) >= max(&warm.softmax));
}

#[test]
fn test_non_positive_temperature_is_rejected() {
    let config = config(1, 0);
    let step = generate_step(&config, 1);
    let params = ParamStore::initialize(&config, 0).unwrap();
    for temperature in [0.0, -1.0, f32::NAN] {
        let feed = GenerateFeed::initial(&config, step.state_layout(), one_hot_inputs(1, &[0]), no_labels(1), temperature);
        assert!(matches!(
            step.run(&params, &feed),
            Err(MelodyError::Configuration(ConfigurationError::NonPositiveTemperature(_)))
        ));
    }
}

#[test]
fn test_tiny_temperature_keeps_softmax_finite() {
    let config = config(2, 0);
    let step = generate_step(&config, 1);
    let params = ParamStore::initialize(&config, 5).unwrap();
    for temperature in [1e-30, f32::MIN_POSITIVE, 1e-45] {
        let feed = GenerateFeed::initial(&config, step.state_layout(), one_hot_inputs(2, &[3]), no_labels(2), temperature);
        let output = step.run(&params, &feed).unwrap();
        assert!(output.softmax.iter().all(|p| p.is_finite()));
        for row in output.softmax.lanes(Axis(2)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }
}

#[test]
fn test_generate_rejects_wrong_number_of_steps() {
    let config = config(1, 0);
    let params = ParamStore::initialize(&config, 0).unwrap();

    // Три шага в граф, развёрнутый на один.
    let single = generate_step(&config, 1);
    assert_eq!(single.num_steps(), 1);
    let feed = GenerateFeed::initial(
        &config,
        single.state_layout(),
        one_hot_inputs(1, &[0, 1, 2]),
        ArrayD::zeros(IxDyn(&[1, 2])),
        1.0,
    );
    assert!(matches!(
        single.run(&params, &feed),
        Err(MelodyError::FeedShape { name, .. }) if name == names::INPUTS
    ));

    // Один шаг в граф, развёрнутый на три.
    let triple = generate_step(&config, 3);
    let feed = GenerateFeed::initial(&config, triple.state_layout(), one_hot_inputs(1, &[0]), no_labels(1), 1.0);
    assert!(matches!(
        triple.run(&params, &feed),
        Err(MelodyError::FeedShape { name, .. }) if name == names::INPUTS
    ));
}

#[test]
fn test_generate_rejects_wrong_label_length() {
    let config = config(2, 2);
    let step = generate_step(&config, 3);
    let params = ParamStore::initialize(&config, 0).unwrap();

    // Затравке из трёх шагов нужны две метки, а не ноль.
    let feed = GenerateFeed::initial(&config, step.state_layout(), one_hot_inputs(2, &[1, 4, 2]), no_labels(2), 1.0);
    match step.run(&params, &feed) {
        Err(MelodyError::FeedShape { name, actual, .. }) => {
            assert_eq!(name, names::LABELS);
            assert_eq!(actual, vec![2, 0]);
        }
        other => panic!("expected a labels shape error, got {:?}", other.map(|o| o.softmax.shape().to_vec())),
    }

    // После одного вызова история из трёх позиций требует 3 + 3 - 1 меток.
    let labels = ArrayD::from_shape_fn(IxDyn(&[2, 2]), |idx| [4.0f32, 2.0][idx[1]]);
    let feed = GenerateFeed::initial(&config, step.state_layout(), one_hot_inputs(2, &[1, 4, 2]), labels, 1.0);
    let output = step.run(&params, &feed).unwrap();
    let short = feed.advance(&output, &ArrayD::zeros(IxDyn(&[2, 1])), one_hot_inputs(2, &[0, 1, 3])).unwrap();
    assert!(matches!(step.run(&params, &short), Err(MelodyError::FeedShape { .. })));
    let next = feed.advance(&output, &ArrayD::zeros(IxDyn(&[2, 3])), one_hot_inputs(2, &[0, 1, 3])).unwrap();
    assert_eq!(next.labels.shape(), &[2, 5]);
    assert_eq!(step.run(&params, &next).unwrap().softmax.shape(), &[2, 3, NUM_CLASSES]);
}

#[test]
fn test_invalid_mode_and_window_size() {
    assert_eq!(
        Mode::parse("sample", 4).unwrap_err(),
        ConfigurationError::InvalidMode("sample".to_string())
    );

    let mut bad = config(1, 0);
    bad.hparams.window_size = 0;
    for mode in [Mode::Train { num_steps: 4 }, Mode::Generate { num_steps: 1 }] {
        assert!(matches!(
            build_graph(mode, &bad),
            Err(MelodyError::Configuration(ConfigurationError::NonPositiveWindowSize(0)))
        ));
    }
}

#[test]
fn test_state_round_trip_and_block_count() {
    let config = config(2, 2);
    let step = generate_step(&config, 1);
    let layout = step.state_layout();

    let zeros = layout.zeros(2);
    let blocks = zeros.flatten();
    assert_eq!(blocks.len(), layout.num_blocks());
    assert_eq!(RnnState::unflatten(layout, blocks.clone()).unwrap(), zeros);

    let params = ParamStore::initialize(&config, 0).unwrap();
    let mut feed = GenerateFeed::initial(&config, layout, one_hot_inputs(2, &[1]), no_labels(2), 1.0);
    let output = step.run(&params, &feed).unwrap();
    assert_eq!(output.final_state.len(), layout.num_blocks());
    let restored = RnnState::unflatten(layout, output.final_state.clone()).unwrap();
    assert_eq!(restored.flatten(), output.final_state);

    feed.state.pop();
    assert!(matches!(
        step.run(&params, &feed),
        Err(MelodyError::State(StateError::BlockCount { .. }))
    ));
}

#[test]
fn test_step_by_step_matches_full_sequence() {
    let config = config(2, 2);
    let params = ParamStore::initialize(&config, 42).unwrap();
    let events = [1, 3, 3, 0];
    let labels = [3.0f32, 3.0, 0.0];

    // Весь отрывок за один вызов
    let full_step = generate_step(&config, 3);
    let full_feed = GenerateFeed::initial(
        &config,
        full_step.state_layout(),
        one_hot_inputs(2, &events[..3]),
        ArrayD::from_shape_fn(IxDyn(&[2, 2]), |idx| labels[idx[1]]),
        1.0,
    );
    let full = full_step.run(&params, &full_feed).unwrap();

    // Тот же отрывок по одному шагу
    let single_step = generate_step(&config, 1);
    let mut feed =
        GenerateFeed::initial(&config, single_step.state_layout(), one_hot_inputs(2, &events[..1]), no_labels(2), 1.0);
    for t in 0..3 {
        let output = single_step.run(&params, &feed).unwrap();
        let expected = full.softmax.slice(s![.., t..t + 1, ..]).to_owned().into_dyn();
        assert_close(&output.softmax, &expected, 1e-5);
        let expected = full.encodings.slice(s![.., t..t + 1, ..]).to_owned().into_dyn();
        assert_close(&output.encodings, &expected, 1e-5);

        let new_labels = ArrayD::from_elem(IxDyn(&[2, 1]), labels[t]);
        let next_inputs = one_hot_inputs(2, &events[t + 1..t + 2]);
        feed = feed.advance(&output, &new_labels, next_inputs).unwrap();
    }

    for (a, b) in feed.state.iter().zip(&full.final_state) {
        assert_close(a, b, 1e-5);
    }
}
