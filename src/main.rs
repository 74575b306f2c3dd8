//! Демонстрационный драйвер: обучение, оценка и генерация на синтетических мелодиях.

use clap::{Args, Parser, Subcommand};
use ndarray::{Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Instant;
use structured_melody_rnn::data::{InMemorySequenceDataset, PaddedBatchLoader, SequenceExample};
use structured_melody_rnn::melody::{
    build_graph, BuiltGraph, EvalMetrics, GenerateFeed, MelodyRnnConfig, Mode, ParamStore,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(author, version, about = "Structured melody RNN on an abstract semantic graph", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON-файл конфигурации (encoder_decoder + hparams)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Переопределения гиперпараметров: "batch_size=4,rnn_layer_sizes=[16,16]"
    #[arg(long, global = true, default_value = "")]
    hparams: String,

    /// Длина развёрнутой последовательности
    #[arg(long, global = true, default_value_t = 16)]
    num_steps: usize,

    #[arg(long, global = true, default_value_t = 0)]
    seed: u64,

    /// Сохранить граф прямого прохода в JSON
    #[arg(long, global = true)]
    dump_graph: Option<PathBuf>,

    /// Подробный лог (DEBUG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Несколько шагов обучения на синтетических мелодиях
    TrainStep {
        #[arg(long, default_value_t = 10)]
        steps: usize,
    },
    /// Потоковая оценка на синтетических мелодиях
    Eval {
        #[arg(long, default_value_t = 4)]
        batches: usize,
    },
    /// Пошаговая генерация мелодии
    Generate {
        #[arg(long, default_value_t = 32)]
        length: usize,
        #[arg(long, default_value_t = 1.0)]
        temperature: f32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.common.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // ---------- 1. Конфигурация ----------
    let mut config = match &cli.common.config {
        Some(path) => MelodyRnnConfig::from_json_file(path)?,
        None => MelodyRnnConfig::default(),
    };
    config.hparams = config.hparams.parse(&cli.common.hparams)?;
    config.validate()?;

    let start_time = Instant::now();
    match cli.command {
        Command::TrainStep { steps } => run_train(&config, &cli.common, steps)?,
        Command::Eval { batches } => run_eval(&config, &cli.common, batches)?,
        Command::Generate { length, temperature } => run_generate(&config, &cli.common, length, temperature)?,
    }
    info!("завершено за {:.2?}", start_time.elapsed());
    Ok(())
}

fn dump_graph(built: &BuiltGraph, path: &Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = path {
        let json = serde_json::to_string_pretty(built.graph())?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), mode = built.mode_name(), "граф сохранён");
    }
    Ok(())
}

/// Синтетические мелодии: повторяющийся мотив с редкими случайными заменами.
/// Вход шага `t` кодирует событие `t`, метка равна событию `t + 1`.
fn synthetic_melodies(
    config: &MelodyRnnConfig,
    count: usize,
    max_len: usize,
    rng: &mut StdRng,
) -> Result<InMemorySequenceDataset, Box<dyn std::error::Error>> {
    let input_size = config.encoder_decoder.input_size;
    let num_classes = config.encoder_decoder.num_classes;

    let examples = (0..count)
        .map(|_| {
            let len = rng.gen_range(max_len / 2..=max_len).max(1);
            let motif: Vec<usize> = (0..4).map(|_| rng.gen_range(0..num_classes)).collect();
            let events: Vec<usize> = (0..=len)
                .map(|t| {
                    if rng.gen_bool(0.1) {
                        rng.gen_range(0..num_classes)
                    } else {
                        motif[t % motif.len()]
                    }
                })
                .collect();
            let mut inputs = Array2::zeros((len, input_size));
            for (t, &event) in events[..len].iter().enumerate() {
                inputs[[t, event % input_size]] = 1.0;
            }
            SequenceExample { inputs, labels: events[1..].to_vec() }
        })
        .collect();
    Ok(InMemorySequenceDataset::new(examples)?)
}

fn run_train(config: &MelodyRnnConfig, args: &CommonArgs, steps: usize) -> Result<(), Box<dyn std::error::Error>> {
    let built = build_graph(Mode::Train { num_steps: args.num_steps }, config)?;
    dump_graph(&built, &args.dump_graph)?;
    let BuiltGraph::Train(artifacts) = built else {
        return Err("режим train построил граф другого типа".into());
    };
    let mut train_step = artifacts.train_step.with_seed(args.seed);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut params = ParamStore::initialize(config, args.seed)?;
    let dataset = synthetic_melodies(config, config.hparams.batch_size * 4, args.num_steps, &mut rng)?;
    let loader = PaddedBatchLoader::new(dataset, config.hparams.batch_size, args.num_steps)
        .shuffle(true)
        .seed(args.seed);
    info!(parameters = params.len(), batches = loader.num_batches(), "начало обучения");

    let mut step = 0;
    while step < steps {
        for batch in loader.iter() {
            if step >= steps {
                break;
            }
            let result = train_step.run(&mut params, &batch)?;
            step += 1;
            info!(
                step,
                loss = format_args!("{:.6}", result.loss),
                perplexity = format_args!("{:.4}", result.perplexity),
                accuracy = format_args!("{:.4}", result.accuracy),
                event_accuracy = format_args!("{:.4}", result.event_accuracy),
                no_event_accuracy = format_args!("{:.4}", result.no_event_accuracy),
                "шаг обучения"
            );
        }
    }
    Ok(())
}

fn run_eval(config: &MelodyRnnConfig, args: &CommonArgs, batches: usize) -> Result<(), Box<dyn std::error::Error>> {
    let built = build_graph(Mode::Eval { num_steps: args.num_steps }, config)?;
    dump_graph(&built, &args.dump_graph)?;
    let BuiltGraph::Eval(artifacts) = built else {
        return Err("режим eval построил граф другого типа".into());
    };
    let eval_step = artifacts.eval_step.with_seed(args.seed);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let params = ParamStore::initialize(config, args.seed)?;
    let dataset = synthetic_melodies(config, config.hparams.batch_size * batches, args.num_steps, &mut rng)?;
    let loader = PaddedBatchLoader::new(dataset, config.hparams.batch_size, args.num_steps);

    let mut metrics = EvalMetrics::for_config(config);
    for batch in loader.iter() {
        eval_step.run(&params, &batch, &mut metrics)?;
    }
    for (name, value) in metrics.summary() {
        info!(positions = metrics.count(), "{} = {:.6}", name, value);
    }
    Ok(())
}

fn run_generate(
    config: &MelodyRnnConfig,
    args: &CommonArgs,
    length: usize,
    temperature: f32,
) -> Result<(), Box<dyn std::error::Error>> {
    // По одному событию за вызов, история копится в GenerateFeed.
    let built = build_graph(Mode::Generate { num_steps: 1 }, config)?;
    dump_graph(&built, &args.dump_graph)?;
    let BuiltGraph::Generate(artifacts) = built else {
        return Err("режим generate построил граф другого типа".into());
    };
    let generate_step = artifacts.generate_step;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let params = ParamStore::initialize(config, args.seed)?;
    let batch = config.hparams.batch_size;
    let input_size = config.encoder_decoder.input_size;
    let one_hot = |labels: &ArrayD<f32>| {
        let mut inputs = ArrayD::zeros(IxDyn(&[batch, 1, input_size]));
        for (b, &label) in labels.iter().enumerate() {
            inputs[[b, 0, label as usize % input_size]] = 1.0;
        }
        inputs
    };

    let primer = ArrayD::from_elem(IxDyn(&[batch]), config.encoder_decoder.default_event_label as f32);
    // Затравка из одного события: предшествующих меток нет.
    let primer_labels = ArrayD::zeros(IxDyn(&[batch, 0]));
    let mut feed = GenerateFeed::initial(
        config,
        generate_step.state_layout(),
        one_hot(&primer),
        primer_labels,
        temperature,
    );
    let mut melody = Vec::with_capacity(length);
    for _ in 0..length {
        let output = generate_step.run(&params, &feed)?;
        let sampled = output.sample_last(&mut rng)?;
        melody.push(sampled[0] as usize);
        let new_labels = sampled.clone().into_shape(IxDyn(&[batch, 1]))?;
        feed = feed.advance(&output, &new_labels, one_hot(&sampled))?;
    }
    info!(temperature, "мелодия: {:?}", melody);
    Ok(())
}
