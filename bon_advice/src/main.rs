use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use bon_advice::best_of_n::{self, BestOfNGenerator, Generations};
use bon_advice::config::{EngineBackend, EngineConfig, PipelineConfig};
use bon_advice::models::{load_tokenizer, CommandEngine, ModelEngine, QuestionReader, Split};
use bon_advice::pairs::PreferencePairBuilder;
use bon_advice::training::{ComparativeRewardModel, PipelineMetrics};
use bon_advice::utils;

#[derive(Parser, Debug)]
#[command(name = "bon-advice")]
#[command(about = "Best-of-N advice generation with a comparative reward model", long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./config.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable DEBUG logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build sharded preference-pair datasets from a question dump
    BuildPairs {
        /// JSON-lines file of questions with their answers
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        output_dir: Option<String>,
        #[arg(long)]
        dataset_id: Option<String>,
        #[arg(long)]
        shard_count: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Maximum seconds between the two answers of a pair
        #[arg(long)]
        max_time_diff: Option<f64>,
        #[arg(long)]
        max_len_ratio: Option<f64>,
        #[arg(long)]
        min_score_ratio: Option<f64>,
        #[arg(long)]
        tokenizer: Option<String>,
    },
    /// Generate N samples per input line
    Generate {
        #[arg(long)]
        inputs: PathBuf,
        #[arg(long)]
        outputs: PathBuf,
        #[arg(short = 'n', long)]
        n: Option<usize>,
        #[arg(long)]
        checkpoint_steps: Option<u64>,
        #[arg(long)]
        top_p: Option<f64>,
        #[arg(long)]
        tmp_dir: Option<String>,
    },
    /// Pool generations from several runs into groups of N
    Merge {
        /// Comma-separated generation files
        #[arg(long, value_delimiter = ',')]
        inputs: Vec<PathBuf>,
        /// Comma-separated generations per question, one per input file
        #[arg(long = "per-source-n", value_delimiter = ',')]
        per_source_n: Vec<usize>,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        target_n: Option<usize>,
    },
    /// Join inputs with their N generations into a reward model scoring file
    Score {
        #[arg(long)]
        inputs: PathBuf,
        #[arg(long)]
        generations: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(short = 'n', long)]
        n: Option<usize>,
    },
    /// Pick the highest-reward generation of each block
    Select {
        #[arg(long)]
        generations: PathBuf,
        #[arg(long)]
        scores: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(short = 'n', long)]
        n: Option<usize>,
        #[arg(long)]
        restore_paragraphs: bool,
    },
    /// Train the comparative reward model
    Train {
        #[arg(long)]
        dataset_id: Option<String>,
        #[arg(long)]
        steps: Option<u64>,
        #[arg(long)]
        init_checkpoint: Option<PathBuf>,
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Finetune the reward model from a pretrained checkpoint
    Finetune {
        #[arg(long)]
        dataset_id: Option<String>,
        #[arg(long)]
        steps: Option<u64>,
        #[arg(long)]
        pretrained_dir: Option<PathBuf>,
        /// Pretrained step to start from (latest when omitted)
        #[arg(long)]
        pretrained_step: Option<u64>,
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Evaluate reward model checkpoints on a split
    Eval {
        #[arg(long)]
        dataset_id: Option<String>,
        #[arg(long, default_value = "val")]
        split: Split,
        #[arg(long)]
        min_checkpoint_steps: Option<u64>,
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Score inputs<TAB>targets lines with the reward model
    Predict {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        checkpoint_steps: Option<u64>,
        #[arg(long)]
        model_dir: Option<String>,
    },
}

fn load_config(path: Option<&str>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path),
        None if Path::new("config.yaml").exists() => PipelineConfig::load("config.yaml"),
        None => Ok(PipelineConfig::default()),
    }
}

// PYO3_PYTHON must be set before the interpreter is prepared; prefer a
// project venv when one is around.
#[cfg(feature = "python")]
fn setup_python_env() {
    if std::env::var("PYO3_PYTHON").is_ok() {
        return;
    }
    let Ok(mut dir) = std::env::current_dir() else {
        return;
    };
    for _ in 0..4 {
        let venv_python = dir.join(".venv").join("bin").join("python");
        if venv_python.exists() {
            std::env::set_var("PYO3_PYTHON", &venv_python);
            eprintln!("Set PYO3_PYTHON={} (detected venv)", venv_python.display());
            return;
        }
        if !dir.pop() {
            return;
        }
    }
}

fn build_engine(config: &EngineConfig, model_dir: Option<&Path>) -> Result<Box<dyn ModelEngine>> {
    match config.backend {
        EngineBackend::Command => {
            info!("Using command engine: {} {:?}", config.program, config.args);
            Ok(Box::new(CommandEngine::new(
                &config.program,
                &config.args,
                model_dir,
                Path::new(&config.work_dir),
            )?))
        }
        #[cfg(feature = "python")]
        EngineBackend::Python => {
            setup_python_env();
            info!("Using Python engine module: {}", config.python_module);
            Ok(Box::new(bon_advice::models::python::PyEngine::new(&config.python_module)?))
        }
        #[cfg(not(feature = "python"))]
        EngineBackend::Python => anyhow::bail!("Python engine requested but bon-advice was built without the `python` feature"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;

    // Setup logging
    let log_level = if args.debug { "debug".to_string() } else { config.logging.log_level.clone() };
    tracing_subscriber::fmt()
        .with_env_filter(format!("bon_advice={}", log_level))
        .init();

    info!("Best-of-N advice pipeline");
    if let Some(path) = &args.config {
        info!("Loaded configuration from: {}", path);
    }

    let mut metrics = PipelineMetrics::new();
    let start = Instant::now();

    match args.command {
        Command::BuildPairs {
            source,
            output_dir,
            dataset_id,
            shard_count,
            seed,
            max_time_diff,
            max_len_ratio,
            min_score_ratio,
            tokenizer,
        } => {
            // Override config with CLI arguments
            let data = &mut config.data;
            if let Some(source) = source {
                data.source_path = source;
            }
            if let Some(output_dir) = output_dir {
                data.output_dir = output_dir;
            }
            if let Some(dataset_id) = dataset_id {
                data.dataset_id = dataset_id;
            }
            if let Some(shard_count) = shard_count {
                data.shard_count = shard_count;
            }
            if seed.is_some() {
                data.seed = seed;
            }
            if max_time_diff.is_some() {
                data.filters.max_time_diff = max_time_diff;
            }
            if max_len_ratio.is_some() {
                data.filters.max_len_ratio = max_len_ratio;
            }
            if min_score_ratio.is_some() {
                data.filters.min_score_ratio = min_score_ratio;
            }
            if tokenizer.is_some() {
                data.tokenizer = tokenizer;
            }

            let tokenizer = load_tokenizer(config.data.tokenizer.as_deref())?;
            let builder = PreferencePairBuilder::new(config.pair_builder(), tokenizer.as_ref());
            let reader = QuestionReader::open(&config.data.source_path)?;
            let stats = builder.build(reader, &config.data.source_path)?;
            metrics.record("build_pairs", start.elapsed().as_secs_f64(), stats.n_questions_read as usize);
        }
        Command::Generate {
            inputs,
            outputs,
            n,
            checkpoint_steps,
            top_p,
            tmp_dir,
        } => {
            if let Some(n) = n {
                config.sampling.n = n;
            }
            if checkpoint_steps.is_some() {
                config.sampling.checkpoint_steps = checkpoint_steps;
            }
            if let Some(top_p) = top_p {
                config.sampling.sampling_keep_top_p = top_p;
            }
            if let Some(tmp_dir) = tmp_dir {
                config.sampling.tmp_dir = tmp_dir;
            }
            let model_dir = config.engine.model_dir.as_ref().map(PathBuf::from);
            let engine = build_engine(&config.engine, model_dir.as_deref())?;
            let generator = BestOfNGenerator::new(engine.generator(), config.sampler());
            let generations = generator.generate_file(&inputs, &outputs)?;
            metrics.record("generate", start.elapsed().as_secs_f64(), generations.lines().len());
        }
        Command::Merge {
            inputs,
            per_source_n,
            output,
            target_n,
        } => {
            let sources: Vec<(PathBuf, usize)> = if inputs.is_empty() {
                config
                    .merge
                    .inputs
                    .iter()
                    .map(|input| (PathBuf::from(&input.path), input.n))
                    .collect()
            } else {
                if inputs.len() != per_source_n.len() {
                    anyhow::bail!(
                        "--inputs has {} files but --per-source-n has {} counts",
                        inputs.len(),
                        per_source_n.len()
                    );
                }
                inputs.into_iter().zip(per_source_n).collect()
            };
            let target_n = target_n.unwrap_or(config.merge.target_n);
            let report = best_of_n::merge_files(&sources, target_n, &output)?;
            metrics.record("merge", start.elapsed().as_secs_f64(), report.lines);
        }
        Command::Score {
            inputs,
            generations,
            output,
            n,
        } => {
            let n = n.unwrap_or(config.sampling.n);
            let inputs = utils::read_lines(&inputs)?;
            let generations = Generations::new(utils::read_lines(&generations)?, n)
                .context("Generation file does not hold whole blocks of N")?;
            let lines = best_of_n::pair_with_inputs(&inputs, &generations)?;
            utils::write_lines(&output, &lines)?;
            info!("Wrote {} scoring inputs to {:?}", lines.len(), output);
            metrics.record("score_inputs", start.elapsed().as_secs_f64(), lines.len());
        }
        Command::Select {
            generations,
            scores,
            output,
            n,
            restore_paragraphs,
        } => {
            let mut options = config.select_options();
            if let Some(n) = n {
                options.n = n;
            }
            options.restore_paragraphs |= restore_paragraphs;
            let report = best_of_n::select_files(&generations, &scores, &output, &options)?;
            metrics.record("select", start.elapsed().as_secs_f64(), report.blocks);
        }
        Command::Train {
            dataset_id,
            steps,
            init_checkpoint,
            model_dir,
        } => {
            if let Some(model_dir) = model_dir {
                config.reward_model.model_dir = model_dir;
            }
            let dataset_id = dataset_id.unwrap_or_else(|| config.data.dataset_id.clone());
            let steps = steps.unwrap_or(config.reward_model.num_train_steps);
            let engine = build_engine(&config.engine, None)?;
            let model = ComparativeRewardModel::new(engine.estimators(), config.reward_model());
            model.write_params(&dataset_id, steps)?;
            let fed = model.train(&dataset_id, steps, init_checkpoint.as_deref())?;
            metrics.record("train", start.elapsed().as_secs_f64(), fed as usize);
        }
        Command::Finetune {
            dataset_id,
            steps,
            pretrained_dir,
            pretrained_step,
            model_dir,
        } => {
            if let Some(model_dir) = model_dir {
                config.reward_model.model_dir = model_dir;
            }
            let dataset_id = dataset_id.unwrap_or_else(|| config.data.dataset_id.clone());
            let steps = steps.unwrap_or(config.reward_model.num_train_steps);
            let pretrained_dir = pretrained_dir
                .or_else(|| config.reward_model.pretrained_dir.as_ref().map(PathBuf::from))
                .context("finetune needs --pretrained-dir or reward_model.pretrained_dir")?;
            let engine = build_engine(&config.engine, None)?;
            let model = ComparativeRewardModel::new(engine.estimators(), config.reward_model());
            model.write_params(&dataset_id, steps)?;
            let fed = model.finetune(&dataset_id, steps, &pretrained_dir, pretrained_step)?;
            metrics.record("finetune", start.elapsed().as_secs_f64(), fed as usize);
        }
        Command::Eval {
            dataset_id,
            split,
            min_checkpoint_steps,
            model_dir,
        } => {
            if let Some(model_dir) = model_dir {
                config.reward_model.model_dir = model_dir;
            }
            let dataset_id = dataset_id.unwrap_or_else(|| config.data.dataset_id.clone());
            let min_steps = min_checkpoint_steps.or(config.reward_model.min_checkpoint_steps);
            let engine = build_engine(&config.engine, None)?;
            let model = ComparativeRewardModel::new(engine.estimators(), config.reward_model());
            let results = model.evaluate(&dataset_id, split, min_steps)?;
            metrics.record("eval", start.elapsed().as_secs_f64(), results.len());
        }
        Command::Predict {
            input,
            output,
            checkpoint_steps,
            model_dir,
        } => {
            if let Some(model_dir) = model_dir {
                config.reward_model.model_dir = model_dir;
            }
            let engine = build_engine(&config.engine, None)?;
            let model = ComparativeRewardModel::new(engine.estimators(), config.reward_model());
            let scored = model.predict_from_file(&input, &output, checkpoint_steps)?;
            info!("Wrote {} predictions to {:?}", scored, output);
            metrics.record("predict", start.elapsed().as_secs_f64(), scored);
        }
    }

    metrics.print_summary();
    info!("Done in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}
