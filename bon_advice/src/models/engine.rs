use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::training::checkpoints;
use crate::training::data::{PairBatch, ScoringExample};
use crate::utils;

/// Options for one generation pass of the sequence model.
#[derive(Debug, Clone, Serialize)]
pub struct PredictOptions {
    /// Checkpoint to decode from; `None` means the latest in the model dir.
    pub checkpoint_steps: Option<u64>,
    pub sampling_keep_top_p: f64,
}

/// The opaque generation engine: reads one example per input line and writes
/// exactly one output line per input line, in order.
pub trait GenerationEngine {
    fn predict(&self, input_file: &Path, output_file: &Path, options: &PredictOptions) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceLength {
    pub inputs: usize,
    pub targets: usize,
}

impl SequenceLength {
    /// Target length for (loser, winner) stacked into one target sequence.
    pub fn for_stacked_pairs(self) -> Self {
        Self {
            inputs: self.inputs,
            targets: self.targets * 2,
        }
    }
}

/// Which model head the engine should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelHead {
    Comparative,
}

/// Everything the engine needs to build an estimator. Replaces patching the
/// engine's model constructor: the head is chosen here.
#[derive(Debug, Clone, Serialize)]
pub struct EstimatorSpec {
    pub model_dir: PathBuf,
    pub head: ModelHead,
    pub batch_size: usize,
    pub sequence_length: SequenceLength,
    pub init_checkpoint: Option<PathBuf>,
    /// Engine-level parameter overrides (dropout, microbatching, ...).
    pub bindings: BTreeMap<String, String>,
}

pub type Metrics = BTreeMap<String, f64>;

pub trait Estimator {
    /// Trains on every batch the iterator yields, up to `max_steps` global steps.
    fn train(&mut self, batches: &mut dyn Iterator<Item = PairBatch>, max_steps: u64) -> Result<()>;

    fn evaluate(&mut self, batches: &[PairBatch], checkpoint: &Path, name: &str) -> Result<Metrics>;

    /// One output per example, in order.
    fn predict(&mut self, examples: &[ScoringExample], checkpoint: &Path) -> Result<Vec<String>>;
}

pub trait EstimatorFactory {
    fn build(&self, spec: &EstimatorSpec) -> Result<Box<dyn Estimator>>;
}

/// A backend serving both generation and reward model estimators.
pub trait ModelEngine: GenerationEngine + EstimatorFactory {
    fn generator(&self) -> &dyn GenerationEngine;
    fn estimators(&self) -> &dyn EstimatorFactory;
}

impl<T: GenerationEngine + EstimatorFactory> ModelEngine for T {
    fn generator(&self) -> &dyn GenerationEngine {
        self
    }

    fn estimators(&self) -> &dyn EstimatorFactory {
        self
    }
}

/// Engine reached through an external program. Each operation is one
/// blocking invocation `<program> <args..> <op> ...` exchanging files in
/// `work_dir`:
///
/// - `predict --input F --output F --top-p P [--checkpoint-steps N]`
/// - `train --spec JSON --max-steps N --batches F` (JSON-lines batches)
/// - `evaluate --spec JSON --checkpoint C --name S --batches F --metrics F`
/// - `score --spec JSON --checkpoint C --examples F --output F`
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    model_dir: Option<PathBuf>,
    work_dir: PathBuf,
}

impl CommandEngine {
    pub fn new(program: &str, args: &[String], model_dir: Option<&Path>, work_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create engine work dir: {:?}", work_dir))?;
        Ok(Self {
            program: program.to_string(),
            args: args.to_vec(),
            model_dir: model_dir.map(Path::to_path_buf),
            work_dir: work_dir.to_path_buf(),
        })
    }

    fn run(&self, op: &str, extra: &[String]) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(op).args(extra);
        debug!("Running engine: {:?}", cmd);
        let status = cmd
            .status()
            .with_context(|| format!("Failed to launch engine program: {}", self.program))?;
        if !status.success() {
            anyhow::bail!("Engine {} {} failed with {}", self.program, op, status);
        }
        Ok(())
    }

    fn scratch(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }
}

impl GenerationEngine for CommandEngine {
    fn predict(&self, input_file: &Path, output_file: &Path, options: &PredictOptions) -> Result<()> {
        let checkpoint_steps = match (options.checkpoint_steps, &self.model_dir) {
            (Some(steps), _) => Some(steps),
            (None, Some(dir)) => Some(checkpoints::latest_checkpoint_step(dir)?),
            (None, None) => None,
        };
        let mut extra = vec![
            "--input".to_string(),
            input_file.display().to_string(),
            "--output".to_string(),
            output_file.display().to_string(),
            "--top-p".to_string(),
            options.sampling_keep_top_p.to_string(),
        ];
        if let Some(steps) = checkpoint_steps {
            extra.push("--checkpoint-steps".to_string());
            extra.push(steps.to_string());
        }
        info!("Generating from {:?} (checkpoint: {:?})", input_file, checkpoint_steps);
        self.run("predict", &extra)
    }
}

impl EstimatorFactory for CommandEngine {
    fn build(&self, spec: &EstimatorSpec) -> Result<Box<dyn Estimator>> {
        let spec_json = serde_json::to_string(spec).context("Failed to serialize estimator spec")?;
        Ok(Box::new(CommandEstimator {
            engine: self.clone(),
            spec_json,
        }))
    }
}

struct CommandEstimator {
    engine: CommandEngine,
    spec_json: String,
}

impl CommandEstimator {
    fn write_jsonl<T: Serialize>(path: &Path, items: impl Iterator<Item = T>) -> Result<usize> {
        let mut writer = utils::create_writer(path)?;
        let mut count = 0;
        for item in items {
            serde_json::to_writer(&mut writer, &item)?;
            writer.write_all(b"\n")?;
            count += 1;
        }
        writer.flush()?;
        Ok(count)
    }
}

impl Estimator for CommandEstimator {
    fn train(&mut self, batches: &mut dyn Iterator<Item = PairBatch>, max_steps: u64) -> Result<()> {
        let batches_path = self.engine.scratch("train-batches.jsonl");
        let n = Self::write_jsonl(&batches_path, batches)?;
        info!("Training for up to {} steps on {} batches", max_steps, n);
        self.engine.run(
            "train",
            &[
                "--spec".to_string(),
                self.spec_json.clone(),
                "--max-steps".to_string(),
                max_steps.to_string(),
                "--batches".to_string(),
                batches_path.display().to_string(),
            ],
        )
    }

    fn evaluate(&mut self, batches: &[PairBatch], checkpoint: &Path, name: &str) -> Result<Metrics> {
        let batches_path = self.engine.scratch(&format!("eval-{}-batches.jsonl", name));
        let metrics_path = self.engine.scratch(&format!("eval-{}-metrics.json", name));
        Self::write_jsonl(&batches_path, batches.iter())?;
        self.engine.run(
            "evaluate",
            &[
                "--spec".to_string(),
                self.spec_json.clone(),
                "--checkpoint".to_string(),
                checkpoint.display().to_string(),
                "--name".to_string(),
                name.to_string(),
                "--batches".to_string(),
                batches_path.display().to_string(),
                "--metrics".to_string(),
                metrics_path.display().to_string(),
            ],
        )?;
        let content = std::fs::read_to_string(&metrics_path)
            .with_context(|| format!("Failed to read metrics file: {:?}", metrics_path))?;
        serde_json::from_str(&content).context("Failed to parse engine metrics")
    }

    fn predict(&mut self, examples: &[ScoringExample], checkpoint: &Path) -> Result<Vec<String>> {
        let examples_path = self.engine.scratch("score-examples.jsonl");
        let output_path = self.engine.scratch("score-output.txt");
        Self::write_jsonl(&examples_path, examples.iter())?;
        self.engine.run(
            "score",
            &[
                "--spec".to_string(),
                self.spec_json.clone(),
                "--checkpoint".to_string(),
                checkpoint.display().to_string(),
                "--examples".to_string(),
                examples_path.display().to_string(),
                "--output".to_string(),
                output_path.display().to_string(),
            ],
        )?;
        utils::read_lines(&output_path)
    }
}
