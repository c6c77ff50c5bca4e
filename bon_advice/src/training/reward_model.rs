use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::models::engine::{EstimatorSpec, Metrics, ModelHead, SequenceLength};
use crate::models::{EstimatorFactory, Split};
use crate::pairs::shards::split_file_name;
use crate::training::checkpoints;
use crate::training::data::{self, TrainingBatches};
use crate::utils;

pub const PARAMS_FILE: &str = "params.json";

#[derive(Debug, Clone)]
pub struct RewardModelConfig {
    pub model_dir: PathBuf,
    /// Directory holding one sub-directory per dataset id.
    pub data_dir: PathBuf,
    pub model_id: Option<String>,
    pub batch_size: usize,
    pub ensemble_inputs: usize,
    pub sequence_length: SequenceLength,
    pub learning_rate: f64,
    pub save_checkpoints_steps: u64,
    pub iterations_per_loop: u64,
    pub tokens_per_microbatch_per_replica: Option<usize>,
    pub dropout_rate: f64,
    pub shuffle_buffer_size: usize,
    pub seed: Option<u64>,
}

/// Record of a training run, stored as `params.json` in the model dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub model_id: String,
    pub dataset_id: String,
    pub learning_rate: f64,
    pub num_train_steps: u64,
    pub train_batch_size: usize,
    pub tokens_per_microbatch_per_replica: Option<usize>,
    pub iterations_per_loop: u64,
    pub save_checkpoints_steps: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMetrics {
    pub step: u64,
    pub checkpoint: PathBuf,
    pub metrics: Metrics,
}

/// Orchestrates the comparative reward model over the opaque estimator:
/// training and finetuning on stacked preference pairs, checkpoint
/// evaluation, and scoring.
pub struct ComparativeRewardModel<'f> {
    factory: &'f dyn EstimatorFactory,
    config: RewardModelConfig,
}

impl<'f> ComparativeRewardModel<'f> {
    pub fn new(factory: &'f dyn EstimatorFactory, config: RewardModelConfig) -> Self {
        Self { factory, config }
    }

    pub fn config(&self) -> &RewardModelConfig {
        &self.config
    }

    pub fn dataset_path(&self, dataset_id: &str, split: Split) -> PathBuf {
        self.config.data_dir.join(dataset_id).join(split_file_name(split))
    }

    fn spec(
        &self,
        sequence_length: SequenceLength,
        init_checkpoint: Option<PathBuf>,
        bindings: BTreeMap<String, String>,
    ) -> EstimatorSpec {
        EstimatorSpec {
            model_dir: self.config.model_dir.clone(),
            head: ModelHead::Comparative,
            batch_size: self.config.batch_size,
            sequence_length,
            init_checkpoint,
            bindings,
        }
    }

    fn microbatch_bindings(&self) -> BTreeMap<String, String> {
        let mut bindings = BTreeMap::new();
        if let Some(tokens) = self.config.tokens_per_microbatch_per_replica {
            bindings.insert("tokens_per_microbatch_per_replica".to_string(), tokens.to_string());
        }
        bindings
    }

    /// Writes `params.json` for a run of `num_train_steps` on `dataset_id`.
    pub fn write_params(&self, dataset_id: &str, num_train_steps: u64) -> Result<TrainingParams> {
        let model_id = match &self.config.model_id {
            Some(id) => id.clone(),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("System clock is before the UNIX epoch")?
                .as_secs()
                .to_string(),
        };
        let params = TrainingParams {
            model_id,
            dataset_id: dataset_id.to_string(),
            learning_rate: self.config.learning_rate,
            num_train_steps,
            train_batch_size: self.config.batch_size,
            tokens_per_microbatch_per_replica: self.config.tokens_per_microbatch_per_replica,
            iterations_per_loop: self.config.iterations_per_loop,
            save_checkpoints_steps: self.config.save_checkpoints_steps,
        };
        std::fs::create_dir_all(&self.config.model_dir)
            .with_context(|| format!("Failed to create model dir: {:?}", self.config.model_dir))?;
        let path = self.config.model_dir.join(PARAMS_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&params)?)
            .with_context(|| format!("Failed to write training params: {:?}", path))?;
        info!("Saved training params to {:?}", path);
        Ok(params)
    }

    /// Trains until global step `steps`. Returns the number of batches fed.
    pub fn train(&self, dataset_id: &str, steps: u64, init_checkpoint: Option<&Path>) -> Result<u64> {
        self.train_with_bindings(dataset_id, steps, init_checkpoint, self.microbatch_bindings())
    }

    fn train_with_bindings(
        &self,
        dataset_id: &str,
        steps: u64,
        init_checkpoint: Option<&Path>,
        bindings: BTreeMap<String, String>,
    ) -> Result<u64> {
        let path = self.dataset_path(dataset_id, Split::Train);
        info!("Loading training pairs from {:?}", path);
        let pairs = data::load_pairs(&path)?;
        if pairs.is_empty() {
            return Err(PipelineError::Config(format!("no training pairs in {:?}", path)).into());
        }

        // A model dir with checkpoints resumes from them; a fresh one starts
        // from the init checkpoint's step.
        let resumed = checkpoints::latest_or_zero(&self.config.model_dir)?;
        let start = if resumed > 0 {
            resumed
        } else {
            init_checkpoint.and_then(step_of_checkpoint).unwrap_or(0)
        };
        let remaining = steps.saturating_sub(start);
        if remaining == 0 {
            warn!("Model already at step {} (target {}); nothing to train", start, steps);
            return Ok(0);
        }

        let spec = self.spec(
            self.config.sequence_length.for_stacked_pairs(),
            init_checkpoint.map(Path::to_path_buf),
            bindings,
        );
        let mut estimator = self.factory.build(&spec)?;
        let batch_size = self.config.batch_size * self.config.ensemble_inputs.max(1);
        let mut batches = TrainingBatches::new(pairs, batch_size, self.config.shuffle_buffer_size, self.config.seed)?
            .take(remaining as usize);

        info!(
            "Training comparative reward model on {} from step {} to {} (batch {})",
            dataset_id, start, steps, batch_size
        );
        let t0 = Instant::now();
        estimator.train(&mut batches, steps)?;
        info!("Training finished in {:.1}s", t0.elapsed().as_secs_f64());
        Ok(remaining)
    }

    /// Continues training a pretrained model for `finetune_steps` steps from
    /// `pretrained_step`, or the latest checkpoint in `pretrained_dir`.
    pub fn finetune(
        &self,
        dataset_id: &str,
        finetune_steps: u64,
        pretrained_dir: &Path,
        pretrained_step: Option<u64>,
    ) -> Result<u64> {
        let step = match pretrained_step {
            Some(step) => step,
            None => checkpoints::latest_checkpoint_step(pretrained_dir)?,
        };
        let mut bindings = self.microbatch_bindings();
        bindings.insert("dropout_rate".to_string(), self.config.dropout_rate.to_string());
        let init = checkpoints::checkpoint_path(pretrained_dir, step);
        info!("Finetuning from {:?} for {} steps", init, finetune_steps);
        self.train_with_bindings(dataset_id, step + finetune_steps, Some(&init), bindings)
    }

    /// Evaluates every checkpoint at or above `min_checkpoint_steps` on one
    /// split, in step order.
    pub fn evaluate(
        &self,
        dataset_id: &str,
        split: Split,
        min_checkpoint_steps: Option<u64>,
    ) -> Result<Vec<CheckpointMetrics>> {
        let ckpts = checkpoints::get_checkpoint_paths(&self.config.model_dir, min_checkpoint_steps)?;
        if ckpts.is_empty() {
            warn!(
                "No checkpoints at or above step {} in {:?}",
                min_checkpoint_steps.unwrap_or(0),
                self.config.model_dir
            );
            return Ok(Vec::new());
        }

        let pairs = data::load_pairs(&self.dataset_path(dataset_id, split))?;
        let batches = data::eval_batches(&pairs, self.config.batch_size)?;
        info!("Evaluating {} checkpoints on {} batches of {}", ckpts.len(), batches.len(), split);

        let spec = self.spec(
            self.config.sequence_length.for_stacked_pairs(),
            None,
            self.microbatch_bindings(),
        );
        let mut estimator = self.factory.build(&spec)?;

        let pb = utils::progress_bar(ckpts.len() as u64)?;
        let mut results = Vec::with_capacity(ckpts.len());
        for (step, checkpoint) in ckpts {
            let metrics = estimator.evaluate(&batches, &checkpoint, split.as_str())?;
            info!("Metrics for ckpt {:?}: {:?}", checkpoint, metrics);
            results.push(CheckpointMetrics {
                step,
                checkpoint,
                metrics,
            });
            pb.inc(1);
        }
        pb.finish();
        Ok(results)
    }

    /// Scores `inputs<TAB>targets` lines at a checkpoint (latest if unset),
    /// one output line per input line. An existing output file is replaced.
    pub fn predict_from_file(&self, input_path: &Path, output_path: &Path, checkpoint_steps: Option<u64>) -> Result<usize> {
        let step = match checkpoint_steps {
            Some(step) => step,
            None => checkpoints::latest_checkpoint_step(&self.config.model_dir)?,
        };
        let examples = data::load_scoring_examples(input_path)?;
        let spec = self.spec(self.config.sequence_length, None, BTreeMap::new());
        let mut estimator = self.factory.build(&spec)?;
        let checkpoint = checkpoints::checkpoint_path(&self.config.model_dir, step);

        info!("Scoring {} examples at {:?}", examples.len(), checkpoint);
        let outputs = estimator.predict(&examples, &checkpoint)?;
        if outputs.len() != examples.len() {
            return Err(PipelineError::correspondence("predictions vs inputs", examples.len(), outputs.len()).into());
        }
        if output_path.exists() {
            std::fs::remove_file(output_path)
                .with_context(|| format!("Failed to remove old output: {:?}", output_path))?;
        }
        utils::write_lines(output_path, &outputs)?;
        Ok(outputs.len())
    }
}

fn step_of_checkpoint(path: &Path) -> Option<u64> {
    path.file_name()?.to_str()?.strip_prefix("model.ckpt-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::engine::Estimator;
    use crate::training::data::{PairBatch, ScoringExample};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        specs: Vec<EstimatorSpec>,
        trained_batches: usize,
        max_steps: Option<u64>,
        evaluated: Vec<(PathBuf, usize)>,
    }

    struct FakeFactory {
        calls: Rc<RefCell<Calls>>,
        short_predictions: bool,
    }

    struct FakeEstimator {
        calls: Rc<RefCell<Calls>>,
        short_predictions: bool,
    }

    impl EstimatorFactory for FakeFactory {
        fn build(&self, spec: &EstimatorSpec) -> Result<Box<dyn Estimator>> {
            self.calls.borrow_mut().specs.push(spec.clone());
            Ok(Box::new(FakeEstimator {
                calls: Rc::clone(&self.calls),
                short_predictions: self.short_predictions,
            }))
        }
    }

    impl Estimator for FakeEstimator {
        fn train(&mut self, batches: &mut dyn Iterator<Item = PairBatch>, max_steps: u64) -> Result<()> {
            let mut calls = self.calls.borrow_mut();
            calls.trained_batches = batches.count();
            calls.max_steps = Some(max_steps);
            Ok(())
        }

        fn evaluate(&mut self, batches: &[PairBatch], checkpoint: &Path, _name: &str) -> Result<Metrics> {
            self.calls.borrow_mut().evaluated.push((checkpoint.to_path_buf(), batches.len()));
            Ok(BTreeMap::from([("accuracy".to_string(), 0.5)]))
        }

        fn predict(&mut self, examples: &[ScoringExample], _checkpoint: &Path) -> Result<Vec<String>> {
            let take = if self.short_predictions { examples.len() - 1 } else { examples.len() };
            Ok(examples[..take].iter().map(|e| format!("{}", e.targets.len())).collect())
        }
    }

    fn setup(short_predictions: bool) -> (tempfile::TempDir, FakeFactory, RewardModelConfig) {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(data_dir.join("rm")).unwrap();
        let rows: Vec<String> = (0..10).map(|k| format!("q{k}\tworse\tbetter")).collect();
        utils::write_lines(data_dir.join("rm").join("train.tsv"), &rows).unwrap();
        utils::write_lines(data_dir.join("rm").join("val.tsv"), &rows[..7]).unwrap();
        let config = RewardModelConfig {
            model_dir: dir.path().join("model"),
            data_dir,
            model_id: Some("test".to_string()),
            batch_size: 3,
            ensemble_inputs: 1,
            sequence_length: SequenceLength { inputs: 1280, targets: 512 },
            learning_rate: 0.001,
            save_checkpoints_steps: 1000,
            iterations_per_loop: 1000,
            tokens_per_microbatch_per_replica: Some(2560),
            dropout_rate: 0.1,
            shuffle_buffer_size: 1000,
            seed: Some(5),
        };
        let factory = FakeFactory {
            calls: Rc::new(RefCell::new(Calls::default())),
            short_predictions,
        };
        (dir, factory, config)
    }

    fn touch_checkpoint(dir: &Path, step: u64) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(format!("model.ckpt-{step}.index")), b"").unwrap();
    }

    #[test]
    fn training_doubles_targets_and_feeds_remaining_steps() {
        let (_dir, factory, config) = setup(false);
        touch_checkpoint(&config.model_dir, 4);
        let model = ComparativeRewardModel::new(&factory, config);
        assert_eq!(model.train("rm", 10, None).unwrap(), 6);

        let calls = factory.calls.borrow();
        assert_eq!(calls.specs[0].head, ModelHead::Comparative);
        assert_eq!(calls.specs[0].sequence_length.targets, 1024);
        assert_eq!(calls.trained_batches, 6);
        assert_eq!(calls.max_steps, Some(10));
    }

    #[test]
    fn finetune_starts_from_latest_pretrained_step() {
        let (dir, factory, config) = setup(false);
        let pretrained = dir.path().join("pretrained");
        touch_checkpoint(&pretrained, 100);
        touch_checkpoint(&pretrained, 300);
        let model = ComparativeRewardModel::new(&factory, config);
        assert_eq!(model.finetune("rm", 5, &pretrained, None).unwrap(), 5);

        let calls = factory.calls.borrow();
        let spec = &calls.specs[0];
        assert_eq!(spec.init_checkpoint.as_deref(), Some(pretrained.join("model.ckpt-300").as_path()));
        assert_eq!(spec.bindings.get("dropout_rate").map(String::as_str), Some("0.1"));
        assert_eq!(calls.max_steps, Some(305));
    }

    #[test]
    fn evaluates_checkpoints_above_minimum_in_order() {
        let (_dir, factory, config) = setup(false);
        for step in [500, 1000, 2000] {
            touch_checkpoint(&config.model_dir, step);
        }
        let model_dir = config.model_dir.clone();
        let model = ComparativeRewardModel::new(&factory, config);
        let results = model.evaluate("rm", Split::Val, Some(1000)).unwrap();
        assert_eq!(results.iter().map(|r| r.step).collect::<Vec<_>>(), vec![1000, 2000]);
        assert_eq!(results[0].metrics["accuracy"], 0.5);

        let calls = factory.calls.borrow();
        // 7 val pairs in batches of 3: two full batches
        assert_eq!(calls.evaluated, vec![(model_dir.join("model.ckpt-1000"), 2), (model_dir.join("model.ckpt-2000"), 2)]);
    }

    #[test]
    fn params_record_defaults() {
        let (_dir, factory, mut config) = setup(false);
        config.model_id = None;
        let model = ComparativeRewardModel::new(&factory, config);
        let params = model.write_params("rm", 10000).unwrap();
        assert!(params.model_id.parse::<u64>().is_ok());
        let path = model.config().model_dir.join(PARAMS_FILE);
        let stored: TrainingParams = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(stored, params);
    }

    #[test]
    fn prediction_count_must_match_inputs() {
        let (dir, factory, config) = setup(true);
        touch_checkpoint(&config.model_dir, 7);
        let input = dir.path().join("score.tsv");
        utils::write_lines(&input, &["ctx\tone", "ctx\ttwo"]).unwrap();
        let model = ComparativeRewardModel::new(&factory, config);
        let err = model.predict_from_file(&input, &dir.path().join("out.txt"), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Correspondence { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn prediction_replaces_existing_output() {
        let (dir, factory, config) = setup(false);
        touch_checkpoint(&config.model_dir, 7);
        let input = dir.path().join("score.tsv");
        let output = dir.path().join("out.txt");
        utils::write_lines(&input, &["ctx\tone", "ctx\tthree"]).unwrap();
        utils::write_lines(&output, &["stale", "stale", "stale"]).unwrap();
        let model = ComparativeRewardModel::new(&factory, config);
        assert_eq!(model.predict_from_file(&input, &output, None).unwrap(), 2);
        assert_eq!(utils::read_lines(&output).unwrap(), vec!["3", "5"]);
        assert_eq!(factory.calls.borrow().specs[0].sequence_length.targets, 512);
    }
}
