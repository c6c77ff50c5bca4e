use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::best_of_n::{SamplerConfig, SelectOptions};
use crate::models::engine::SequenceLength;
use crate::models::ValidityRules;
use crate::pairs::{PairBuilderConfig, PairFilters};
use crate::pairs::record::SELFTEXT_DESIRED_LEN;
use crate::training::data::DEFAULT_SHUFFLE_BUFFER;
use crate::training::RewardModelConfig;

// Nested YAML structure matching config.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_source_path")]
    pub source_path: String,
    #[serde(default = "default_data_dir")]
    pub output_dir: String,
    #[serde(default = "default_dataset_id")]
    pub dataset_id: String,
    #[serde(default = "default_one")]
    pub shard_count: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    /// tokenizer.json path, model directory or hub id; whitespace tokens if unset
    #[serde(default)]
    pub tokenizer: Option<String>,
    #[serde(default = "default_selftext_tokens")]
    pub selftext_max_tokens: usize,
    #[serde(default)]
    pub filters: PairFilters,
    #[serde(default)]
    pub validity: ValidityRules,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source_path: default_source_path(),
            output_dir: default_data_dir(),
            dataset_id: default_dataset_id(),
            shard_count: default_one(),
            seed: None,
            tokenizer: None,
            selftext_max_tokens: default_selftext_tokens(),
            filters: PairFilters::default(),
            validity: ValidityRules::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default = "default_top_p")]
    pub sampling_keep_top_p: f64,
    #[serde(default)]
    pub checkpoint_steps: Option<u64>,
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: String,
    #[serde(default = "default_false")]
    pub restore_paragraphs: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n: default_n(),
            sampling_keep_top_p: default_top_p(),
            checkpoint_steps: None,
            tmp_dir: default_tmp_dir(),
            restore_paragraphs: default_false(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeInput {
    pub path: String,
    pub n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub inputs: Vec<MergeInput>,
    #[serde(default = "default_one")]
    pub target_n: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            target_n: default_one(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardModelSection {
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub pretrained_dir: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_one")]
    pub ensemble_inputs: usize,
    #[serde(default = "default_inputs_length")]
    pub inputs_length: usize,
    #[serde(default = "default_targets_length")]
    pub targets_length: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_train_steps")]
    pub num_train_steps: u64,
    #[serde(default = "default_1000")]
    pub save_checkpoints_steps: u64,
    #[serde(default = "default_1000")]
    pub iterations_per_loop: u64,
    #[serde(default = "default_tokens_per_microbatch")]
    pub tokens_per_microbatch_per_replica: Option<usize>,
    #[serde(default = "default_dropout")]
    pub dropout_rate: f64,
    #[serde(default = "default_shuffle_buffer")]
    pub shuffle_buffer_size: usize,
    #[serde(default)]
    pub min_checkpoint_steps: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RewardModelSection {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            model_id: None,
            pretrained_dir: None,
            batch_size: default_batch_size(),
            ensemble_inputs: default_one(),
            inputs_length: default_inputs_length(),
            targets_length: default_targets_length(),
            learning_rate: default_learning_rate(),
            num_train_steps: default_train_steps(),
            save_checkpoints_steps: default_1000(),
            iterations_per_loop: default_1000(),
            tokens_per_microbatch_per_replica: default_tokens_per_microbatch(),
            dropout_rate: default_dropout(),
            shuffle_buffer_size: default_shuffle_buffer(),
            min_checkpoint_steps: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    Command,
    Python,
}

/// How the opaque model engine is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_backend")]
    pub backend: EngineBackend,
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_python_module")]
    pub python_module: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    /// Model dir the generation engine decodes from.
    #[serde(default)]
    pub model_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            program: default_program(),
            args: Vec::new(),
            python_module: default_python_module(),
            work_dir: default_work_dir(),
            model_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_info")]
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_info(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub reward_model: RewardModelSection,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Helper functions for defaults
fn default_false() -> bool { false }
fn default_one() -> usize { 1 }
fn default_n() -> usize { 5 }
fn default_1000() -> u64 { 1000 }
fn default_top_p() -> f64 { 0.94 }
fn default_selftext_tokens() -> usize { SELFTEXT_DESIRED_LEN }
fn default_batch_size() -> usize { 8 }
fn default_inputs_length() -> usize { 1280 }
fn default_targets_length() -> usize { 512 }
fn default_learning_rate() -> f64 { 0.001 }
fn default_train_steps() -> u64 { 10000 }
fn default_tokens_per_microbatch() -> Option<usize> { Some(1280 * 2) }
fn default_dropout() -> f64 { 0.1 }
fn default_shuffle_buffer() -> usize { DEFAULT_SHUFFLE_BUFFER }
fn default_source_path() -> String { "./data/questions.jsonl".to_string() }
fn default_data_dir() -> String { "./data/datasets".to_string() }
fn default_dataset_id() -> String { "reddit_pairs".to_string() }
fn default_tmp_dir() -> String { "./tmp".to_string() }
fn default_model_dir() -> String { "./checkpoints/reward".to_string() }
fn default_backend() -> EngineBackend { EngineBackend::Command }
fn default_program() -> String { "python3".to_string() }
fn default_python_module() -> String { "bon_engine".to_string() }
fn default_work_dir() -> String { "./tmp/engine".to_string() }
fn default_info() -> String { "info".to_string() }

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML config")
    }

    pub fn pair_builder(&self) -> PairBuilderConfig {
        PairBuilderConfig {
            dataset_id: self.data.dataset_id.clone(),
            output_dir: PathBuf::from(&self.data.output_dir),
            shard_count: self.data.shard_count,
            seed: self.data.seed,
            filters: self.data.filters,
            validity: self.data.validity.clone(),
            selftext_max_tokens: self.data.selftext_max_tokens,
        }
    }

    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            n: self.sampling.n,
            sampling_keep_top_p: self.sampling.sampling_keep_top_p,
            checkpoint_steps: self.sampling.checkpoint_steps,
            tmp_dir: PathBuf::from(&self.sampling.tmp_dir),
        }
    }

    pub fn select_options(&self) -> SelectOptions {
        SelectOptions {
            n: self.sampling.n,
            restore_paragraphs: self.sampling.restore_paragraphs,
        }
    }

    pub fn reward_model(&self) -> RewardModelConfig {
        let rm = &self.reward_model;
        RewardModelConfig {
            model_dir: PathBuf::from(&rm.model_dir),
            data_dir: PathBuf::from(&self.data.output_dir),
            model_id: rm.model_id.clone(),
            batch_size: rm.batch_size,
            ensemble_inputs: rm.ensemble_inputs,
            sequence_length: SequenceLength {
                inputs: rm.inputs_length,
                targets: rm.targets_length,
            },
            learning_rate: rm.learning_rate,
            save_checkpoints_steps: rm.save_checkpoints_steps,
            iterations_per_loop: rm.iterations_per_loop,
            tokens_per_microbatch_per_replica: rm.tokens_per_microbatch_per_replica,
            dropout_rate: rm.dropout_rate,
            shuffle_buffer_size: rm.shuffle_buffer_size,
            seed: rm.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = PipelineConfig::from_yaml("{}").unwrap();
        assert_eq!(config.data.shard_count, 1);
        assert_eq!(config.data.selftext_max_tokens, 1250);
        assert_eq!(config.data.validity.min_selftext_chars, 16);
        assert_eq!(config.sampling.sampling_keep_top_p, 0.94);
        assert_eq!(config.reward_model.tokens_per_microbatch_per_replica, Some(2560));
        assert_eq!(config.engine.backend, EngineBackend::Command);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.data.filters.max_time_diff.is_none());
    }

    #[test]
    fn nested_sections_flatten_into_component_configs() {
        let yaml = r#"
data:
  dataset_id: advice
  shard_count: 3
  seed: 11
  filters:
    max_len_ratio: 3.0
    min_score_ratio: 2.0
  validity:
    blacklisted_subreddits: [relationships]
sampling:
  n: 8
  restore_paragraphs: true
merge:
  target_n: 8
  inputs:
    - { path: gens_a.txt, n: 5 }
    - { path: gens_b.txt, n: 5 }
reward_model:
  batch_size: 4
  targets_length: 256
engine:
  backend: python
  python_module: t5_engine
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        let pairs = config.pair_builder();
        assert_eq!(pairs.dataset_id, "advice");
        assert_eq!(pairs.shard_count, 3);
        assert_eq!(pairs.seed, Some(11));
        assert_eq!(pairs.filters.max_len_ratio, Some(3.0));
        assert_eq!(pairs.validity.blacklisted_subreddits, vec!["relationships"]);

        assert_eq!(config.sampler().n, 8);
        assert!(config.select_options().restore_paragraphs);
        assert_eq!(config.merge.inputs[1], MergeInput { path: "gens_b.txt".into(), n: 5 });

        let rm = config.reward_model();
        assert_eq!(rm.batch_size, 4);
        assert_eq!(rm.sequence_length.targets, 256);
        assert_eq!(rm.data_dir, PathBuf::from("./data/datasets"));
        assert_eq!(config.engine.backend, EngineBackend::Python);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(PipelineConfig::load("/nonexistent/config.yaml").is_err());
    }
}
