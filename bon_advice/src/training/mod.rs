pub mod checkpoints;
pub mod data;
pub mod metrics;
pub mod reward_model;

pub use metrics::PipelineMetrics;
pub use reward_model::{CheckpointMetrics, ComparativeRewardModel, RewardModelConfig, TrainingParams};
