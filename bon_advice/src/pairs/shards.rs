use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::PipelineError;
use crate::models::Split;
use crate::pairs::filters::PairFilters;
use crate::pairs::record::PreferenceRecord;
use crate::utils;

pub const METADATA_FILE: &str = "metadata.json";

/// Per-shard metadata written next to the split files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub dataset_id: String,
    pub shard_count: usize,
    pub source_path: String,
    pub max_time_diff: Option<f64>,
    pub max_len_ratio: Option<f64>,
    pub min_score_ratio: Option<f64>,
    pub n_questions: u64,
    pub n_ans_pairs: u64,
    pub n_rejected_pairs: u64,
    pub n_invalid_questions: u64,
    pub seed: Option<u64>,
    pub created_at: String,
}

pub fn split_file_name(split: Split) -> String {
    format!("{}.tsv", split)
}

/// Directory names for a dataset: the bare id for a single shard, `id_k`
/// otherwise.
pub fn shard_ids(dataset_id: &str, shard_count: usize) -> Vec<String> {
    if shard_count == 1 {
        vec![dataset_id.to_string()]
    } else {
        (0..shard_count).map(|k| format!("{}_{}", dataset_id, k)).collect()
    }
}

pub struct Shard {
    pub id: String,
    pub dir: PathBuf,
    writers: BTreeMap<Split, BufWriter<File>>,
    pub n_questions: u64,
    pub n_ans_pairs: u64,
    pub n_rejected_pairs: u64,
}

impl Shard {
    pub fn write(&mut self, split: Split, record: &PreferenceRecord) -> Result<()> {
        let writer = self
            .writers
            .get_mut(&split)
            .with_context(|| format!("No {} writer for shard {}", split, self.id))?;
        writeln!(writer, "{}", record.to_tsv_line())
            .with_context(|| format!("Failed to write {} record for shard {}", split, self.id))?;
        self.n_ans_pairs += 1;
        Ok(())
    }
}

/// The set of independent output datasets for one build.
pub struct ShardSet {
    shards: Vec<Shard>,
    rng: StdRng,
}

impl ShardSet {
    /// Creates every shard directory and its split files. Fails before
    /// creating anything if any shard directory already exists.
    pub fn create(output_dir: &Path, dataset_id: &str, shard_count: usize, seed: Option<u64>) -> Result<Self> {
        if shard_count == 0 {
            return Err(PipelineError::Config("shard_count must be at least 1".to_string()).into());
        }
        let ids = shard_ids(dataset_id, shard_count);
        let dirs: Vec<PathBuf> = ids.iter().map(|id| output_dir.join(id)).collect();
        if let Some(existing) = dirs.iter().find(|d| d.exists()) {
            return Err(PipelineError::AlreadyExists(existing.clone()).into());
        }

        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

        let mut shards = Vec::with_capacity(shard_count);
        for (id, dir) in ids.into_iter().zip(dirs) {
            match std::fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(PipelineError::AlreadyExists(dir).into());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create shard directory: {:?}", dir));
                }
            }
            let mut writers = BTreeMap::new();
            for split in Split::ALL {
                writers.insert(split, utils::create_writer(dir.join(split_file_name(split)))?);
            }
            shards.push(Shard {
                id,
                dir,
                writers,
                n_questions: 0,
                n_ans_pairs: 0,
                n_rejected_pairs: 0,
            });
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!("Created {} shard(s) under {:?}", shards.len(), output_dir);
        Ok(Self { shards, rng })
    }

    /// Draws the shard for the next question, uniformly at random.
    pub fn assign(&mut self) -> usize {
        if self.shards.len() == 1 {
            0
        } else {
            self.rng.gen_range(0..self.shards.len())
        }
    }

    pub fn shard_mut(&mut self, index: usize) -> &mut Shard {
        &mut self.shards[index]
    }

    /// Flushes every split file and writes each shard's metadata.
    pub fn finish(
        self,
        source_path: &str,
        filters: &PairFilters,
        seed: Option<u64>,
        n_invalid_questions: u64,
    ) -> Result<Vec<ShardMetadata>> {
        let shard_count = self.shards.len();
        let created_at = chrono::Utc::now().to_rfc3339();
        let mut metadata = Vec::with_capacity(shard_count);
        for mut shard in self.shards {
            for (split, writer) in shard.writers.iter_mut() {
                writer
                    .flush()
                    .with_context(|| format!("Failed to flush {} split of shard {}", split, shard.id))?;
            }
            let meta = ShardMetadata {
                dataset_id: shard.id.clone(),
                shard_count,
                source_path: source_path.to_string(),
                max_time_diff: filters.max_time_diff,
                max_len_ratio: filters.max_len_ratio,
                min_score_ratio: filters.min_score_ratio,
                n_questions: shard.n_questions,
                n_ans_pairs: shard.n_ans_pairs,
                n_rejected_pairs: shard.n_rejected_pairs,
                n_invalid_questions,
                seed,
                created_at: created_at.clone(),
            };
            let path = shard.dir.join(METADATA_FILE);
            std::fs::write(&path, serde_json::to_string_pretty(&meta)?)
                .with_context(|| format!("Failed to write shard metadata: {:?}", path))?;
            info!(
                "Shard {}: {} questions, {} answer pairs",
                meta.dataset_id, meta.n_questions, meta.n_ans_pairs
            );
            metadata.push(meta);
        }
        Ok(metadata)
    }
}

pub fn load_metadata(shard_dir: &Path) -> Result<ShardMetadata> {
    let path = shard_dir.join(METADATA_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read shard metadata: {:?}", path))?;
    serde_json::from_str(&content).context("Failed to parse shard metadata")
}
