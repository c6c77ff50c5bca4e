use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::Path;

use crate::error::PipelineError;
use crate::pairs::PreferenceRecord;
use crate::utils;

pub const DEFAULT_SHUFFLE_BUFFER: usize = 1000;

/// A preference record as the comparative head consumes it: the loser and
/// winner stacked into a single two-element target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackedPair {
    pub inputs: String,
    /// `[loser, winner]`
    pub targets: [String; 2],
}

impl From<PreferenceRecord> for StackedPair {
    fn from(record: PreferenceRecord) -> Self {
        Self {
            inputs: record.inputs,
            targets: [record.loser, record.winner],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairBatch {
    pub examples: Vec<StackedPair>,
}

/// One `inputs<TAB>targets` line to be scored by the reward model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoringExample {
    pub inputs: String,
    pub targets: String,
}

pub fn load_pairs(path: &Path) -> Result<Vec<StackedPair>> {
    let name = path.display().to_string();
    utils::read_lines(path)?
        .iter()
        .enumerate()
        .map(|(i, line)| PreferenceRecord::from_tsv_line(line, &name, i + 1).map(StackedPair::from))
        .collect()
}

pub fn load_scoring_examples(path: &Path) -> Result<Vec<ScoringExample>> {
    let name = path.display().to_string();
    let mut examples = Vec::new();
    for (i, line) in utils::read_lines(path)?.into_iter().enumerate() {
        let mut fields = line.split('\t');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(inputs), Some(targets), None) => examples.push(ScoringExample {
                inputs: inputs.to_string(),
                targets: targets.to_string(),
            }),
            _ => {
                return Err(PipelineError::malformed(&name, i + 1, "expected inputs<TAB>targets").into());
            }
        }
    }
    Ok(examples)
}

/// Endless training stream: the dataset repeated, passed through a bounded
/// shuffle buffer, grouped into fixed-size batches. Partial batches never
/// occur since the stream does not end.
pub struct TrainingBatches {
    pairs: Vec<StackedPair>,
    cursor: usize,
    buffer: Vec<StackedPair>,
    buffer_size: usize,
    batch_size: usize,
    rng: StdRng,
}

impl TrainingBatches {
    pub fn new(pairs: Vec<StackedPair>, batch_size: usize, buffer_size: usize, seed: Option<u64>) -> Result<Self> {
        if batch_size == 0 {
            return Err(PipelineError::Config("batch size must be at least 1".to_string()).into());
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            pairs,
            cursor: 0,
            buffer: Vec::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            batch_size,
            rng,
        })
    }

    fn next_repeated(&mut self) -> Option<StackedPair> {
        if self.pairs.is_empty() {
            return None;
        }
        let pair = self.pairs[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.pairs.len();
        Some(pair)
    }

    fn next_shuffled(&mut self) -> Option<StackedPair> {
        while self.buffer.len() < self.buffer_size {
            match self.next_repeated() {
                Some(pair) => self.buffer.push(pair),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(index))
    }
}

impl Iterator for TrainingBatches {
    type Item = PairBatch;

    fn next(&mut self) -> Option<PairBatch> {
        let mut examples = Vec::with_capacity(self.batch_size);
        while examples.len() < self.batch_size {
            examples.push(self.next_shuffled()?);
        }
        Some(PairBatch { examples })
    }
}

/// Evaluation batches in file order; the trailing partial batch is dropped.
pub fn eval_batches(pairs: &[StackedPair], batch_size: usize) -> Result<Vec<PairBatch>> {
    if batch_size == 0 {
        return Err(PipelineError::Config("batch size must be at least 1".to_string()).into());
    }
    Ok(pairs
        .chunks_exact(batch_size)
        .map(|chunk| PairBatch {
            examples: chunk.to_vec(),
        })
        .collect())
}
