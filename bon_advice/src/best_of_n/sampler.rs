use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use crate::error::PipelineError;
use crate::models::{GenerationEngine, PredictOptions};
use crate::utils;

const REPEATS_FILE: &str = "BoN-repeats.txt";
const RAW_OUTPUT_FILE: &str = "BoN-generations.txt";

/// A flat generation sequence read as consecutive blocks of `n`: line
/// `block * n + replicate` belongs to input `block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generations {
    n: usize,
    lines: Vec<String>,
}

impl Generations {
    pub fn new(lines: Vec<String>, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(PipelineError::Config("N must be at least 1".to_string()).into());
        }
        if lines.len() % n != 0 {
            let expected = lines.len().div_ceil(n) * n;
            return Err(PipelineError::correspondence("generation blocks", expected, lines.len()).into());
        }
        Ok(Self { n, lines })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn num_blocks(&self) -> usize {
        self.lines.len() / self.n
    }

    pub fn block(&self, index: usize) -> Option<&[String]> {
        self.lines.get(index * self.n..(index + 1) * self.n)
    }

    pub fn blocks(&self) -> std::slice::Chunks<'_, String> {
        self.lines.chunks(self.n)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// `inputs[0]` n times, then `inputs[1]` n times, and so on.
pub fn expand_inputs(inputs: &[String], n: usize) -> Vec<String> {
    inputs
        .iter()
        .flat_map(|line| std::iter::repeat(line.clone()).take(n))
        .collect()
}

/// Runs `generate` once over the n-fold expanded inputs. `generate` must
/// return exactly one output per request, in order; any other count is a
/// correspondence error and nothing is returned.
pub fn generate_n<F>(inputs: &[String], n: usize, generate: F) -> Result<Generations>
where
    F: FnOnce(&[String]) -> Result<Vec<String>>,
{
    if n == 0 {
        return Err(PipelineError::Config("N must be at least 1".to_string()).into());
    }
    let requests = expand_inputs(inputs, n);
    let outputs = generate(&requests)?;
    if outputs.len() != requests.len() {
        return Err(PipelineError::correspondence("generations vs repeated inputs", requests.len(), outputs.len()).into());
    }
    Generations::new(outputs, n)
}

/// Joins each generation with the input it answers, one
/// `inputs<TAB>generation` line per generation, for the reward model's
/// scoring pass. Only the first tab field of an input line is kept.
pub fn pair_with_inputs(inputs: &[String], generations: &Generations) -> Result<Vec<String>> {
    if inputs.len() != generations.num_blocks() {
        return Err(PipelineError::correspondence("inputs vs generation blocks", inputs.len(), generations.num_blocks()).into());
    }
    let mut lines = Vec::with_capacity(generations.lines().len());
    for (input, block) in inputs.iter().zip(generations.blocks()) {
        let context = input.split('\t').next().unwrap_or_default();
        for generation in block {
            lines.push(format!("{}\t{}", context, generation));
        }
    }
    Ok(lines)
}

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub n: usize,
    pub sampling_keep_top_p: f64,
    pub checkpoint_steps: Option<u64>,
    pub tmp_dir: PathBuf,
}

/// File-level best-of-N sampling against the opaque generation engine.
pub struct BestOfNGenerator<'e> {
    engine: &'e dyn GenerationEngine,
    config: SamplerConfig,
}

impl<'e> BestOfNGenerator<'e> {
    pub fn new(engine: &'e dyn GenerationEngine, config: SamplerConfig) -> Self {
        Self { engine, config }
    }

    pub fn generate(&self, inputs: &[String]) -> Result<Generations> {
        std::fs::create_dir_all(&self.config.tmp_dir)
            .with_context(|| format!("Failed to create tmp dir: {:?}", self.config.tmp_dir))?;
        let repeats_path = self.config.tmp_dir.join(REPEATS_FILE);
        let raw_path = self.config.tmp_dir.join(RAW_OUTPUT_FILE);
        let options = PredictOptions {
            checkpoint_steps: self.config.checkpoint_steps,
            sampling_keep_top_p: self.config.sampling_keep_top_p,
        };

        generate_n(inputs, self.config.n, |requests| {
            utils::write_lines(&repeats_path, requests)?;
            self.engine.predict(&repeats_path, &raw_path, &options)?;
            utils::read_lines(&raw_path)
        })
    }

    /// Reads one input per line and writes N generations per input. The
    /// output file is only written once the counts have been verified.
    pub fn generate_file(&self, inputs_path: &Path, outputs_path: &Path) -> Result<Generations> {
        let inputs = utils::read_lines(inputs_path)?;
        info!("Generating {} x {} samples from {:?}", inputs.len(), self.config.n, inputs_path);
        let start = Instant::now();
        let generations = self.generate(&inputs)?;
        utils::write_lines(outputs_path, generations.lines())?;
        info!(
            "Wrote {} generations to {:?} in {:.1}s",
            generations.lines().len(),
            outputs_path,
            start.elapsed().as_secs_f64()
        );
        Ok(generations)
    }
}
