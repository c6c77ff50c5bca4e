use anyhow::{Context, Result};
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::best_of_n::sampler::Generations;
use crate::error::PipelineError;
use crate::pairs::record::PARAGRAPH_MARK;
use crate::utils;

#[derive(Debug, Clone, Copy)]
pub struct SelectOptions {
    pub n: usize,
    /// Turn paragraph marks back into blank lines in the selected text.
    pub restore_paragraphs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectReport {
    pub blocks: usize,
    /// Lines in a trailing block shorter than N, left unselected.
    pub dropped_partial: usize,
}

/// Index of the maximum score; ties go to the lowest index.
pub fn argmax_first(scores: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i)
}

/// Parses one score line. NaN is refused since it has no place in an ordering.
pub fn parse_score(line: &str, source_name: &str, line_num: usize) -> Result<f64> {
    let score: f64 = line
        .trim()
        .parse()
        .map_err(|e| PipelineError::malformed(source_name, line_num, format!("bad score {:?}: {}", line, e)))?;
    if score.is_nan() {
        return Err(PipelineError::malformed(source_name, line_num, "score is NaN").into());
    }
    Ok(score)
}

/// Splits on the paragraph mark only where whitespace surrounds it, so a
/// `»` inside a word or quote stays put.
pub fn restore_paragraphs(text: &str) -> String {
    let mark = PARAGRAPH_MARK.trim();
    let mut paragraphs = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let next = chars.peek().map(|&(_, c)| c);
        if text[i..].starts_with(mark)
            && prev.is_some_and(char::is_whitespace)
            && next.is_some_and(char::is_whitespace)
        {
            paragraphs.push(text[start..i].trim());
            start = i + c.len_utf8();
        }
        prev = Some(c);
    }
    paragraphs.push(text[start..].trim());
    paragraphs.join("\n\n").trim().to_string()
}

fn emit<W: Write>(out: &mut W, text: &str, options: &SelectOptions) -> Result<()> {
    if options.restore_paragraphs {
        writeln!(out, "{}", restore_paragraphs(text))?;
    } else {
        writeln!(out, "{}", text)?;
    }
    Ok(())
}

/// Streams generations and scores side by side, N lines at a time, writing
/// the best generation of each full block. The two streams must have the
/// same length; on a mismatch both are read to the end so the error reports
/// the real totals.
pub fn select_best<G, S, W>(
    mut generations: G,
    mut scores: S,
    scores_name: &str,
    options: &SelectOptions,
    out: &mut W,
) -> Result<SelectReport>
where
    G: BufRead,
    S: BufRead,
    W: Write,
{
    if options.n == 0 {
        return Err(PipelineError::Config("N must be at least 1".to_string()).into());
    }

    let mut report = SelectReport::default();
    let mut block_text: Vec<String> = Vec::with_capacity(options.n);
    let mut block_scores: Vec<f64> = Vec::with_capacity(options.n);
    let mut line_num = 0;

    loop {
        let generation = utils::next_line(&mut generations)?;
        let score = utils::next_line(&mut scores)?;
        match (generation, score) {
            (Some(text), Some(score)) => {
                line_num += 1;
                block_scores.push(parse_score(&score, scores_name, line_num)?);
                block_text.push(text);
            }
            (None, None) => break,
            (generation, score) => {
                let mut n_generations = line_num + usize::from(generation.is_some());
                let mut n_scores = line_num + usize::from(score.is_some());
                while utils::next_line(&mut generations)?.is_some() {
                    n_generations += 1;
                }
                while utils::next_line(&mut scores)?.is_some() {
                    n_scores += 1;
                }
                return Err(PipelineError::correspondence("scores vs generations", n_generations, n_scores).into());
            }
        }

        if block_text.len() == options.n {
            if let Some(best) = argmax_first(&block_scores) {
                emit(out, &block_text[best], options)?;
            }
            report.blocks += 1;
            block_text.clear();
            block_scores.clear();
        }
    }

    if !block_text.is_empty() {
        warn!(
            "Trailing block has {} of {} lines; not selecting from it",
            block_text.len(),
            options.n
        );
        report.dropped_partial = block_text.len();
    }
    out.flush()?;
    Ok(report)
}

/// Best generation per block for already-loaded data.
pub fn select_best_in_memory(generations: &Generations, scores: &[f64]) -> Result<Vec<String>> {
    if scores.len() != generations.lines().len() {
        return Err(PipelineError::correspondence("scores vs generations", generations.lines().len(), scores.len()).into());
    }
    Ok(generations
        .blocks()
        .zip(scores.chunks(generations.n()))
        .filter_map(|(block, block_scores)| argmax_first(block_scores).map(|i| block[i].clone()))
        .collect())
}

fn partial_output_path(output_path: &Path) -> PathBuf {
    let mut name = output_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    output_path.with_file_name(name)
}

pub fn select_files(
    generations_path: &Path,
    scores_path: &Path,
    output_path: &Path,
    options: &SelectOptions,
) -> Result<SelectReport> {
    let generations = utils::open_reader(generations_path)?;
    let scores = utils::open_reader(scores_path)?;
    // Selected lines go to a sibling file that only becomes the output once
    // both streams have been checked end to end.
    let partial_path = partial_output_path(output_path);
    let selected = utils::create_writer(&partial_path).and_then(|mut writer| {
        select_best(
            generations,
            scores,
            &scores_path.display().to_string(),
            options,
            &mut writer,
        )
    });
    let report = match selected {
        Ok(report) => report,
        Err(e) => {
            if let Err(rm) = fs::remove_file(&partial_path) {
                warn!("Could not remove {:?}: {}", partial_path, rm);
            }
            return Err(e);
        }
    };
    fs::rename(&partial_path, output_path)
        .with_context(|| format!("Failed to move {:?} to {:?}", partial_path, output_path))?;
    info!("Selected {} of N={} into {:?}", report.blocks, options.n, output_path);
    Ok(report)
}
