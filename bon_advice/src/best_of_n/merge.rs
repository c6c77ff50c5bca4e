use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::utils;

/// One generation file holding `n` consecutive generations per question.
pub struct MergeSource<R> {
    pub name: String,
    pub reader: R,
    pub n: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Questions written, each with exactly `target_n` generations.
    pub questions: usize,
    pub lines: usize,
    /// Index of the first question that could not be filled.
    pub exhausted_at: Option<usize>,
    /// Generations that question did have; zero when every source ran dry.
    pub shortfall: usize,
}

fn read_group<R: BufRead>(source: &mut MergeSource<R>) -> Result<Vec<String>> {
    let mut group = Vec::with_capacity(source.n);
    for _ in 0..source.n {
        match utils::next_line(&mut source.reader)
            .with_context(|| format!("Failed to read from {}", source.name))?
        {
            Some(line) => group.push(line),
            None => break,
        }
    }
    Ok(group)
}

/// Pools per-question generation groups from several sources into groups of
/// exactly `target_n`, filling from sources in order. Every source's group is
/// read for every question, used or not, so the sources stay aligned.
/// Merging stops at the first question that cannot be filled; nothing of
/// that question is written.
pub fn merge_generations<R: BufRead, W: Write>(
    mut sources: Vec<MergeSource<R>>,
    target_n: usize,
    out: &mut W,
) -> Result<MergeReport> {
    if target_n == 0 {
        return Err(PipelineError::Config("target N must be at least 1".to_string()).into());
    }
    let available: usize = sources.iter().map(|s| s.n).sum();
    if available < target_n {
        return Err(PipelineError::Config(format!(
            "sources provide {} generations per question, fewer than N = {}",
            available, target_n
        ))
        .into());
    }

    let mut report = MergeReport::default();
    loop {
        let mut groups = Vec::with_capacity(sources.len());
        for source in sources.iter_mut() {
            groups.push(read_group(source)?);
        }

        let mut selected: Vec<String> = Vec::with_capacity(target_n);
        for group in groups {
            if group.is_empty() {
                continue;
            }
            let take = (target_n - selected.len()).min(group.len());
            selected.extend(group.into_iter().take(take));
            if selected.len() >= target_n {
                break;
            }
        }

        if selected.len() < target_n {
            if selected.is_empty() {
                info!("All sources exhausted after {} questions", report.questions);
            } else {
                warn!(
                    "Question {} has only {} of {} generations; stopping merge",
                    report.questions,
                    selected.len(),
                    target_n
                );
            }
            report.exhausted_at = Some(report.questions);
            report.shortfall = selected.len();
            break;
        }

        for line in &selected {
            writeln!(out, "{}", line)?;
        }
        report.questions += 1;
        report.lines += selected.len();
    }
    out.flush()?;
    Ok(report)
}

/// File wrapper over [`merge_generations`].
pub fn merge_files(inputs: &[(PathBuf, usize)], target_n: usize, output: &Path) -> Result<MergeReport> {
    let mut sources = Vec::with_capacity(inputs.len());
    for (path, n) in inputs {
        sources.push(MergeSource {
            name: path.display().to_string(),
            reader: utils::open_reader(path)?,
            n: *n,
        });
    }
    let mut writer = utils::create_writer(output)?;
    let report = merge_generations(sources, target_n, &mut writer)?;
    info!(
        "Merged {} questions ({} generations) into {:?}",
        report.questions, report.lines, output
    );
    Ok(report)
}
