use anyhow::{Context, Result};
use chrono::DateTime;
use std::fmt;

use crate::error::PipelineError;
use crate::models::{Question, TextTokenizer};
use crate::pairs::filters::AnswerPair;

pub const SELFTEXT_DESIRED_LEN: usize = 1250;
pub const TSV_COLNAMES: [&str; 3] = ["inputs", "targets1", "targets2"];

/// Paragraph separator used once text is flattened onto a single TSV line.
pub const PARAGRAPH_MARK: &str = " » ";

/// One training line: question context, lower scored body, higher scored body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceRecord {
    pub inputs: String,
    pub loser: String,
    pub winner: String,
}

impl PreferenceRecord {
    pub fn to_tsv_line(&self) -> String {
        [self.inputs.as_str(), self.loser.as_str(), self.winner.as_str()].join("\t")
    }

    /// Parses a TSV line; anything but exactly three fields is malformed.
    pub fn from_tsv_line(line: &str, source_name: &str, line_num: usize) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != TSV_COLNAMES.len() {
            return Err(PipelineError::malformed(
                source_name,
                line_num,
                format!("expected {} tab-separated fields, found {}", TSV_COLNAMES.len(), fields.len()),
            )
            .into());
        }
        Ok(Self {
            inputs: fields[0].to_string(),
            loser: fields[1].to_string(),
            winner: fields[2].to_string(),
        })
    }
}

impl fmt::Display for PreferenceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_tsv_line())
    }
}

/// Cleans Reddit text so it fits on one TSV line: entities unescaped,
/// paragraphs joined with `PARAGRAPH_MARK`, all other whitespace collapsed.
pub fn fix_reddit_text(text: &str) -> String {
    // &amp; last so "&amp;lt;" stays "&lt;"
    let unescaped = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in unescaped.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.extend(line.split_whitespace());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }
    paragraphs.join(PARAGRAPH_MARK)
}

/// `January 5, 2019` style date for a UTC timestamp in seconds.
pub fn format_date(created_utc: f64) -> Option<String> {
    let dt = DateTime::from_timestamp(created_utc.floor() as i64, 0)?;
    Some(dt.format("%B %-d, %Y").to_string())
}

/// Builds preference records for one dataset, owning the token budget for
/// the question selftext.
pub struct RecordFormatter<'t> {
    tokenizer: &'t dyn TextTokenizer,
    selftext_max_tokens: usize,
}

impl<'t> RecordFormatter<'t> {
    pub fn new(tokenizer: &'t dyn TextTokenizer, selftext_max_tokens: usize) -> Self {
        Self {
            tokenizer,
            selftext_max_tokens,
        }
    }

    /// The model input for a question. Returns `None` when the question lacks
    /// a renderable timestamp.
    pub fn inputs(&self, question: &Question) -> Result<Option<String>> {
        let Some(date) = question.created_utc.and_then(format_date) else {
            return Ok(None);
        };
        let selftext = self
            .tokenizer
            .truncate(question.selftext.as_deref().unwrap_or_default(), self.selftext_max_tokens)
            .context("Failed to truncate selftext")?;
        Ok(Some(format!(
            "Subreddit: {} Date: {} Title: {} Selftext: {}",
            fix_reddit_text(question.subreddit.as_deref().unwrap_or_default()),
            fix_reddit_text(&date),
            fix_reddit_text(question.title.as_deref().unwrap_or_default()),
            fix_reddit_text(&selftext),
        )))
    }

    pub fn record(inputs: &str, pair: &AnswerPair<'_>) -> PreferenceRecord {
        PreferenceRecord {
            inputs: inputs.to_string(),
            loser: fix_reddit_text(pair.loser.body_text()),
            winner: fix_reddit_text(pair.winner.body_text()),
        }
    }
}
