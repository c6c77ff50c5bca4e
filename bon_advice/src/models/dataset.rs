use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::str::FromStr;

use crate::error::PipelineError;
use crate::utils;

const REMOVED_MARKERS: [&str; 2] = ["[deleted]", "[removed]"];

/// One candidate answer to a question. Every field is optional at parse
/// time; missing values make the answer invalid, not the line malformed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Answer {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub created_utc: Option<f64>,
}

impl Answer {
    pub fn is_valid(&self) -> bool {
        let body_ok = self
            .body
            .as_deref()
            .map(|b| !b.trim().is_empty() && !is_removed(b))
            .unwrap_or(false);
        body_ok && self.score.is_some()
    }

    pub fn body_text(&self) -> &str {
        self.body.as_deref().unwrap_or_default()
    }

    pub fn score_value(&self) -> i64 {
        self.score.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subreddit: Option<String>,
    #[serde(default)]
    pub created_utc: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub selftext: Option<String>,
    #[serde(default)]
    pub split: Option<String>,
    #[serde(default)]
    pub good_comments: Vec<Answer>,
}

impl Question {
    pub fn is_valid(&self, rules: &ValidityRules) -> bool {
        let required = [&self.id, &self.subreddit, &self.title, &self.selftext, &self.split];
        if required
            .iter()
            .any(|field| field.as_deref().map(|v| v.trim().is_empty()).unwrap_or(true))
        {
            return false;
        }
        if self.created_utc.is_none() || self.parsed_split().is_none() {
            return false;
        }

        let subreddit = self.subreddit.as_deref().unwrap_or_default();
        if rules
            .blacklisted_subreddits
            .iter()
            .any(|s| s.eq_ignore_ascii_case(subreddit))
        {
            return false;
        }

        let selftext = self.selftext.as_deref().unwrap_or_default();
        let len = selftext.chars().count();
        !is_removed(selftext) && len >= rules.min_selftext_chars && len <= rules.max_selftext_chars
    }

    pub fn parsed_split(&self) -> Option<Split> {
        self.split.as_deref().and_then(|s| s.parse().ok())
    }
}

fn is_removed(text: &str) -> bool {
    REMOVED_MARKERS.contains(&text.trim())
}

/// Domain validity thresholds for questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidityRules {
    #[serde(default)]
    pub blacklisted_subreddits: Vec<String>,
    #[serde(default = "default_min_selftext_chars")]
    pub min_selftext_chars: usize,
    #[serde(default = "default_max_selftext_chars")]
    pub max_selftext_chars: usize,
}

fn default_min_selftext_chars() -> usize { 16 }
fn default_max_selftext_chars() -> usize { 40_000 }

impl Default for ValidityRules {
    fn default() -> Self {
        Self {
            blacklisted_subreddits: Vec::new(),
            min_selftext_chars: default_min_selftext_chars(),
            max_selftext_chars: default_max_selftext_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => anyhow::bail!("Unknown split: {}", other),
        }
    }
}

/// Streams questions from a line-delimited JSON source. Blank lines are
/// skipped; a line that is not a JSON question stops the stream with a
/// `MalformedRecord` error.
pub struct QuestionReader<R> {
    reader: R,
    source_name: String,
    line_num: usize,
}

impl QuestionReader<std::io::BufReader<std::fs::File>> {
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let reader = utils::open_reader(&file_path)
            .with_context(|| format!("Failed to open dataset file: {:?}", file_path.as_ref()))?;
        Ok(Self::new(reader, file_path.as_ref().display().to_string()))
    }
}

impl<R: BufRead> QuestionReader<R> {
    pub fn new(reader: R, source_name: impl Into<String>) -> Self {
        Self {
            reader,
            source_name: source_name.into(),
            line_num: 0,
        }
    }
}

impl<R: BufRead> Iterator for QuestionReader<R> {
    type Item = Result<Question>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match utils::next_line(&mut self.reader) {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
            self.line_num += 1;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<Question>(&line).map_err(|e| {
                anyhow::Error::from(PipelineError::malformed(self.source_name.clone(), self.line_num, e))
            });
            return Some(parsed);
        }
    }
}
