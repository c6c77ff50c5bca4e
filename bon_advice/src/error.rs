use std::path::PathBuf;
use thiserror::Error;

/// Fatal pipeline errors. Validity rejections are never represented here:
/// they are counted and skipped where they occur.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Two positionally paired streams disagree on their length.
    #[error("positional correspondence broken ({what}): expected {expected} lines, found {found}")]
    Correspondence {
        what: String,
        expected: usize,
        found: usize,
    },

    /// An output location from a previous run is in the way.
    #[error("output location already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// A source line could not be parsed into its structured form.
    #[error("malformed record in {source_name} at line {line}: {reason}")]
    MalformedRecord {
        source_name: String,
        line: usize,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn correspondence(what: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::Correspondence {
            what: what.into(),
            expected,
            found,
        }
    }

    pub fn malformed(source_name: impl Into<String>, line: usize, reason: impl ToString) -> Self {
        Self::MalformedRecord {
            source_name: source_name.into(),
            line,
            reason: reason.to_string(),
        }
    }
}
