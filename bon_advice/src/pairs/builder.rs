use anyhow::Result;
use std::io::BufRead;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::models::{Question, QuestionReader, TextTokenizer, ValidityRules};
use crate::pairs::filters::{AnswerPair, PairFilters};
use crate::pairs::record::{PreferenceRecord, RecordFormatter};
use crate::pairs::shards::{ShardMetadata, ShardSet};
use crate::utils;

#[derive(Debug, Clone)]
pub struct PairBuilderConfig {
    pub dataset_id: String,
    pub output_dir: PathBuf,
    pub shard_count: usize,
    pub seed: Option<u64>,
    pub filters: PairFilters,
    pub validity: ValidityRules,
    pub selftext_max_tokens: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub n_questions_read: u64,
    pub n_invalid_questions: u64,
    pub n_ans_pairs: u64,
    pub n_rejected_pairs: u64,
    pub shards: Vec<ShardMetadata>,
}

/// Records for one question plus how many candidate pairs were considered.
#[derive(Debug, Clone, Default)]
pub struct QuestionPairs {
    pub records: Vec<PreferenceRecord>,
    pub considered: u64,
}

impl QuestionPairs {
    pub fn rejected(&self) -> u64 {
        self.considered - self.records.len() as u64
    }
}

pub struct PreferencePairBuilder<'t> {
    config: PairBuilderConfig,
    formatter: RecordFormatter<'t>,
}

impl<'t> PreferencePairBuilder<'t> {
    pub fn new(config: PairBuilderConfig, tokenizer: &'t dyn TextTokenizer) -> Self {
        let formatter = RecordFormatter::new(tokenizer, config.selftext_max_tokens);
        Self { config, formatter }
    }

    /// Every unordered pair `i < j` of the question's answers is considered;
    /// a pair becomes a record when both answers are valid, their scores
    /// differ and all active filters pass. The question must already be valid.
    pub fn pairs_for_question(&self, question: &Question) -> Result<QuestionPairs> {
        let answers = &question.good_comments;
        let n = answers.len() as u64;
        let mut result = QuestionPairs {
            records: Vec::new(),
            considered: n * n.saturating_sub(1) / 2,
        };

        let Some(inputs) = self.formatter.inputs(question)? else {
            return Ok(result);
        };

        for (i, first) in answers.iter().enumerate() {
            if !first.is_valid() {
                continue;
            }
            for second in &answers[i + 1..] {
                if !second.is_valid() {
                    continue;
                }
                let Some(pair) = AnswerPair::orient(first, second) else {
                    continue;
                };
                if self.config.filters.accepts(&pair) {
                    result.records.push(RecordFormatter::record(&inputs, &pair));
                }
            }
        }
        Ok(result)
    }

    /// Scans the source once, writing each passing pair to the shard drawn
    /// for its question and the split the question names. A malformed source
    /// line aborts the build.
    pub fn build<R: BufRead>(&self, source: QuestionReader<R>, source_path: &str) -> Result<BuildStats> {
        let mut shards = ShardSet::create(
            &self.config.output_dir,
            &self.config.dataset_id,
            self.config.shard_count,
            self.config.seed,
        )?;
        let mut stats = BuildStats::default();

        let pb = utils::progress_spinner()?;
        pb.set_message("questions");
        for question in source {
            let question = question?;
            stats.n_questions_read += 1;
            pb.inc(1);

            let split = match question.parsed_split() {
                Some(split) if question.is_valid(&self.config.validity) => split,
                _ => {
                    stats.n_invalid_questions += 1;
                    debug!("Skipping invalid question {:?}", question.id);
                    continue;
                }
            };

            let shard_idx = shards.assign();
            let pairs = self.pairs_for_question(&question)?;
            let shard = shards.shard_mut(shard_idx);
            shard.n_questions += 1;
            shard.n_rejected_pairs += pairs.rejected();
            stats.n_rejected_pairs += pairs.rejected();
            for record in &pairs.records {
                shard.write(split, record)?;
            }
            stats.n_ans_pairs += pairs.records.len() as u64;
        }
        pb.finish();

        info!(
            "Read {} questions ({} invalid), wrote {} answer pairs ({} rejected)",
            stats.n_questions_read, stats.n_invalid_questions, stats.n_ans_pairs, stats.n_rejected_pairs
        );
        stats.shards = shards.finish(
            source_path,
            &self.config.filters,
            self.config.seed,
            stats.n_invalid_questions,
        )?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::models::tokenizer::WhitespaceTokenizer;
    use crate::models::Split;
    use crate::pairs::shards::{load_metadata, split_file_name};
    use serde_json::json;
    use std::io::Cursor;
    use std::path::Path;

    fn question_json(id: &str, split: &str, scores: &[i64]) -> String {
        let comments: Vec<_> = scores
            .iter()
            .enumerate()
            .map(|(k, s)| json!({"id": format!("{id}-a{k}"), "body": format!("answer {k} to {id}"), "score": s, "created_utc": 1_546_646_400 + k as i64 * 60}))
            .collect();
        json!({
            "id": id,
            "subreddit": "Advice",
            "created_utc": 1_546_646_400,
            "title": format!("Question {id}"),
            "selftext": "A long enough description of my situation.",
            "split": split,
            "good_comments": comments,
        })
        .to_string()
    }

    fn config(output_dir: &Path, shard_count: usize) -> PairBuilderConfig {
        PairBuilderConfig {
            dataset_id: "rm".to_string(),
            output_dir: output_dir.to_path_buf(),
            shard_count,
            seed: Some(3),
            filters: PairFilters::default(),
            validity: ValidityRules::default(),
            selftext_max_tokens: 1250,
        }
    }

    fn count_lines(path: &Path) -> usize {
        utils::read_lines(path).unwrap().len()
    }

    #[test]
    fn pairs_are_oriented_and_equal_scores_dropped() {
        let tok = WhitespaceTokenizer;
        let dir = tempfile::tempdir().unwrap();
        let builder = PreferencePairBuilder::new(config(dir.path(), 1), &tok);
        let question: Question = serde_json::from_str(&question_json("q", "train", &[5, 1, 5])).unwrap();
        let pairs = builder.pairs_for_question(&question).unwrap();
        assert_eq!(pairs.considered, 3);
        assert_eq!(pairs.records.len(), 2);
        assert_eq!(pairs.rejected(), 1);
        for record in &pairs.records {
            assert_eq!(record.loser, "answer 1 to q");
        }
    }

    #[test]
    fn single_shard_build_routes_by_split() {
        let tok = WhitespaceTokenizer;
        let dir = tempfile::tempdir().unwrap();
        let source = [
            question_json("a", "train", &[1, 2, 3]),
            question_json("b", "val", &[4, 2]),
            question_json("c", "dev", &[1, 2]),
            question_json("d", "test", &[7, 7]),
        ]
        .join("\n");
        let builder = PreferencePairBuilder::new(config(dir.path(), 1), &tok);
        let stats = builder
            .build(QuestionReader::new(Cursor::new(source), "mem"), "mem")
            .unwrap();

        assert_eq!(stats.n_questions_read, 4);
        assert_eq!(stats.n_invalid_questions, 1);
        assert_eq!(stats.n_ans_pairs, 4);
        let shard_dir = dir.path().join("rm");
        assert_eq!(count_lines(&shard_dir.join(split_file_name(Split::Train))), 3);
        assert_eq!(count_lines(&shard_dir.join(split_file_name(Split::Val))), 1);
        assert_eq!(count_lines(&shard_dir.join(split_file_name(Split::Test))), 0);

        let meta = load_metadata(&shard_dir).unwrap();
        assert_eq!(meta.n_questions, 3);
        assert_eq!(meta.n_ans_pairs, 4);
        assert_eq!(meta.n_rejected_pairs, 1);
        assert_eq!(meta.n_invalid_questions, 1);
        assert_eq!(meta.shard_count, 1);
    }

    #[test]
    fn multi_shard_build_keeps_questions_whole() {
        let tok = WhitespaceTokenizer;
        let dir = tempfile::tempdir().unwrap();
        let source: Vec<String> = (0..40)
            .map(|k| question_json(&format!("q{k}"), "train", &[1, 2, 3, 4]))
            .collect();
        let builder = PreferencePairBuilder::new(config(dir.path(), 3), &tok);
        let stats = builder
            .build(QuestionReader::new(Cursor::new(source.join("\n")), "mem"), "mem")
            .unwrap();

        assert_eq!(stats.shards.len(), 3);
        let total: u64 = stats.shards.iter().map(|m| m.n_ans_pairs).sum();
        assert_eq!(total, 40 * 6);
        assert_eq!(stats.shards.iter().map(|m| m.n_questions).sum::<u64>(), 40);

        for meta in &stats.shards {
            let lines = utils::read_lines(dir.path().join(&meta.dataset_id).join("train.tsv")).unwrap();
            assert_eq!(lines.len() as u64, meta.n_questions * 6);
            // every question present in this shard contributes all six pairs here
            let mut per_question = std::collections::BTreeMap::new();
            for line in &lines {
                let inputs = line.split('\t').next().unwrap().to_string();
                *per_question.entry(inputs).or_insert(0) += 1;
            }
            assert!(per_question.values().all(|&c| c == 6));
        }
    }

    #[test]
    fn malformed_line_aborts_build() {
        let tok = WhitespaceTokenizer;
        let dir = tempfile::tempdir().unwrap();
        let source = format!("{}\n{{broken\n", question_json("a", "train", &[1, 2]));
        let builder = PreferencePairBuilder::new(config(dir.path(), 1), &tok);
        let err = builder
            .build(QuestionReader::new(Cursor::new(source), "mem"), "mem")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MalformedRecord { line: 2, .. })
        ));
    }
}
