use anyhow::Result;
use serde_json::json;
use std::path::Path;

use bon_advice::best_of_n::{self, BestOfNGenerator, Generations, SamplerConfig, SelectOptions};
use bon_advice::models::tokenizer::WhitespaceTokenizer;
use bon_advice::models::{GenerationEngine, PredictOptions, QuestionReader, ValidityRules};
use bon_advice::pairs::{PairBuilderConfig, PairFilters, PreferencePairBuilder};
use bon_advice::utils;
use bon_advice::PipelineError;

/// Answers each request with `<n-th answer> for <request>`, counting per
/// distinct request so replicates are distinguishable.
struct ReplicaEngine;

impl GenerationEngine for ReplicaEngine {
    fn predict(&self, input_file: &Path, output_file: &Path, _options: &PredictOptions) -> Result<()> {
        let mut seen = std::collections::HashMap::new();
        let outputs: Vec<String> = utils::read_lines(input_file)?
            .into_iter()
            .map(|request| {
                let k = seen.entry(request.clone()).or_insert(0);
                *k += 1;
                format!("answer {} for {}", k, request.split(" Title: ").nth(1).unwrap_or(&request))
            })
            .collect();
        utils::write_lines(output_file, &outputs)
    }
}

fn question(id: &str, title: &str, scores: [i64; 3]) -> String {
    let comments: Vec<_> = scores
        .iter()
        .enumerate()
        .map(|(k, score)| json!({"id": format!("{id}-{k}"), "body": format!("reply {k}"), "score": score, "created_utc": 1_546_646_400 + k * 30}))
        .collect();
    json!({
        "id": id,
        "subreddit": "Advice",
        "created_utc": 1_546_646_400,
        "title": title,
        "selftext": "Some background that is long enough to count.",
        "split": "test",
        "good_comments": comments,
    })
    .to_string()
}

#[test]
fn two_questions_best_of_three() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    // 1. preference pairs: three valid answers with distinct scores give three pairs each
    let source = root.join("questions.jsonl");
    utils::write_lines(&source, &[question("q1", "Moving out", [3, 10, 1]), question("q2", "New job", [4, 2, 7])]).unwrap();
    let tok = WhitespaceTokenizer;
    let builder = PreferencePairBuilder::new(
        PairBuilderConfig {
            dataset_id: "advice".to_string(),
            output_dir: root.join("datasets"),
            shard_count: 1,
            seed: None,
            filters: PairFilters::default(),
            validity: ValidityRules::default(),
            selftext_max_tokens: 1250,
        },
        &tok,
    );
    let stats = builder
        .build(QuestionReader::open(&source).unwrap(), &source.display().to_string())
        .unwrap();
    assert_eq!(stats.n_ans_pairs, 6);
    let test_rows = utils::read_lines(root.join("datasets/advice/test.tsv")).unwrap();
    assert_eq!(test_rows.len(), 6);

    // 2. best-of-3 generation for the two question contexts
    let mut contexts: Vec<String> = Vec::new();
    for row in &test_rows {
        let inputs = row.split('\t').next().unwrap().to_string();
        if !contexts.contains(&inputs) {
            contexts.push(inputs);
        }
    }
    assert_eq!(contexts.len(), 2);
    let inputs_path = root.join("inputs.txt");
    let generations_path = root.join("generations.txt");
    utils::write_lines(&inputs_path, &contexts).unwrap();

    let engine = ReplicaEngine;
    let generator = BestOfNGenerator::new(
        &engine,
        SamplerConfig {
            n: 3,
            sampling_keep_top_p: 0.94,
            checkpoint_steps: None,
            tmp_dir: root.join("tmp"),
        },
    );
    let generations = generator.generate_file(&inputs_path, &generations_path).unwrap();
    assert_eq!(generations.num_blocks(), 2);

    // 3. scoring inputs line up with the generations
    let scoring = best_of_n::pair_with_inputs(&contexts, &generations).unwrap();
    assert_eq!(scoring.len(), 6);
    assert!(scoring[4].starts_with(&contexts[1]));

    // 4. reward scores from the reward model, then selection
    let scores_path = root.join("scores.txt");
    utils::write_lines(&scores_path, &["1", "5", "3", "2", "2", "9"]).unwrap();
    let best_path = root.join("best.txt");
    let report = best_of_n::select_files(
        &generations_path,
        &scores_path,
        &best_path,
        &SelectOptions { n: 3, restore_paragraphs: false },
    )
    .unwrap();
    assert_eq!(report.blocks, 2);

    let best = utils::read_lines(&best_path).unwrap();
    assert_eq!(best, vec!["answer 2 for Moving out Selftext: Some background that is long enough to count.", "answer 3 for New job Selftext: Some background that is long enough to count."]);
    assert_eq!(best[0], generations.block(0).unwrap()[1]);
    assert_eq!(best[1], generations.block(1).unwrap()[2]);
}

#[test]
fn merged_runs_feed_selection() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let run_a = root.join("run_a.txt");
    let run_b = root.join("run_b.txt");
    utils::write_lines(&run_a, &["q1 a1", "q1 a2", "q2 a1", "q2 a2"]).unwrap();
    utils::write_lines(&run_b, &["q1 b1", "q1 b2", "q2 b1", "q2 b2"]).unwrap();

    let merged = root.join("merged.txt");
    let report = best_of_n::merge_files(&[(run_a, 2), (run_b, 2)], 3, &merged).unwrap();
    assert_eq!(report.questions, 2);
    let lines = utils::read_lines(&merged).unwrap();
    assert_eq!(lines, vec!["q1 a1", "q1 a2", "q1 b1", "q2 a1", "q2 a2", "q2 b1"]);

    let generations = Generations::new(lines, 3).unwrap();
    let best = best_of_n::select_best_in_memory(&generations, &[0.1, 0.1, 0.7, 0.3, -1.0, 0.2]).unwrap();
    assert_eq!(best, vec!["q1 b1", "q2 a1"]);
}

#[test]
fn misaligned_scores_abort_selection() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let generations = root.join("gens.txt");
    let scores = root.join("scores.txt");
    utils::write_lines(&generations, &["a", "b", "c", "d", "e", "f"]).unwrap();
    utils::write_lines(&scores, &["1", "2", "3", "4", "5"]).unwrap();

    let best = root.join("best.txt");
    let err = best_of_n::select_files(
        &generations,
        &scores,
        &best,
        &SelectOptions { n: 3, restore_paragraphs: false },
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Correspondence { expected: 6, found: 5, .. })
    ));
    // the first block was selectable before the mismatch showed up
    assert!(!best.exists());
    assert_eq!(std::fs::read_dir(root).unwrap().count(), 2);
}

#[test]
fn rerunning_a_build_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let source = root.join("questions.jsonl");
    utils::write_lines(&source, &[question("q1", "Moving out", [3, 10, 1])]).unwrap();
    let tok = WhitespaceTokenizer;
    let config = PairBuilderConfig {
        dataset_id: "advice".to_string(),
        output_dir: root.join("datasets"),
        shard_count: 2,
        seed: Some(1),
        filters: PairFilters::default(),
        validity: ValidityRules::default(),
        selftext_max_tokens: 1250,
    };
    let builder = PreferencePairBuilder::new(config, &tok);
    builder.build(QuestionReader::open(&source).unwrap(), "questions").unwrap();
    let err = builder
        .build(QuestionReader::open(&source).unwrap(), "questions")
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::AlreadyExists(_))
    ));
}
