use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const CHECKPOINT_PREFIX: &str = "model.ckpt-";
const INDEX_SUFFIX: &str = ".index";

/// Checkpoint prefix for `step`, as handed to the engine.
pub fn checkpoint_path(model_dir: &Path, step: u64) -> PathBuf {
    model_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
}

fn step_from_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(INDEX_SUFFIX)?
        .parse()
        .ok()
}

/// Steps of every `model.ckpt-<step>.index` in `model_dir`, ascending.
pub fn checkpoint_steps(model_dir: &Path) -> Result<Vec<u64>> {
    let entries = std::fs::read_dir(model_dir)
        .with_context(|| format!("Failed to list model dir: {:?}", model_dir))?;
    let mut steps = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(step) = entry.file_name().to_str().and_then(step_from_file_name) {
            steps.push(step);
        }
    }
    steps.sort_unstable();
    steps.dedup();
    Ok(steps)
}

pub fn latest_checkpoint_step(model_dir: &Path) -> Result<u64> {
    checkpoint_steps(model_dir)?
        .last()
        .copied()
        .with_context(|| format!("No checkpoints found in {:?}", model_dir))
}

/// Like [`latest_checkpoint_step`] but a fresh model dir is step 0.
pub fn latest_or_zero(model_dir: &Path) -> Result<u64> {
    if !model_dir.exists() {
        return Ok(0);
    }
    Ok(checkpoint_steps(model_dir)?.last().copied().unwrap_or(0))
}

/// `(step, path)` for every checkpoint at or above `min_steps`, ascending.
pub fn get_checkpoint_paths(model_dir: &Path, min_steps: Option<u64>) -> Result<Vec<(u64, PathBuf)>> {
    let min_steps = min_steps.unwrap_or(0);
    Ok(checkpoint_steps(model_dir)?
        .into_iter()
        .filter(|&step| step >= min_steps)
        .map(|step| (step, checkpoint_path(model_dir, step)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn enumerates_index_files_in_step_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "model.ckpt-1000.index",
            "model.ckpt-1000.data-00000-of-00002",
            "model.ckpt-200.index",
            "model.ckpt-30000.index",
            "model.ckpt-abc.index",
            "checkpoint",
        ] {
            touch(dir.path(), name);
        }
        assert_eq!(checkpoint_steps(dir.path()).unwrap(), vec![200, 1000, 30000]);
        assert_eq!(latest_checkpoint_step(dir.path()).unwrap(), 30000);

        let kept = get_checkpoint_paths(dir.path(), Some(1000)).unwrap();
        assert_eq!(
            kept,
            vec![
                (1000, dir.path().join("model.ckpt-1000")),
                (30000, dir.path().join("model.ckpt-30000")),
            ]
        );
    }

    #[test]
    fn empty_dir_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint_step(dir.path()).is_err());
        assert_eq!(latest_or_zero(dir.path()).unwrap(), 0);
        assert_eq!(latest_or_zero(&dir.path().join("missing")).unwrap(), 0);
    }
}
