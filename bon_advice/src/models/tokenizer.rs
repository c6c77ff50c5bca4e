use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// The opaque tokenizer: only prefix truncation is needed by the data
/// pipeline.
pub trait TextTokenizer: Send + Sync {
    /// Returns `text` unchanged when it fits in `max_tokens`, otherwise the
    /// decoded first `max_tokens` tokens.
    fn truncate(&self, text: &str, max_tokens: usize) -> Result<String>;
}

/// HuggingFace `tokenizer.json` backed tokenizer.
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer from {}: {}", path.as_ref().display(), e)
        })?;
        Ok(Self { inner })
    }

    fn ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize text: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl TextTokenizer for HfTokenizer {
    fn truncate(&self, text: &str, max_tokens: usize) -> Result<String> {
        let ids = self.ids(text)?;
        if ids.len() <= max_tokens {
            return Ok(text.to_string());
        }
        self.inner
            .decode(&ids[..max_tokens], true)
            .map_err(|e| anyhow::anyhow!("Failed to decode truncated text: {}", e))
    }
}

/// Whitespace word tokenizer, used when no tokenizer file is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl TextTokenizer for WhitespaceTokenizer {
    /// Cuts the original text right after the `max_tokens`-th word, so the
    /// whitespace inside the kept prefix (newlines included) survives.
    fn truncate(&self, text: &str, max_tokens: usize) -> Result<String> {
        let mut words = 0;
        let mut in_word = false;
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                if in_word && words == max_tokens {
                    return Ok(text[..i].to_string());
                }
                in_word = false;
            } else if !in_word {
                if words == max_tokens {
                    return Ok(text[..i].trim_end().to_string());
                }
                in_word = true;
                words += 1;
            }
        }
        Ok(text.to_string())
    }
}

/// Resolves a tokenizer spec: a local `tokenizer.json`, a model directory
/// containing one, or a HuggingFace model id already in the local hub cache.
/// `None` selects the whitespace tokenizer.
pub fn load_tokenizer(spec: Option<&str>) -> Result<Box<dyn TextTokenizer>> {
    let Some(spec) = spec else {
        info!("No tokenizer configured, truncating on whitespace tokens");
        return Ok(Box::new(WhitespaceTokenizer));
    };

    let path = Path::new(spec);
    let candidate = if path.is_dir() {
        path.join("tokenizer.json")
    } else if path.exists() {
        path.to_path_buf()
    } else if spec.contains('/') {
        find_in_hf_cache(spec)
            .with_context(|| format!("Tokenizer {} not found locally or in HuggingFace cache", spec))?
    } else {
        anyhow::bail!("Tokenizer path does not exist: {}", spec);
    };

    info!("Loading tokenizer from {}", candidate.display());
    Ok(Box::new(HfTokenizer::from_file(&candidate)?))
}

fn find_in_hf_cache(model_id: &str) -> Option<PathBuf> {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    // "org/model" is cached as "models--org--model"
    let models_dir = Path::new(&home)
        .join(".cache")
        .join("huggingface")
        .join("hub")
        .join(format!("models--{}", model_id.replace('/', "--")));

    let snapshots = std::fs::read_dir(models_dir.join("snapshots")).ok()?;
    for entry in snapshots.flatten() {
        let tokenizer_path = entry.path().join("tokenizer.json");
        if tokenizer_path.exists() {
            debug!("Found cached tokenizer: {}", tokenizer_path.display());
            return Some(tokenizer_path);
        }
    }
    warn!("No tokenizer.json under HuggingFace cache for {}", model_id);
    None
}
