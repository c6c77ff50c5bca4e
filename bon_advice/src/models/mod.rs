pub mod dataset;
pub mod engine;
#[cfg(feature = "python")]
pub mod python;
pub mod tokenizer;

pub use dataset::{Answer, Question, QuestionReader, Split, ValidityRules};
pub use engine::{CommandEngine, EstimatorFactory, GenerationEngine, ModelEngine, PredictOptions};
pub use tokenizer::{load_tokenizer, TextTokenizer};
