pub mod builder;
pub mod filters;
pub mod record;
pub mod shards;

pub use builder::{BuildStats, PairBuilderConfig, PreferencePairBuilder};
pub use filters::{AnswerPair, PairFilters};
pub use record::{fix_reddit_text, PreferenceRecord, RecordFormatter, PARAGRAPH_MARK};
pub use shards::{ShardMetadata, ShardSet};
