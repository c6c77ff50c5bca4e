pub mod merge;
pub mod sampler;
pub mod select;

pub use merge::{merge_files, merge_generations, MergeReport, MergeSource};
pub use sampler::{expand_inputs, generate_n, pair_with_inputs, BestOfNGenerator, Generations, SamplerConfig};
pub use select::{argmax_first, select_best, select_best_in_memory, select_files, SelectOptions, SelectReport};
