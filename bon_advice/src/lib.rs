pub mod best_of_n;
pub mod config;
pub mod error;
pub mod models;
pub mod pairs;
pub mod training;
pub mod utils;

pub use error::PipelineError;
