pub mod pipeline;
pub mod universe;

pub use pipeline::{DataPipeline, HealthStatus};
pub use universe::{generate_option_symbols, round_to_atm};
