pub mod continuous;

pub use continuous::{BestStrikes, ContinuousFilter};
