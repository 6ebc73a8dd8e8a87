pub mod manager;
pub mod migrations;
pub mod switches;

pub use manager::{DailyState, StateManager};
pub use switches::Switch;
