pub mod tracker;

pub use tracker::PositionTracker;
