pub mod detector;

pub use detector::{MultiSwingDetector, SwingDetector};
