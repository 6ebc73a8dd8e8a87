pub mod churn;
pub mod manager;

pub use churn::{ChurnVerdict, OrderChurnDetector};
pub use manager::{OrderManager, ReconcileReport};
