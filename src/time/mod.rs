pub mod session;

pub use session::{floor_to_minute, ist_now, MarketSession};

#[cfg(test)]
pub use session::session_for_tests;
