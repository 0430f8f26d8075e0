pub mod rate_limit;
pub mod state;

pub use rate_limit::rate_limit_hoop;
pub use state::{inject_state, StateDepotExt};
