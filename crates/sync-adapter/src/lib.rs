pub mod adapter;
pub mod conflict;

pub use adapter::{from_planner, to_planner, OUTPUT_DELIMITER};
pub use conflict::{resolve as resolve_conflict, DEAD_BAND};
