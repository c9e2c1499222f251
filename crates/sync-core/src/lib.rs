pub mod bus;
pub mod config;
pub mod crosswalk;
pub mod engine;
pub mod errors;
pub mod planner_api;
pub mod rate_governor;
pub mod store;
pub mod token_cache;

pub use bus::{channels, Bus};
pub use config::EngineConfig;
pub use crosswalk::Crosswalk;
pub use engine::SyncEngine;
pub use errors::{PlannerError, TokenError};
pub use planner_api::{IfMatch, PlannerApi, Versioned};
pub use rate_governor::RateGovernor;
pub use store::StoreGateway;
pub use token_cache::{AcquiredToken, TokenCache, TokenKind, DELEGATED_SUPERSET_SCOPES};
