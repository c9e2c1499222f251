//! Subscription Manager (§4.5): keeps the webhook firehose alive by
//! creating, renewing, and tearing down change-notification subscriptions
//! against the planner and chat domains.

pub mod manager;
pub mod registry;

pub use manager::SubscriptionManager;
pub use registry::{Domain, Mode, State, SubscriptionRecord};
