use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which resource family a subscription notifies on (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    Planner,
    Chat,
}

/// How the chat subscription is scoped — recorded so operators can audit
/// which tenants fell back to per-chat subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Global,
    PerChat,
}

/// `Pending -> Active -> Renewing -> Active -> Expiring -> Deleted`, with
/// `Failed` a terminal side state that the renewal sweep treats as "recreate
/// from scratch".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Pending,
    Active,
    Renewing,
    Expiring,
    Deleted,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub domain: Domain,
    pub mode: Mode,
    pub resource: String,
    pub expires_at: DateTime<Utc>,
    pub state: State,
}

pub const REGISTRY_KEY: &str = "subs:registry";

pub fn client_state_key(subscription_id: &str) -> String {
    format!("subs:clientState:{subscription_id}")
}
