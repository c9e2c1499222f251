use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body posted to create a subscription (§4.5). `expiration_date_time` is
/// capped by the planner at a resource-specific maximum (a few days for
/// `plannerTasks`); the Subscription Manager renews well before it lapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "changeType")]
    pub change_type: String,
    #[serde(rename = "notificationUrl")]
    pub notification_url: String,
    pub resource: String,
    #[serde(rename = "expirationDateTime")]
    pub expiration_date_time: DateTime<Utc>,
    #[serde(rename = "clientState")]
    pub client_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionResource {
    pub id: String,
    #[serde(rename = "resource")]
    pub resource: String,
    #[serde(rename = "expirationDateTime")]
    pub expiration_date_time: DateTime<Utc>,
    #[serde(rename = "clientState")]
    pub client_state: String,
}

/// Body for a renewal PATCH: only the new expiration is mutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRenewal {
    #[serde(rename = "expirationDateTime")]
    pub expiration_date_time: DateTime<Utc>,
}
