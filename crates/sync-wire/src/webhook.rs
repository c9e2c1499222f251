use serde::{Deserialize, Serialize};

/// The envelope the planner's webhook delivery posts to our HTTP surface
/// (§6): a batch of change notifications sharing one HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub value: Vec<ChangeNotification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "clientState")]
    pub client_state: String,
    #[serde(rename = "changeType")]
    pub change_type: ChangeType,
    pub resource: String,
    #[serde(rename = "resourceData")]
    pub resource_data: ResourceData,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceData {
    pub id: String,
    #[serde(rename = "@odata.type", default, skip_serializing_if = "Option::is_none")]
    pub odata_type: Option<String>,
    #[serde(rename = "@odata.etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// The query-string validation handshake (§4.6): on subscription creation
/// and renewal the planner GETs our endpoint with `validationToken` and
/// expects it echoed back verbatim, `text/plain`, within 10 seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationQuery {
    #[serde(rename = "validationToken")]
    pub validation_token: String,
}

/// A lifecycle notification (subscription about to expire, reauthorization
/// required) delivered on the same channel as change notifications, distinguished
/// by the `lifecycleEvent` field instead of `changeType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleNotification {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "clientState")]
    pub client_state: String,
    #[serde(rename = "lifecycleEvent")]
    pub lifecycle_event: LifecycleEvent,
    pub resource: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleEvent {
    SubscriptionRemoved,
    ReauthorizationRequired,
    MissedNotifications,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_created_task_notification() {
        let raw = r#"{
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": "secret",
                "changeType": "updated",
                "resource": "planner/tasks/abc",
                "resourceData": {
                    "id": "abc",
                    "@odata.type": "#microsoft.graph.plannerTask",
                    "@odata.etag": "W/\"etag1\""
                }
            }]
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.value.len(), 1);
        assert_eq!(envelope.value[0].change_type, ChangeType::Updated);
        assert_eq!(envelope.value[0].resource_data.id, "abc");
    }
}
