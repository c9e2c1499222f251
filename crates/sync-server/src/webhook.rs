use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::{json, Value};
use sync_observability::redact_text;
use sync_wire::{ChangeNotification, LifecycleNotification, ValidationQuery};
use tracing::{info, warn};

use crate::AppState;

/// Planner notification endpoint (§4.6). Handles the validation-token
/// handshake and the steady-state notification envelope identically to
/// the chat endpoint, differing only in which bus channel normalized
/// events land on.
pub async fn planner_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> impl IntoResponse {
    handle(&state, params, body, sync_core::channels::PLANNER_WEBHOOK).await
}

pub async fn chat_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> impl IntoResponse {
    handle(&state, params, body, sync_core::channels::CHAT_WEBHOOK).await
}

async fn handle(
    state: &AppState,
    params: HashMap<String, String>,
    body: String,
    channel: &str,
) -> impl IntoResponse {
    // §4.6 step 1: the subscription handshake. Must echo within 10s as
    // plain text — there is no JSON envelope on this leg at all. The query
    // string only ever carries this one field, so a `HashMap` extractor
    // plus a best-effort typed conversion lets a missing token fall
    // through to the notification body instead of rejecting the request.
    let validation: Option<ValidationQuery> =
        serde_json::to_value(&params).ok().and_then(|v| serde_json::from_value(v).ok());
    if let Some(validation) = validation {
        return (StatusCode::OK, validation.validation_token).into_response();
    }

    let Ok(envelope) = serde_json::from_str::<Value>(&body) else {
        warn!("webhook: malformed JSON envelope, dropping");
        return StatusCode::ACCEPTED.into_response();
    };

    let notifications = envelope
        .get("value")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for notification in notifications {
        process_one(state, notification, channel).await;
    }

    // §4.6 step 4: 202 is returned unconditionally within this request;
    // any failure downstream of this point is logged and handled async.
    StatusCode::ACCEPTED.into_response()
}

async fn process_one(state: &AppState, notification: Value, channel: &str) {
    // Lifecycle notifications (subscription removed, reauthorization
    // required, missed notifications) ride the same envelope but carry
    // `lifecycleEvent` instead of `changeType` (§4.5/§4.6); check the
    // discriminant before committing to one typed shape or the other.
    if notification.get("lifecycleEvent").is_some() {
        let Ok(lifecycle) = serde_json::from_value::<LifecycleNotification>(notification) else {
            warn!("webhook: malformed lifecycle notification, dropping");
            return;
        };
        if !state
            .subscriptions
            .verify_client_state(&lifecycle.subscription_id, &lifecycle.client_state)
            .await
        {
            warn!(
                subscription_id = lifecycle.subscription_id.as_str(),
                client_state = redact_text(&lifecycle.client_state).as_str(),
                "webhook: clientState mismatch, dropping lifecycle notification"
            );
            return;
        }
        state.subscriptions.handle_lifecycle_notification(&lifecycle.subscription_id).await;
        return;
    }

    let Ok(change) = serde_json::from_value::<ChangeNotification>(notification) else {
        warn!("webhook: malformed change notification, dropping");
        return;
    };

    if !state
        .subscriptions
        .verify_client_state(&change.subscription_id, &change.client_state)
        .await
    {
        warn!(
            subscription_id = change.subscription_id.as_str(),
            client_state = redact_text(&change.client_state).as_str(),
            "webhook: clientState mismatch, dropping notification"
        );
        return;
    }

    let change_type = serde_json::to_value(change.change_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let etag = change.resource_data.etag.clone().unwrap_or_default();
    let resource = change.resource.clone();

    let dedup_key = format!("{resource}|{change_type}|{}|{etag}", change.resource_data.id);
    if !state.dedup.admit(&dedup_key).await {
        return;
    }

    let normalized = json!({
        "changeType": change_type,
        "resource": change.resource,
        "resourceData": change.resource_data,
        "subscriptionId": change.subscription_id,
        "receivedAt": Utc::now(),
    });

    if state.bus.publish(channel, normalized.clone()).await {
        info!(change_type = change_type.as_str(), resource = resource.as_str(), "webhook: notification published");
    } else {
        warn!(
            change_type = change_type.as_str(),
            resource = resource.as_str(),
            "webhook: no subscribers for channel, re-queueing to sync:pending"
        );
        let envelope = json!({
            "op_id": format!("webhook-replay-{dedup_key}"),
            "kind": "webhook_replay",
            "payload": { "channel": channel, "notification": normalized },
            "attempt": 0,
        });
        let _ = state.store.push("sync:pending", envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppState;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use sync_core::{Bus, StoreGateway};
    use sync_subscriptions::SubscriptionManager;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let file = NamedTempFile::new().expect("tempfile");
        let store = Arc::new(StoreGateway::new(file.path()).await.expect("store"));
        let tokens = Arc::new(sync_core::token_cache::TokenCache::new(
            store.clone(),
            "t",
            "c",
            "s",
            "u",
            "p",
        ));
        struct NoPlans;
        #[async_trait::async_trait]
        impl sync_core::planner_api::PlannerApi for NoPlans {
            async fn list_accessible_plans(&self) -> Result<Vec<sync_wire::PlanSummary>, sync_core::PlannerError> {
                Ok(vec![])
            }
            async fn list_plan_buckets(&self, _: &str) -> Result<Vec<sync_wire::BucketSummary>, sync_core::PlannerError> {
                Ok(vec![])
            }
            async fn list_plan_tasks(&self, _: &str) -> Result<Vec<sync_wire::PlannerTask>, sync_core::PlannerError> {
                Ok(vec![])
            }
            async fn get_task(&self, _: &str) -> Result<sync_core::planner_api::Versioned<sync_wire::PlannerTask>, sync_core::PlannerError> {
                Err(sync_core::PlannerError::NotFound)
            }
            async fn get_task_details(&self, _: &str) -> Result<sync_core::planner_api::Versioned<sync_wire::PlannerTaskDetails>, sync_core::PlannerError> {
                Err(sync_core::PlannerError::NotFound)
            }
            async fn create_task(&self, _: &sync_wire::PlannerCreateBody) -> Result<sync_core::planner_api::Versioned<sync_wire::PlannerTask>, sync_core::PlannerError> {
                Err(sync_core::PlannerError::NotFound)
            }
            async fn update_task(&self, _: &str, _: &Value, _: &sync_core::planner_api::IfMatch) -> Result<String, sync_core::PlannerError> {
                Err(sync_core::PlannerError::NotFound)
            }
            async fn update_task_details(&self, _: &str, _: &sync_wire::PlannerDetailsBody, _: &sync_core::planner_api::IfMatch) -> Result<String, sync_core::PlannerError> {
                Err(sync_core::PlannerError::NotFound)
            }
            async fn delete_task(&self, _: &str, _: &sync_core::planner_api::IfMatch) -> Result<(), sync_core::PlannerError> {
                Ok(())
            }
        }

        let subscriptions = Arc::new(SubscriptionManager::new(
            "https://graph.example.com/v1.0",
            "https://svc.example.com/webhook/planner",
            tokens,
            sync_core::RateGovernor::new(),
            store.clone(),
            Arc::new(NoPlans),
        ));

        AppState {
            store,
            bus: Arc::new(Bus::new()),
            subscriptions,
            dedup: Arc::new(crate::dedup::DedupWindow::new()),
        }
    }

    #[tokio::test]
    async fn validation_handshake_echoes_token_as_plain_text() {
        let state = test_state().await;
        let app = crate::router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/planner?validationToken=abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"abc123");
    }

    #[tokio::test]
    async fn notification_with_unknown_subscription_is_dropped_but_still_202s() {
        let state = test_state().await;
        let app = crate::router(state);
        let payload = json!({
            "value": [{
                "subscriptionId": "sub-unknown",
                "clientState": "whatever",
                "changeType": "updated",
                "resource": "/planner/tasks/T1",
                "resourceData": { "id": "T1" },
            }]
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/planner")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn lifecycle_notification_marks_the_subscription_failed_for_recreate() {
        let state = test_state().await;
        state
            .store
            .set(
                &sync_subscriptions::registry::client_state_key("sub-1"),
                json!("secret"),
                None,
            )
            .await
            .unwrap();
        state
            .store
            .set(
                sync_subscriptions::registry::REGISTRY_KEY,
                json!({
                    "sub-1": {
                        "id": "sub-1",
                        "domain": "Planner",
                        "mode": "PerChat",
                        "resource": "/planner/plans/p1/tasks",
                        "expires_at": Utc::now() + chrono::Duration::hours(1),
                        "state": "Active",
                    }
                }),
                None,
            )
            .await
            .unwrap();

        let app = crate::router(state.clone());
        let payload = json!({
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": "secret",
                "lifecycleEvent": "reauthorizationRequired",
                "resource": "/planner/plans/p1/tasks",
            }]
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/planner")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let registry = state
            .store
            .get(sync_subscriptions::registry::REGISTRY_KEY)
            .await
            .unwrap();
        assert_eq!(registry["sub-1"]["state"], "Failed");
    }

    #[tokio::test]
    async fn notification_with_no_bus_subscribers_is_requeued_to_pending() {
        let state = test_state().await;
        state
            .store
            .set(
                &sync_subscriptions::registry::client_state_key("sub-1"),
                json!("secret"),
                None,
            )
            .await
            .unwrap();
        let app = crate::router(state.clone());
        let payload = json!({
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": "secret",
                "changeType": "updated",
                "resource": "/planner/tasks/T1",
                "resourceData": { "id": "T1" },
            }]
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/planner")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.store.list_len("sync:pending").await, 1);
    }
}
