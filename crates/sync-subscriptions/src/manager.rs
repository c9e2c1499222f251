use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sync_core::planner_api::PlannerApi;
use sync_core::token_cache::{TokenCache, TokenKind};
use sync_core::{RateGovernor, StoreGateway};
use sync_wire::{SubscriptionRenewal, SubscriptionRequest, SubscriptionResource};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::registry::{client_state_key, Domain, Mode, State, SubscriptionRecord, REGISTRY_KEY};

const RENEWAL_TICK: StdDuration = StdDuration::from_secs(15 * 60);
const RENEWAL_THRESHOLD: ChronoDuration = ChronoDuration::minutes(20);
const MAX_LIFETIME: ChronoDuration = ChronoDuration::hours(71);
const PLANNER_SCOPES: &[&str] = &["Tasks.ReadWrite", "Group.ReadWrite.All"];
const CHAT_SCOPES: &[&str] = &["Chat.Read", "Chat.ReadWrite"];

/// Owns the lifecycle of every change-notification subscription this
/// service holds (§4.5). Planner coverage is one subscription per
/// accessible plan's task collection; chat coverage prefers a single
/// tenant-wide subscription and falls back to one per chat.
pub struct SubscriptionManager {
    http: reqwest::Client,
    base_url: String,
    notification_url: String,
    tokens: Arc<TokenCache>,
    governor: Arc<RateGovernor>,
    store: Arc<StoreGateway>,
    planner: Arc<dyn PlannerApi>,
}

impl SubscriptionManager {
    pub fn new(
        base_url: impl Into<String>,
        notification_url: impl Into<String>,
        tokens: Arc<TokenCache>,
        governor: Arc<RateGovernor>,
        store: Arc<StoreGateway>,
        planner: Arc<dyn PlannerApi>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            notification_url: notification_url.into(),
            tokens,
            governor,
            store,
            planner,
        }
    }

    /// Runs the initial create pass, then the 15-min renewal ticker, until
    /// cancelled. The caller owns the returned handle's lifetime the same
    /// way it owns the Sync Engine's task handles. `release_on_shutdown`
    /// controls whether cancellation tears the subscriptions down
    /// upstream or just stops renewing them in place — a restart-heavy
    /// deployment may prefer to leave them active across a brief outage.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, release_on_shutdown: bool) {
        self.reconcile_all().await;

        let mut ticker = tokio::time::interval(RENEWAL_TICK);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if release_on_shutdown {
                        self.teardown_all().await;
                    }
                    return;
                }
                _ = ticker.tick() => self.reconcile_all().await,
            }
        }
    }

    /// Ensures planner coverage and chat coverage both exist, and renews or
    /// recreates anything close to expiry or previously `Failed`.
    async fn reconcile_all(self: &Arc<Self>) {
        self.ensure_planner_subscriptions().await;
        self.ensure_chat_subscription().await;
        self.renew_sweep().await;
    }

    async fn ensure_planner_subscriptions(&self) {
        let plans = match self.planner.list_accessible_plans().await {
            Ok(plans) => plans,
            Err(err) => {
                warn!(error = %err, "subscription manager: could not list plans");
                return;
            }
        };

        let registry = self.load_registry().await;
        let covered: std::collections::HashSet<&str> = registry
            .values()
            .filter(|r| r.domain == Domain::Planner && !matches!(r.state, State::Deleted | State::Failed))
            .map(|r| r.resource.as_str())
            .collect();

        for plan in plans {
            let resource = format!("/planner/plans/{}/tasks", plan.id);
            if covered.contains(resource.as_str()) {
                continue;
            }
            self.create(Domain::Planner, Mode::PerChat, &resource, PLANNER_SCOPES).await;
        }
    }

    /// Chat fallback (§4.5): try one global subscription first; if the
    /// tenant forbids it, iterate the accessible chat list instead.
    async fn ensure_chat_subscription(&self) {
        let registry = self.load_registry().await;
        let has_active_chat_coverage = registry
            .values()
            .any(|r| r.domain == Domain::Chat && !matches!(r.state, State::Deleted | State::Failed));
        if has_active_chat_coverage {
            return;
        }

        match self.create(Domain::Chat, Mode::Global, "/me/chats/getAllMessages", CHAT_SCOPES).await {
            Some(_) => {}
            None => {
                let chat_ids = self.list_chat_ids().await;
                for chat_id in chat_ids {
                    let resource = format!("/chats/{chat_id}/messages");
                    self.create(Domain::Chat, Mode::PerChat, &resource, CHAT_SCOPES).await;
                }
            }
        }
    }

    async fn list_chat_ids(&self) -> Vec<String> {
        #[derive(serde::Deserialize)]
        struct Page {
            value: Vec<ChatSummary>,
        }
        #[derive(serde::Deserialize)]
        struct ChatSummary {
            id: String,
        }

        let Ok(token) = self.bearer(CHAT_SCOPES).await else {
            return Vec::new();
        };
        let url = format!("{}/me/chats?$select=id", self.base_url);
        match self.http.get(&url).bearer_auth(token).send().await {
            Ok(response) => response
                .json::<Page>()
                .await
                .map(|p| p.value.into_iter().map(|c| c.id).collect())
                .unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "subscription manager: could not list chats");
                Vec::new()
            }
        }
    }

    async fn create(&self, domain: Domain, mode: Mode, resource: &str, scopes: &[&str]) -> Option<SubscriptionRecord> {
        let token = self.bearer(scopes).await.ok()?;
        if !self.governor.acquire() {
            return None;
        }

        let client_state = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + MAX_LIFETIME;
        let request = SubscriptionRequest {
            change_type: "updated,created,deleted".to_string(),
            notification_url: self.notification_url.clone(),
            resource: resource.to_string(),
            expiration_date_time: expires_at,
            client_state: client_state.clone(),
        };

        let response = self
            .http
            .post(format!("{}/subscriptions", self.base_url))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                self.governor.report_result(false, None);
                warn!(resource, error = %err, "subscription create request failed");
                return None;
            }
        };

        if !response.status().is_success() {
            self.governor.report_result(response.status().as_u16() == 429, None);
            warn!(resource, status = %response.status(), "subscription create rejected (falling back if applicable)");
            return None;
        }
        self.governor.report_result(false, None);

        let created: SubscriptionResource = match response.json().await {
            Ok(v) => v,
            Err(err) => {
                error!(resource, error = %err, "malformed subscription create response");
                return None;
            }
        };

        let record = SubscriptionRecord {
            id: created.id.clone(),
            domain,
            mode,
            resource: resource.to_string(),
            expires_at: created.expiration_date_time,
            state: State::Active,
        };

        let _ = self.store.set(&client_state_key(&created.id), json!(client_state), None).await;
        self.upsert_record(&record).await;
        info!(subscription_id = %record.id, resource, ?mode, "subscription created");
        Some(record)
    }

    async fn renew_sweep(&self) {
        let registry = self.load_registry().await;
        let now = Utc::now();

        for record in registry.values() {
            if matches!(record.state, State::Deleted) {
                continue;
            }
            if matches!(record.state, State::Failed) {
                self.recreate(record).await;
                continue;
            }
            if record.expires_at - now > RENEWAL_THRESHOLD {
                continue;
            }
            self.renew_one(record).await;
        }
    }

    async fn renew_one(&self, record: &SubscriptionRecord) {
        let scopes = match record.domain {
            Domain::Planner => PLANNER_SCOPES,
            Domain::Chat => CHAT_SCOPES,
        };
        let Ok(token) = self.bearer(scopes).await else {
            self.mark_state(&record.id, State::Failed).await;
            return;
        };
        if !self.governor.acquire() {
            return;
        }

        self.mark_state(&record.id, State::Renewing).await;
        let new_expiry = Utc::now() + MAX_LIFETIME;
        let body = SubscriptionRenewal { expiration_date_time: new_expiry };

        let response = self
            .http
            .patch(format!("{}/subscriptions/{}", self.base_url, record.id))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => {
                self.governor.report_result(false, None);
                let mut updated = record.clone();
                updated.expires_at = new_expiry;
                updated.state = State::Active;
                self.upsert_record(&updated).await;
                info!(subscription_id = %record.id, "subscription renewed");
            }
            Ok(r) => {
                self.governor.report_result(r.status().as_u16() == 429, None);
                warn!(subscription_id = %record.id, status = %r.status(), "renewal failed, recreating");
                self.recreate(record).await;
            }
            Err(err) => {
                self.governor.report_result(false, None);
                warn!(subscription_id = %record.id, error = %err, "renewal request failed, recreating");
                self.recreate(record).await;
            }
        }
    }

    /// §4.5: a renewal failure deletes and recreates rather than retrying
    /// the PATCH indefinitely — a subscription id can go stale in ways a
    /// retry won't fix.
    async fn recreate(&self, record: &SubscriptionRecord) {
        self.delete_remote(&record.id, record.domain).await;
        self.mark_state(&record.id, State::Deleted).await;
        self.create(record.domain, record.mode, &record.resource, match record.domain {
            Domain::Planner => PLANNER_SCOPES,
            Domain::Chat => CHAT_SCOPES,
        })
        .await;
    }

    async fn teardown_all(&self) {
        let registry = self.load_registry().await;
        for record in registry.values() {
            if matches!(record.state, State::Deleted) {
                continue;
            }
            self.delete_remote(&record.id, record.domain).await;
            self.mark_state(&record.id, State::Deleted).await;
        }
    }

    async fn delete_remote(&self, subscription_id: &str, domain: Domain) {
        let scopes = match domain {
            Domain::Planner => PLANNER_SCOPES,
            Domain::Chat => CHAT_SCOPES,
        };
        let Ok(token) = self.bearer(scopes).await else { return };
        let _ = self
            .http
            .delete(format!("{}/subscriptions/{}", self.base_url, subscription_id))
            .bearer_auth(token)
            .send()
            .await;
        let _ = self.store.delete(&client_state_key(subscription_id)).await;
    }

    /// Webhook Router calls this when a lifecycle notification reports a
    /// subscription gone bad (`subscriptionRemoved`, `reauthorizationRequired`,
    /// `missedNotifications`). Marking it `Failed` here makes the next
    /// renewal sweep recreate it immediately instead of waiting out the
    /// normal `RENEWAL_THRESHOLD` window.
    pub async fn handle_lifecycle_notification(&self, subscription_id: &str) {
        warn!(subscription_id, "subscription lifecycle notification received, marking failed for recreate");
        self.mark_state(subscription_id, State::Failed).await;
    }

    /// Webhook Router calls this to drop notifications whose `clientState`
    /// doesn't match what was stored at create time (§4.6).
    pub async fn verify_client_state(&self, subscription_id: &str, candidate: &str) -> bool {
        match self.store.get(&client_state_key(subscription_id)).await {
            Some(stored) => stored.as_str() == Some(candidate),
            None => false,
        }
    }

    async fn bearer(&self, scopes: &[&str]) -> Result<String, ()> {
        self.tokens
            .acquire(TokenKind::Delegated, scopes)
            .await
            .map(|t| t.access_token)
            .map_err(|_| ())
    }

    async fn load_registry(&self) -> HashMap<String, SubscriptionRecord> {
        match self.store.get(REGISTRY_KEY).await {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => HashMap::new(),
        }
    }

    async fn upsert_record(&self, record: &SubscriptionRecord) {
        let mut registry = self.load_registry().await;
        registry.insert(record.id.clone(), record.clone());
        let _ = self.store.set(REGISTRY_KEY, json!(registry), None).await;
    }

    async fn mark_state(&self, subscription_id: &str, state: State) {
        let mut registry = self.load_registry().await;
        if let Some(record) = registry.get_mut(subscription_id) {
            record.state = state;
            let _ = self.store.set(REGISTRY_KEY, json!(registry), None).await;
        }
    }
}
