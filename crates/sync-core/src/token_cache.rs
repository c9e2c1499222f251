use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use crate::errors::TokenError;
use crate::store::StoreGateway;

/// The two credential kinds the engine ever mints (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Delegated,
    Application,
}

impl TokenKind {
    fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Delegated => "delegated",
            TokenKind::Application => "application",
        }
    }
}

/// Every delegated capability the service ever needs, minted once as one
/// superset grant and reused for any subset lookup (§4.1). Keeping this as
/// a single sorted list is what makes the superset cache key stable.
pub const DELEGATED_SUPERSET_SCOPES: &[&str] = &[
    "Tasks.ReadWrite",
    "Group.ReadWrite.All",
    "Chat.ReadWrite",
    "ChannelMessage.Read.All",
    "Calendars.ReadWrite",
    "Mail.ReadWrite",
    "Files.ReadWrite.All",
    "User.Read",
    "offline_access",
];

const SUPERSET_CACHE_KEY: &str = "tokens:delegated:__superset__";
const MINT_RETRY_CAP_SECS: u64 = 60;
const MINT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquiredToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AcquiredToken {
    fn remaining(&self) -> chrono::Duration {
        self.expires_at - Utc::now()
    }

    /// §4.1: a cache hit is only usable with at least 5 minutes left.
    fn is_fresh(&self) -> bool {
        self.remaining() >= chrono::Duration::minutes(5)
    }
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointError {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Issues, caches, and refreshes delegated and application bearer tokens
/// (§4.1). One of the three process-wide singletons (§9); shared by cheap
/// `Clone` (the in-process layer is an `Arc<RwLock<_>>`, the store handle
/// is itself a value-semantics clone).
#[derive(Clone)]
pub struct TokenCache {
    http: reqwest::Client,
    store: Arc<StoreGateway>,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    agent_username: String,
    agent_password: String,
    inproc: Arc<RwLock<HashMap<String, AcquiredToken>>>,
}

impl TokenCache {
    pub fn new(
        store: Arc<StoreGateway>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        agent_username: impl Into<String>,
        agent_password: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .expect("token cache http client"),
            store,
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            agent_username: agent_username.into(),
            agent_password: agent_password.into(),
            inproc: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn token_endpoint(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        )
    }

    /// `Acquire(kind, scope_set) -> (access_token, expires_at)` (§4.1).
    pub async fn acquire(
        &self,
        kind: TokenKind,
        scopes: &[&str],
    ) -> Result<AcquiredToken, TokenError> {
        let scope_key = scope_cache_key(kind, scopes);

        if let Some(token) = self.fresh(&scope_key).await {
            return Ok(token);
        }

        if kind == TokenKind::Delegated {
            if scope_key != SUPERSET_CACHE_KEY {
                if let Some(token) = self.fresh(SUPERSET_CACHE_KEY).await {
                    return Ok(token);
                }
            }
            let token = self
                .mint(TokenKind::Delegated, DELEGATED_SUPERSET_SCOPES)
                .await?;
            self.remember(SUPERSET_CACHE_KEY, &token).await;
            return Ok(token);
        }

        let token = self.mint(TokenKind::Application, scopes).await?;
        self.remember(&scope_key, &token).await;
        Ok(token)
    }

    async fn fresh(&self, cache_key: &str) -> Option<AcquiredToken> {
        if let Some(token) = self.inproc.read().await.get(cache_key) {
            if token.is_fresh() {
                return Some(token.clone());
            }
        }
        let stored = self.store.get(cache_key).await?;
        let token: AcquiredToken = serde_json::from_value(stored).ok()?;
        if token.is_fresh() {
            self.inproc
                .write()
                .await
                .insert(cache_key.to_string(), token.clone());
            Some(token)
        } else {
            None
        }
    }

    /// §4.1: durable cache TTL is `expires_in − 300 s`, not the raw
    /// remaining lifetime — the store entry goes stale 5 minutes before
    /// the token itself does, matching the `is_fresh` freshness bar so a
    /// store hit is never returned already under that bar.
    async fn remember(&self, cache_key: &str, token: &AcquiredToken) {
        self.inproc
            .write()
            .await
            .insert(cache_key.to_string(), token.clone());
        let ttl = (token.remaining() - chrono::Duration::minutes(5))
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        let _ = self
            .store
            .set(cache_key, json!(token), Some(ttl))
            .await;
    }

    async fn mint(&self, kind: TokenKind, scopes: &[&str]) -> Result<AcquiredToken, TokenError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.mint_once(kind, scopes).await {
                Ok(token) => return Ok(token),
                Err(TokenError::ConsentRequired) => return Err(TokenError::ConsentRequired),
                Err(TokenError::BadCredentials) => return Err(TokenError::BadCredentials),
                Err(err) if attempt >= MINT_MAX_ATTEMPTS => return Err(err),
                Err(_) => {
                    let base = 2u64.saturating_pow(attempt).min(MINT_RETRY_CAP_SECS);
                    let jittered = rand::thread_rng().gen_range(0..=base.max(1));
                    let sleep_for = (base + jittered).min(MINT_RETRY_CAP_SECS).max(1);
                    tokio::time::sleep(Duration::from_secs(sleep_for)).await;
                }
            }
        }
    }

    async fn mint_once(&self, kind: TokenKind, scopes: &[&str]) -> Result<AcquiredToken, TokenError> {
        let scope = scopes.join(" ");
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];
        match kind {
            TokenKind::Delegated => {
                form.push(("grant_type", "password"));
                form.push(("username", self.agent_username.as_str()));
                form.push(("password", self.agent_password.as_str()));
            }
            TokenKind::Application => {
                form.push(("grant_type", "client_credentials"));
            }
        }

        let response = self
            .http
            .post(self.token_endpoint())
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenError::Transient(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenError::Transient(e.to_string()))?;

        if status.is_success() {
            let parsed: TokenEndpointResponse = serde_json::from_str(&body)
                .map_err(|e| TokenError::Transient(format!("malformed token response: {e}")))?;
            return Ok(AcquiredToken {
                access_token: parsed.access_token,
                expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
            });
        }

        if status.as_u16() == 429 {
            return Err(TokenError::Throttled);
        }
        if status.is_server_error() {
            return Err(TokenError::Transient(format!("token endpoint {status}")));
        }

        let parsed: Option<TokenEndpointError> = serde_json::from_str(&body).ok();
        match parsed.as_ref().map(|e| e.error.as_str()) {
            Some("consent_required") | Some("interaction_required") => {
                Err(TokenError::ConsentRequired)
            }
            Some("invalid_grant") | Some("invalid_client") | Some("unauthorized_client") => {
                Err(TokenError::BadCredentials)
            }
            _ => Err(TokenError::Transient(
                parsed
                    .map(|e| e.error_description)
                    .unwrap_or(body),
            )),
        }
    }
}

fn scope_cache_key(kind: TokenKind, scopes: &[&str]) -> String {
    if kind == TokenKind::Delegated {
        let mut sorted: Vec<&str> = scopes.to_vec();
        sorted.sort_unstable();
        format!("tokens:delegated:{}", short_hash(&sorted.join(",")))
    } else {
        let mut sorted: Vec<&str> = scopes.to_vec();
        sorted.sort_unstable();
        format!("tokens:application:{}", short_hash(&sorted.join(",")))
    }
}

fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn temp_store() -> Arc<StoreGateway> {
        let path = std::env::temp_dir().join(format!("sync-core-tokens-{}.json", Uuid::new_v4()));
        Arc::new(StoreGateway::new(path).await.expect("store"))
    }

    #[tokio::test]
    async fn fresh_in_process_token_skips_network() {
        let store = temp_store().await;
        let cache = TokenCache::new(store, "t", "c", "s", "u", "p");
        let key = scope_cache_key(TokenKind::Application, &["Tasks.Read"]);
        cache
            .remember(
                &key,
                &AcquiredToken {
                    access_token: "tok-1".to_string(),
                    expires_at: Utc::now() + chrono::Duration::minutes(30),
                },
            )
            .await;
        let acquired = cache
            .acquire(TokenKind::Application, &["Tasks.Read"])
            .await
            .unwrap();
        assert_eq!(acquired.access_token, "tok-1");
    }

    #[tokio::test]
    async fn delegated_subset_miss_falls_back_to_superset() {
        let store = temp_store().await;
        let cache = TokenCache::new(store, "t", "c", "s", "u", "p");
        cache
            .remember(
                SUPERSET_CACHE_KEY,
                &AcquiredToken {
                    access_token: "superset-tok".to_string(),
                    expires_at: Utc::now() + chrono::Duration::minutes(30),
                },
            )
            .await;
        let acquired = cache
            .acquire(TokenKind::Delegated, &["Tasks.ReadWrite"])
            .await
            .unwrap();
        assert_eq!(acquired.access_token, "superset-tok");
    }

    #[test]
    fn scope_cache_key_is_order_independent() {
        let a = scope_cache_key(TokenKind::Application, &["b", "a"]);
        let b = scope_cache_key(TokenKind::Application, &["a", "b"]);
        assert_eq!(a, b);
    }
}
