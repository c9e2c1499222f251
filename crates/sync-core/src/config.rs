use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;

/// Env-first configuration for the headless daemon. There is no
/// project/global/managed JSON layering here — this is a service, not an
/// editor — but missing required credentials are still a fatal,
/// `anyhow::Context`-wrapped startup error.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub agent_username: String,
    pub agent_password: String,
    pub agent_user_id: Option<String>,
    pub default_plan_id: Option<String>,
    pub user_name_map: HashMap<String, String>,
    pub planner_poll_interval: Duration,
    pub min_quick_poll_interval: Duration,
    pub upload_batch_size: usize,
    pub upload_batch_linger: Duration,
    pub max_tasks_per_plan: u32,
    pub housekeeping_dry_run: bool,
    pub notification_url: String,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let tenant_id = require_env("TENANT_ID")?;
        let client_id = require_env("CLIENT_ID")?;
        let client_secret = require_env("CLIENT_SECRET")?;
        let agent_username = require_env("AGENT_USERNAME")?;
        let agent_password = require_env("AGENT_PASSWORD")?;
        let notification_url = require_env("NOTIFICATION_URL")?;

        let agent_user_id = optional_env("AGENT_USER_ID");
        let default_plan_id = optional_env("DEFAULT_PLAN_ID");

        let user_name_map = match optional_env("USER_NAME_MAP") {
            Some(raw) => serde_json::from_str(&raw).context("USER_NAME_MAP is not valid JSON")?,
            None => HashMap::new(),
        };

        let planner_poll_interval = Duration::from_secs(parse_env_u64(
            "PLANNER_POLL_INTERVAL_SECONDS",
            3600,
        )?.max(300));
        let min_quick_poll_interval =
            Duration::from_secs(parse_env_u64("MIN_QUICK_POLL_INTERVAL_SECONDS", 300)?);
        let upload_batch_size = parse_env_u64("UPLOAD_BATCH_SIZE", 20)? as usize;
        let upload_batch_linger =
            Duration::from_millis(parse_env_u64("UPLOAD_BATCH_LINGER_MS", 100)?);
        let max_tasks_per_plan = parse_env_u64("MAX_TASKS_PER_PLANNER_PLAN", 200)? as u32;
        let housekeeping_dry_run = parse_env_bool("HOUSEKEEPING_DRY_RUN", true)?;

        Ok(Self {
            tenant_id,
            client_id,
            client_secret,
            agent_username,
            agent_password,
            agent_user_id,
            default_plan_id,
            user_name_map,
            planner_poll_interval,
            min_quick_poll_interval,
            upload_batch_size,
            upload_batch_linger,
            max_tasks_per_plan,
            housekeeping_dry_run,
            notification_url,
        })
    }

    pub fn reverse_user_name_map(&self) -> HashMap<String, String> {
        self.user_name_map
            .iter()
            .map(|(name, id)| (id.clone(), name.clone()))
            .collect()
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("missing required configuration option {key}"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env_u64(key: &str, default: u64) -> anyhow::Result<u64> {
    match optional_env(key) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{key} must be a non-negative integer")),
        None => Ok(default),
    }
}

fn parse_env_bool(key: &str, default: bool) -> anyhow::Result<bool> {
    match optional_env(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{key} must be a boolean-like value, got {raw:?}"),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_required_env() {
        std::env::set_var("TENANT_ID", "tenant-1");
        std::env::set_var("CLIENT_ID", "client-1");
        std::env::set_var("CLIENT_SECRET", "secret-1");
        std::env::set_var("AGENT_USERNAME", "agent@example.com");
        std::env::set_var("AGENT_PASSWORD", "hunter2");
        std::env::set_var("NOTIFICATION_URL", "https://example.com/webhook/planner");
    }

    fn clear_optional_env() {
        for key in [
            "AGENT_USER_ID",
            "DEFAULT_PLAN_ID",
            "USER_NAME_MAP",
            "PLANNER_POLL_INTERVAL_SECONDS",
            "MIN_QUICK_POLL_INTERVAL_SECONDS",
            "UPLOAD_BATCH_SIZE",
            "UPLOAD_BATCH_LINGER_MS",
            "MAX_TASKS_PER_PLANNER_PLAN",
            "HOUSEKEEPING_DRY_RUN",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_absent() {
        set_required_env();
        clear_optional_env();
        let config = EngineConfig::from_env().expect("config");
        assert_eq!(config.planner_poll_interval, Duration::from_secs(3600));
        assert_eq!(config.upload_batch_size, 20);
        assert!(config.housekeeping_dry_run);
    }

    #[test]
    fn poll_interval_is_floored_at_five_minutes() {
        set_required_env();
        clear_optional_env();
        std::env::set_var("PLANNER_POLL_INTERVAL_SECONDS", "10");
        let config = EngineConfig::from_env().expect("config");
        assert_eq!(config.planner_poll_interval, Duration::from_secs(300));
        std::env::remove_var("PLANNER_POLL_INTERVAL_SECONDS");
    }

    #[test]
    fn missing_required_var_is_a_fatal_error() {
        clear_optional_env();
        std::env::remove_var("TENANT_ID");
        std::env::remove_var("CLIENT_ID");
        std::env::remove_var("CLIENT_SECRET");
        std::env::remove_var("AGENT_USERNAME");
        std::env::remove_var("AGENT_PASSWORD");
        std::env::remove_var("NOTIFICATION_URL");
        assert!(EngineConfig::from_env().is_err());
    }

    #[test]
    fn user_name_map_parses_and_reverses() {
        set_required_env();
        clear_optional_env();
        std::env::set_var("USER_NAME_MAP", r#"{"Ann":"u-ann"}"#);
        let config = EngineConfig::from_env().expect("config");
        assert_eq!(config.user_name_map.get("Ann"), Some(&"u-ann".to_string()));
        assert_eq!(
            config.reverse_user_name_map().get("u-ann"),
            Some(&"Ann".to_string())
        );
        std::env::remove_var("USER_NAME_MAP");
    }
}
