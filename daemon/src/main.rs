use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sync_core::token_cache::TokenCache;
use sync_core::{Bus, Crosswalk, EngineConfig, PlannerApi, RateGovernor, StoreGateway, SyncEngine, TokenError, TokenKind};
use sync_planner::PlannerClient;
use sync_server::AppState;
use sync_subscriptions::SubscriptionManager;

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Headless planner/task sync service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the sync engine and webhook router until terminated.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        hostname: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
        #[arg(long, env = "STATE_DIR", default_value = ".sync-daemon")]
        state_dir: String,
    },
    /// Runs the initial full sync pass once, then exits — useful for
    /// smoke-testing credentials and plan access without standing up
    /// the webhook listener.
    SyncOnce {
        #[arg(long, env = "STATE_DIR", default_value = ".sync-daemon")]
        state_dir: String,
    },
}

const CONFIG_ERROR: u8 = 1;
const STORE_UNREACHABLE: u8 = 2;
const TOKEN_FATAL: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let logs_dir = sync_observability::canonical_logs_dir_from_root(&PathBuf::from(
        std::env::var("STATE_DIR").unwrap_or_else(|_| ".sync-daemon".to_string()),
    ));
    let _guard = match sync_observability::init_logging(&logs_dir, 14) {
        Ok((guard, info)) => {
            tracing::info!(logs_dir = %info.logs_dir, "logging initialized");
            Some(guard)
        }
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            None
        }
    };

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(DaemonError::Config(err)) => {
            error!(error = %err, "configuration error");
            ExitCode::from(CONFIG_ERROR)
        }
        Err(DaemonError::StoreUnreachable(err)) => {
            error!(error = %err, "store unreachable after retrying for 60s");
            ExitCode::from(STORE_UNREACHABLE)
        }
        Err(DaemonError::TokenFatal(err)) => {
            error!(error = %err, "token acquisition fatal at startup");
            ExitCode::from(TOKEN_FATAL)
        }
    }
}

enum DaemonError {
    Config(anyhow::Error),
    StoreUnreachable(anyhow::Error),
    TokenFatal(String),
}

async fn run() -> Result<(), DaemonError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let components = bootstrap(&state_dir).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")
                .map_err(DaemonError::Config)?;
            serve(addr, components).await;
            Ok(())
        }
        Command::SyncOnce { state_dir } => {
            let components = bootstrap(&state_dir).await?;
            let (tasks, cancel) = components.engine.start();
            // The initial sync pass is spawned as part of `start`; give it a
            // generous window to finish, then tear everything back down.
            tokio::time::sleep(Duration::from_secs(30)).await;
            components.engine.stop(cancel, tasks).await;
            Ok(())
        }
    }
}

struct Components {
    store: Arc<StoreGateway>,
    bus: Bus,
    governor: Arc<RateGovernor>,
    crosswalk: Arc<Crosswalk>,
    planner: Arc<dyn PlannerApi>,
    engine: Arc<SyncEngine>,
    subscriptions: Arc<SubscriptionManager>,
    config: Arc<EngineConfig>,
}

const PLANNER_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

async fn bootstrap(state_dir: &str) -> Result<Components, DaemonError> {
    let config = Arc::new(EngineConfig::from_env().map_err(DaemonError::Config)?);

    let store = Arc::new(open_store_with_retry(state_dir).await?);
    let bus = Bus::new();
    let governor = RateGovernor::new();
    let crosswalk = Arc::new(Crosswalk::new(store.clone()));

    let tokens = Arc::new(TokenCache::new(
        store.clone(),
        config.tenant_id.clone(),
        config.client_id.clone(),
        config.client_secret.clone(),
        config.agent_username.clone(),
        config.agent_password.clone(),
    ));

    verify_credentials(&tokens).await?;

    let planner: Arc<dyn PlannerApi> = Arc::new(PlannerClient::new(
        PLANNER_BASE_URL,
        tokens.clone(),
        governor.clone(),
    ));

    let engine = SyncEngine::new(
        config.clone(),
        store.clone(),
        bus.clone(),
        governor.clone(),
        crosswalk.clone(),
        planner.clone(),
    );

    let subscriptions = Arc::new(SubscriptionManager::new(
        PLANNER_BASE_URL,
        config.notification_url.clone(),
        tokens,
        governor.clone(),
        store.clone(),
        planner.clone(),
    ));

    Ok(Components {
        store,
        bus,
        governor,
        crosswalk,
        planner,
        engine,
        subscriptions,
        config,
    })
}

/// §6 exit code 2: the store is a local JSON file, but a hostile
/// filesystem (read-only mount, permissions) can still make it
/// unreachable. Retries with backoff for up to a minute before giving up.
async fn open_store_with_retry(state_dir: &str) -> Result<StoreGateway, DaemonError> {
    let path = PathBuf::from(state_dir).join("store.json");
    let deadline = Instant::now() + Duration::from_secs(60);
    let mut attempt = 0u32;

    loop {
        match StoreGateway::new(&path).await {
            Ok(store) => return Ok(store),
            Err(err) if Instant::now() >= deadline => {
                return Err(DaemonError::StoreUnreachable(err));
            }
            Err(err) => {
                warn!(error = %err, attempt, "store unreachable, retrying");
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt).min(10));
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// §6 exit code 3: a fatal credential problem at startup should fail fast
/// rather than let every downstream loop discover it independently.
async fn verify_credentials(tokens: &TokenCache) -> Result<(), DaemonError> {
    match tokens.acquire(TokenKind::Delegated, &["User.Read"]).await {
        Ok(_) => Ok(()),
        Err(TokenError::ConsentRequired) => {
            Err(DaemonError::TokenFatal("consent_required".to_string()))
        }
        Err(TokenError::BadCredentials) => {
            Err(DaemonError::TokenFatal("bad_credentials".to_string()))
        }
        // Throttled/Transient at startup are not fatal — the token cache's
        // own retry-with-backoff already absorbed what it could; downstream
        // loops will keep trying rather than blocking startup further.
        Err(_) => Ok(()),
    }
}

async fn serve(addr: SocketAddr, components: Components) {
    let Components {
        store,
        bus,
        governor: _governor,
        crosswalk: _crosswalk,
        planner: _planner,
        engine,
        subscriptions,
        config,
    } = components;

    let (engine_tasks, engine_cancel) = engine.start();
    let subscriptions_cancel = CancellationToken::new();
    let release_on_shutdown = std::env::var("RELEASE_ON_SHUTDOWN")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    let subscriptions_handle = tokio::spawn({
        let subscriptions = subscriptions.clone();
        let cancel = subscriptions_cancel.clone();
        async move { subscriptions.run(cancel, release_on_shutdown).await }
    });

    let dedup = Arc::new(sync_server::DedupWindow::new());
    let app_state = AppState {
        store: store.clone(),
        bus: Arc::new(bus.clone()),
        subscriptions: subscriptions.clone(),
        dedup,
    };

    info!(%addr, notification_url = %config.notification_url, "sync-daemon listening");

    let http = tokio::spawn(sync_server::serve(addr, app_state));

    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");

    // §5 shutdown sequence: stop accepting new webhook work, drain the
    // upload batch, write the final health snapshot, then release
    // subscriptions only if explicitly requested.
    http.abort();
    engine.stop(engine_cancel, engine_tasks).await;
    subscriptions_cancel.cancel();
    let _ = subscriptions_handle.await;
}
