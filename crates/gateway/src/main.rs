use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use vox_domain::config::{Config, ConfigSeverity};
use vox_gateway::ai::AiClient;
use vox_gateway::api;
use vox_gateway::cli::{Cli, Command, ConfigCommand};
use vox_gateway::state::AppState;
use vox_gateway::telephony::RestTelephonyClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(Arc::new(Config::from_env())).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            if !vox_gateway::cli::validate(&Config::from_env()) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            vox_gateway::cli::show(&Config::from_env());
            Ok(())
        }
        Some(Command::Version) => {
            println!("voxflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vox_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("voxflow starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if Config::has_errors(&issues) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Provider clients ─────────────────────────────────────────────
    let telephony =
        Arc::new(RestTelephonyClient::new(&config).context("initializing telephony client")?);
    let ai = Arc::new(AiClient::new(&config).context("initializing ai client")?);
    tracing::info!(
        account_sid = %config.telephony.account_sid,
        agent_id = %config.ai.agent_id,
        "provider clients ready"
    );

    // ── State assembly ───────────────────────────────────────────────
    let state =
        AppState::assemble(config.clone(), telephony, ai).context("assembling components")?;
    tracing::info!("stores, bus, arbiter, bridge, engine ready");

    // ── Background maintenance ───────────────────────────────────────
    state.spawn_maintenance();
    tracing::info!("maintenance tasks started (call flush 5s, lock sweeper 30s)");

    // ── Graceful restart: rebuild active campaign runtimes ──────────
    state.engine.recover();

    // ── Middleware stack ─────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_concurrent = std::env::var("MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);

    let governor_layer = config.server.rate_limit_rps.map(|rps| {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(rps)
            .burst_size(config.server.rate_limit_burst)
            .finish()
            .expect("rate limit: rps and burst must be > 0");
        tracing::info!(rps, burst = config.server.rate_limit_burst, "per-IP rate limiting enabled");
        GovernorLayer {
            config: Arc::new(gov_config),
        }
    });

    // ── Router ───────────────────────────────────────────────────────
    let router = api::router(state.clone())
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = if let Some(gov) = governor_layer {
        router.layer(gov).with_state(state.clone())
    } else {
        router.with_state(state.clone())
    };

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, public_url = %config.server.public_url, "voxflow listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // Stop tickers, let in-flight cycles finish their step, flush.
    tracing::info!("shutting down");
    state.engine.shutdown();
    state.calls.flush_if_dirty().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("ctrl-c received");
}
