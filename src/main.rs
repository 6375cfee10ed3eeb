//! Reauth Proxy - authenticating reverse proxy
//!
//! Starts the loopback admin API, the combined TLS/plaintext proxy listener
//! and the auth cache sweeper, then waits for a termination signal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reauth_proxy::admin::{run_admin_server, AdminState};
use reauth_proxy::auth_cache::{AuthCache, SWEEP_INTERVAL};
use reauth_proxy::config::{load_startup_config, ConfigStore};
use reauth_proxy::firewall::{FirewallManager, SystemRunner};
use reauth_proxy::http_listener::run_proxy_listener;
use reauth_proxy::proxy::ProxyCore;

/// Reauth Proxy - authenticating reverse proxy with TLS multiplexing
#[derive(Parser, Debug)]
#[command(name = "reauth-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Admin API port (bound to 127.0.0.1)
    #[arg(long, default_value_t = 9091, env = "REAUTH_ADMIN_PORT")]
    admin_port: u16,

    /// Proxy port (bound to 0.0.0.0, TLS and plaintext)
    #[arg(long, default_value_t = 9090, env = "REAUTH_PROXY_PORT")]
    proxy_port: u16,

    /// Lifetime of a positive auth result, in seconds
    #[arg(long, default_value_t = 60, env = "REAUTH_AUTH_CACHE_EXPIRE")]
    auth_cache_expire: u64,

    /// Persisted configuration file
    #[arg(short, long, default_value = "config.json", env = "REAUTH_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "REAUTH_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "REAUTH_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The upstream client and the TLS listener both rely on the process default
    let provider_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;
    if !provider_installed {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Reauth Proxy v{}", reauth_proxy::VERSION);

    let store = Arc::new(ConfigStore::new(&args.config));
    let config = load_startup_config(&store)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    let chain_name = config.chain_name.clone();

    let cache = Arc::new(AuthCache::new(std::time::Duration::from_secs(
        config.auth_config.cache_expire,
    )));
    let core = Arc::new(ProxyCore::new(store.clone(), config, cache.clone(), args.admin_port));

    // The CLI value wins over the persisted one and is written back
    core.set_cache_expire(args.auth_cache_expire)
        .context("Failed to persist auth cache expiry")?;

    let firewall = Arc::new(FirewallManager::new(
        Arc::new(SystemRunner::new()),
        chain_name.as_deref(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr = SocketAddr::from(([127, 0, 0, 1], args.admin_port));
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {}", admin_addr))?;
    let admin_state = Arc::new(AdminState {
        core: core.clone(),
        firewall: firewall.clone(),
    });
    let admin_shutdown = shutdown_rx.clone();
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = run_admin_server(admin_listener, admin_state, admin_shutdown).await {
            error!("Admin server error: {}", e);
        }
    });

    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], args.proxy_port));
    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("Failed to bind proxy listener on {}", proxy_addr))?;
    let proxy_core = core.clone();
    let proxy_shutdown = shutdown_rx.clone();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = run_proxy_listener(proxy_listener, proxy_core, proxy_shutdown).await {
            error!("Proxy listener error: {}", e);
        }
    });

    let sweeper = cache.spawn_sweeper(SWEEP_INTERVAL);

    print_startup_summary(&args, &core, &firewall.chain_name());

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down...");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down...");
        }
    }

    let _ = shutdown_tx.send(true);
    sweeper.abort();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    info!("Reauth Proxy shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()?;
    }

    Ok(())
}

/// Wait for SIGTERM or SIGQUIT
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigquit) = match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
        (Ok(term), Ok(quit)) => (term, quit),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to install signal handlers: {}", e);
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigquit.recv() => info!("Received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}

fn print_startup_summary(args: &Args, core: &ProxyCore, chain: &str) {
    let auth = core.auth_config();
    let rules = core.rules();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  Reauth Proxy v{}", reauth_proxy::VERSION);
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Proxy:         0.0.0.0:{} (TLS + plaintext)", args.proxy_port);
    info!("  Admin API:     127.0.0.1:{}", args.admin_port);
    info!("  Config:        {:?}", args.config);
    info!("  TLS:           {}", if core.has_certificate() { "certificate loaded" } else { "plaintext only" });
    info!("  Auth service:  127.0.0.1:{}{} (cache {}s)", auth.auth_port, auth.auth_url, auth.cache_expire);
    info!("  Default route: {}", core.default_route());
    info!("  Firewall:      chain {}", chain);
    info!("  Rules:         {} configured", rules.len());
    for rule in &rules {
        let auth_mark = if rule.use_auth { " [auth]" } else { "" };
        info!("    - {} -> {}{}", rule.path, rule.target, auth_mark);
    }
    info!("═══════════════════════════════════════════════════════════════");
}
