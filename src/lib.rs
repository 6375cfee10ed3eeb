//! Reauth Proxy - authenticating reverse proxy
//!
//! - Routes path prefixes to internal HTTP/WebSocket services
//! - Gates selected routes behind a loopback auth service with a result cache
//! - Serves TLS and plaintext on one port with live certificate rotation
//! - Manages an iptables chain for per-IP allow/block decisions
//! - Exposes a loopback-only admin API for all of the above

pub mod admin;
pub mod auth;
pub mod auth_cache;
pub mod config;
pub mod error;
pub mod firewall;
pub mod http_listener;
pub mod pages;
pub mod proxy;
pub mod routing;
pub mod tls;
pub mod transform;

// Re-export commonly used types
pub use admin::{run_admin_server, AdminState};
pub use auth_cache::AuthCache;
pub use config::{AppConfig, AuthConfig, ConfigStore, Rule};
pub use firewall::{CommandRunner, FirewallManager, SystemRunner};
pub use http_listener::run_proxy_listener;
pub use proxy::ProxyCore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
