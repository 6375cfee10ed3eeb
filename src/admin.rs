//! Loopback admin HTTP API
//!
//! Endpoints (all answer HTTP 200 with a JSON envelope):
//! - GET  /api/info - Version
//! - GET  /api/rules - List rules
//! - POST /api/rules - Add one rule (object) or several (array)
//! - POST /api/rules/delete - Remove a rule by `path` (query or body)
//! - POST /api/flush - Remove every rule
//! - GET/POST /api/config/default-route - Default route
//! - GET/POST /api/config/auth - Auth settings
//! - GET  /api/ssl - Certificate status
//! - POST /api/ssl - Install a PEM certificate and key
//! - POST /api/ssl/clear - Drop the certificate
//! - POST /api/iptables/{init,clean,flush,allow,block,remove,block-all,allow-all}
//! - GET  /api/iptables/list - Per-IP decisions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{AuthConfig, Rule};
use crate::error::{
    code_message, AdminError, FirewallError, CODE_BAD_REQUEST, CODE_INVALID_JSON,
    CODE_INTERNAL, CODE_INVALID_RULE, CODE_NOT_FOUND, CODE_SUCCESS,
};
use crate::firewall::{FirewallManager, IpRule, ParentChains, PortList};
use crate::proxy::ProxyCore;

/// Shared handles for admin handlers
pub struct AdminState {
    pub core: Arc<ProxyCore>,
    pub firewall: Arc<FirewallManager>,
}

/// `{success, code, message, data, timestamp}`
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    pub code: u32,
    pub message: String,
    pub data: Value,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn envelope(success: bool, code: u32, message: String, data: Value) -> Response {
    Json(Envelope {
        success,
        code,
        message,
        data,
        timestamp: now_millis(),
    })
    .into_response()
}

fn success(data: impl Serialize) -> Response {
    match serde_json::to_value(data) {
        Ok(data) => envelope(true, CODE_SUCCESS, code_message(CODE_SUCCESS).to_string(), data),
        Err(e) => failure(AdminError::Internal(e.to_string())),
    }
}

fn failure(err: AdminError) -> Response {
    let code = err.code();
    if (500..600).contains(&code) {
        error!("Admin request failed: {}", err);
    } else {
        warn!("Admin request rejected: {}", err);
    }
    envelope(false, code, err.to_string(), Value::Null)
}

fn reject(code: u32, message: impl Into<String>) -> Response {
    envelope(false, code, message.into(), Value::Null)
}

fn respond<T: Serialize>(result: Result<T, AdminError>) -> Response {
    match result {
        Ok(data) => success(data),
        Err(e) => failure(e),
    }
}

/// Build the admin router
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/api/info", get(info_handler))
        .route("/api/rules", get(list_rules_handler).post(add_rules_handler))
        .route("/api/rules/delete", post(remove_rule_handler))
        .route("/api/flush", post(flush_rules_handler))
        .route(
            "/api/config/default-route",
            get(get_default_route_handler).post(set_default_route_handler),
        )
        .route(
            "/api/config/auth",
            get(get_auth_config_handler).post(set_auth_config_handler),
        )
        .route("/api/ssl", get(ssl_status_handler).post(set_ssl_handler))
        .route("/api/ssl/clear", post(clear_ssl_handler))
        .route("/api/iptables/init", post(fw_init_handler))
        .route("/api/iptables/clean", post(fw_clean_handler))
        .route("/api/iptables/flush", post(fw_flush_handler))
        .route("/api/iptables/allow", post(fw_allow_handler))
        .route("/api/iptables/block", post(fw_block_handler))
        .route("/api/iptables/remove", post(fw_remove_handler))
        .route("/api/iptables/block-all", post(fw_block_all_handler))
        .route("/api/iptables/allow-all", post(fw_allow_all_handler))
        .route("/api/iptables/list", get(fw_list_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router until `shutdown` flips to true
pub async fn run_admin_server(
    listener: TcpListener,
    state: Arc<AdminState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("Admin API listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await
    .map_err(|e| anyhow::anyhow!("Admin server error: {e}"))
}

async fn not_found_handler() -> Response {
    reject(CODE_NOT_FOUND, "Resource Not Found")
}

#[derive(Serialize)]
struct InfoResponse {
    version: &'static str,
}

async fn info_handler() -> Response {
    success(InfoResponse {
        version: crate::VERSION,
    })
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Admin-submitted rule; omitted flags take admin defaults
#[derive(Debug, Deserialize)]
struct RuleRequest {
    #[serde(default)]
    path: String,
    #[serde(default)]
    target: String,
    use_auth: Option<bool>,
    strip_path: Option<bool>,
    rewrite_html: Option<bool>,
    use_root_mode: Option<bool>,
}

impl RuleRequest {
    fn into_rule(self) -> Rule {
        Rule {
            path: self.path,
            target: self.target,
            use_auth: self.use_auth.unwrap_or(false),
            strip_path: self.strip_path.unwrap_or(true),
            rewrite_html: self.rewrite_html.unwrap_or(true),
            use_root_mode: self.use_root_mode.unwrap_or(false),
        }
    }
}

async fn list_rules_handler(State(state): State<Arc<AdminState>>) -> Response {
    success(state.core.rules())
}

async fn add_rules_handler(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    let trimmed = body.trim_ascii();
    let single = !trimmed.starts_with(b"[");

    let requests: Vec<RuleRequest> = if single {
        match serde_json::from_slice::<RuleRequest>(trimmed) {
            Ok(request) => vec![request],
            Err(e) => return reject(CODE_INVALID_JSON, format!("Invalid JSON object: {}", e)),
        }
    } else {
        match serde_json::from_slice(trimmed) {
            Ok(requests) => requests,
            Err(e) => return reject(CODE_INVALID_JSON, format!("Invalid JSON array: {}", e)),
        }
    };

    let mut added = Vec::with_capacity(requests.len());
    for request in requests {
        if request.path.is_empty() || request.target.is_empty() {
            return reject(
                CODE_INVALID_RULE,
                format!(
                    "Path and Target are required for rule: path={:?} target={:?}",
                    request.path, request.target
                ),
            );
        }
        match state.core.add_rule(request.into_rule()).await {
            Ok(rule) => added.push(rule),
            Err(e) => return failure(e),
        }
    }

    if single && added.len() == 1 {
        success(&added[0])
    } else {
        success(added)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PathParam {
    #[serde(default)]
    path: String,
}

async fn remove_rule_handler(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<PathParam>,
    body: Bytes,
) -> Response {
    let mut path = query.path;
    if path.is_empty() {
        if let Ok(from_body) = serde_json::from_slice::<PathParam>(&body) {
            path = from_body.path;
        }
    }
    if path.is_empty() {
        return reject(CODE_BAD_REQUEST, "Path is required");
    }
    respond(state.core.remove_rule(&path).map(|_| Value::Null))
}

async fn flush_rules_handler(State(state): State<Arc<AdminState>>) -> Response {
    respond(state.core.flush_rules().map(|_| Value::Null))
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DefaultRouteRequest {
    #[serde(default)]
    default_route: String,
}

async fn get_default_route_handler(State(state): State<Arc<AdminState>>) -> Response {
    success(state.core.default_route())
}

async fn set_default_route_handler(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    let request: DefaultRouteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return reject(CODE_INVALID_JSON, "Invalid JSON object"),
    };
    if request.default_route.is_empty() {
        return reject(CODE_BAD_REQUEST, "default_route is required");
    }
    respond(state.core.set_default_route(&request.default_route).map(|_| Value::Null))
}

async fn get_auth_config_handler(State(state): State<Arc<AdminState>>) -> Response {
    success(state.core.auth_config())
}

async fn set_auth_config_handler(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    let config: AuthConfig = match serde_json::from_slice(&body) {
        Ok(config) => config,
        Err(e) => return reject(CODE_INVALID_JSON, format!("Invalid JSON object: {}", e)),
    };
    respond(state.core.set_auth_config(config))
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SslRequest {
    #[serde(default)]
    cert: String,
    #[serde(default)]
    key: String,
}

#[derive(Serialize)]
struct SslStatus {
    enabled: bool,
}

async fn ssl_status_handler(State(state): State<Arc<AdminState>>) -> Response {
    success(SslStatus {
        enabled: state.core.has_certificate(),
    })
}

async fn set_ssl_handler(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    let request: SslRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return reject(CODE_INVALID_JSON, "Invalid JSON object"),
    };
    if request.cert.is_empty() || request.key.is_empty() {
        return reject(CODE_BAD_REQUEST, "cert and key are required");
    }
    respond(
        state
            .core
            .set_certificate(&request.cert, &request.key)
            .map(|_| SslStatus { enabled: true }),
    )
}

async fn clear_ssl_handler(State(state): State<Arc<AdminState>>) -> Response {
    respond(
        state
            .core
            .clear_certificate()
            .map(|_| SslStatus { enabled: false }),
    )
}

// ---------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------

/// Run a blocking firewall operation off the async runtime
async fn with_firewall<T, F>(state: &AdminState, op: F) -> Result<T, AdminError>
where
    F: FnOnce(&FirewallManager) -> Result<T, FirewallError> + Send + 'static,
    T: Send + 'static,
{
    let firewall = state.firewall.clone();
    tokio::task::spawn_blocking(move || op(&firewall))
        .await
        .map_err(|e| AdminError::Internal(format!("firewall task failed: {}", e)))?
        .map_err(AdminError::from)
}

#[derive(Debug, Default, Deserialize)]
struct InitRequest {
    #[serde(default)]
    chain_name: Option<String>,
    #[serde(default)]
    parent_chain: Option<ParentChains>,
    #[serde(default)]
    exempt_ports: Option<PortList>,
}

async fn fw_init_handler(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    // A missing or malformed body initialises with the current settings
    let request = if body.trim_ascii().is_empty() {
        InitRequest::default()
    } else {
        serde_json::from_slice::<InitRequest>(&body).unwrap_or_else(|e| {
            warn!("Ignoring unparseable iptables init body: {}", e);
            InitRequest::default()
        })
    };

    let chain_name = request.chain_name.clone().filter(|c| !c.is_empty());
    let result = with_firewall(&state, move |fw| {
        fw.configure(
            request.chain_name,
            request.parent_chain.map(|p| p.0),
            request.exempt_ports.map(|p| p.0),
        );
        fw.init()
    })
    .await;
    if let Err(e) = result {
        return failure(e);
    }

    if let Some(chain) = chain_name {
        if let Err(e) = state.core.store().update(move |cfg| cfg.chain_name = Some(chain)) {
            return reject(CODE_INTERNAL, format!("Failed to save config: {}", e));
        }
    }
    success(Value::Null)
}

async fn fw_clean_handler(State(state): State<Arc<AdminState>>) -> Response {
    respond(with_firewall(&state, |fw| fw.destroy()).await.map(|_| Value::Null))
}

async fn fw_flush_handler(State(state): State<Arc<AdminState>>) -> Response {
    respond(with_firewall(&state, |fw| fw.flush()).await.map(|_| Value::Null))
}

async fn fw_block_all_handler(State(state): State<Arc<AdminState>>) -> Response {
    respond(with_firewall(&state, |fw| fw.block_all()).await.map(|_| Value::Null))
}

async fn fw_allow_all_handler(State(state): State<Arc<AdminState>>) -> Response {
    respond(with_firewall(&state, |fw| fw.allow_all()).await.map(|_| Value::Null))
}

async fn fw_list_handler(State(state): State<Arc<AdminState>>) -> Response {
    respond::<Vec<IpRule>>(with_firewall(&state, |fw| fw.list_rules()).await)
}

#[derive(Debug, Deserialize)]
struct IpRequest {
    #[serde(default)]
    ip: String,
}

#[derive(Clone, Copy)]
enum IpOp {
    Allow,
    Block,
    Remove,
}

async fn ip_operation(state: &AdminState, body: &[u8], op: IpOp) -> Response {
    let request: IpRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(_) => return reject(CODE_INVALID_JSON, "Invalid JSON body"),
    };
    if request.ip.is_empty() {
        return reject(CODE_BAD_REQUEST, "IP is required");
    }
    let ip = request.ip;
    let result = with_firewall(state, move |fw| match op {
        IpOp::Allow => fw.allow_ip(&ip),
        IpOp::Block => fw.block_ip(&ip),
        IpOp::Remove => fw.remove_ip(&ip),
    })
    .await;
    respond(result.map(|_| Value::Null))
}

async fn fw_allow_handler(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    ip_operation(&state, &body, IpOp::Allow).await
}

async fn fw_block_handler(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    ip_operation(&state, &body, IpOp::Block).await
}

async fn fw_remove_handler(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    ip_operation(&state, &body, IpOp::Remove).await
}
