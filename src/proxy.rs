//! Proxy core: live routing state, administrative mutators and the request path
//!
//! Routing rules, the default route, the auth settings and the certificate
//! slot sit behind one reader/writer lock. Requests take the read side for a
//! snapshot; administrative writes take the write side and persist through
//! the [`ConfigStore`] before the in-memory change becomes visible, so memory
//! and disk either both move or neither does.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{AuthGateway, AuthSubject};
use crate::auth_cache::AuthCache;
use crate::config::{AppConfig, AuthConfig, ConfigStore, Rule, DEFAULT_ROUTE};
use crate::error::{
    AdminError, RuleError, CODE_NOT_FOUND, CODE_PROXY_TARGET_INVALID, CODE_PROXY_TIMEOUT,
};
use crate::pages;
use crate::routing::{
    resolve, validate_rule_shape, validate_target, RouteDecision, RouteRequest, RoutingTable,
    AFFINITY_COOKIE,
};
use crate::tls::{parse_pem_pair, CertSlot};
use crate::transform::{
    affinity_cookie, dial_scheme, forward_headers, is_websocket_upgrade, needs_body_rewrite,
    outgoing_path, request_cookie, rewrite_response_headers, strip_hop_by_hop, target_authority,
    transform_html, ForwardContext,
};

/// Dial timeout for upstream connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
/// Bound on waiting for upstream response headers
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Pooled client for http, https, ws and wss targets
pub fn upstream_client() -> UpstreamClient {
    let mut http = HttpConnector::new();
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.set_nodelay(true);
    http.enforce_http(false);

    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .build(connector)
}

/// Live routing state guarded by the core's lock
#[derive(Debug, Clone)]
struct ProxyState {
    table: RoutingTable,
    default_route: String,
    auth: AuthConfig,
}

pub struct ProxyCore {
    state: RwLock<ProxyState>,
    store: Arc<ConfigStore>,
    certs: Arc<CertSlot>,
    gateway: AuthGateway,
    upstream: UpstreamClient,
    admin_port: u16,
}

impl ProxyCore {
    /// Build the core from a loaded configuration
    ///
    /// A persisted certificate that no longer parses is logged and skipped;
    /// the proxy then starts in plaintext mode.
    pub fn new(store: Arc<ConfigStore>, config: AppConfig, cache: Arc<AuthCache>, admin_port: u16) -> Self {
        let certs = Arc::new(CertSlot::new());
        if let Some((cert, key)) = config.cert_pair() {
            match parse_pem_pair(cert, key) {
                Ok(certified) => certs.install(Arc::new(certified)),
                Err(e) => warn!("Ignoring stored TLS certificate: {}", e),
            }
        }

        cache.set_ttl(Duration::from_secs(config.auth_config.cache_expire));

        Self {
            state: RwLock::new(ProxyState {
                table: RoutingTable::new(config.rules),
                default_route: config.default_route,
                auth: config.auth_config,
            }),
            store,
            certs,
            gateway: AuthGateway::new(cache),
            upstream: upstream_client(),
            admin_port,
        }
    }

    pub fn cert_slot(&self) -> &Arc<CertSlot> {
        &self.certs
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn auth_cache(&self) -> &Arc<AuthCache> {
        self.gateway.cache()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.state.read().table.rules().to_vec()
    }

    /// Validate and insert or replace a rule, keeping its table position
    pub async fn add_rule(&self, rule: Rule) -> Result<Rule, AdminError> {
        validate_rule_shape(&rule)?;
        // DNS lookups happen before the write lock is taken.
        validate_target(&rule.target, self.admin_port).await?;

        let mut state = self.state.write();
        let mut table = state.table.clone();
        let replaced = table.upsert(rule.clone());
        self.persist_rules(&table)?;
        state.table = table;

        info!(
            "{} rule {} -> {}",
            if replaced { "Updated" } else { "Added" },
            rule.path,
            rule.target
        );
        Ok(rule)
    }

    pub fn remove_rule(&self, path: &str) -> Result<(), AdminError> {
        let mut state = self.state.write();
        let mut table = state.table.clone();
        if !table.remove(path) {
            return Err(RuleError::NotFound(path.to_string()).into());
        }
        self.persist_rules(&table)?;
        state.table = table;
        info!("Removed rule {}", path);
        Ok(())
    }

    pub fn flush_rules(&self) -> Result<(), AdminError> {
        let mut state = self.state.write();
        let table = RoutingTable::default();
        self.persist_rules(&table)?;
        state.table = table;
        info!("Flushed all rules");
        Ok(())
    }

    fn persist_rules(&self, table: &RoutingTable) -> Result<(), AdminError> {
        let rules = table.rules().to_vec();
        self.store.update(move |cfg| cfg.rules = rules)?;
        Ok(())
    }

    pub fn default_route(&self) -> String {
        self.state.read().default_route.clone()
    }

    /// An empty route resets to the route selector
    pub fn set_default_route(&self, route: &str) -> Result<String, AdminError> {
        let route = if route.is_empty() { DEFAULT_ROUTE } else { route }.to_string();
        let mut state = self.state.write();
        let persisted = route.clone();
        self.store.update(move |cfg| cfg.default_route = persisted)?;
        state.default_route = route.clone();
        info!("Default route set to {}", route);
        Ok(route)
    }

    pub fn auth_config(&self) -> AuthConfig {
        self.state.read().auth.clone()
    }

    /// Replace the auth settings; zero fields fall back to defaults
    pub fn set_auth_config(&self, config: AuthConfig) -> Result<AuthConfig, AdminError> {
        let config = config.with_defaults();
        let mut state = self.state.write();
        let persisted = config.clone();
        self.store.update(move |cfg| cfg.auth_config = persisted)?;
        self.gateway
            .cache()
            .set_ttl(Duration::from_secs(config.cache_expire));
        state.auth = config.clone();
        info!(
            "Auth config updated: port {} verify {} (cache {}s)",
            config.auth_port, config.auth_url, config.cache_expire
        );
        Ok(config)
    }

    /// Override the positive-result lifetime and persist it
    pub fn set_cache_expire(&self, secs: u64) -> Result<AuthConfig, AdminError> {
        let mut config = self.auth_config();
        config.cache_expire = secs;
        self.set_auth_config(config)
    }

    /// Validate and install a certificate, persisting the PEM pair
    pub fn set_certificate(&self, cert_pem: &str, key_pem: &str) -> Result<(), AdminError> {
        let certified = Arc::new(parse_pem_pair(cert_pem, key_pem)?);
        let _state = self.state.write();
        let (cert, key) = (cert_pem.to_string(), key_pem.to_string());
        self.store.update(move |cfg| {
            cfg.ssl_cert = Some(cert);
            cfg.ssl_key = Some(key);
        })?;
        self.certs.install(certified);
        Ok(())
    }

    pub fn clear_certificate(&self) -> Result<(), AdminError> {
        let _state = self.state.write();
        self.store.update(|cfg| {
            cfg.ssl_cert = None;
            cfg.ssl_key = None;
        })?;
        self.certs.clear();
        Ok(())
    }

    pub fn has_certificate(&self) -> bool {
        self.certs.has_cert()
    }

    /// Route one request from the listener
    pub async fn handle(&self, request: Request<Body>, peer: SocketAddr, is_tls: bool) -> Response<Body> {
        let headers = request.headers();
        let path = request.uri().path();

        let (decision, auth, rules) = {
            let state = self.state.read();
            let route_request = RouteRequest {
                method: request.method().clone(),
                path,
                query: request.uri().query(),
                affinity_cookie: request_cookie(headers, AFFINITY_COOKIE),
                referer: headers.get(header::REFERER).and_then(|v| v.to_str().ok()),
                has_origin: headers.contains_key(header::ORIGIN),
                is_websocket: is_websocket_upgrade(headers),
            };
            let decision = resolve(&state.table, &state.default_route, &route_request);
            (decision, state.auth.clone(), state.table.rules().to_vec())
        };

        debug!("{} {} -> {:?}", request.method(), path, decision);

        match decision {
            RouteDecision::Select => {
                if rules.iter().any(|r| r.use_auth) {
                    if let Some(denied) = self.gate(&auth, request.headers(), request.uri(), peer, is_tls).await {
                        return denied;
                    }
                }
                pages::select_page(&rules)
            }
            RouteDecision::AuthPassthrough => {
                self.gateway.passthrough(&auth, request, peer.ip()).await
            }
            RouteDecision::SlashRedirect(location) => redirect(StatusCode::MOVED_PERMANENTLY, &location),
            RouteDecision::RootMode(rule) => {
                let mut response = redirect(StatusCode::FOUND, "/");
                if let Some(cookie) = affinity_cookie(&rule.path) {
                    response.headers_mut().append(header::SET_COOKIE, cookie);
                }
                response
            }
            RouteDecision::Welcome => pages::welcome_page(),
            RouteDecision::DefaultRedirect(location) => redirect(StatusCode::FOUND, &location),
            RouteDecision::NotFound => pages::error_page(CODE_NOT_FOUND, "Not Found", &rules),
            RouteDecision::Proxy(rule) => {
                if rule.use_auth {
                    if let Some(denied) = self.gate(&auth, request.headers(), request.uri(), peer, is_tls).await {
                        return denied;
                    }
                }
                self.forward(&rule, request, peer, is_tls, &rules).await
            }
        }
    }

    async fn gate(
        &self,
        auth: &AuthConfig,
        headers: &HeaderMap,
        uri: &Uri,
        peer: SocketAddr,
        is_tls: bool,
    ) -> Option<Response<Body>> {
        let subject = AuthSubject {
            headers,
            uri,
            client_ip: peer.ip(),
            is_tls,
        };
        self.gateway.gate(auth, &subject).await
    }

    async fn forward(
        &self,
        rule: &Rule,
        mut request: Request<Body>,
        peer: SocketAddr,
        is_tls: bool,
        rules: &[Rule],
    ) -> Response<Body> {
        let target = match Url::parse(&rule.target) {
            Ok(target) if target.host_str().is_some() => target,
            _ => {
                return pages::error_page(
                    CODE_PROXY_TARGET_INVALID,
                    "Invalid target URL configuration",
                    rules,
                )
            }
        };

        let upgrade = is_websocket_upgrade(request.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let (parts, body) = request.into_parts();
        let uri = upstream_uri(&target, rule, parts.uri.path(), parts.uri.query());
        let original_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.authority().map(|a| a.as_str()));
        let headers = forward_headers(
            &parts.headers,
            &ForwardContext {
                rule,
                target: &target,
                client_ip: peer.ip(),
                original_host,
                is_tls,
            },
        );

        let is_head = parts.method == Method::HEAD;
        let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        let upstream_request = match builder.body(body) {
            Ok(req) => req,
            Err(e) => {
                return pages::error_page(
                    CODE_PROXY_TARGET_INVALID,
                    &format!("Failed to build upstream request: {}", e),
                    rules,
                )
            }
        };

        debug!("Forwarding {} {} -> {}", parts.method, parts.uri, uri);

        let mut response = match tokio::time::timeout(
            RESPONSE_HEADER_TIMEOUT,
            self.upstream.request(upstream_request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let reason = error_chain(&e);
                warn!("Proxy error for {}: {}", uri, reason);
                return pages::error_page(
                    CODE_PROXY_TIMEOUT,
                    &format!("Upstream unavailable: {}", reason),
                    rules,
                );
            }
            Err(_) => {
                warn!("Proxy error for {}: timed out waiting for response headers", uri);
                return pages::error_page(
                    CODE_PROXY_TIMEOUT,
                    "Upstream unavailable: timeout awaiting response headers",
                    rules,
                );
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(splice_upgrade(client_upgrade, upstream_upgrade));
                let (mut parts, _) = response.into_parts();
                if let Some(cookie) = affinity_cookie(&rule.path) {
                    parts.headers.append(header::SET_COOKIE, cookie);
                }
                return Response::from_parts(parts, Body::empty());
            }
        }

        let (mut parts, incoming) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        rewrite_response_headers(&mut parts.headers, rule);

        let encoded = parts
            .headers
            .get(header::CONTENT_ENCODING)
            .is_some_and(|v| v != "identity");
        if is_head
            || encoded
            || !needs_body_rewrite(rule, &parts.headers)
        {
            return Response::from_parts(parts, Body::new(incoming));
        }

        let bytes = match incoming.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Failed to read upstream body from {}: {}", uri, e);
                return pages::error_page(
                    CODE_PROXY_TIMEOUT,
                    &format!("Upstream unavailable: {}", e),
                    rules,
                );
            }
        };

        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(text) => {
                let toolbar = rule.use_auth.then(|| pages::toolbar_html(rules, &rule.path));
                transform_html(&text, rule, toolbar.as_deref()).into_bytes()
            }
            Err(_) => bytes.to_vec(),
        };

        parts.headers.remove(header::TRANSFER_ENCODING);
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        Response::from_parts(parts, Body::from(body))
    }
}

fn redirect(status: StatusCode, location: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    if let Ok(v) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, v);
    }
    response
}

/// Absolute upstream URI: target base path joined with the (stripped) request path
fn upstream_uri(target: &Url, rule: &Rule, path: &str, query: Option<&str>) -> String {
    let base = target.path().trim_end_matches('/');
    let mut uri = format!(
        "{}://{}{}{}",
        dial_scheme(target),
        target_authority(target),
        base,
        outgoing_path(rule, path)
    );
    match (target.query(), query) {
        (Some(tq), Some(q)) => uri.push_str(&format!("?{}&{}", tq, q)),
        (Some(q), None) | (None, Some(q)) => uri.push_str(&format!("?{}", q)),
        (None, None) => {}
    }
    uri
}

/// Flatten an error and its sources into one line
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

async fn splice_upgrade(client: hyper::upgrade::OnUpgrade, upstream: hyper::upgrade::OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Upgrade failed: {}", e);
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((up, down)) => debug!("Upgraded connection closed ({} bytes up, {} down)", up, down),
        Err(e) => debug!("Upgraded connection ended: {}", e),
    }
}
