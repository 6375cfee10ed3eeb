//! Authentication gateway
//!
//! Admits or denies a request by asking the loopback auth service, with a
//! positive-result cache in front of it. A denial redirects to the login
//! page carrying the original URL; an unreachable or misbehaving auth
//! service renders an error page instead, so a dead backend can never cause
//! a redirect loop.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::auth_cache::{fingerprint, AuthCache};
use crate::config::{AuthConfig, DEFAULT_AUTH_URL, DEFAULT_LOGIN_URL, DEFAULT_LOGOUT_URL};
use crate::error::{CODE_INTERNAL, CODE_PROXY_AUTH_FAILED};
use crate::pages;
use crate::routing::AUTH_PREFIX;
use crate::transform::strip_hop_by_hop;

/// Bound on a single verification round trip
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on pass-through requests waiting for response headers
pub const PASSTHROUGH_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);

/// Body returned by the verification endpoint
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
}

/// Result of one verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Admit,
    Deny,
    /// The service could not give an answer; rendered, never redirected
    Unavailable { code: u32, message: String },
}

/// Identity and addressing of the request being checked
pub struct AuthSubject<'a> {
    pub headers: &'a HeaderMap,
    pub uri: &'a Uri,
    pub client_ip: IpAddr,
    pub is_tls: bool,
}

pub struct AuthGateway {
    client: Client<HttpConnector, Body>,
    cache: Arc<AuthCache>,
}

impl AuthGateway {
    pub fn new(cache: Arc<AuthCache>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { client, cache }
    }

    pub fn cache(&self) -> &Arc<AuthCache> {
        &self.cache
    }

    /// Ask the auth service whether the subject is signed in
    pub async fn check(&self, config: &AuthConfig, subject: &AuthSubject<'_>) -> AuthOutcome {
        if config.auth_port == 0 {
            return AuthOutcome::Unavailable {
                code: CODE_INTERNAL,
                message: "Authentication Service Not Configured".to_string(),
            };
        }

        let cookie = header_str(subject.headers, header::COOKIE);
        let authorization = header_str(subject.headers, header::AUTHORIZATION);
        let key = fingerprint(cookie, authorization);

        if self.cache.get(&key) == Some(true) {
            debug!("Auth cache hit");
            return AuthOutcome::Admit;
        }

        let outcome = self.verify(config, subject, cookie, authorization).await;
        if outcome == AuthOutcome::Admit {
            self.cache.set(key, true);
        }
        outcome
    }

    async fn verify(
        &self,
        config: &AuthConfig,
        subject: &AuthSubject<'_>,
        cookie: &str,
        authorization: &str,
    ) -> AuthOutcome {
        let url = format!(
            "http://127.0.0.1:{}{}",
            config.auth_port,
            leading_slash(&config.auth_url, DEFAULT_AUTH_URL)
        );
        let ip = subject.client_ip.to_string();

        let mut builder = Request::get(&url)
            .header("x-real-ip", &ip)
            .header("x-forwarded-for", &ip);
        if !cookie.is_empty() {
            builder = builder.header(header::COOKIE, cookie);
        }
        if !authorization.is_empty() {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        let request = match builder.body(Body::empty()) {
            Ok(request) => request,
            Err(e) => {
                return AuthOutcome::Unavailable {
                    code: CODE_INTERNAL,
                    message: format!("Internal Server Error during Auth: {}", e),
                }
            }
        };

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| e.to_string())?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| e.to_string())?
                .to_bytes();
            Ok::<_, String>((status, body))
        };

        let (status, body) = match tokio::time::timeout(AUTH_TIMEOUT, exchange).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("Auth request to {} failed: {}", url, e);
                return unavailable();
            }
            Err(_) => {
                warn!("Auth request to {} timed out after {:?}", url, AUTH_TIMEOUT);
                return unavailable();
            }
        };

        if !status.is_success() {
            debug!("Auth service answered {}", status);
            return AuthOutcome::Deny;
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return AuthOutcome::Admit;
        }

        match serde_json::from_slice::<VerifyResponse>(&body) {
            Ok(verdict) if verdict.success => AuthOutcome::Admit,
            Ok(verdict) => {
                info!("Auth failed: {}", verdict.message);
                AuthOutcome::Deny
            }
            Err(e) => {
                warn!("Failed to decode auth response: {}", e);
                AuthOutcome::Unavailable {
                    code: CODE_PROXY_AUTH_FAILED,
                    message: "Invalid Auth Response Format".to_string(),
                }
            }
        }
    }

    /// Gate a request; `None` admits, `Some` is the response to send instead
    pub async fn gate(&self, config: &AuthConfig, subject: &AuthSubject<'_>) -> Option<Response<Body>> {
        match self.check(config, subject).await {
            AuthOutcome::Admit => None,
            AuthOutcome::Deny => {
                let original = original_url(subject.headers, subject.uri, subject.is_tls);
                let location = login_location(config, &original);
                Some(found(&location))
            }
            AuthOutcome::Unavailable { code, message } => {
                Some(pages::error_page(code, &message, &[]))
            }
        }
    }

    /// Forward a `/__auth__/*` request to the auth service
    pub async fn passthrough(
        &self,
        config: &AuthConfig,
        request: Request<Body>,
        client_ip: IpAddr,
    ) -> Response<Body> {
        if config.auth_port == 0 {
            return pages::error_page(CODE_INTERNAL, "Authentication service is not configured", &[]);
        }

        let (parts, body) = request.into_parts();
        let path = passthrough_path(config, parts.uri.path());
        let path_and_query = match parts.uri.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };
        let authority = format!("127.0.0.1:{}", config.auth_port);
        let url = format!("http://{}{}", authority, path_and_query);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        let ip = client_ip.to_string();
        if let Ok(v) = HeaderValue::from_str(&ip) {
            headers.insert("x-real-ip", v.clone());
            headers.insert("x-forwarded-for", v);
        }
        if let Ok(v) = HeaderValue::from_str(&authority) {
            headers.insert(header::HOST, v);
        }

        let mut builder = Request::builder().method(parts.method).uri(&url);
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        let request = match builder.body(body) {
            Ok(request) => request,
            Err(e) => {
                return pages::error_page(CODE_INTERNAL, &format!("Failed to build request: {}", e), &[])
            }
        };

        debug!("Auth pass-through to {}", url);
        match tokio::time::timeout(PASSTHROUGH_TIMEOUT, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let (mut parts, incoming) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(incoming))
            }
            Ok(Err(e)) => {
                warn!("Auth pass-through to {} failed: {}", url, e);
                pages::error_page(CODE_PROXY_AUTH_FAILED, "Authentication Service Unavailable", &[])
            }
            Err(_) => {
                warn!("Auth pass-through to {} timed out", url);
                pages::error_page(CODE_PROXY_AUTH_FAILED, "Authentication Service Unavailable", &[])
            }
        }
    }
}

fn unavailable() -> AuthOutcome {
    AuthOutcome::Unavailable {
        code: CODE_PROXY_AUTH_FAILED,
        message: "Authentication Service Unavailable".to_string(),
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn leading_slash(path: &str, fallback: &str) -> String {
    let path = if path.is_empty() { fallback } else { path };
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn found(location: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(v) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, v);
    }
    response
}

/// Map a `/__auth__/*` path onto the auth service
pub fn passthrough_path(config: &AuthConfig, path: &str) -> String {
    match path {
        "/__auth__/login" => leading_slash(&config.login_url, DEFAULT_LOGIN_URL),
        "/__auth__/logout" | "/__auth__/api/auth/logout" => {
            leading_slash(&config.logout_url, DEFAULT_LOGOUT_URL)
        }
        other => leading_slash(other.strip_prefix(AUTH_PREFIX).unwrap_or(other), "/"),
    }
}

/// Absolute URL of the request as the browser addressed it
pub fn original_url(headers: &HeaderMap, uri: &Uri, is_tls: bool) -> String {
    let forwarded_https = header_str(headers, header::HeaderName::from_static("x-forwarded-proto"))
        .eq_ignore_ascii_case("https");
    let scheme = if is_tls || forwarded_https { "https" } else { "http" };

    let forwarded_host = header_str(headers, header::HeaderName::from_static("x-forwarded-host"));
    let host = if !forwarded_host.is_empty() {
        forwarded_host
    } else {
        let host = header_str(headers, header::HOST);
        if host.is_empty() {
            uri.authority().map(|a| a.as_str()).unwrap_or_default()
        } else {
            host
        }
    };

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme, host, path_and_query)
}

/// Login page location carrying `redirect_uri`
pub fn login_location(config: &AuthConfig, original: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("redirect_uri", original)
        .finish();

    let login = &config.login_url;
    let base = if login.starts_with("http://") || login.starts_with("https://") {
        login.clone()
    } else {
        format!("{}{}", AUTH_PREFIX, leading_slash(login, DEFAULT_LOGIN_URL))
    };
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, sep, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn_auth_service(status: StatusCode, body: &'static str) -> (u16, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/auth/verify",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (status, body)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (port, hits)
    }

    fn config(port: u16) -> AuthConfig {
        AuthConfig {
            auth_port: port,
            ..AuthConfig::default()
        }
        .with_defaults()
    }

    fn subject<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> AuthSubject<'a> {
        AuthSubject {
            headers,
            uri,
            client_ip: "127.0.0.1".parse().unwrap(),
            is_tls: false,
        }
    }

    #[tokio::test]
    async fn test_positive_result_is_cached() {
        let (port, hits) = spawn_auth_service(StatusCode::OK, r#"{"success":true}"#).await;
        let gateway = AuthGateway::new(Arc::new(AuthCache::new(Duration::from_secs(60))));
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("session=ok"));
        let uri: Uri = "/app/".parse().unwrap();

        assert_eq!(gateway.check(&config(port), &subject(&headers, &uri)).await, AuthOutcome::Admit);
        assert_eq!(gateway.check(&config(port), &subject(&headers, &uri)).await, AuthOutcome::Admit);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denial_is_not_cached() {
        let (port, hits) = spawn_auth_service(StatusCode::UNAUTHORIZED, "").await;
        let gateway = AuthGateway::new(Arc::new(AuthCache::new(Duration::from_secs(60))));
        let headers = HeaderMap::new();
        let uri: Uri = "/app/".parse().unwrap();

        assert_eq!(gateway.check(&config(port), &subject(&headers, &uri)).await, AuthOutcome::Deny);
        assert_eq!(gateway.check(&config(port), &subject(&headers, &uri)).await, AuthOutcome::Deny);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_success_false_denies() {
        let (port, _) = spawn_auth_service(StatusCode::OK, r#"{"success":false,"message":"expired"}"#).await;
        let gateway = AuthGateway::new(Arc::new(AuthCache::new(Duration::from_secs(60))));
        let headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(gateway.check(&config(port), &subject(&headers, &uri)).await, AuthOutcome::Deny);
    }

    #[tokio::test]
    async fn test_garbage_body_is_unavailable() {
        let (port, _) = spawn_auth_service(StatusCode::OK, "<html>oops</html>").await;
        let gateway = AuthGateway::new(Arc::new(AuthCache::new(Duration::from_secs(60))));
        let headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        assert!(matches!(
            gateway.check(&config(port), &subject(&headers, &uri)).await,
            AuthOutcome::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service_renders_page() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let gateway = AuthGateway::new(Arc::new(AuthCache::new(Duration::from_secs(60))));
        let headers = HeaderMap::new();
        let uri: Uri = "/app/".parse().unwrap();
        let response = gateway.gate(&config(port), &subject(&headers, &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn test_denial_redirects_to_login() {
        let (port, _) = spawn_auth_service(StatusCode::UNAUTHORIZED, "").await;
        let gateway = AuthGateway::new(Arc::new(AuthCache::new(Duration::from_secs(60))));
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.example"));
        let uri: Uri = "/app/page?x=1".parse().unwrap();

        let response = gateway.gate(&config(port), &subject(&headers, &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/__auth__/login?redirect_uri=http%3A%2F%2Fproxy.example%2Fapp%2Fpage%3Fx%3D1"
        );
    }

    #[test]
    fn test_original_url_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:9090"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("public.example"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        let uri: Uri = "/a?b=c".parse().unwrap();
        assert_eq!(original_url(&headers, &uri, false), "https://public.example/a?b=c");
    }

    #[test]
    fn test_absolute_login_url() {
        let mut cfg = config(7997);
        cfg.login_url = "https://sso.example/login?app=1".to_string();
        assert_eq!(
            login_location(&cfg, "http://p/x"),
            "https://sso.example/login?app=1&redirect_uri=http%3A%2F%2Fp%2Fx"
        );
    }

    #[test]
    fn test_passthrough_path_mapping() {
        let mut cfg = config(7997);
        cfg.login_url = "signin".to_string();
        assert_eq!(passthrough_path(&cfg, "/__auth__/login"), "/signin");
        assert_eq!(passthrough_path(&cfg, "/__auth__/logout"), "/api/auth/logout");
        assert_eq!(passthrough_path(&cfg, "/__auth__/api/auth/logout"), "/api/auth/logout");
        assert_eq!(passthrough_path(&cfg, "/__auth__/assets/app.js"), "/assets/app.js");
    }
}
