//! End-to-end tests for the proxy listener, auth gate and certificate rotation
//!
//! Each test runs a real listener on an ephemeral loopback port together
//! with mock upstream and auth services built from axum routers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;

use common::{get, self_signed, spawn_auth_service, spawn_proxy, spawn_upstream, FakeIptables};
use reauth_proxy::firewall::{FirewallManager, IpAction};
use reauth_proxy::{AuthConfig, Rule};

fn client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Body> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn body_text(response: axum::http::Response<hyper::body::Incoming>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

fn strip_rule(path: &str, target: String) -> Rule {
    let mut rule = Rule::new(path, target);
    rule.strip_path = true;
    rule
}

#[tokio::test]
async fn test_empty_table_serves_welcome() {
    let proxy = spawn_proxy().await;
    let response = client().request(get(proxy.addr, "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::LOCATION).is_none());
}

#[tokio::test]
async fn test_strip_path_forward_sets_affinity_cookie() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy().await;
    proxy
        .core
        .add_rule(strip_rule("/app", format!("http://{}", upstream)))
        .await
        .unwrap();

    let response = client().request(get(proxy.addr, "/app/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream-target"], "/x");
    let cookies: Vec<_> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    assert!(cookies.iter().any(|c| c.starts_with("__proxy_path=/app")));
    assert_eq!(body_text(response).await, "/x");
}

#[tokio::test]
async fn test_bare_prefix_redirects_with_slash() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy().await;
    proxy
        .core
        .add_rule(strip_rule("/app", format!("http://{}", upstream)))
        .await
        .unwrap();

    let response = client().request(get(proxy.addr, "/app")).await.unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()[header::LOCATION], "/app/");
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy().await;
    proxy
        .core
        .add_rule(strip_rule("/app", format!("http://{}", upstream)))
        .await
        .unwrap();

    let response = client().request(get(proxy.addr, "/elsewhere")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dead_upstream_renders_gateway_timeout() {
    // Bind then drop to get a port nobody listens on
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = spawn_proxy().await;
    proxy
        .core
        .add_rule(strip_rule("/gone", format!("http://{}", dead)))
        .await
        .unwrap();

    let response = client().request(get(proxy.addr, "/gone/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(body_text(response).await.contains("Upstream unavailable"));
}

#[tokio::test]
async fn test_denied_request_redirects_to_login() {
    let upstream = spawn_upstream().await;
    let auth = spawn_auth_service(StatusCode::UNAUTHORIZED).await;
    let proxy = spawn_proxy().await;
    proxy
        .core
        .set_auth_config(AuthConfig {
            auth_port: auth.port(),
            ..AuthConfig::default()
        })
        .unwrap();
    let mut rule = strip_rule("/app", format!("http://{}", upstream));
    rule.use_auth = true;
    proxy.core.add_rule(rule).await.unwrap();

    let response = client().request(get(proxy.addr, "/app/x?y=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let original = format!("http://{}/app/x?y=1", proxy.addr);
    let encoded: String = url::form_urlencoded::byte_serialize(original.as_bytes()).collect();
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("/__auth__/login?redirect_uri={}", encoded).as_str()
    );
}

#[tokio::test]
async fn test_admitted_request_is_forwarded() {
    let upstream = spawn_upstream().await;
    let auth = spawn_auth_service(StatusCode::OK).await;
    let proxy = spawn_proxy().await;
    proxy
        .core
        .set_auth_config(AuthConfig {
            auth_port: auth.port(),
            ..AuthConfig::default()
        })
        .unwrap();
    let mut rule = strip_rule("/app", format!("http://{}", upstream));
    rule.use_auth = true;
    proxy.core.add_rule(rule).await.unwrap();

    let request = Request::builder()
        .uri(format!("http://{}/app/ok", proxy.addr))
        .header(header::COOKIE, "session=abc")
        .body(Body::empty())
        .unwrap();
    let response = client().request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream-target"], "/ok");
    assert_eq!(proxy.core.auth_cache().len(), 1);
}

#[tokio::test]
async fn test_certificate_install_closes_idle_plaintext_connection() {
    let proxy = spawn_proxy().await;

    let stream = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(stream))
        .await
        .unwrap();
    let conn_task = tokio::spawn(conn);

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "localhost")
        .body(Body::empty())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_text(response).await;

    let (cert, key) = self_signed();
    proxy.core.set_certificate(&cert, &key).unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), conn_task).await;
    assert!(closed.is_ok(), "idle connection survived certificate rotation");

    // A fresh plaintext connection is now sent to https
    let response = client().request(get(proxy.addr, "/app?x=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("https://{}/app?x=1", proxy.addr).as_str()
    );
}

#[tokio::test]
async fn test_tls_handshake_uses_installed_certificate() {
    let proxy = spawn_proxy().await;
    let (cert, key) = self_signed();
    proxy.core.set_certificate(&cert, &key).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut cert.as_bytes()) {
        roots.add(der.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(proxy.addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let tls = connector.connect(server_name, stream).await.unwrap();

    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Body>(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);
    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "localhost")
        .body(Body::empty())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    // No redirect over TLS; the empty table answers with the welcome page
    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn test_allow_then_block_leaves_single_drop() {
    let fake = Arc::new(FakeIptables::with_parents(&["INPUT", "DOCKER-USER"]));
    let firewall = FirewallManager::new(fake.clone(), None);
    firewall.init().unwrap();

    firewall.allow_ip("10.0.0.5").unwrap();
    firewall.block_ip("10.0.0.5").unwrap();

    let entries: Vec<_> = firewall
        .list_rules()
        .unwrap()
        .into_iter()
        .filter(|r| r.ip == "10.0.0.5")
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, IpAction::Drop);
}

#[test]
fn test_repeated_operations_are_idempotent() {
    let fake = Arc::new(FakeIptables::with_parents(&["INPUT", "DOCKER-USER"]));
    let firewall = FirewallManager::new(fake.clone(), Some("TEST_FW"));
    firewall.configure(None, None, Some(vec!["22".to_string()]));
    firewall.init().unwrap();

    firewall.flush().unwrap();
    let first = fake.rules("TEST_FW");
    firewall.flush().unwrap();
    assert_eq!(fake.rules("TEST_FW"), first);
    assert_eq!(first.len(), firewall.base_rule_count());

    firewall.allow_ip("192.168.0.7").unwrap();
    firewall.allow_ip("192.168.0.7").unwrap();
    let accepts = fake
        .rules("TEST_FW")
        .iter()
        .filter(|r| r.as_str() == "-s 192.168.0.7 -j ACCEPT")
        .count();
    assert_eq!(accepts, 1);
}
