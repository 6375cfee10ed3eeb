//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get as route_get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;

use reauth_proxy::error::FirewallError;
use reauth_proxy::{run_proxy_listener, AuthCache, CommandRunner, ConfigStore, ProxyCore};

/// Port the fixture core treats as its admin listener
pub const ADMIN_PORT: u16 = 1;

pub struct ProxyFixture {
    pub addr: SocketAddr,
    pub core: Arc<ProxyCore>,
    pub store: Arc<ConfigStore>,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

impl Drop for ProxyFixture {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Proxy core plus a live listener on an ephemeral loopback port
pub async fn spawn_proxy() -> ProxyFixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ConfigStore::new(dir.path().join("config.json")));
    let config = store.load().unwrap();
    let cache = Arc::new(AuthCache::new(Duration::from_secs(60)));
    let core = Arc::new(ProxyCore::new(store.clone(), config, cache, ADMIN_PORT));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(run_proxy_listener(listener, core.clone(), rx));

    ProxyFixture {
        addr,
        core,
        store,
        shutdown,
        _dir: dir,
    }
}

/// Upstream that echoes the request target in its body
pub async fn spawn_upstream() -> SocketAddr {
    async fn echo(uri: Uri) -> impl IntoResponse {
        let target = uri.path_and_query().map(|pq| pq.to_string()).unwrap_or_default();
        ([("x-upstream-target", target.clone())], target)
    }

    let app = Router::new().fallback(echo);
    serve(app).await
}

/// Auth service answering every verify call with `status`
pub async fn spawn_auth_service(status: StatusCode) -> SocketAddr {
    let app = Router::new().route("/api/auth/verify", route_get(move || async move { status }));
    serve(app).await
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn get(addr: SocketAddr, path: &str) -> Request<Body> {
    Request::builder()
        .uri(format!("http://{}{}", addr, path))
        .body(Body::empty())
        .unwrap()
}

/// Self-signed localhost certificate and key as PEM
pub fn self_signed() -> (String, String) {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    (generated.cert.pem(), generated.key_pair.serialize_pem())
}

/// In-memory packet filter understanding the subset of iptables the manager uses
#[derive(Default)]
pub struct FakeIptables {
    chains: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeIptables {
    pub fn with_parents(parents: &[&str]) -> Self {
        let fake = Self::default();
        for parent in parents {
            fake.chains.lock().insert(parent.to_string(), Vec::new());
        }
        fake
    }

    pub fn rules(&self, chain: &str) -> Vec<String> {
        self.chains.lock().get(chain).cloned().unwrap_or_default()
    }
}

impl CommandRunner for FakeIptables {
    fn run(&self, args: &[&str]) -> Result<String, FirewallError> {
        let fail = || FirewallError::Command {
            cmd: args.join(" "),
            output: "iptables: No chain/target/match by that name.".to_string(),
        };
        let mut chains = self.chains.lock();
        let chain = args[1].to_string();
        let spec = args[2..].join(" ");
        match args[0] {
            "-L" => chains.get(&chain).map(|_| String::new()).ok_or_else(fail),
            "-N" => {
                chains.insert(chain, Vec::new());
                Ok(String::new())
            }
            "-C" => match chains.get(&chain) {
                Some(rules) if rules.contains(&spec) => Ok(String::new()),
                _ => Err(fail()),
            },
            "-A" => {
                chains.get_mut(&chain).ok_or_else(fail)?.push(spec);
                Ok(String::new())
            }
            "-I" => {
                let rules = chains.get_mut(&chain).ok_or_else(fail)?;
                match args[2].parse::<usize>() {
                    Ok(pos) => rules.insert((pos - 1).min(rules.len()), args[3..].join(" ")),
                    Err(_) => rules.insert(0, spec),
                }
                Ok(String::new())
            }
            "-D" => {
                let rules = chains.get_mut(&chain).ok_or_else(fail)?;
                let idx = rules.iter().position(|r| *r == spec).ok_or_else(fail)?;
                rules.remove(idx);
                Ok(String::new())
            }
            "-F" => {
                chains.get_mut(&chain).ok_or_else(fail)?.clear();
                Ok(String::new())
            }
            "-X" => chains.remove(&chain).map(|_| String::new()).ok_or_else(fail),
            "-S" => {
                let rules = chains.get(&chain).ok_or_else(fail)?;
                Ok(rules
                    .iter()
                    .map(|r| format!("-A {} {}\n", chain, r))
                    .collect())
            }
            _ => Err(fail()),
        }
    }
}
