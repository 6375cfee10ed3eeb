//! Routing table and request match procedure
//!
//! Rules are keyed by path and kept in insertion order. Matching is
//! longest-prefix with the earliest-inserted rule winning ties, followed by
//! the browser-affinity fallbacks (cookie, then Referer) for requests that
//! lost their prefix, e.g. sub-resources of a root-mounted app.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use axum::http::Method;
use tracing::debug;
use url::{Host, Url};

use crate::config::Rule;
use crate::error::RuleError;

/// Lists configured routes
pub const SELECT_PATH: &str = "/__select__";
/// Prefix proxied to the auth service
pub const AUTH_PREFIX: &str = "/__auth__";
/// First-party affinity cookie naming the last-used rule path
pub const AFFINITY_COOKIE: &str = "__proxy_path";

/// Ordered, path-keyed collection of rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    rules: Vec<Rule>,
}

impl RoutingTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Replace the rule with the same path in place, or append a new one.
    /// Returns `true` when an existing rule was replaced.
    pub fn upsert(&mut self, rule: Rule) -> bool {
        match self.rules.iter_mut().find(|r| r.path == rule.path) {
            Some(existing) => {
                *existing = rule;
                true
            }
            None => {
                self.rules.push(rule);
                false
            }
        }
    }

    pub fn remove(&mut self, path: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.path != path);
        before != self.rules.len()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn find(&self, path: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.path == path)
    }

    /// Longest rule path that prefixes `path`; strict `>` keeps the earliest on ties
    pub fn longest_prefix(&self, path: &str) -> Option<&Rule> {
        let mut best: Option<&Rule> = None;
        let mut longest = 0;
        for rule in &self.rules {
            if path.starts_with(&rule.path) && rule.path.len() > longest {
                longest = rule.path.len();
                best = Some(rule);
            }
        }
        best
    }
}

/// Request attributes the match procedure looks at
#[derive(Debug, Clone, Default)]
pub struct RouteRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub affinity_cookie: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub has_origin: bool,
    pub is_websocket: bool,
}

/// Outcome of matching one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// `/__select__`
    Select,
    /// `/__auth__/*`
    AuthPassthrough,
    /// 301 to the rule path with a trailing slash (query preserved)
    SlashRedirect(String),
    /// Set the affinity cookie to the rule path and 302 to "/"
    RootMode(Rule),
    /// Forward to the rule's target
    Proxy(Rule),
    /// Empty table at "/"
    Welcome,
    /// 302 to the configured default route
    DefaultRedirect(String),
    /// Nothing matched
    NotFound,
}

fn is_read_method(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Select at most one rule for a request, deterministically
pub fn resolve(table: &RoutingTable, default_route: &str, req: &RouteRequest<'_>) -> RouteDecision {
    let path = req.path;

    if path == SELECT_PATH {
        return RouteDecision::Select;
    }
    if path.starts_with("/__auth__/") {
        return RouteDecision::AuthPassthrough;
    }

    let mut matched = table.longest_prefix(path).cloned();
    let longest = matched.as_ref().map_or(0, |r| r.path.len());
    let mut slash_redirect: Option<String> = table
        .rules()
        .iter()
        .find(|r| r.path.len() == path.len() + 1 && r.path.starts_with(path) && r.path.ends_with('/'))
        .map(|r| r.path.clone());

    let exact_without_slash = matched
        .as_ref()
        .is_some_and(|r| r.path != "/" && r.path == path && !r.path.ends_with('/'));

    if exact_without_slash {
        if is_read_method(&req.method) {
            slash_redirect = matched.take().map(|r| format!("{}/", r.path));
        }
    } else if longest == path.len() {
        slash_redirect = None;
    } else if slash_redirect.is_some() {
        matched = None;
    }

    if let Some(location) = slash_redirect {
        let location = match req.query {
            Some(q) if !q.is_empty() => format!("{}?{}", location, q),
            _ => location,
        };
        return RouteDecision::SlashRedirect(location);
    }

    if matched.is_none() {
        let can_use_cookie =
            path == "/" || req.referer.is_some() || req.has_origin || req.is_websocket;
        if can_use_cookie {
            if let Some(cookie) = req.affinity_cookie.filter(|c| !c.is_empty()) {
                matched = table.find(cookie).cloned();
                if matched.is_some() {
                    debug!("Affinity cookie resolved {} to rule {}", path, cookie);
                }
            }
        }

        if matched.is_none() {
            if let Some(referer_path) = req.referer.and_then(referer_path) {
                matched = table.longest_prefix(&referer_path).cloned();
                if matched.is_some() {
                    debug!("Referer {} resolved {}", referer_path, path);
                }
            }
        }
    }

    match matched {
        None if path == "/" => {
            if table.is_empty() {
                RouteDecision::Welcome
            } else {
                RouteDecision::DefaultRedirect(default_route.to_string())
            }
        }
        None => RouteDecision::NotFound,
        Some(rule) if rule.use_root_mode && rule.path != "/" && path.starts_with(&rule.path) => {
            RouteDecision::RootMode(rule)
        }
        Some(rule) => RouteDecision::Proxy(rule),
    }
}

fn referer_path(referer: &str) -> Option<String> {
    Url::parse(referer).ok().map(|u| u.path().to_string())
}

/// Path and target checks that need no I/O
pub fn validate_rule_shape(rule: &Rule) -> Result<(), RuleError> {
    if rule.path.is_empty() || rule.path == "/" {
        return Err(RuleError::RootOrEmptyPath);
    }
    if rule.target.is_empty() {
        return Err(RuleError::EmptyTarget);
    }
    if rule.path.starts_with("/__") || rule.path.starts_with("__") {
        return Err(RuleError::ReservedPath);
    }
    if rule.path.ends_with('/') {
        return Err(RuleError::TrailingSlash);
    }
    Ok(())
}

/// Internal = private, loopback, unspecified or link-local
pub fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_unspecified() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            v6.is_loopback() || v6.is_unspecified() || unique_local || link_local
        }
    }
}

/// Addresses that reach a listener bound on the loopback interface
fn reaches_loopback(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

/// Target must parse, resolve to internal addresses only, and not be the admin listener
pub async fn validate_target(target: &str, admin_port: u16) -> Result<(), RuleError> {
    let url = Url::parse(target).map_err(|e| RuleError::UnparseableTarget(e.to_string()))?;
    let host = url
        .host()
        .ok_or_else(|| RuleError::UnparseableTarget(format!("missing host in {}", target)))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let addrs: Vec<IpAddr> = match &host {
        Host::Domain(d) if d.eq_ignore_ascii_case("localhost") => {
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)]
        }
        Host::Domain(d) => tokio::net::lookup_host((*d, port))
            .await
            .map_err(|e| RuleError::Unresolvable {
                host: d.to_string(),
                message: e.to_string(),
            })?
            .map(|a| a.ip())
            .collect(),
        Host::Ipv4(v4) => vec![IpAddr::V4(*v4)],
        Host::Ipv6(v6) => vec![IpAddr::V6(*v6)],
    };

    if addrs.is_empty() || !addrs.iter().all(|ip| is_internal_ip(*ip)) {
        return Err(RuleError::ExternalTarget(host.to_string()));
    }

    if port == admin_port && addrs.iter().any(|ip| reaches_loopback(*ip)) {
        return Err(RuleError::AdminPortTarget(admin_port));
    }

    Ok(())
}
