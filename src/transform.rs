//! Request and response rewriting for forwarded traffic
//!
//! The outgoing side strips the rule prefix and rewrites Origin/Referer so
//! the backend sees itself addressed directly. The return side stamps the
//! affinity cookie, carries the rule prefix into root-relative Locations and
//! HTML attributes, and injects the toolbar. HTML rewriting is plain string
//! substitution over a handful of attribute patterns, not a parse.

use std::net::IpAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::config::Rule;
use crate::routing::AFFINITY_COOKIE;

/// Headers that describe a single hop and are never forwarded as-is
const HOP_BY_HOP: [&str; 9] = [
    "host",
    "connection",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Drop hop-by-hop headers from a forwarded response
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter().filter(|n| **n != "host") {
        headers.remove(*name);
    }
}

/// Value of a named cookie in the request's Cookie header(s)
pub fn request_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Path sent to the backend; StripPath removes the prefix, empty becomes "/"
pub fn outgoing_path(rule: &Rule, path: &str) -> String {
    if !rule.strip_path {
        return path.to_string();
    }
    match path.strip_prefix(&rule.path) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) => format!("/{}", rest),
        None => path.to_string(),
    }
}

/// Target scheme with ws/wss mapped onto the HTTP scheme they ride on
pub fn dial_scheme(target: &Url) -> &str {
    match target.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    }
}

/// `host[:port]` of the target as it appears in a Host header
pub fn target_authority(target: &Url) -> String {
    let host = target.host_str().unwrap_or_default();
    match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Everything the outgoing header rewrite needs to know about the inbound hop
pub struct ForwardContext<'a> {
    pub rule: &'a Rule,
    pub target: &'a Url,
    pub client_ip: IpAddr,
    pub original_host: Option<&'a str>,
    pub is_tls: bool,
}

/// Build the header map sent upstream
pub fn forward_headers(inbound: &HeaderMap, ctx: &ForwardContext<'_>) -> HeaderMap {
    let upgrade = is_websocket_upgrade(inbound);
    let mut out = HeaderMap::with_capacity(inbound.len() + 6);

    for (name, value) in inbound.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if upgrade {
        out.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        if let Some(v) = inbound.get(header::UPGRADE) {
            out.insert(header::UPGRADE, v.clone());
        }
    }

    if let Ok(v) = HeaderValue::from_str(&target_authority(ctx.target)) {
        out.insert(header::HOST, v);
    }

    if let Ok(v) = HeaderValue::from_str(&ctx.client_ip.to_string()) {
        out.insert(HeaderName::from_static("x-real-ip"), v.clone());
        out.insert(HeaderName::from_static("x-forwarded-for"), v);
    }
    if let Some(host) = ctx.original_host.and_then(|h| HeaderValue::from_str(h).ok()) {
        out.insert(HeaderName::from_static("x-forwarded-host"), host);
    }
    out.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static(if ctx.is_tls { "https" } else { "http" }),
    );

    let scheme = dial_scheme(ctx.target);
    let authority = target_authority(ctx.target);

    if inbound.contains_key(header::ORIGIN) {
        if let Ok(v) = HeaderValue::from_str(&format!("{}://{}", scheme, authority)) {
            out.insert(header::ORIGIN, v);
        }
    }

    if let Some(referer) = inbound.get(header::REFERER).and_then(|v| v.to_str().ok()) {
        if let Some(rewritten) = rewrite_referer(referer, ctx.rule, scheme, &authority) {
            if let Ok(v) = HeaderValue::from_str(&rewritten) {
                out.insert(header::REFERER, v);
            }
        }
    }

    if ctx.rule.rewrite_html || ctx.rule.use_auth {
        out.remove(header::ACCEPT_ENCODING);
    }

    out
}

fn rewrite_referer(referer: &str, rule: &Rule, scheme: &str, authority: &str) -> Option<String> {
    let parsed = Url::parse(referer).ok()?;
    let path = outgoing_path(rule, parsed.path());
    let mut rewritten = format!("{}://{}{}", scheme, authority, path);
    if let Some(q) = parsed.query() {
        rewritten.push('?');
        rewritten.push_str(q);
    }
    Some(rewritten)
}

/// `Set-Cookie` value naming the rule that served this response
pub fn affinity_cookie(path: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("{}={}; Path=/", AFFINITY_COOKIE, path)).ok()
}

/// Whether this rule rewrites links and Locations
pub fn rewrites_links(rule: &Rule) -> bool {
    rule.rewrite_html && !rule.use_root_mode
}

/// Whether the response body must be buffered and rewritten
pub fn needs_body_rewrite(rule: &Rule, headers: &HeaderMap) -> bool {
    (rewrites_links(rule) || rule.use_auth) && is_html(headers)
}

pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

/// Stamp the affinity cookie and prefix a root-relative Location
pub fn rewrite_response_headers(headers: &mut HeaderMap, rule: &Rule) {
    if let Some(cookie) = affinity_cookie(&rule.path) {
        headers.append(header::SET_COOKIE, cookie);
    }

    if !rewrites_links(rule) {
        return;
    }
    let location = headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .filter(|l| l.starts_with('/'))
        .map(|l| format!("{}{}", rule.path, l));
    if let Some(v) = location.and_then(|l| HeaderValue::from_str(&l).ok()) {
        headers.insert(header::LOCATION, v);
    }
}

/// Carry the rule prefix into root-relative HTML attributes
pub fn rewrite_html(body: &str, path: &str) -> String {
    let prefix = path.trim_end_matches('/');
    let replacements = [
        ("href=\"/", format!("href=\"{}/", prefix)),
        ("src=\"/", format!("src=\"{}/", prefix)),
        ("action=\"/", format!("action=\"{}/", prefix)),
        ("<base href=\"/\">", format!("<base href=\"{}/\">", prefix)),
    ];

    let mut out = body.to_string();
    for (from, to) in &replacements {
        out = out.replace(from, to);
    }
    out
}

/// Insert the toolbar before the last `</body>`, or append it to anything that looks like HTML
pub fn inject_toolbar(body: &str, toolbar: &str) -> String {
    let lower = body.to_ascii_lowercase();
    if let Some(idx) = lower.rfind("</body>") {
        let mut out = String::with_capacity(body.len() + toolbar.len());
        out.push_str(&body[..idx]);
        out.push_str(toolbar);
        out.push_str(&body[idx..]);
        return out;
    }
    let looks_like_html = ["<html", "<head", "<body", "<!doctype"]
        .iter()
        .any(|marker| lower.contains(marker));
    if looks_like_html {
        format!("{}{}", body, toolbar)
    } else {
        body.to_string()
    }
}

/// Apply the body rewrites a rule calls for
pub fn transform_html(body: &str, rule: &Rule, toolbar: Option<&str>) -> String {
    let mut out = if rewrites_links(rule) {
        rewrite_html(body, &rule.path)
    } else {
        body.to_string()
    };
    if let Some(toolbar) = toolbar.filter(|_| rule.use_auth) {
        out = inject_toolbar(&out, toolbar);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(path: &str) -> Rule {
        Rule::new(path, "http://127.0.0.1:9999")
    }

    #[test]
    fn test_outgoing_path_strip() {
        let mut r = rule("/app");
        assert_eq!(outgoing_path(&r, "/app/x"), "/app/x");
        r.strip_path = true;
        assert_eq!(outgoing_path(&r, "/app/x"), "/x");
        assert_eq!(outgoing_path(&r, "/app"), "/");
        assert_eq!(outgoing_path(&r, "/appx"), "/x");
        assert_eq!(outgoing_path(&r, "/other"), "/other");
    }

    #[test]
    fn test_request_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session=abc; __proxy_path=/app"),
        );
        assert_eq!(request_cookie(&headers, AFFINITY_COOKIE), Some("/app"));
        assert_eq!(request_cookie(&headers, "session"), Some("abc"));
        assert_eq!(request_cookie(&headers, "missing"), None);
    }

    #[test]
    fn test_forward_headers() {
        let mut r = rule("/app");
        r.strip_path = true;
        r.rewrite_html = true;
        let target = Url::parse("ws://127.0.0.1:9999").unwrap();

        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("proxy.example"));
        inbound.insert(header::ORIGIN, HeaderValue::from_static("https://proxy.example"));
        inbound.insert(
            header::REFERER,
            HeaderValue::from_static("https://proxy.example/app/page?x=1"),
        );
        inbound.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert(header::COOKIE, HeaderValue::from_static("a=b"));

        let ctx = ForwardContext {
            rule: &r,
            target: &target,
            client_ip: "10.0.0.7".parse().unwrap(),
            original_host: Some("proxy.example"),
            is_tls: true,
        };
        let out = forward_headers(&inbound, &ctx);

        assert_eq!(out[header::HOST], "127.0.0.1:9999");
        assert_eq!(out["x-real-ip"], "10.0.0.7");
        assert_eq!(out["x-forwarded-for"], "10.0.0.7");
        assert_eq!(out["x-forwarded-proto"], "https");
        assert_eq!(out["x-forwarded-host"], "proxy.example");
        assert_eq!(out[header::ORIGIN], "http://127.0.0.1:9999");
        assert_eq!(out[header::REFERER], "http://127.0.0.1:9999/page?x=1");
        assert_eq!(out[header::COOKIE], "a=b");
        assert!(!out.contains_key(header::ACCEPT_ENCODING));
        assert!(!out.contains_key(header::CONNECTION));
    }

    #[test]
    fn test_upgrade_headers_survive() {
        let r = rule("/ws");
        let target = Url::parse("http://127.0.0.1:9999").unwrap();
        let mut inbound = HeaderMap::new();
        inbound.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        inbound.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        let ctx = ForwardContext {
            rule: &r,
            target: &target,
            client_ip: "127.0.0.1".parse().unwrap(),
            original_host: None,
            is_tls: false,
        };
        let out = forward_headers(&inbound, &ctx);
        assert_eq!(out[header::UPGRADE], "websocket");
        assert_eq!(out[header::CONNECTION], "upgrade");
    }

    #[test]
    fn test_response_headers() {
        let mut r = rule("/app");
        r.rewrite_html = true;
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/login"));
        rewrite_response_headers(&mut headers, &r);
        assert_eq!(headers[header::LOCATION], "/app/login");
        assert_eq!(headers[header::SET_COOKIE], "__proxy_path=/app; Path=/");

        // Root mode leaves Locations alone but still stamps the cookie
        r.use_root_mode = true;
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/login"));
        rewrite_response_headers(&mut headers, &r);
        assert_eq!(headers[header::LOCATION], "/login");
        assert!(headers.contains_key(header::SET_COOKIE));
    }

    #[test]
    fn test_html_rewrite() {
        let body = r#"<base href="/"><a href="/x">x</a><img src="/i.png"><form action="/f"></form><a href="https://e.com/">e</a>"#;
        let out = rewrite_html(body, "/app");
        assert_eq!(
            out,
            r#"<base href="/app/"><a href="/app/x">x</a><img src="/app/i.png"><form action="/app/f"></form><a href="https://e.com/">e</a>"#
        );
    }

    #[test]
    fn test_toolbar_injection() {
        assert_eq!(
            inject_toolbar("<html><BODY>hi</BODY></html>", "[T]"),
            "<html><BODY>hi[T]</BODY></html>"
        );
        assert_eq!(inject_toolbar("<!DOCTYPE html><p>x", "[T]"), "<!DOCTYPE html><p>x[T]");
        assert_eq!(inject_toolbar("plain text", "[T]"), "plain text");
        // Only the last closing tag
        assert_eq!(
            inject_toolbar("<body></body><body></body>", "[T]"),
            "<body></body><body>[T]</body>"
        );
    }

    #[test]
    fn test_toolbar_independent_of_rewrite() {
        let mut r = rule("/app");
        r.use_auth = true;
        let out = transform_html(r#"<body><a href="/x"></a></body>"#, &r, Some("[T]"));
        assert_eq!(out, r#"<body><a href="/x"></a>[T]</body>"#);
    }
}
