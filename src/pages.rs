//! HTML pages served by the proxy itself
//!
//! Error pages, the welcome placeholder, the route selector and the floating
//! toolbar injected into authenticated responses. Markup is kept minimal.

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};

use crate::config::Rule;
use crate::error::{code_message, http_status};
use crate::routing::SELECT_PATH;
use crate::VERSION;

/// Logout entry point rendered into the toolbar and select page
pub const LOGOUT_PATH: &str = "/__auth__/logout";

const STYLE: &str = "body{font-family:system-ui,sans-serif;color:#111;background:#fff;\
margin:0;min-height:100vh;display:flex;align-items:center;justify-content:center}\
main{max-width:32rem;padding:2rem;text-align:center}h1{font-size:3rem;margin:0 0 1rem}\
p{color:#555}a.btn{display:inline-block;margin-top:1.5rem;padding:.6rem 1.2rem;\
background:#000;color:#fff;text-decoration:none}ul{list-style:none;padding:0}\
li a{display:block;padding:.75rem 1rem;border:1px solid #e5e7eb;margin:.5rem 0;\
color:#111;text-decoration:none}li a:hover{background:#000;color:#fff}\
footer{margin-top:3rem;font-size:.75rem;color:#999}";

/// Minimal escaping for text and attribute positions
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, content: &str, toolbar: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
<title>{title} - Reauth Proxy</title>\n<style>{STYLE}</style>\n</head>\n<body>\n\
<main>\n{content}\n<footer>Reauth Proxy v{VERSION}</footer>\n</main>\n{toolbar}\n</body>\n</html>\n",
        title = escape_html(title),
    )
}

fn html_response(status: StatusCode, html: String) -> Response<Body> {
    let mut response = Response::new(Body::from(html));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

/// Error page for a taxonomy code; `rules` feeds the toolbar when non-empty
pub fn error_page(code: u32, message: &str, rules: &[Rule]) -> Response<Body> {
    let content = format!(
        "<h1>{code}</h1>\n<p><strong>{label}</strong></p>\n<p>{message}</p>\n\
<a class=\"btn\" href=\"{SELECT_PATH}\">Go to Select</a>",
        label = code_message(code),
        message = escape_html(message),
    );
    let toolbar = if rules.is_empty() {
        String::new()
    } else {
        toolbar_html(rules, "")
    };
    html_response(http_status(code), layout(&code.to_string(), &content, &toolbar))
}

pub fn welcome_page() -> Response<Body> {
    let content = "<h1>Welcome</h1>\n<p>Welcome to Reauth Proxy. No routes are configured yet; \
add one through the admin API.</p>";
    html_response(StatusCode::OK, layout("Welcome", content, ""))
}

/// Route selector listing every configured rule
pub fn select_page(rules: &[Rule]) -> Response<Body> {
    let mut items = String::new();
    for rule in rules {
        let path = escape_html(&rule.path);
        items.push_str(&format!("<li><a href=\"{path}/\">{path}</a></li>\n"));
    }
    let list = if items.is_empty() {
        "<p>No routes configured.</p>".to_string()
    } else {
        format!("<ul>\n{items}</ul>")
    };
    let content = format!(
        "<h1>Select Route</h1>\n{list}\n<a class=\"btn\" href=\"{LOGOUT_PATH}\">Logout</a>"
    );
    html_response(
        StatusCode::OK,
        layout("Select Route", &content, &toolbar_html(rules, SELECT_PATH)),
    )
}

/// Floating route switcher with a logout link, injected into proxied HTML
pub fn toolbar_html(rules: &[Rule], current: &str) -> String {
    let mut links = String::new();
    for rule in rules {
        let path = escape_html(&rule.path);
        let marker = if rule.path == current { " aria-current=\"page\"" } else { "" };
        links.push_str(&format!(
            "<a href=\"{path}/\"{marker} style=\"display:block;padding:6px 10px;color:#111;text-decoration:none\">{path}</a>"
        ));
    }
    format!(
        "<div id=\"__reauth_toolbar\" style=\"position:fixed;right:16px;bottom:16px;z-index:2147483647;\
background:#fff;border:1px solid #e5e7eb;box-shadow:0 4px 12px rgba(0,0,0,.12);\
font:13px system-ui,sans-serif\">\
<details><summary style=\"padding:6px 10px;cursor:pointer\">Routes</summary>\
<a href=\"{SELECT_PATH}\" style=\"display:block;padding:6px 10px;color:#111;text-decoration:none\">All routes</a>\
{links}\
<a href=\"{LOGOUT_PATH}\" style=\"display:block;padding:6px 10px;color:#b91c1c;text-decoration:none\">Logout</a>\
</details></div>"
    )
}
