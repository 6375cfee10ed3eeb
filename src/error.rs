//! Error types and the numeric error taxonomy
//!
//! Every error surfaced to a client (rendered page) or an operator (admin
//! JSON envelope) carries one of the numeric codes below. Codes in the
//! 200..600 range double as HTTP statuses; the others map onto one.

use axum::http::StatusCode;
use thiserror::Error;

pub const CODE_SUCCESS: u32 = 200;
pub const CODE_BAD_REQUEST: u32 = 400;
pub const CODE_UNAUTHORIZED: u32 = 401;
pub const CODE_FORBIDDEN: u32 = 403;
pub const CODE_NOT_FOUND: u32 = 404;
pub const CODE_INTERNAL: u32 = 500;

// Admin surface
pub const CODE_INVALID_RULE: u32 = 10001;
pub const CODE_RULE_NOT_FOUND: u32 = 10002;
pub const CODE_INVALID_JSON: u32 = 10003;

// Proxy
pub const CODE_PROXY_TARGET_INVALID: u32 = 20001;
pub const CODE_PROXY_AUTH_FAILED: u32 = 20002;
pub const CODE_PROXY_TIMEOUT: u32 = 20003;

// Firewall
pub const CODE_FIREWALL_INIT: u32 = 30001;
pub const CODE_FIREWALL_COMMAND: u32 = 30002;
pub const CODE_FIREWALL_PARSE: u32 = 30003;

/// Human-readable label for a taxonomy code
pub fn code_message(code: u32) -> &'static str {
    match code {
        CODE_SUCCESS => "Success",
        CODE_BAD_REQUEST => "Bad Request",
        CODE_UNAUTHORIZED => "Unauthorized",
        CODE_FORBIDDEN => "Forbidden",
        CODE_NOT_FOUND => "Not Found",
        CODE_INTERNAL => "Internal Server Error",
        CODE_INVALID_RULE => "Invalid Rule Configuration",
        CODE_RULE_NOT_FOUND => "Rule Not Found",
        CODE_INVALID_JSON => "Invalid JSON Format",
        CODE_PROXY_TARGET_INVALID => "Invalid Proxy Target",
        CODE_PROXY_AUTH_FAILED => "Authentication Failed",
        CODE_PROXY_TIMEOUT => "Upstream Timeout",
        CODE_FIREWALL_INIT => "Firewall Initialization Failed",
        CODE_FIREWALL_COMMAND => "Firewall Command Failed",
        CODE_FIREWALL_PARSE => "Firewall Parse Failed",
        _ => "Unknown Error",
    }
}

/// Map a taxonomy code onto the HTTP status used for rendered pages
pub fn http_status(code: u32) -> StatusCode {
    if (200..600).contains(&code) {
        if let Ok(status) = StatusCode::from_u16(code as u16) {
            return status;
        }
    }
    match code {
        CODE_PROXY_AUTH_FAILED | CODE_PROXY_TARGET_INVALID => StatusCode::BAD_GATEWAY,
        CODE_PROXY_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Rejections raised when a rule is added through the admin surface
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("cannot add rule for root path '/' or empty path")]
    RootOrEmptyPath,

    #[error("cannot add rule for reserved path starting with '__'")]
    ReservedPath,

    #[error("path cannot end with a slash '/'")]
    TrailingSlash,

    #[error("cannot add rule with empty target")]
    EmptyTarget,

    #[error("invalid target: {0}")]
    UnparseableTarget(String),

    #[error("invalid target: failed to resolve target hostname {host}: {message}")]
    Unresolvable { host: String, message: String },

    #[error("invalid target: target must be an internal network address, external address not allowed: {0}")]
    ExternalTarget(String),

    #[error("invalid target: cannot target local admin port {0}")]
    AdminPortTarget(u16),

    #[error("rule not found: {0}")]
    NotFound(String),
}

impl RuleError {
    pub fn code(&self) -> u32 {
        match self {
            RuleError::NotFound(_) => CODE_RULE_NOT_FOUND,
            _ => CODE_INVALID_RULE,
        }
    }
}

/// Certificate slot errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("no certificate found in PEM input")]
    NoCertificate,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error("failed to read PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("unsupported private key: {0}")]
    UnsupportedKey(String),

    #[error("certificate and private key do not match: {0}")]
    Mismatch(String),
}

/// Persisted configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialise config: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Packet-filter chain errors; the captured command output is kept verbatim
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("iptables command failed: {cmd}, output: {output}")]
    Command { cmd: String, output: String },

    #[error("{context}: {source}")]
    Init {
        context: String,
        #[source]
        source: Box<FirewallError>,
    },

    #[error("{context}: {source}")]
    Operation {
        context: String,
        #[source]
        source: Box<FirewallError>,
    },

    #[error("failed to list rules: {0}")]
    Parse(Box<FirewallError>),

    #[error("invalid source address: {0}")]
    InvalidSource(String),
}

impl FirewallError {
    pub fn code(&self) -> u32 {
        match self {
            FirewallError::Init { .. } => CODE_FIREWALL_INIT,
            FirewallError::Parse(_) => CODE_FIREWALL_PARSE,
            FirewallError::InvalidSource(_) => CODE_BAD_REQUEST,
            _ => CODE_FIREWALL_COMMAND,
        }
    }

    pub(crate) fn init(context: impl Into<String>, source: FirewallError) -> Self {
        FirewallError::Init {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn operation(context: impl Into<String>, source: FirewallError) -> Self {
        FirewallError::Operation {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Errors surfaced by administrative mutators on the proxy core
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error("failed to persist configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl AdminError {
    pub fn code(&self) -> u32 {
        match self {
            AdminError::Rule(e) => e.code(),
            AdminError::Cert(_) => CODE_BAD_REQUEST,
            AdminError::Config(_) => CODE_INTERNAL,
            AdminError::Firewall(e) => e.code(),
            AdminError::BadRequest(_) => CODE_BAD_REQUEST,
            AdminError::Internal(_) => CODE_INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(http_status(CODE_NOT_FOUND), StatusCode::NOT_FOUND);
        assert_eq!(http_status(CODE_PROXY_TIMEOUT), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(http_status(CODE_PROXY_AUTH_FAILED), StatusCode::BAD_GATEWAY);
        assert_eq!(http_status(CODE_FIREWALL_PARSE), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_firewall_error_keeps_output() {
        let err = FirewallError::operation(
            "Failed to allow IP 10.0.0.5",
            FirewallError::Command {
                cmd: "-I REAUTH_FW 3 -s 10.0.0.5 -j ACCEPT".to_string(),
                output: "iptables: No chain/target/match by that name.".to_string(),
            },
        );
        assert_eq!(err.code(), CODE_FIREWALL_COMMAND);
        assert!(err.to_string().contains("No chain/target/match"));
    }
}
