//! Request metadata and bucket key derivation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Bucket key used when the client address is not known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Request metadata handed to the throttle by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    /// Client address as seen by the server (or a trusted proxy)
    pub ip: Option<IpAddr>,
    /// Authenticated user id, if an upstream layer established one
    pub user_id: Option<String>,
    /// Request headers with lowercase names
    pub headers: HashMap<String, String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The client address as a key fragment.
    pub fn client_ip(&self) -> String {
        self.ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

/// Derives a bucket key from a request.
pub type KeyFn = Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>;

/// Decides whether a request bypasses a limiter entirely.
pub type SkipFn = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

/// Key derivation strategies selectable from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One bucket per client address
    #[default]
    ClientIp,
    /// One bucket per authenticated user, per address for anonymous requests
    UserOrIp,
    /// One bucket per value of the named header, per address when absent
    Header { name: String },
}

impl KeyStrategy {
    /// Compute the bucket key for `request`.
    pub fn derive(&self, request: &RequestInfo) -> String {
        match self {
            KeyStrategy::ClientIp => request.client_ip(),
            KeyStrategy::UserOrIp => match &request.user_id {
                Some(user) => format!("user:{}", user),
                None => format!("ip:{}", request.client_ip()),
            },
            KeyStrategy::Header { name } => match request.header(name) {
                Some(value) => format!("{}:{}", name.to_ascii_lowercase(), value),
                None => format!("ip:{}", request.client_ip()),
            },
        }
    }

    pub fn into_key_fn(self) -> KeyFn {
        Arc::new(move |request: &RequestInfo| self.derive(request))
    }
}

/// Skip predicate matching any of the given path prefixes.
pub fn skip_paths(prefixes: Vec<String>) -> SkipFn {
    Arc::new(move |request: &RequestInfo| {
        prefixes
            .iter()
            .any(|prefix| request.path.starts_with(prefix.as_str()))
    })
}

/// Normalize a login identifier so one account maps to one bucket.
///
/// Identifiers that look like phone numbers (only digits, spaces and
/// `+ - . ( )` punctuation, with at least one digit) keep a leading `+` and
/// their ASCII digits. Anything else, emails included, is trimmed and
/// lowercased as an opaque string.
pub fn normalize_identifier(raw: &str) -> String {
    let trimmed = raw.trim();
    if !looks_like_phone(trimmed) {
        return trimmed.to_lowercase();
    }

    let mut normalized = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        normalized.push('+');
    }
    normalized.extend(trimmed.chars().filter(|c| c.is_ascii_digit()));
    normalized
}

fn looks_like_phone(identifier: &str) -> bool {
    identifier.chars().any(|c| c.is_ascii_digit())
        && identifier
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | '(' | ')' | ' '))
}

/// Composite login throttle key: `identifier|ip`.
pub fn login_key(identifier: &str, ip: &str) -> String {
    format!("{}|{}", normalize_identifier(identifier), ip)
}

/// Mask a normalized identifier for log output.
pub fn mask_identifier(identifier: &str) -> String {
    if let Some((local, domain)) = identifier.split_once('@') {
        let first: String = local.chars().take(1).collect();
        return format!("{}***@{}", first, domain);
    }

    let chars: Vec<char> = identifier.chars().collect();
    let visible = chars.len().saturating_sub(2);
    let tail: String = chars[visible..].iter().collect();
    format!("***{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestInfo {
        RequestInfo::new("GET", "/api/items").with_ip("10.0.0.7".parse().unwrap())
    }

    #[test]
    fn test_client_ip_strategy() {
        assert_eq!(KeyStrategy::ClientIp.derive(&request()), "10.0.0.7");
        assert_eq!(
            KeyStrategy::ClientIp.derive(&RequestInfo::new("GET", "/")),
            UNKNOWN_CLIENT
        );
    }

    #[test]
    fn test_user_or_ip_strategy() {
        let strategy = KeyStrategy::UserOrIp;
        assert_eq!(strategy.derive(&request()), "ip:10.0.0.7");
        assert_eq!(strategy.derive(&request().with_user("42")), "user:42");
    }

    #[test]
    fn test_header_strategy() {
        let strategy = KeyStrategy::Header {
            name: "X-Api-Key".to_string(),
        };
        assert_eq!(strategy.derive(&request()), "ip:10.0.0.7");
        assert_eq!(
            strategy.derive(&request().with_header("x-api-key", "abc")),
            "x-api-key:abc"
        );
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let req = request().with_header("X-Forwarded-For", "1.2.3.4");
        assert_eq!(req.header("x-forwarded-for"), Some("1.2.3.4"));
        assert_eq!(req.header("X-FORWARDED-FOR"), Some("1.2.3.4"));
    }

    #[test]
    fn test_skip_paths() {
        let skip = skip_paths(vec!["/health".to_string()]);
        assert!(skip(&RequestInfo::new("GET", "/health")));
        assert!(skip(&RequestInfo::new("GET", "/health/ready")));
        assert!(!skip(&RequestInfo::new("GET", "/api/health")));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_identifier("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_identifier("+1 (555) 010-9999"), "+15550109999");
        assert_eq!(normalize_identifier("555.010.9999"), "5550109999");
    }

    #[test]
    fn test_normalize_plain_username() {
        assert_eq!(normalize_identifier(" Admin "), "admin");
        assert_eq!(normalize_identifier("root"), "root");
        assert_eq!(normalize_identifier("user42"), "user42");
        assert_eq!(normalize_identifier("   "), "");
        assert_ne!(login_key("admin", "10.0.0.1"), login_key("root", "10.0.0.1"));
    }

    #[test]
    fn test_login_key() {
        assert_eq!(
            login_key("Bob@Example.com", "192.168.1.1"),
            "bob@example.com|192.168.1.1"
        );
    }

    #[test]
    fn test_mask_identifier() {
        assert_eq!(mask_identifier("alice@example.com"), "a***@example.com");
        assert_eq!(mask_identifier("+15550109999"), "***99");
        assert_eq!(mask_identifier(""), "***");
    }
}
