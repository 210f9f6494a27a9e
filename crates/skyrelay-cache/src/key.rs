//! Cache keys and backend key layout.
//!
//! Every key reaching a backend has the form `<prefix>:<namespace>:<id>`.
//! Namespace and id are sanitized so user input (airport codes, callsigns,
//! query parameters) can never inject wildcards into `SCAN MATCH` patterns.

use regex::Regex;
use sha2::{Digest, Sha256};

/// Logical namespaces.
pub mod namespaces {
    pub const AIRPORT: &str = "airport";
    pub const FLIGHT_STATE: &str = "flight_state";
    pub const TRACK: &str = "track";
    pub const ARRIVALS: &str = "arrivals";
    pub const DEPARTURES: &str = "departures";
    pub const TOKEN: &str = "token";
    pub const LOCK: &str = "lock";
    pub const RATE_LIMIT: &str = "ratelimit";
    pub const STATS: &str = "stats";

    /// Namespaces holding upstream payloads; the only ones `clear` touches.
    pub const PAYLOAD: &[&str] = &[AIRPORT, FLIGHT_STATE, TRACK, ARRIVALS, DEPARTURES];

    /// Coordination state owned by locks, limiters, the token cache and stats.
    pub const INTERNAL: &[&str] = &[TOKEN, LOCK, RATE_LIMIT, STATS];
}

/// Strip control characters, whitespace and glob metacharacters.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() && !c.is_whitespace() && !is_glob_meta(*c))
        .collect()
}

/// Like [`sanitize`] but keeps `*` so callers can express prefix clears.
pub fn sanitize_pattern(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() && !c.is_whitespace() && (*c == '*' || !is_glob_meta(*c)))
        .collect()
}

fn is_glob_meta(c: char) -> bool {
    matches!(c, '*' | '?' | '[' | ']' | '\\')
}

/// A namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    id: String,
}

impl CacheKey {
    pub fn new(namespace: &str, id: &str) -> Self {
        let namespace = non_empty(sanitize(namespace));
        let id = non_empty(sanitize(id));
        Self { namespace, id }
    }

    /// Key whose id is a stable hash of request parameters.
    ///
    /// Parameters are sorted first, so argument order does not matter.
    pub fn hashed<I, K, V>(namespace: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pairs: Vec<(String, String)> = params
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        pairs.sort();

        let mut hasher = Sha256::new();
        for (k, v) in &pairs {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"&");
        }
        let digest = hex::encode(hasher.finalize());

        Self {
            namespace: non_empty(sanitize(namespace)),
            id: digest[..16].to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

fn non_empty(s: String) -> String {
    if s.is_empty() { "_".to_string() } else { s }
}

/// Maps logical keys onto backend keys under a shared prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: non_empty(sanitize(prefix)),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, key: &CacheKey) -> String {
        format!("{}:{}:{}", self.prefix, key.namespace(), key.id())
    }

    /// Backend key for internal namespaces (locks, counters, tokens).
    pub fn raw(&self, namespace: &str, id: &str) -> String {
        self.key(&CacheKey::new(namespace, id))
    }

    /// Resolve a user pattern (`airport:*`) to backend patterns for `clear`.
    ///
    /// The first segment selects namespaces. A wildcard there expands to the
    /// matching payload namespaces only, and `None` selects all of them.
    /// Naming an internal namespace is an error: lock, budget, token and
    /// stats keys are never cleared this way.
    pub fn clear_patterns(&self, pattern: Option<&str>) -> Result<Vec<String>, String> {
        let pattern = pattern.map(sanitize_pattern).filter(|p| !p.is_empty());
        let Some(pattern) = pattern else {
            return Ok(namespaces::PAYLOAD
                .iter()
                .map(|ns| format!("{}:{ns}:*", self.prefix))
                .collect());
        };

        let (namespace, rest) = match pattern.split_once(':') {
            Some((namespace, rest)) => (namespace, rest),
            None => (pattern.as_str(), "*"),
        };

        if !namespace.contains('*') {
            if namespaces::INTERNAL.contains(&namespace) {
                return Err(format!("namespace '{namespace}' cannot be cleared"));
            }
            return Ok(vec![format!("{}:{namespace}:{rest}", self.prefix)]);
        }

        let Some(matcher) = glob_matcher(namespace) else {
            return Err(format!("invalid pattern '{pattern}'"));
        };
        Ok(namespaces::PAYLOAD
            .iter()
            .filter(|ns| matcher.is_match(ns))
            .map(|ns| format!("{}:{ns}:{rest}", self.prefix))
            .collect())
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("skyrelay")
    }
}

/// Compile a `*`-only glob into an anchored regex.
pub(crate) fn glob_matcher(pattern: &str) -> Option<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).ok()
}
