//! HTTP-01 challenge responses.
//!
//! The ACME workers stash `token → key-authorization` pairs here; the
//! port-80 listener answers `/.well-known/acme-challenge/{token}` from
//! this map. It is a small, separately-locked table so challenge serving
//! never contends with the route table.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct ChallengeMap {
    entries: RwLock<HashMap<String, ChallengeEntry>>,
}

#[derive(Debug, Clone)]
struct ChallengeEntry {
    host: String,
    key_authorization: String,
}

impl ChallengeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, token: &str, key_authorization: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                token.to_string(),
                ChallengeEntry {
                    host: host.to_string(),
                    key_authorization: key_authorization.to_string(),
                },
            );
    }

    /// The body to serve for a token, if we are expecting it.
    pub fn response_for(&self, token: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .map(|entry| entry.key_authorization.clone())
    }

    /// Drop every token belonging to a host, once its order settles.
    pub fn clear_host(&self, host: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| entry.host != host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_and_clears_tokens() {
        let map = ChallengeMap::new();
        map.insert("demo.example", "tok-1", "tok-1.auth");
        map.insert("demo.example", "tok-2", "tok-2.auth");
        map.insert("other.example", "tok-3", "tok-3.auth");

        assert_eq!(map.response_for("tok-1").as_deref(), Some("tok-1.auth"));
        assert_eq!(map.response_for("missing"), None);

        map.clear_host("demo.example");
        assert_eq!(map.response_for("tok-1"), None);
        assert_eq!(map.response_for("tok-3").as_deref(), Some("tok-3.auth"));
    }
}
