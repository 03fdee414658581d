//! Per-request inputs to the admission pipeline.

/// Who is calling and, optionally, what they want to stay pinned to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Rate-limit key (client IP, API key, user id...).
    pub client_key: String,
    /// Session-affinity key for hash selection; falls back to `client_key`.
    pub affinity_key: Option<String>,
}

impl RequestContext {
    pub fn new(client_key: impl Into<String>) -> Self {
        Self {
            client_key: client_key.into(),
            affinity_key: None,
        }
    }

    pub fn with_affinity(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }

    pub fn hash_key(&self) -> &str {
        self.affinity_key.as_deref().unwrap_or(&self.client_key)
    }
}
