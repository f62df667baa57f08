//! Shared HTTP client pool
//!
//! Building a `reqwest::Client` sets up a connection pool and TLS state, so
//! clients are reused across calls with identical connection parameters.
//! The API key is part of the key only as a SHA-256 digest. A new digest for
//! an endpoint replaces the client built for the previous one, so a rotated
//! key does not leave its old client behind.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Client;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Normalized connection parameters identifying one pooled client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub provider: String,
    pub base_url: String,
    pub key_digest: Option<String>,
    pub timeout: Duration,
}

impl PoolKey {
    /// Same endpoint and timeout, credential ignored
    fn same_endpoint(&self, other: &PoolKey) -> bool {
        self.provider == other.provider
            && self.base_url == other.base_url
            && self.timeout == other.timeout
    }

    pub fn new(provider: &str, base_url: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        Self {
            provider: provider.to_ascii_lowercase(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key_digest: api_key.map(digest),
            timeout,
        }
    }
}

fn digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[derive(Debug)]
pub struct ClientPool {
    connect_timeout: Duration,
    clients: RwLock<HashMap<PoolKey, Client>>,
}

impl ClientPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Return the pooled client for `key`, building it with `headers` on a miss.
    pub fn get_or_build(&self, key: &PoolKey, headers: HeaderMap) -> Result<Client> {
        if let Some(client) = self.clients.read().unwrap().get(key) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().unwrap();
        if let Some(client) = clients.get(key) {
            return Ok(client.clone());
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(key.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let before = clients.len();
        clients.retain(|existing, _| !existing.same_endpoint(key));
        let replaced = before - clients.len();

        tracing::debug!(
            provider = %key.provider,
            base_url = %key.base_url,
            replaced,
            "Built HTTP client"
        );
        clients.insert(key.clone(), client.clone());
        Ok(client)
    }

    /// Drop every client for a provider code, e.g. after its profile changed.
    ///
    /// Returns the number of evicted clients.
    pub fn invalidate_provider(&self, provider: &str) -> usize {
        let provider = provider.to_ascii_lowercase();
        let mut clients = self.clients.write().unwrap();
        let before = clients.len();
        clients.retain(|key, _| key.provider != provider);
        let evicted = before - clients.len();
        if evicted > 0 {
            tracing::info!(provider = %provider, evicted, "Invalidated pooled HTTP clients");
        }
        evicted
    }

    pub fn invalidate_all(&self) {
        self.clients.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(provider: &str, api_key: &str) -> PoolKey {
        PoolKey::new(
            provider,
            "https://api.example.com/v1/",
            Some(api_key),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_key_hides_secret() {
        let k = key("OpenAI", "sk-secret");
        assert_eq!(k.provider, "openai");
        assert_eq!(k.base_url, "https://api.example.com/v1");
        let digest = k.key_digest.unwrap();
        assert_eq!(digest.len(), 64);
        assert!(!digest.contains("sk-secret"));
    }

    #[test]
    fn test_reuses_client_for_same_key() {
        let pool = ClientPool::default();
        pool.get_or_build(&key("openai", "a"), HeaderMap::new()).unwrap();
        pool.get_or_build(&key("openai", "a"), HeaderMap::new()).unwrap();
        assert_eq!(pool.len(), 1);

        pool.get_or_build(&key("deepseek", "a"), HeaderMap::new()).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_rotated_key_replaces_client() {
        let pool = ClientPool::default();
        pool.get_or_build(&key("openai", "old"), HeaderMap::new()).unwrap();
        pool.get_or_build(&key("deepseek", "old"), HeaderMap::new()).unwrap();
        pool.get_or_build(&key("openai", "new"), HeaderMap::new()).unwrap();
        assert_eq!(pool.len(), 2);

        let other_endpoint = PoolKey::new(
            "openai",
            "https://gateway.local/v1",
            Some("new"),
            Duration::from_secs(30),
        );
        pool.get_or_build(&other_endpoint, HeaderMap::new()).unwrap();
        assert_eq!(pool.len(), 3);

        // the "old" openai client is already gone
        assert_eq!(pool.invalidate_provider("openai"), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_invalidate_provider() {
        let pool = ClientPool::default();
        pool.get_or_build(&key("openai", "a"), HeaderMap::new()).unwrap();
        pool.get_or_build(&key("deepseek", "a"), HeaderMap::new()).unwrap();

        assert_eq!(pool.invalidate_provider("OPENAI"), 1);
        assert_eq!(pool.len(), 1);
        pool.invalidate_all();
        assert!(pool.is_empty());
    }
}
