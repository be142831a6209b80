//! HTTP-01 challenge solver
//!
//! The proof is the key authorization served as plain text at
//! `/.well-known/acme-challenge/<token>` over HTTP on port 80. The
//! solver owns a shared token store; the host's HTTP front end
//! intercepts well-known requests and answers from the store, the same
//! way a reverse proxy serves its ACME challenges without a dedicated
//! listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::AcmeError;
use crate::resources::ChallengeType;
use crate::solver::ChallengeSolver;

/// Path prefix the ACME server fetches challenge responses from
pub const WELL_KNOWN_PATH: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges, shared with the serving front end
#[derive(Debug, Default)]
pub struct ChallengeStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, key_auth: &str) {
        trace!(token = %token, "Registering HTTP-01 challenge");
        self.tokens.write().insert(token.to_string(), key_auth.to_string());
    }

    pub fn remove(&self, token: &str) {
        self.tokens.write().remove(token);
    }

    /// Key authorization for a token, if the challenge is pending
    pub fn key_authorization(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }

    /// Response body for a raw request path, for front-end interception
    ///
    /// Returns `None` for paths outside the well-known prefix or tokens
    /// that are not pending, which the front end should handle as any
    /// other request.
    pub fn response_for_path(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix(WELL_KNOWN_PATH)?;
        self.key_authorization(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

/// HTTP-01 solver backed by a shared challenge store
#[derive(Debug)]
pub struct Http01Solver {
    store: Arc<ChallengeStore>,
    /// HTTP client for the optional pre-notification self-probe;
    /// `None` disables probing
    probe: Option<reqwest::Client>,
    probe_port: u16,
    propagation_timeout: Duration,
    poll_interval: Duration,
}

impl Http01Solver {
    /// Solver with the self-probe enabled against port 80
    pub fn new(store: Arc<ChallengeStore>) -> Self {
        Self {
            store,
            probe: Some(reqwest::Client::new()),
            probe_port: 80,
            propagation_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Disable the pre-notification self-probe
    ///
    /// Useful when the front end is not reachable from this process.
    pub fn without_probe(mut self) -> Self {
        self.probe = None;
        self
    }

    /// Probe a non-standard port (tests, local front ends)
    pub fn with_probe_port(mut self, port: u16) -> Self {
        self.probe_port = port;
        self
    }

    /// Override the propagation wait bounds
    pub fn with_timeouts(mut self, timeout: Duration, interval: Duration) -> Self {
        self.propagation_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<ChallengeStore> {
        &self.store
    }

    fn probe_url(&self, domain: &str, token: &str) -> String {
        format!(
            "http://{}:{}{}{}",
            domain, self.probe_port, WELL_KNOWN_PATH, token
        )
    }
}

#[async_trait]
impl ChallengeSolver for Http01Solver {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::Http01
    }

    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), AcmeError> {
        debug!(domain = %domain, token = %token, "Registering HTTP-01 challenge response");
        // Overwriting an existing registration for the token is fine
        self.store.insert(token, key_auth);
        Ok(())
    }

    async fn cleanup(&self, domain: &str, token: &str, _key_auth: &str) -> Result<(), AcmeError> {
        debug!(domain = %domain, token = %token, "Removing HTTP-01 challenge response");
        self.store.remove(token);
        Ok(())
    }

    fn timeout(&self) -> (Duration, Duration) {
        (self.propagation_timeout, self.poll_interval)
    }

    async fn propagated(&self, domain: &str, token: &str, key_auth: &str) -> Result<bool, AcmeError> {
        let Some(client) = &self.probe else {
            return Ok(true);
        };

        let url = self.probe_url(domain, token);
        trace!(url = %url, "Probing HTTP-01 challenge visibility");

        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body = response.text().await?;
        Ok(body.trim() == key_auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_present_and_cleanup_manage_store() {
        let store = Arc::new(ChallengeStore::new());
        let solver = Http01Solver::new(Arc::clone(&store)).without_probe();

        solver.present("example.com", "tok-1", "tok-1.thumb").await.unwrap();
        assert_eq!(store.key_authorization("tok-1").as_deref(), Some("tok-1.thumb"));

        solver.cleanup("example.com", "tok-1", "tok-1.thumb").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_of_absent_token_is_ok() {
        let store = Arc::new(ChallengeStore::new());
        let solver = Http01Solver::new(Arc::clone(&store)).without_probe();

        solver.cleanup("example.com", "missing", "x").await.unwrap();
    }

    #[tokio::test]
    async fn test_present_twice_is_ok() {
        let store = Arc::new(ChallengeStore::new());
        let solver = Http01Solver::new(Arc::clone(&store)).without_probe();

        solver.present("example.com", "tok", "v1").await.unwrap();
        solver.present("example.com", "tok", "v1").await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_response_for_path() {
        let store = ChallengeStore::new();
        store.insert("tok-abc", "tok-abc.thumbprint");

        assert_eq!(
            store.response_for_path("/.well-known/acme-challenge/tok-abc").as_deref(),
            Some("tok-abc.thumbprint")
        );
        assert!(store.response_for_path("/.well-known/acme-challenge/other").is_none());
        assert!(store.response_for_path("/index.html").is_none());
    }

    #[tokio::test]
    async fn test_probe_disabled_reports_ready() {
        let store = Arc::new(ChallengeStore::new());
        let solver = Http01Solver::new(store).without_probe();
        assert!(solver.propagated("example.com", "tok", "x").await.unwrap());
    }

    #[test]
    fn test_probe_url_shape() {
        let solver = Http01Solver::new(Arc::new(ChallengeStore::new())).with_probe_port(8080);
        assert_eq!(
            solver.probe_url("example.com", "tok"),
            "http://example.com:8080/.well-known/acme-challenge/tok"
        );
    }
}
