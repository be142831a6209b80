//! Challenge solvers
//!
//! A solver implements one validation method: it publishes the proof the
//! ACME server will look for (`present`), removes it afterwards
//! (`cleanup`), and bounds how long the orchestrator waits for the proof
//! to become visible (`timeout`). Solvers are registered explicitly by
//! the caller; registration order is the challenge-type preference when
//! an authorization offers several supported types.

mod dns01;
mod http01;
mod tls_alpn01;

pub use dns01::{Dns01Solver, DnsProvider, CHALLENGE_TTL};
pub use http01::{ChallengeStore, Http01Solver, WELL_KNOWN_PATH};
pub use tls_alpn01::{CertificateStore, TlsAlpn01Solver, TlsAlpnCertificate, ACME_TLS_ALPN_PROTOCOL};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::AcmeError;
use crate::resources::{Authorization, Challenge, ChallengeType};

/// Errors from solver and provider operations
#[derive(Debug, Error)]
pub enum SolverError {
    /// Authentication failed against the provider backend
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Publishing the challenge material failed
    #[error("Failed to present challenge for '{name}': {message}")]
    Present { name: String, message: String },

    /// Removing the challenge material failed
    #[error("Failed to clean up challenge for '{name}': {message}")]
    Cleanup { name: String, message: String },

    /// A visibility probe could not be completed
    #[error("Challenge probe failed: {0}")]
    Probe(String),

    /// Invalid solver configuration
    #[error("Invalid solver configuration: {0}")]
    Configuration(String),
}

/// One validation method's capability set
///
/// Implementations must be thread-safe; the orchestrator drives them
/// from concurrent per-domain workers.
#[async_trait]
pub trait ChallengeSolver: Send + Sync + std::fmt::Debug {
    /// The challenge type this solver handles
    fn challenge_type(&self) -> ChallengeType;

    /// Publish the proof for `domain`
    ///
    /// Must tolerate the proof already existing (treated as success).
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), AcmeError>;

    /// Remove the proof for `domain`
    ///
    /// Must tolerate the proof already being absent. Called for every
    /// domain that reached presentation, regardless of outcome.
    async fn cleanup(&self, domain: &str, token: &str, key_auth: &str) -> Result<(), AcmeError>;

    /// (propagation timeout, poll interval) for the visibility wait
    fn timeout(&self) -> (Duration, Duration) {
        (Duration::from_secs(120), Duration::from_secs(5))
    }

    /// Whether the published proof is observable out-of-band yet
    ///
    /// Polled by the orchestrator between presentation and notification.
    /// The default reports ready immediately, for methods with nothing
    /// to observe.
    async fn propagated(&self, domain: &str, token: &str, key_auth: &str) -> Result<bool, AcmeError> {
        let _ = (domain, token, key_auth);
        Ok(true)
    }
}

/// Ordered challenge-solver registry
///
/// Built explicitly by the caller at startup and handed to the
/// orchestrator; registration order is the preference order when an
/// authorization offers more than one supported challenge type.
#[derive(Debug, Default, Clone)]
pub struct SolverRegistry {
    solvers: Vec<Arc<dyn ChallengeSolver>>,
}

impl SolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a solver; earlier registrations are preferred
    pub fn register(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solvers.push(solver);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.solvers.is_empty()
    }

    /// Registered challenge types, in preference order
    pub fn challenge_types(&self) -> Vec<ChallengeType> {
        self.solvers.iter().map(|s| s.challenge_type()).collect()
    }

    /// Pick the challenge to accept for an authorization
    ///
    /// Exactly one challenge is selected; the others are left untouched.
    pub fn select<'a>(
        &self,
        authz: &'a Authorization,
    ) -> Option<(&'a Challenge, Arc<dyn ChallengeSolver>)> {
        for solver in &self.solvers {
            if let Some(challenge) = authz.challenge(solver.challenge_type()) {
                return Some((challenge, Arc::clone(solver)));
            }
        }
        None
    }
}
