//! ACME client error types

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::solver::SolverError;

/// Problem type urn for a rejected anti-replay nonce (RFC 8555 §6.5)
pub const ERR_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";

/// Problem type urn for server-side rate limiting
pub const ERR_RATE_LIMITED: &str = "urn:ietf:params:acme:error:rateLimited";

/// Structured protocol error from an `application/problem+json` body
/// (RFC 7807, as profiled by RFC 8555 §6.7)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Problem {
    /// Error type urn (e.g. "urn:ietf:params:acme:error:badNonce")
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Human-readable detail from the server
    #[serde(default)]
    pub detail: String,

    /// HTTP status the server attached to the problem document
    #[serde(default)]
    pub status: Option<u16>,

    /// Server-supplied retry hint, taken from the Retry-After header
    /// rather than the document body
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl Problem {
    /// Whether the server rejected the request's anti-replay nonce
    pub fn is_bad_nonce(&self) -> bool {
        self.kind == ERR_BAD_NONCE
    }

    /// Whether the server rate-limited the request
    pub fn is_rate_limited(&self) -> bool {
        self.kind == ERR_RATE_LIMITED
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.kind.is_empty() { "unknown" } else { &self.kind };
        write!(f, "{}", kind)?;
        if let Some(status) = self.status {
            write!(f, " (HTTP {})", status)?;
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        if let Some(after) = self.retry_after {
            write!(f, " [retry after {}s]", after.as_secs())?;
        }
        Ok(())
    }
}

/// Per-domain terminal failures collected by the obtain orchestrator
///
/// Every failing domain appears with its terminal reason; no domain's
/// failure is collapsed into a generic message.
#[derive(Debug, Default)]
pub struct FailureSet(pub BTreeMap<String, AcmeError>);

impl FailureSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn insert(&mut self, domain: impl Into<String>, error: AcmeError) {
        self.0.insert(domain.into(), error);
    }

    /// Domains that failed, in sorted order
    pub fn domains(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

impl fmt::Display for FailureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (domain, error) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", domain, error)?;
            first = false;
        }
        Ok(())
    }
}

/// Errors that can occur during ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    /// A required input failed validation before any network call
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A resource URL that must be present was empty
    #[error("{operation}: empty URL")]
    EmptyUrl { operation: &'static str },

    /// Network-level failure (timeout, connection reset, TLS)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The new-nonce endpoint answered without a Replay-Nonce header
    #[error("Server supplied no Replay-Nonce header")]
    MissingNonce,

    /// Structured protocol error from the server
    #[error("ACME protocol error: {0}")]
    Protocol(Problem),

    /// The account key is already registered; the existing account URL
    /// is carried so callers can treat this as success-equivalent
    #[error("Account already exists at {location}")]
    AccountAlreadyExists { location: String },

    /// An operation requiring a registered account ran before registration
    #[error("No account registered - call register() or lookup_account() first")]
    MissingAccount,

    /// The server omitted a Location header where one is required
    #[error("Server response missing Location header for {0}")]
    MissingLocation(&'static str),

    /// No authoritative zone was found walking the FQDN toward the root
    #[error("No authoritative zone found for '{fqdn}'")]
    ZoneNotFound { fqdn: String },

    /// The FQDN does not end with the discovered zone
    #[error("Cannot extract subdomain: '{fqdn}' is not within zone '{zone}'")]
    SubdomainExtraction { fqdn: String, zone: String },

    /// DNS lookup failure during zone discovery or propagation probing
    #[error("DNS lookup failed for '{name}': {message}")]
    Dns { name: String, message: String },

    /// Challenge solver operation failed
    #[error("Challenge solver error: {0}")]
    Solver(#[from] SolverError),

    /// The authorization offers no challenge type a registered solver
    /// can handle
    #[error("No registered solver matches the challenges offered for '{domain}'")]
    NoSolverAvailable { domain: String },

    /// Bounded polling gave up before the predicate reported done
    #[error("Timed out waiting for {label}{}", .last_error.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    PropagationTimeout {
        label: String,
        last_error: Option<Box<AcmeError>>,
    },

    /// The server declared the challenge invalid
    #[error("Challenge validation failed for domain '{domain}': {detail}")]
    ChallengeRejected { domain: String, detail: String },

    /// The order reached the terminal invalid state
    #[error("Order failed: {detail}")]
    OrderFailed { detail: String },

    /// One or more domains failed validation; every failing domain and
    /// its terminal reason is enumerated
    #[error("Validation failed for {} domain(s): {}", .0.len(), .0)]
    DomainFailures(FailureSet),

    /// The obtain operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Account key generation or JWS signing failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// CSR generation failed
    #[error("Failed to build certificate request: {0}")]
    Csr(String),

    /// The issued certificate chain could not be parsed
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    /// The server answered with a body or status the protocol does not allow
    #[error("Unexpected server response: {0}")]
    UnexpectedResponse(String),
}

impl From<serde_json::Error> for AcmeError {
    fn from(e: serde_json::Error) -> Self {
        AcmeError::UnexpectedResponse(format!("invalid JSON: {}", e))
    }
}

impl AcmeError {
    /// Whether this error is a protocol-level badNonce rejection
    pub(crate) fn is_bad_nonce(&self) -> bool {
        matches!(self, AcmeError::Protocol(p) if p.is_bad_nonce())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_display() {
        let problem = Problem {
            kind: ERR_BAD_NONCE.to_string(),
            detail: "JWS has an invalid anti-replay nonce".to_string(),
            status: Some(400),
            retry_after: None,
        };
        let msg = problem.to_string();
        assert!(msg.contains("badNonce"));
        assert!(msg.contains("400"));
        assert!(msg.contains("anti-replay"));
    }

    #[test]
    fn test_problem_classification() {
        let nonce = Problem { kind: ERR_BAD_NONCE.to_string(), ..Default::default() };
        assert!(nonce.is_bad_nonce());
        assert!(!nonce.is_rate_limited());

        let limited = Problem { kind: ERR_RATE_LIMITED.to_string(), ..Default::default() };
        assert!(limited.is_rate_limited());
    }

    #[test]
    fn test_problem_deserializes_from_wire_form() {
        let problem: Problem = serde_json::from_str(
            r#"{"type":"urn:ietf:params:acme:error:rateLimited","detail":"slow down","status":429}"#,
        )
        .unwrap();
        assert!(problem.is_rate_limited());
        assert_eq!(problem.status, Some(429));
        assert_eq!(problem.detail, "slow down");
    }

    #[test]
    fn test_failure_set_names_every_domain() {
        let mut failures = FailureSet::default();
        failures.insert("b.example.org", AcmeError::ChallengeRejected {
            domain: "b.example.org".to_string(),
            detail: "DNS record not found".to_string(),
        });
        failures.insert("a.example.com", AcmeError::ZoneNotFound {
            fqdn: "_acme-challenge.a.example.com.".to_string(),
        });

        let err = AcmeError::DomainFailures(failures);
        let msg = err.to_string();
        assert!(msg.contains("2 domain(s)"));
        assert!(msg.contains("a.example.com"));
        assert!(msg.contains("b.example.org"));
        assert!(msg.contains("DNS record not found"));
    }

    #[test]
    fn test_propagation_timeout_carries_last_error() {
        let err = AcmeError::PropagationTimeout {
            label: "TXT record visibility".to_string(),
            last_error: Some(Box::new(AcmeError::Dns {
                name: "_acme-challenge.example.com.".to_string(),
                message: "connection refused".to_string(),
            })),
        };
        let msg = err.to_string();
        assert!(msg.contains("TXT record visibility"));
        assert!(msg.contains("connection refused"));
    }
}
