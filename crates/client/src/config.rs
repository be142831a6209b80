//! Client and obtain-run configuration

use std::net::IpAddr;
use std::time::Duration;

use crate::error::AcmeError;

/// Let's Encrypt production directory URL
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default timeout for individual ACME requests
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Default timeout for order/authorization status polling
pub(crate) const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(120);
/// Default interval between status polls
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default grace period granted to cleanup after cancellation or failure
pub(crate) const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(30);

/// ACME client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory URL of the ACME server
    pub directory_url: String,

    /// Contact URIs for account registration (e.g. "mailto:admin@example.com")
    pub contact: Vec<String>,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Configuration pointing at the given directory with no contacts
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Let's Encrypt configuration, staging or production
    pub fn lets_encrypt(staging: bool) -> Self {
        if staging {
            Self::new(LETS_ENCRYPT_STAGING)
        } else {
            Self::new(LETS_ENCRYPT_PRODUCTION)
        }
    }

    /// Add a mailto: contact address
    pub fn with_email(mut self, email: &str) -> Self {
        self.contact.push(format!("mailto:{}", email));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AcmeError> {
        if self.directory_url.is_empty() {
            return Err(AcmeError::InvalidInput("directory URL must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Options governing one obtain run
#[derive(Debug, Clone)]
pub struct ObtainOptions {
    /// Maximum number of per-domain workers running at once
    /// (None = unbounded)
    pub concurrency_limit: Option<usize>,

    /// How long to wait for an order or authorization to reach a
    /// terminal status after notification
    pub validation_timeout: Duration,

    /// Interval between status polls
    pub poll_interval: Duration,

    /// Grace period for solver cleanup after cancellation or failure
    pub cleanup_grace: Duration,

    /// Deactivate authorizations still pending after a failed run,
    /// releasing them instead of leaving them to expire
    pub deactivate_pending_on_failure: bool,
}

impl Default for ObtainOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            deactivate_pending_on_failure: false,
        }
    }
}

/// Resolver configuration for zone discovery and propagation probes
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Nameservers to query (empty = system defaults)
    pub nameservers: Vec<IpAddr>,

    /// Per-lookup timeout
    pub lookup_timeout: Duration,

    /// Lookup attempts before a query is reported failed
    pub attempts: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            lookup_timeout: Duration::from_secs(5),
            attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lets_encrypt_urls() {
        assert_eq!(ClientConfig::lets_encrypt(false).directory_url, LETS_ENCRYPT_PRODUCTION);
        assert_eq!(ClientConfig::lets_encrypt(true).directory_url, LETS_ENCRYPT_STAGING);
    }

    #[test]
    fn test_with_email_builds_mailto_contact() {
        let config = ClientConfig::lets_encrypt(true).with_email("admin@example.com");
        assert_eq!(config.contact, vec!["mailto:admin@example.com".to_string()]);
    }

    #[test]
    fn test_empty_directory_url_rejected() {
        let config = ClientConfig::new("");
        assert!(matches!(config.validate(), Err(AcmeError::InvalidInput(_))));
    }

    #[test]
    fn test_obtain_defaults() {
        let options = ObtainOptions::default();
        assert!(options.concurrency_limit.is_none());
        assert_eq!(options.poll_interval, Duration::from_secs(2));
        assert!(!options.deactivate_pending_on_failure);
    }
}
