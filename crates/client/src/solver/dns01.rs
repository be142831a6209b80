//! DNS-01 challenge solver
//!
//! Publishes the challenge digest as a TXT record at
//! `_acme-challenge.<domain>`, in whatever zone is actually
//! authoritative for that name. Record creation and deletion are
//! delegated to a provider collaborator; everything the providers share
//! (zone discovery, record naming, digest computation, propagation
//! probing) lives here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::DnsConfig;
use crate::error::AcmeError;
use crate::resources::ChallengeType;
use crate::solver::{ChallengeSolver, SolverError};
use crate::zone::{challenge_fqdn, subdomain_for_zone, DnsQuery, HickoryDns, ZoneResolver};

/// Recommended TTL for challenge records, in seconds
pub const CHALLENGE_TTL: u32 = 60;

/// DNS backend collaborator
///
/// One implementation per hosting provider; a thin wrapper over the
/// provider's record API. The solver hands it the discovered zone and
/// the fully-qualified record name (both without trailing dots).
///
/// Both operations must be idempotent: creating a record that already
/// exists and deleting one that is already absent are successes.
#[async_trait]
pub trait DnsProvider: Send + Sync + std::fmt::Debug {
    /// Provider name, for diagnostics (e.g. "route53")
    fn name(&self) -> &'static str;

    /// Create a TXT record `fqdn` with `value` in `zone`
    async fn create_txt_record(&self, zone: &str, fqdn: &str, value: &str)
        -> Result<(), SolverError>;

    /// Delete the TXT record `fqdn` with `value` from `zone`
    async fn delete_txt_record(&self, zone: &str, fqdn: &str, value: &str)
        -> Result<(), SolverError>;
}

/// DNS-01 solver over a pluggable provider
#[derive(Debug)]
pub struct Dns01Solver {
    provider: Arc<dyn DnsProvider>,
    zones: ZoneResolver,
    dns: Arc<dyn DnsQuery>,
    propagation_timeout: Duration,
    poll_interval: Duration,
}

impl Dns01Solver {
    /// Solver using the system resolvers for zone discovery and
    /// propagation probing
    pub fn new(provider: Arc<dyn DnsProvider>) -> Self {
        Self::with_dns(provider, Arc::new(HickoryDns::new(&DnsConfig::default())))
    }

    /// Solver with injected DNS lookups (custom nameservers, tests)
    pub fn with_dns(provider: Arc<dyn DnsProvider>, dns: Arc<dyn DnsQuery>) -> Self {
        Self {
            provider,
            zones: ZoneResolver::new(Arc::clone(&dns)),
            dns,
            propagation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Override the propagation wait bounds
    pub fn with_timeouts(mut self, timeout: Duration, interval: Duration) -> Self {
        self.propagation_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    /// The TXT record value: base64url-encoded SHA-256 digest of the
    /// key authorization
    pub fn challenge_value(key_auth: &str) -> String {
        let digest = Sha256::digest(key_auth.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// Resolve where the record for `domain` goes: (zone, record fqdn),
    /// both without trailing dots
    async fn record_location(&self, domain: &str) -> Result<(String, String), AcmeError> {
        let fqdn = challenge_fqdn(domain);
        let zone = self.zones.find_zone(&fqdn).await?;

        // Invariant check: the walk must have stayed inside the name
        let subdomain = subdomain_for_zone(&fqdn, &zone)?;
        debug!(
            domain = %domain,
            zone = %zone,
            subdomain = %subdomain,
            "Resolved challenge record location"
        );

        Ok((
            zone.trim_end_matches('.').to_string(),
            fqdn.trim_end_matches('.').to_string(),
        ))
    }
}

#[async_trait]
impl ChallengeSolver for Dns01Solver {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::Dns01
    }

    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<(), AcmeError> {
        let (zone, fqdn) = self.record_location(domain).await?;
        let value = Self::challenge_value(key_auth);

        info!(
            domain = %domain,
            record = %fqdn,
            provider = %self.provider.name(),
            "Creating DNS-01 challenge record"
        );
        self.provider.create_txt_record(&zone, &fqdn, &value).await?;
        Ok(())
    }

    async fn cleanup(&self, domain: &str, _token: &str, key_auth: &str) -> Result<(), AcmeError> {
        let (zone, fqdn) = self.record_location(domain).await?;
        let value = Self::challenge_value(key_auth);

        debug!(
            domain = %domain,
            record = %fqdn,
            provider = %self.provider.name(),
            "Removing DNS-01 challenge record"
        );
        if let Err(e) = self.provider.delete_txt_record(&zone, &fqdn, &value).await {
            warn!(
                domain = %domain,
                record = %fqdn,
                error = %e,
                "Failed to remove DNS-01 challenge record"
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn timeout(&self) -> (Duration, Duration) {
        (self.propagation_timeout, self.poll_interval)
    }

    async fn propagated(&self, domain: &str, _token: &str, key_auth: &str) -> Result<bool, AcmeError> {
        let fqdn = challenge_fqdn(domain);
        let expected = Self::challenge_value(key_auth);

        let values = self.dns.txt(&fqdn).await?;
        Ok(values.iter().any(|value| *value == expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// In-memory provider; created records feed the fake DNS view
    #[derive(Debug, Default)]
    struct MemoryProvider {
        records: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl DnsProvider for MemoryProvider {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn create_txt_record(
            &self,
            _zone: &str,
            fqdn: &str,
            value: &str,
        ) -> Result<(), SolverError> {
            // Re-creating an existing record is a success, not a conflict
            self.records.lock().insert(fqdn.to_string(), value.to_string());
            Ok(())
        }

        async fn delete_txt_record(
            &self,
            _zone: &str,
            fqdn: &str,
            _value: &str,
        ) -> Result<(), SolverError> {
            // Absent records are fine; cleanup must be idempotent
            self.records.lock().remove(fqdn);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct StaticDns {
        zones: HashSet<String>,
        txt: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl DnsQuery for StaticDns {
        async fn soa(&self, name: &str) -> Result<Option<String>, AcmeError> {
            let name = crate::zone::to_fqdn(name);
            Ok(self.zones.contains(&name).then_some(name))
        }

        async fn txt(&self, name: &str) -> Result<Vec<String>, AcmeError> {
            Ok(self.txt.lock().get(name).cloned().unwrap_or_default())
        }
    }

    fn solver_for(zone: &str, provider: Arc<MemoryProvider>) -> Dns01Solver {
        let dns = StaticDns {
            zones: [crate::zone::to_fqdn(zone)].into_iter().collect(),
            txt: Mutex::new(HashMap::new()),
        };
        Dns01Solver::with_dns(provider, Arc::new(dns))
    }

    #[test]
    fn test_challenge_value_shape() {
        let value = Dns01Solver::challenge_value("token.thumbprint");
        // base64url of a 32-byte digest, unpadded
        assert_eq!(value.len(), 43);
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
        assert!(!value.contains('='));
    }

    #[test]
    fn test_challenge_value_is_deterministic() {
        assert_eq!(
            Dns01Solver::challenge_value("a.b"),
            Dns01Solver::challenge_value("a.b")
        );
        assert_ne!(
            Dns01Solver::challenge_value("a.b"),
            Dns01Solver::challenge_value("a.c")
        );
    }

    #[tokio::test]
    async fn test_present_creates_record_in_discovered_zone() {
        let provider = Arc::new(MemoryProvider::default());
        let solver = solver_for("example.com", Arc::clone(&provider));

        solver.present("www.example.com", "tok", "tok.thumb").await.unwrap();

        let records = provider.records.lock();
        let value = records.get("_acme-challenge.www.example.com").unwrap();
        assert_eq!(*value, Dns01Solver::challenge_value("tok.thumb"));
    }

    #[tokio::test]
    async fn test_wildcard_record_lands_on_base_domain() {
        let provider = Arc::new(MemoryProvider::default());
        let solver = solver_for("example.com", Arc::clone(&provider));

        solver.present("*.example.com", "tok", "tok.thumb").await.unwrap();

        assert!(provider.records.lock().contains_key("_acme-challenge.example.com"));
    }

    #[tokio::test]
    async fn test_present_fails_without_zone() {
        let provider = Arc::new(MemoryProvider::default());
        let solver = solver_for("other.net", Arc::clone(&provider));

        let result = solver.present("www.example.com", "tok", "tok.thumb").await;
        assert!(matches!(result, Err(AcmeError::ZoneNotFound { .. })));
        assert!(provider.records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_of_absent_record_is_ok() {
        let provider = Arc::new(MemoryProvider::default());
        let solver = solver_for("example.com", Arc::clone(&provider));

        solver.cleanup("www.example.com", "tok", "tok.thumb").await.unwrap();
    }

    #[tokio::test]
    async fn test_present_then_cleanup_round_trip() {
        let provider = Arc::new(MemoryProvider::default());
        let solver = solver_for("example.com", Arc::clone(&provider));

        solver.present("www.example.com", "tok", "tok.thumb").await.unwrap();
        assert_eq!(provider.records.lock().len(), 1);

        solver.cleanup("www.example.com", "tok", "tok.thumb").await.unwrap();
        assert!(provider.records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_propagated_sees_record_only_when_visible() {
        let provider = Arc::new(MemoryProvider::default());
        let dns = Arc::new(StaticDns {
            zones: [crate::zone::to_fqdn("example.com")].into_iter().collect(),
            txt: Mutex::new(HashMap::new()),
        });
        let solver = Dns01Solver::with_dns(provider, Arc::clone(&dns) as Arc<dyn DnsQuery>);

        assert!(!solver.propagated("example.com", "tok", "tok.thumb").await.unwrap());

        dns.txt.lock().insert(
            "_acme-challenge.example.com.".to_string(),
            vec![Dns01Solver::challenge_value("tok.thumb")],
        );
        assert!(solver.propagated("example.com", "tok", "tok.thumb").await.unwrap());
    }
}
