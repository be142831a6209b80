//! TLS-ALPN-01 challenge solver
//!
//! The proof is a self-signed certificate for the domain carrying the
//! acmeIdentifier extension (SHA-256 of the key authorization). The
//! validation server connects with the `acme-tls/1` ALPN protocol and
//! expects the host's TLS listener to answer with that certificate for
//! the probed SNI name; the solver deposits it into a shared store the
//! listener consults.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::AcmeError;
use crate::resources::ChallengeType;
use crate::solver::{ChallengeSolver, SolverError};
use crate::zone::normalize_domain;

/// ALPN protocol name negotiated during validation (RFC 8737)
pub const ACME_TLS_ALPN_PROTOCOL: &str = "acme-tls/1";

/// Challenge certificate in DER form, for the host's TLS stack
#[derive(Debug, Clone)]
pub struct TlsAlpnCertificate {
    pub certificate_der: Vec<u8>,
    pub private_key_der: Vec<u8>,
}

/// Challenge certificates keyed by SNI name, shared with the listener
#[derive(Debug, Default)]
pub struct CertificateStore {
    certs: RwLock<HashMap<String, TlsAlpnCertificate>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str) -> Option<TlsAlpnCertificate> {
        self.certs.read().get(domain).cloned()
    }

    pub fn insert(&self, domain: &str, certificate: TlsAlpnCertificate) {
        self.certs.write().insert(domain.to_string(), certificate);
    }

    pub fn remove(&self, domain: &str) {
        self.certs.write().remove(domain);
    }

    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }
}

/// TLS-ALPN-01 solver backed by a shared certificate store
#[derive(Debug)]
pub struct TlsAlpn01Solver {
    store: Arc<CertificateStore>,
}

impl TlsAlpn01Solver {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    fn build_certificate(domain: &str, key_auth: &str) -> Result<TlsAlpnCertificate, SolverError> {
        let digest = Sha256::digest(key_auth.as_bytes());

        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).map_err(|e| {
            SolverError::Present {
                name: domain.to_string(),
                message: format!("invalid certificate params: {}", e),
            }
        })?;
        params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(digest.as_slice())];

        let key = rcgen::KeyPair::generate().map_err(|e| SolverError::Present {
            name: domain.to_string(),
            message: format!("key generation failed: {}", e),
        })?;
        let certificate = params.self_signed(&key).map_err(|e| SolverError::Present {
            name: domain.to_string(),
            message: format!("self-signing failed: {}", e),
        })?;

        Ok(TlsAlpnCertificate {
            certificate_der: certificate.der().to_vec(),
            private_key_der: key.serialize_der(),
        })
    }
}

#[async_trait]
impl ChallengeSolver for TlsAlpn01Solver {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::TlsAlpn01
    }

    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<(), AcmeError> {
        let sni = normalize_domain(domain);
        debug!(domain = %domain, sni = %sni, "Depositing TLS-ALPN-01 challenge certificate");

        // Replacing an existing challenge certificate is fine
        let certificate = Self::build_certificate(sni, key_auth)?;
        self.store.insert(sni, certificate);
        Ok(())
    }

    async fn cleanup(&self, domain: &str, _token: &str, _key_auth: &str) -> Result<(), AcmeError> {
        let sni = normalize_domain(domain);
        debug!(domain = %domain, sni = %sni, "Removing TLS-ALPN-01 challenge certificate");
        self.store.remove(sni);
        Ok(())
    }

    fn timeout(&self) -> (std::time::Duration, std::time::Duration) {
        // The certificate is live as soon as the store holds it
        (std::time::Duration::from_secs(10), std::time::Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_present_deposits_certificate() {
        let store = Arc::new(CertificateStore::new());
        let solver = TlsAlpn01Solver::new(Arc::clone(&store));

        solver.present("example.com", "tok", "tok.thumb").await.unwrap();

        let certificate = store.get("example.com").unwrap();
        assert!(!certificate.certificate_der.is_empty());
        assert!(!certificate.private_key_der.is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_stored_under_base_domain() {
        let store = Arc::new(CertificateStore::new());
        let solver = TlsAlpn01Solver::new(Arc::clone(&store));

        solver.present("*.example.com", "tok", "tok.thumb").await.unwrap();
        assert!(store.get("example.com").is_some());
    }

    #[tokio::test]
    async fn test_cleanup_removes_certificate() {
        let store = Arc::new(CertificateStore::new());
        let solver = TlsAlpn01Solver::new(Arc::clone(&store));

        solver.present("example.com", "tok", "tok.thumb").await.unwrap();
        solver.cleanup("example.com", "tok", "tok.thumb").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_of_absent_certificate_is_ok() {
        let store = Arc::new(CertificateStore::new());
        let solver = TlsAlpn01Solver::new(store);
        solver.cleanup("example.com", "tok", "tok.thumb").await.unwrap();
    }

    #[tokio::test]
    async fn test_propagated_is_immediate() {
        let solver = TlsAlpn01Solver::new(Arc::new(CertificateStore::new()));
        assert!(solver.propagated("example.com", "tok", "x").await.unwrap());
    }
}
