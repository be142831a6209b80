//! Certificate requests and issued bundles

use chrono::{DateTime, Utc};

use crate::error::AcmeError;

/// An issued certificate with its private key
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    /// Full PEM chain as returned by the server (leaf first)
    pub certificate_chain_pem: String,
    /// PEM-encoded private key matching the leaf
    pub private_key_pem: String,
    /// Expiry of the leaf certificate
    pub expires: DateTime<Utc>,
}

/// A generated CSR with the private key it was signed by
#[derive(Debug)]
pub struct CertificateRequest {
    pub csr_der: Vec<u8>,
    pub private_key_pem: String,
}

/// Generate a fresh P-256 key and a CSR covering `domains`
///
/// The certificate key is always distinct from the account key.
pub fn generate_csr(domains: &[String]) -> Result<CertificateRequest, AcmeError> {
    if domains.is_empty() {
        return Err(AcmeError::InvalidInput(
            "certificate request requires at least one domain".to_string(),
        ));
    }

    let key = rcgen::KeyPair::generate()
        .map_err(|e| AcmeError::Csr(format!("key generation failed: {}", e)))?;

    let params = rcgen::CertificateParams::new(domains.to_vec())
        .map_err(|e| AcmeError::Csr(format!("invalid domains: {}", e)))?;

    let csr = params
        .serialize_request(&key)
        .map_err(|e| AcmeError::Csr(format!("CSR serialization failed: {}", e)))?;

    Ok(CertificateRequest {
        csr_der: csr.der().to_vec(),
        private_key_pem: key.serialize_pem(),
    })
}

/// Extract the expiry of the leaf certificate from a PEM chain
pub fn parse_certificate_expiry(cert_pem: &str) -> Result<DateTime<Utc>, AcmeError> {
    use x509_parser::prelude::FromDer;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| AcmeError::CertificateParse(format!("invalid PEM: {}", e)))?;

    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&pem.contents)
        .map_err(|e| AcmeError::CertificateParse(format!("invalid DER: {}", e)))?;

    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| AcmeError::CertificateParse("expiry timestamp out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_csr() {
        let request = generate_csr(&["example.com".to_string(), "www.example.com".to_string()])
            .unwrap();

        assert!(!request.csr_der.is_empty());
        assert!(request.private_key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_generate_csr_requires_domains() {
        assert!(matches!(generate_csr(&[]), Err(AcmeError::InvalidInput(_))));
    }

    #[test]
    fn test_parse_expiry_of_self_signed() {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let expires = parse_certificate_expiry(&cert.pem()).unwrap();
        assert!(expires > Utc::now());
    }

    #[test]
    fn test_parse_expiry_rejects_garbage() {
        assert!(matches!(
            parse_certificate_expiry("not a certificate"),
            Err(AcmeError::CertificateParse(_))
        ));
    }
}
