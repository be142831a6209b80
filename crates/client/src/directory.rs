//! ACME directory document
//!
//! The directory maps operation names to endpoint URLs and is the only
//! URL a client needs to configure; everything else is discovered from
//! it (RFC 8555 §7.1.1). Fetched once per client lifetime and cached.

use serde::Deserialize;
use tracing::debug;

use crate::error::AcmeError;

/// Service endpoints resolved from the directory URL
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: Option<String>,
    #[serde(default)]
    pub key_change: Option<String>,
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

/// Optional directory metadata
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default)]
    pub terms_of_service: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub caa_identities: Option<Vec<String>>,
    #[serde(default)]
    pub external_account_required: bool,
}

impl Directory {
    /// Fetch the directory document
    ///
    /// The directory itself is the one unauthenticated GET the protocol
    /// allows.
    pub async fn discover(http: &reqwest::Client, url: &str) -> Result<Self, AcmeError> {
        debug!(url = %url, "Fetching ACME directory");

        let response = http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AcmeError::UnexpectedResponse(format!(
                "directory fetch returned HTTP {}",
                response.status()
            )));
        }

        let directory: Directory = response.json().await?;
        debug!(
            new_nonce = %directory.new_nonce,
            new_order = %directory.new_order,
            "ACME directory resolved"
        );
        Ok(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_parse() {
        let directory: Directory = serde_json::from_str(
            r#"{
                "newNonce": "https://ca.test/acme/new-nonce",
                "newAccount": "https://ca.test/acme/new-acct",
                "newOrder": "https://ca.test/acme/new-order",
                "revokeCert": "https://ca.test/acme/revoke-cert",
                "keyChange": "https://ca.test/acme/key-change",
                "meta": {
                    "termsOfService": "https://ca.test/terms",
                    "caaIdentities": ["ca.test"]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(directory.new_nonce, "https://ca.test/acme/new-nonce");
        assert_eq!(directory.key_change.as_deref(), Some("https://ca.test/acme/key-change"));
        let meta = directory.meta.unwrap();
        assert_eq!(meta.terms_of_service.as_deref(), Some("https://ca.test/terms"));
        assert!(!meta.external_account_required);
    }

    #[test]
    fn test_minimal_directory_parse() {
        let directory: Directory = serde_json::from_str(
            r#"{
                "newNonce": "https://ca.test/nonce",
                "newAccount": "https://ca.test/acct",
                "newOrder": "https://ca.test/order"
            }"#,
        )
        .unwrap();
        assert!(directory.revoke_cert.is_none());
        assert!(directory.meta.is_none());
    }
}
