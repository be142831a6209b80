//! ACME protocol client
//!
//! High-level operations over the signed transport: account lifecycle,
//! order and authorization CRUD, challenge notification, finalization,
//! and certificate download. One client holds one account key and one
//! cached directory; it is safe to share behind an `Arc` across
//! concurrent per-domain workers.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::directory::Directory;
use crate::error::AcmeError;
use crate::jose::AccountKey;
use crate::resources::{Account, AccountStatus, Authorization, Challenge, Identifier, Order};
use crate::transport::Transport;

const PEM_CHAIN_CONTENT_TYPE: &str = "application/pem-certificate-chain";

/// ACME client bound to one account key
pub struct AcmeClient {
    config: ClientConfig,
    directory: Directory,
    transport: Transport,
}

impl AcmeClient {
    /// Resolve the server's directory and build a client
    ///
    /// The directory is fetched once here and cached for the client's
    /// lifetime.
    pub async fn connect(config: ClientConfig, key: Arc<AccountKey>) -> Result<Self, AcmeError> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let directory = Directory::discover(&http, &config.directory_url).await?;
        let transport = Transport::new(http, key, directory.new_nonce.clone());

        Ok(Self {
            config,
            directory,
            transport,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Key authorization for a challenge token under this account's key
    pub fn key_authorization(&self, token: &str) -> String {
        self.transport.key().key_authorization(token)
    }

    /// The account URL, once registered or looked up
    pub fn account_url(&self) -> Option<String> {
        self.transport.kid()
    }

    // ------------------------------------------------------------------
    // Account lifecycle
    // ------------------------------------------------------------------

    /// Register the account key with the server
    ///
    /// A server answering 200 instead of 201 already knows this key;
    /// that is surfaced as the distinct [`AcmeError::AccountAlreadyExists`]
    /// so callers can treat it as success-equivalent. Either way the
    /// account URL is retained for subsequent request signing.
    pub async fn register(&self, accept_tos: bool) -> Result<Account, AcmeError> {
        info!(contact = ?self.config.contact, "Registering ACME account");

        let payload = json!({
            "contact": self.config.contact,
            "termsOfServiceAgreed": accept_tos,
        });

        let response = self
            .transport
            .post_with_jwk(&self.directory.new_account, &payload)
            .await?;

        let location = response
            .location()
            .ok_or(AcmeError::MissingLocation("newAccount"))?
            .to_string();
        self.transport.set_kid(location.clone());

        if response.status() == StatusCode::OK {
            debug!(account = %location, "Account key was already registered");
            return Err(AcmeError::AccountAlreadyExists { location });
        }

        let mut account: Account = response.json()?;
        account.url = location;
        info!(account = %account.url, "ACME account registered");
        Ok(account)
    }

    /// Look up the account for this key without creating one
    pub async fn lookup_account(&self) -> Result<Account, AcmeError> {
        let payload = json!({ "onlyReturnExisting": true });

        let response = self
            .transport
            .post_with_jwk(&self.directory.new_account, &payload)
            .await?;

        let location = response
            .location()
            .ok_or(AcmeError::MissingLocation("newAccount"))?
            .to_string();
        self.transport.set_kid(location.clone());

        let mut account: Account = response.json()?;
        account.url = location;
        Ok(account)
    }

    /// Roll the account over to a new key (RFC 8555 §7.3.5)
    ///
    /// After a successful change the server only accepts the new key;
    /// reconnect with it before issuing further requests.
    pub async fn key_change(&self, new_key: &AccountKey) -> Result<(), AcmeError> {
        let url = self.directory.key_change.as_deref().ok_or_else(|| {
            AcmeError::UnexpectedResponse("directory offers no keyChange endpoint".to_string())
        })?;
        let account_url = self.transport.kid().ok_or(AcmeError::MissingAccount)?;

        info!(account = %account_url, "Rolling account key");

        let inner = AccountKey::key_change_jws(new_key, self.transport.key(), &account_url, url)?;
        self.transport.post(url, &inner).await?;
        Ok(())
    }

    /// Deactivate the account
    ///
    /// Idempotent: deactivating an already-deactivated account succeeds
    /// without a server round-trip for the update.
    pub async fn deactivate_account(&self) -> Result<(), AcmeError> {
        let account_url = self.transport.kid().ok_or(AcmeError::MissingAccount)?;

        let current: Account = self.transport.post_as_get(&account_url).await?.json()?;
        if current.status == AccountStatus::Deactivated {
            debug!(account = %account_url, "Account is already deactivated");
            return Ok(());
        }

        info!(account = %account_url, "Deactivating ACME account");
        self.transport
            .post(&account_url, &json!({ "status": "deactivated" }))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Create a new order for a set of domains
    pub async fn new_order(&self, domains: &[String]) -> Result<Order, AcmeError> {
        if domains.is_empty() {
            return Err(AcmeError::InvalidInput(
                "an order requires at least one domain".to_string(),
            ));
        }

        let identifiers: Vec<Identifier> =
            domains.iter().map(|domain| Identifier::dns(domain.clone())).collect();

        info!(domains = ?domains, "Creating certificate order");
        let response = self
            .transport
            .post(&self.directory.new_order, &json!({ "identifiers": identifiers }))
            .await?;

        let url = response
            .location()
            .ok_or(AcmeError::MissingLocation("newOrder"))?
            .to_string();

        let mut order: Order = response.json()?;
        order.url = url;
        debug!(order = %order.url, authorizations = order.authorizations.len(), "Order created");
        Ok(order)
    }

    /// Refresh an order from its URL
    pub async fn get_order(&self, url: &str) -> Result<Order, AcmeError> {
        if url.is_empty() {
            return Err(AcmeError::EmptyUrl { operation: "order[get]" });
        }

        let mut order: Order = self.transport.post_as_get(url).await?.json()?;
        order.url = url.to_string();
        Ok(order)
    }

    /// Submit the CSR for an order
    ///
    /// The returned order may still be `processing`; poll it until the
    /// server settles on `valid` or `invalid`.
    pub async fn finalize_order(&self, order: &Order, csr_der: &[u8]) -> Result<Order, AcmeError> {
        if order.finalize.is_empty() {
            return Err(AcmeError::EmptyUrl { operation: "order[finalize]" });
        }

        info!(order = %order.url, "Finalizing order");
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self.transport.post(&order.finalize, &payload).await?;

        let mut finalized: Order = response.json()?;
        finalized.url = response
            .location()
            .map(str::to_string)
            .unwrap_or_else(|| order.url.clone());
        Ok(finalized)
    }

    /// Download the certificate chain for a valid order
    pub async fn fetch_certificate(&self, url: &str) -> Result<String, AcmeError> {
        if url.is_empty() {
            return Err(AcmeError::EmptyUrl { operation: "certificate[get]" });
        }

        debug!(url = %url, "Downloading certificate chain");
        let response = self
            .transport
            .post_as_get_accept(url, PEM_CHAIN_CONTENT_TYPE)
            .await?;

        String::from_utf8(response.body().to_vec())
            .map_err(|e| AcmeError::CertificateParse(format!("chain is not UTF-8: {}", e)))
    }

    // ------------------------------------------------------------------
    // Authorizations and challenges
    // ------------------------------------------------------------------

    /// Fetch an authorization
    pub async fn get_authorization(&self, url: &str) -> Result<Authorization, AcmeError> {
        if url.is_empty() {
            return Err(AcmeError::EmptyUrl { operation: "authorization[get]" });
        }

        self.transport.post_as_get(url).await?.json()
    }

    /// Deactivate an authorization, releasing it before expiry
    pub async fn deactivate_authorization(&self, url: &str) -> Result<(), AcmeError> {
        if url.is_empty() {
            return Err(AcmeError::EmptyUrl { operation: "authorization[deactivate]" });
        }

        debug!(authorization = %url, "Deactivating authorization");
        self.transport
            .post(url, &json!({ "status": "deactivated" }))
            .await?;
        Ok(())
    }

    /// Tell the server a presented challenge is ready for validation
    pub async fn accept_challenge(&self, url: &str) -> Result<Challenge, AcmeError> {
        if url.is_empty() {
            return Err(AcmeError::EmptyUrl { operation: "challenge[accept]" });
        }

        debug!(challenge = %url, "Notifying server that challenge is ready");
        self.transport.post(url, &json!({})).await?.json()
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.config.directory_url)
            .field("has_account", &self.transport.kid().is_some())
            .finish()
    }
}
