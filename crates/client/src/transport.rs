//! Signed HTTP transport with nonce management
//!
//! Every authenticated request draws a nonce from the pool (fetching one
//! from the newNonce endpoint when the pool is dry), signs the envelope,
//! and harvests the Replay-Nonce header of whatever comes back - success
//! or error - into the pool. A `badNonce` rejection is retried exactly
//! once with a freshly fetched nonce; a second rejection surfaces as a
//! protocol error.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{AcmeError, Problem};
use crate::jose::AccountKey;
use crate::nonce::NoncePool;

const JOSE_CONTENT_TYPE: &str = "application/jose+json";
const REPLAY_NONCE: &str = "replay-nonce";

/// Response from a signed ACME request
#[derive(Debug)]
pub struct AcmeResponse {
    status: StatusCode,
    location: Option<String>,
    body: Vec<u8>,
}

impl AcmeResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Location header, where the server publishes new resource URLs
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AcmeError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Signed request/response plumbing shared by all protocol services
pub struct Transport {
    http: reqwest::Client,
    key: Arc<AccountKey>,
    nonces: NoncePool,
    new_nonce_url: String,
    /// Account URL used as the JWS kid; set after registration
    kid: RwLock<Option<String>>,
}

impl Transport {
    pub fn new(http: reqwest::Client, key: Arc<AccountKey>, new_nonce_url: String) -> Self {
        Self {
            http,
            key,
            nonces: NoncePool::new(),
            new_nonce_url,
            kid: RwLock::new(None),
        }
    }

    /// The account key backing this transport's signatures
    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn kid(&self) -> Option<String> {
        self.kid.read().clone()
    }

    pub fn set_kid(&self, kid: String) {
        *self.kid.write() = Some(kid);
    }

    /// Signed POST carrying a JSON payload, authenticated by kid
    pub async fn post(&self, url: &str, payload: &Value) -> Result<AcmeResponse, AcmeError> {
        self.execute(url, Some(payload), false, None).await
    }

    /// Signed POST with the account's full JWK in the header, for
    /// newAccount and other pre-kid operations
    pub async fn post_with_jwk(&self, url: &str, payload: &Value) -> Result<AcmeResponse, AcmeError> {
        self.execute(url, Some(payload), true, None).await
    }

    /// Authenticated read: a signed envelope with a zero-length payload
    /// (RFC 8555 §6.3)
    pub async fn post_as_get(&self, url: &str) -> Result<AcmeResponse, AcmeError> {
        self.execute(url, None, false, None).await
    }

    /// Authenticated read with an explicit Accept header, for resources
    /// with negotiable representations (certificate chains)
    pub async fn post_as_get_accept(
        &self,
        url: &str,
        accept: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        self.execute(url, None, false, Some(accept)).await
    }

    async fn execute(
        &self,
        url: &str,
        payload: Option<&Value>,
        use_jwk: bool,
        accept: Option<&str>,
    ) -> Result<AcmeResponse, AcmeError> {
        let nonce = match self.nonces.take() {
            Some(nonce) => nonce,
            None => self.fetch_nonce().await?,
        };

        match self.attempt(url, payload, use_jwk, accept, &nonce).await {
            Err(error) if error.is_bad_nonce() => {
                debug!(url = %url, "Server rejected nonce, retrying once with a fresh one");
                let fresh = self.fetch_nonce().await?;
                self.attempt(url, payload, use_jwk, accept, &fresh).await
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        url: &str,
        payload: Option<&Value>,
        use_jwk: bool,
        accept: Option<&str>,
        nonce: &str,
    ) -> Result<AcmeResponse, AcmeError> {
        let kid = if use_jwk {
            None
        } else {
            Some(self.kid.read().clone().ok_or(AcmeError::MissingAccount)?)
        };

        let signed = self.key.sign(url, nonce, kid.as_deref(), payload)?;

        trace!(url = %url, authenticated = !use_jwk, "Sending signed ACME request");
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, JOSE_CONTENT_TYPE)
            .json(&signed);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        let response = request.send().await?;

        // Nonces are scarce; harvest from every response, errors included
        self.harvest_nonce(response.headers());

        let status = response.status();
        let location = header_string(response.headers(), "location");
        let retry_after = retry_after_hint(response.headers());
        let body = response.bytes().await?.to_vec();

        if status.is_success() {
            return Ok(AcmeResponse {
                status,
                location,
                body,
            });
        }

        let mut problem = match serde_json::from_slice::<Problem>(&body) {
            Ok(problem) => problem,
            Err(_) => Problem {
                detail: String::from_utf8_lossy(&body).into_owned(),
                ..Default::default()
            },
        };
        if problem.status.is_none() {
            problem.status = Some(status.as_u16());
        }
        if problem.is_rate_limited() {
            problem.retry_after = retry_after;
        }

        warn!(url = %url, status = %status, error = %problem, "ACME request rejected");
        Err(AcmeError::Protocol(problem))
    }

    /// Fetch a fresh nonce from the newNonce endpoint
    ///
    /// The fetched nonce is returned to the caller directly rather than
    /// pooled, so a retry always uses it immediately.
    pub async fn fetch_nonce(&self) -> Result<String, AcmeError> {
        trace!(url = %self.new_nonce_url, "Fetching fresh nonce");
        let response = self.http.head(&self.new_nonce_url).send().await?;

        header_string(response.headers(), REPLAY_NONCE).ok_or(AcmeError::MissingNonce)
    }

    fn harvest_nonce(&self, headers: &HeaderMap) {
        if let Some(nonce) = header_string(headers, REPLAY_NONCE) {
            self.nonces.put(nonce);
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("new_nonce_url", &self.new_nonce_url)
            .field("has_kid", &self.kid.read().is_some())
            .finish()
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Parse a Retry-After header given in seconds
///
/// The HTTP-date form is rare from ACME servers and is ignored rather
/// than guessed at.
fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
