//! ACME resource wire types
//!
//! JSON representations of the Account, Order, Authorization, and
//! Challenge resources (RFC 8555 §7.1), plus their status enums. Resource
//! URLs are not part of the wire body; the client fills them in from
//! Location headers or the parent resource.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Problem;

/// Account status (RFC 8555 §7.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Pending,
    Valid,
    Deactivated,
    Revoked,
}

/// Order status; transitions are monotonic forward except for the
/// terminal `invalid`, reachable from any non-terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// Authorization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// Challenge status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// Challenge validation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChallengeType {
    Dns01,
    Http01,
    TlsAlpn01,
    /// A type this client does not implement; left untouched
    Unknown,
}

impl From<String> for ChallengeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "dns-01" => ChallengeType::Dns01,
            "http-01" => ChallengeType::Http01,
            "tls-alpn-01" => ChallengeType::TlsAlpn01,
            _ => ChallengeType::Unknown,
        }
    }
}

impl From<ChallengeType> for String {
    fn from(value: ChallengeType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::Http01 => "http-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Order identifier; ACME currently defines only the "dns" type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// ACME account resource
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub orders: Option<String>,
    /// Account URL (the kid), from the Location header
    #[serde(skip)]
    pub url: String,
}

/// ACME order resource
#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    pub identifiers: Vec<Identifier>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub expires: Option<String>,
    /// Present only once the order is valid
    #[serde(default)]
    pub certificate: Option<String>,
    /// Present only once the order is invalid
    #[serde(default)]
    pub error: Option<Problem>,
    /// Order URL, from the Location header
    #[serde(skip)]
    pub url: String,
}

/// ACME authorization resource: proof-of-control requirement for one
/// domain within an order
#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub expires: Option<String>,
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    /// The challenge of the given type, if the server offered one
    pub fn challenge(&self, kind: ChallengeType) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == kind)
    }

    /// The domain this authorization covers, in the form the certificate
    /// names it (wildcard authorizations carry the base domain plus a flag)
    pub fn domain(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }
}

/// ACME challenge resource
#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub url: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub error: Option<Problem>,
}
