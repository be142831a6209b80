//! ACME certificate issuance client
//!
//! Speaks the ACME protocol (RFC 8555) end to end: account
//! registration, order creation, authorization and challenge
//! resolution, order finalization, and certificate retrieval.
//!
//! # Architecture
//!
//! - [`Transport`](transport::Transport) - signed request/response
//!   plumbing with the anti-replay [`NoncePool`](nonce::NoncePool)
//! - [`AccountKey`](jose::AccountKey) - ES256 JWS envelopes, JWK
//!   thumbprints, key authorizations
//! - [`AcmeClient`](client::AcmeClient) - directory resolution, account
//!   lifecycle, order/authorization/challenge operations
//! - [`ChallengeSolver`](solver::ChallengeSolver) - one variant per
//!   validation method (DNS-01, HTTP-01, TLS-ALPN-01), registered in an
//!   explicit [`SolverRegistry`](solver::SolverRegistry)
//! - [`ZoneResolver`](zone::ZoneResolver) - authoritative-zone
//!   discovery for DNS-01 via SOA walking
//! - [`wait_for`](wait::wait_for) - bounded polling shared by
//!   propagation probing and status polling
//! - [`Issuer`](obtain::Issuer) - the obtain orchestrator running one
//!   concurrent worker per domain
//!
//! # Issuance flow
//!
//! 1. [`Issuer::obtain`](obtain::Issuer::obtain) creates an order for
//!    the deduplicated domain list
//! 2. Each authorization gets a worker: it selects the preferred
//!    supported challenge, presents the proof, waits for out-of-band
//!    propagation, notifies the server, and polls the authorization to
//!    a terminal status
//! 3. Challenge material is cleaned up for every domain that reached
//!    presentation, whatever the outcome
//! 4. If any domain failed, the run fails with an error naming every
//!    failing domain; otherwise the order is polled to ready, finalized
//!    with a fresh CSR, polled to valid, and the chain downloaded
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ferrocert_client::{
//!     AccountKey, AcmeClient, ChallengeStore, ClientConfig, Http01Solver, Issuer,
//!     SolverRegistry,
//! };
//!
//! # async fn run() -> Result<(), ferrocert_client::AcmeError> {
//! let key = Arc::new(AccountKey::generate()?);
//! let config = ClientConfig::lets_encrypt(true).with_email("admin@example.com");
//! let client = Arc::new(AcmeClient::connect(config, key).await?);
//!
//! match client.register(true).await {
//!     Ok(_) => {}
//!     Err(ferrocert_client::AcmeError::AccountAlreadyExists { .. }) => {}
//!     Err(e) => return Err(e),
//! }
//!
//! let store = Arc::new(ChallengeStore::new());
//! let solvers = SolverRegistry::new().register(Arc::new(Http01Solver::new(store)));
//!
//! let issuer = Issuer::new(client, solvers);
//! let bundle = issuer.obtain(&["example.com".to_string()]).await?;
//! println!("issued, expires {}", bundle.expires);
//! # Ok(())
//! # }
//! ```

pub mod cert;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod jose;
pub mod nonce;
pub mod obtain;
pub mod resources;
pub mod solver;
pub mod transport;
pub mod wait;
pub mod zone;

pub use cert::CertificateBundle;
pub use client::AcmeClient;
pub use config::{ClientConfig, DnsConfig, ObtainOptions};
pub use directory::Directory;
pub use error::{AcmeError, Problem};
pub use jose::AccountKey;
pub use obtain::Issuer;
pub use resources::{
    Account, Authorization, Challenge, ChallengeType, Identifier, Order, OrderStatus,
};
pub use solver::{
    CertificateStore, ChallengeSolver, ChallengeStore, Dns01Solver, DnsProvider, Http01Solver,
    SolverError, SolverRegistry, TlsAlpn01Solver,
};
pub use zone::{DnsQuery, ZoneResolver};
