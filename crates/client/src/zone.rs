//! Authoritative-zone discovery and DNS probing
//!
//! DNS-01 records must be created in the zone that is authoritative for
//! the validated name, which is rarely the registered domain itself.
//! The zone is discovered by walking the FQDN's labels from most
//! specific to least specific, querying each candidate cut for an SOA
//! record; the first authoritative answer wins. Results are cached per
//! resolver instance so one obtain run never repeats a walk.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::DnsConfig;
use crate::error::AcmeError;

/// Label prefix for DNS-01 challenge records
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// DNS lookups needed for zone discovery and propagation probing
///
/// Negative answers (NXDOMAIN, NODATA) are empty results, not errors;
/// errors mean the query itself could not be completed.
#[async_trait]
pub trait DnsQuery: Send + Sync + std::fmt::Debug {
    /// The zone apex name, when `name` answers an authoritative SOA
    async fn soa(&self, name: &str) -> Result<Option<String>, AcmeError>;

    /// TXT record strings at `name`
    async fn txt(&self, name: &str) -> Result<Vec<String>, AcmeError>;
}

/// hickory-resolver backed lookups
#[derive(Debug)]
pub struct HickoryDns {
    resolver: TokioResolver,
}

impl HickoryDns {
    pub fn new(config: &DnsConfig) -> Self {
        let resolver_config = if config.nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &config.nameservers {
                resolver_config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = config.lookup_timeout;
        opts.attempts = config.attempts;
        opts.cache_size = 0; // stale positives would defeat propagation probing

        let resolver =
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();
        Self { resolver }
    }
}

#[async_trait]
impl DnsQuery for HickoryDns {
    async fn soa(&self, name: &str) -> Result<Option<String>, AcmeError> {
        match self.resolver.soa_lookup(name).await {
            Ok(lookup) => {
                let apex = lookup
                    .as_lookup()
                    .record_iter()
                    .find(|record| record.record_type() == RecordType::SOA)
                    .map(|record| to_fqdn(&record.name().to_ascii().to_lowercase()));
                Ok(apex)
            }
            Err(e) if is_negative_answer(&e.to_string()) => Ok(None),
            Err(e) => Err(AcmeError::Dns {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn txt(&self, name: &str) -> Result<Vec<String>, AcmeError> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|record| {
                    // A TXT record may be split into multiple strings; join them
                    record
                        .txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect()),
            Err(e) if is_negative_answer(&e.to_string()) => Ok(Vec::new()),
            Err(e) => Err(AcmeError::Dns {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// NXDOMAIN, NODATA, and their resolver-specific spellings are ordinary
/// pre-propagation conditions rather than lookup failures
fn is_negative_answer(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("no records found")
        || message.contains("nxdomain")
        || message.contains("record not found")
}

/// FQDN-to-zone resolver with a per-instance cache
#[derive(Debug)]
pub struct ZoneResolver {
    dns: Arc<dyn DnsQuery>,
    cache: Mutex<HashMap<String, String>>,
}

impl ZoneResolver {
    pub fn new(dns: Arc<dyn DnsQuery>) -> Self {
        Self {
            dns,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Discover the most specific zone authoritative for `fqdn`
    ///
    /// Walks candidate cuts from the full name upward, stripping one
    /// leftmost label at a time; the first candidate answering an SOA is
    /// the authoritative zone. Candidates that answer negatively are
    /// skipped; a failed query aborts the walk since a wrong pick would
    /// place the record in the wrong zone.
    pub async fn find_zone(&self, fqdn: &str) -> Result<String, AcmeError> {
        let fqdn = to_fqdn(fqdn);

        if let Some(zone) = self.cache.lock().get(&fqdn) {
            trace!(fqdn = %fqdn, zone = %zone, "Zone found in cache");
            return Ok(zone.clone());
        }

        let labels: Vec<&str> = fqdn.trim_end_matches('.').split('.').collect();
        for cut in 0..labels.len() {
            let candidate = format!("{}.", labels[cut..].join("."));
            trace!(candidate = %candidate, "Probing for SOA");

            if let Some(zone) = self.dns.soa(&candidate).await? {
                debug!(fqdn = %fqdn, zone = %zone, "Authoritative zone discovered");
                self.cache.lock().insert(fqdn, zone.clone());
                return Ok(zone);
            }
        }

        Err(AcmeError::ZoneNotFound { fqdn })
    }
}

/// Normalize a name to fully-qualified form (trailing dot)
pub fn to_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Strip a wildcard prefix; challenge records for `*.example.com` live
/// at the base domain
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// The fully-qualified challenge record name for a domain
pub fn challenge_fqdn(domain: &str) -> String {
    format!(
        "{}.{}.",
        ACME_CHALLENGE_LABEL,
        normalize_domain(domain).trim_end_matches('.')
    )
}

/// The labels of `fqdn` below the zone cut
///
/// The composition invariant `subdomain + "." + zone == fqdn` holds for
/// every valid input; an FQDN outside the zone is an orchestration bug
/// surfaced as `SubdomainExtraction`.
pub fn subdomain_for_zone(fqdn: &str, zone: &str) -> Result<String, AcmeError> {
    let fqdn = to_fqdn(fqdn);
    let zone = to_fqdn(zone);

    match fqdn.strip_suffix(&format!(".{}", zone)) {
        Some(subdomain) if !subdomain.is_empty() => Ok(subdomain.to_string()),
        _ => Err(AcmeError::SubdomainExtraction {
            fqdn,
            zone,
        }),
    }
}
