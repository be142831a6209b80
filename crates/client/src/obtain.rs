//! Obtain orchestrator
//!
//! Drives one certificate issuance end to end: order creation, one
//! concurrent worker per authorization running the challenge state
//! machine, unconditional cleanup of presented material, failure
//! aggregation, finalization, and chain download.
//!
//! # Per-domain state machine
//!
//! `NotStarted -> Presenting -> Propagating -> Notified -> Validating ->
//! Valid | Invalid`
//!
//! Workers run independently; a failing domain never aborts its
//! siblings. Cleanup for a domain happens-after its presentation
//! attempt, and finalization happens-after every worker reached a
//! terminal state.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cert::{generate_csr, parse_certificate_expiry, CertificateBundle};
use crate::client::AcmeClient;
use crate::config::ObtainOptions;
use crate::error::{AcmeError, FailureSet};
use crate::resources::{AuthorizationStatus, OrderStatus};
use crate::solver::{ChallengeSolver, SolverRegistry};
use crate::wait::{wait_for, CheckError};

/// Per-domain progress through challenge validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomainState {
    NotStarted,
    Presenting,
    Propagating,
    Notified,
    Validating,
    Valid,
    Invalid,
}

/// Challenge material a worker published, retained so cleanup can run
/// regardless of how the worker ended
struct Presentation {
    solver: Arc<dyn ChallengeSolver>,
    domain: String,
    token: String,
    key_auth: String,
}

/// Terminal report of one per-domain worker
struct WorkerReport {
    domain: String,
    state: DomainState,
    presentation: Option<Presentation>,
    result: Result<(), AcmeError>,
}

/// Certificate issuance orchestrator
///
/// Holds a shared protocol client and an explicit solver registry; one
/// issuer can run many obtain operations, but each operation owns its
/// order exclusively.
pub struct Issuer {
    client: Arc<AcmeClient>,
    solvers: Arc<SolverRegistry>,
    options: ObtainOptions,
}

impl Issuer {
    pub fn new(client: Arc<AcmeClient>, solvers: SolverRegistry) -> Self {
        Self {
            client,
            solvers: Arc::new(solvers),
            options: ObtainOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ObtainOptions) -> Self {
        self.options = options;
        self
    }

    /// Obtain a certificate for a set of domains
    pub async fn obtain(&self, domains: &[String]) -> Result<CertificateBundle, AcmeError> {
        self.obtain_with_cancel(domains, CancellationToken::new()).await
    }

    /// Obtain a certificate, subject to external cancellation
    ///
    /// On cancellation in-flight workers stop at their next suspension
    /// point; material already presented is still cleaned up under the
    /// configured grace deadline.
    pub async fn obtain_with_cancel(
        &self,
        domains: &[String],
        cancel: CancellationToken,
    ) -> Result<CertificateBundle, AcmeError> {
        if domains.is_empty() {
            return Err(AcmeError::InvalidInput(
                "obtain requires at least one domain".to_string(),
            ));
        }
        if self.solvers.is_empty() {
            return Err(AcmeError::InvalidInput(
                "no challenge solvers registered".to_string(),
            ));
        }

        let domains = dedupe_domains(domains);
        info!(domains = ?domains, "Obtaining certificate");

        let order = self.client.new_order(&domains).await?;

        let limiter = self
            .options
            .concurrency_limit
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        let mut workers = JoinSet::new();
        for authz_url in order.authorizations.iter().cloned() {
            let client = Arc::clone(&self.client);
            let solvers = Arc::clone(&self.solvers);
            let options = self.options.clone();
            let cancel = cancel.clone();
            let limiter = limiter.clone();
            workers.spawn(async move {
                run_worker(client, solvers, options, cancel, limiter, authz_url).await
            });
        }

        let mut failures = FailureSet::default();
        let mut presented = Vec::new();
        let mut panics = 0usize;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => {
                    debug!(
                        domain = %report.domain,
                        state = ?report.state,
                        "Domain worker finished"
                    );
                    if let Some(presentation) = report.presentation {
                        presented.push(presentation);
                    }
                    if let Err(error) = report.result {
                        failures.insert(report.domain, error);
                    }
                }
                Err(join_error) => {
                    panics += 1;
                    failures.insert(
                        format!("worker-{}", panics),
                        AcmeError::UnexpectedResponse(format!("worker aborted: {}", join_error)),
                    );
                }
            }
        }

        // Cleanup is unconditional for everything presented, regardless
        // of per-domain outcome or cancellation.
        self.cleanup_presented(&presented).await;

        if cancel.is_cancelled() {
            return Err(AcmeError::Cancelled);
        }

        if !failures.is_empty() {
            if self.options.deactivate_pending_on_failure {
                self.deactivate_pending(&order.authorizations).await;
            }
            return Err(AcmeError::DomainFailures(failures));
        }

        self.complete_order(&order.url).await
    }

    /// Run cleanup for every presentation, bounded by the grace deadline
    async fn cleanup_presented(&self, presented: &[Presentation]) {
        for presentation in presented {
            debug!(domain = %presentation.domain, "Cleaning up challenge material");
            let cleanup = presentation.solver.cleanup(
                &presentation.domain,
                &presentation.token,
                &presentation.key_auth,
            );
            match tokio::time::timeout(self.options.cleanup_grace, cleanup).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    // Cleanup failures are logged, never fatal
                    warn!(
                        domain = %presentation.domain,
                        error = %error,
                        "Challenge cleanup failed"
                    );
                }
                Err(_) => {
                    warn!(
                        domain = %presentation.domain,
                        grace_secs = self.options.cleanup_grace.as_secs(),
                        "Challenge cleanup exceeded its grace deadline"
                    );
                }
            }
        }
    }

    /// Release authorizations still pending after a failed run
    async fn deactivate_pending(&self, authz_urls: &[String]) {
        for url in authz_urls {
            let status = match self.client.get_authorization(url).await {
                Ok(authz) => authz.status,
                Err(error) => {
                    debug!(authorization = %url, error = %error, "Skipping deactivation");
                    continue;
                }
            };
            if status == AuthorizationStatus::Pending {
                if let Err(error) = self.client.deactivate_authorization(url).await {
                    debug!(authorization = %url, error = %error, "Deactivation failed");
                }
            }
        }
    }

    /// Poll the order to ready, finalize it, poll to valid, and download
    /// the chain
    async fn complete_order(&self, order_url: &str) -> Result<CertificateBundle, AcmeError> {
        let client = &self.client;

        wait_for(
            "order readiness",
            self.options.validation_timeout,
            self.options.poll_interval,
            || async move {
                let order = client.get_order(order_url).await.map_err(CheckError::Transient)?;
                match order.status {
                    OrderStatus::Ready | OrderStatus::Valid => Ok(true),
                    OrderStatus::Pending | OrderStatus::Processing => Ok(false),
                    OrderStatus::Invalid => Err(CheckError::Fatal(order_failure(&order.error))),
                }
            },
        )
        .await?;

        let order = client.get_order(order_url).await?;
        let domains: Vec<String> = order
            .identifiers
            .iter()
            .map(|identifier| identifier.value.clone())
            .collect();

        let request = generate_csr(&domains)?;
        let mut finalized = client.finalize_order(&order, &request.csr_der).await?;

        if finalized.status != OrderStatus::Valid {
            wait_for(
                "certificate issuance",
                self.options.validation_timeout,
                self.options.poll_interval,
                || async move {
                    let order =
                        client.get_order(order_url).await.map_err(CheckError::Transient)?;
                    match order.status {
                        OrderStatus::Valid => Ok(true),
                        OrderStatus::Invalid => Err(CheckError::Fatal(order_failure(&order.error))),
                        _ => Ok(false),
                    }
                },
            )
            .await?;
            finalized = client.get_order(order_url).await?;
        }

        let certificate_url = finalized.certificate.ok_or_else(|| {
            AcmeError::UnexpectedResponse("valid order carries no certificate URL".to_string())
        })?;

        let chain = client.fetch_certificate(&certificate_url).await?;
        let expires = parse_certificate_expiry(&chain)?;

        info!(domains = ?domains, expires = %expires, "Certificate issued");
        Ok(CertificateBundle {
            certificate_chain_pem: chain,
            private_key_pem: request.private_key_pem,
            expires,
        })
    }
}

impl std::fmt::Debug for Issuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Issuer")
            .field("solvers", &self.solvers.challenge_types())
            .field("options", &self.options)
            .finish()
    }
}

fn order_failure(problem: &Option<crate::error::Problem>) -> AcmeError {
    AcmeError::OrderFailed {
        detail: problem
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "order became invalid".to_string()),
    }
}

/// Run one per-domain worker, honoring cancellation
async fn run_worker(
    client: Arc<AcmeClient>,
    solvers: Arc<SolverRegistry>,
    options: ObtainOptions,
    cancel: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
    authz_url: String,
) -> WorkerReport {
    let mut report = WorkerReport {
        domain: authz_url.clone(),
        state: DomainState::NotStarted,
        presentation: None,
        result: Ok(()),
    };

    let cancelled = tokio::select! {
        _ = cancel.cancelled() => true,
        _ = drive_domain(&client, &solvers, &options, limiter, &authz_url, &mut report) => false,
    };

    if cancelled && report.result.is_ok() {
        report.result = Err(AcmeError::Cancelled);
    }
    if report.result.is_err() {
        report.state = DomainState::Invalid;
    }
    report
}

/// The per-domain state machine body
async fn drive_domain(
    client: &AcmeClient,
    solvers: &SolverRegistry,
    options: &ObtainOptions,
    limiter: Option<Arc<Semaphore>>,
    authz_url: &str,
    report: &mut WorkerReport,
) {
    let _permit = match limiter {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
    };

    let authz = match client.get_authorization(authz_url).await {
        Ok(authz) => authz,
        Err(error) => {
            report.result = Err(error);
            return;
        }
    };
    let domain = authz.domain();
    report.domain = domain.clone();

    match authz.status {
        AuthorizationStatus::Valid => {
            debug!(domain = %domain, "Authorization already valid");
            report.state = DomainState::Valid;
            return;
        }
        AuthorizationStatus::Pending => {}
        other => {
            report.result = Err(AcmeError::UnexpectedResponse(format!(
                "authorization for '{}' is {:?}, expected pending",
                domain, other
            )));
            return;
        }
    }

    let Some((challenge, solver)) = solvers.select(&authz) else {
        report.result = Err(AcmeError::NoSolverAvailable { domain });
        return;
    };
    let challenge_url = challenge.url.clone();
    let token = challenge.token.clone();
    let key_auth = client.key_authorization(&token);

    debug!(
        domain = %domain,
        challenge = %solver.challenge_type(),
        "Presenting challenge"
    );
    report.state = DomainState::Presenting;
    // Recorded before the attempt so cleanup runs even when present
    // fails partway through
    report.presentation = Some(Presentation {
        solver: Arc::clone(&solver),
        domain: domain.clone(),
        token: token.clone(),
        key_auth: key_auth.clone(),
    });
    if let Err(error) = solver.present(&domain, &token, &key_auth).await {
        report.result = Err(error);
        return;
    }

    report.state = DomainState::Propagating;
    let (timeout, interval) = solver.timeout();
    let label = format!("{} propagation for '{}'", solver.challenge_type(), domain);
    let propagation = wait_for(&label, timeout, interval, || {
        let solver = Arc::clone(&solver);
        let domain = domain.clone();
        let token = token.clone();
        let key_auth = key_auth.clone();
        async move {
            solver
                .propagated(&domain, &token, &key_auth)
                .await
                .map_err(CheckError::Transient)
        }
    })
    .await;
    if let Err(error) = propagation {
        report.result = Err(error);
        return;
    }

    report.state = DomainState::Notified;
    if let Err(error) = client.accept_challenge(&challenge_url).await {
        report.result = Err(error);
        return;
    }

    report.state = DomainState::Validating;
    let label = format!("validation of '{}'", domain);
    let validation = wait_for(
        &label,
        options.validation_timeout,
        options.poll_interval,
        || {
            let domain = domain.clone();
            let challenge_url = challenge_url.clone();
            async move {
                let authz = client
                    .get_authorization(authz_url)
                    .await
                    .map_err(CheckError::Transient)?;
                match authz.status {
                    AuthorizationStatus::Valid => Ok(true),
                    AuthorizationStatus::Pending => Ok(false),
                    AuthorizationStatus::Invalid => {
                        let detail = authz
                            .challenges
                            .iter()
                            .find(|c| c.url == challenge_url)
                            .and_then(|c| c.error.as_ref())
                            .map(|problem| problem.to_string())
                            .unwrap_or_else(|| "authorization became invalid".to_string());
                        Err(CheckError::Fatal(AcmeError::ChallengeRejected { domain, detail }))
                    }
                    other => Err(CheckError::Fatal(AcmeError::UnexpectedResponse(format!(
                        "authorization for '{}' became {:?} during validation",
                        domain, other
                    )))),
                }
            }
        },
    )
    .await;

    match validation {
        Ok(()) => {
            info!(domain = %domain, "Domain validated");
            report.state = DomainState::Valid;
        }
        Err(error) => report.result = Err(error),
    }
}

/// Preserve order, drop repeated domains
fn dedupe_domains(domains: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    domains
        .iter()
        .filter(|domain| seen.insert(domain.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_preserves_first_occurrence_order() {
        let domains = vec![
            "b.example.com".to_string(),
            "a.example.com".to_string(),
            "b.example.com".to_string(),
            "a.example.com".to_string(),
        ];
        assert_eq!(
            dedupe_domains(&domains),
            vec!["b.example.com".to_string(), "a.example.com".to_string()]
        );
    }

    #[test]
    fn test_dedupe_no_duplicates_is_identity() {
        let domains = vec!["a.example.com".to_string(), "b.example.org".to_string()];
        assert_eq!(dedupe_domains(&domains), domains);
    }

    #[test]
    fn test_order_failure_uses_problem_detail() {
        let problem = crate::error::Problem {
            kind: "urn:ietf:params:acme:error:unauthorized".to_string(),
            detail: "CAA forbids issuance".to_string(),
            status: Some(403),
            retry_after: None,
        };
        let error = order_failure(&Some(problem));
        assert!(error.to_string().contains("CAA forbids issuance"));

        let fallback = order_failure(&None);
        assert!(fallback.to_string().contains("order became invalid"));
    }
}
