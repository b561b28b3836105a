//! Certificate lifecycle controller.
//!
//! Drives the per-host state machine (none → acquiring → valid, with
//! renewal and bounded retry) through a small worker pool. ACME
//! operations block for tens of seconds, so everything here runs apart
//! from request handling; the only shared surfaces are the challenge
//! map, the certificate registry, and the state store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, Authorization, AuthorizationStatus, ChallengeType, Identifier,
    LetsEncrypt, NewAccount, NewOrder, Order, OrderStatus,
};
use iop_common::api::{CertState, IssuerMode};
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use super::challenge::ChallengeMap;
use super::queue::{CertJob, CertJobKind, CertQueue};
use super::storage::{self, StoredAccount};
use crate::errors::AcmeError;
use crate::state::{CertRecord, StateStore};
use crate::tls::CertStore;

/// Bounded worker pool size.
const WORKERS: usize = 4;
/// Hard deadline for one ACME attempt, order to certificate.
const ATTEMPT_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// Retry back-off: doubles from the base, bounded at the ceiling.
const BACKOFF_BASE_SECS: u64 = 15;
const BACKOFF_CAP_SECS: u64 = 10 * 60;
/// About a day of retries at the ceiling.
const MAX_ATTEMPTS: u32 = 144;
/// How often directory order state is polled within an attempt.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct AcmeController {
    store: StateStore,
    certs: Arc<CertStore>,
    challenges: Arc<ChallengeMap>,
    queue: Arc<CertQueue>,
    account_key_path: PathBuf,
    contact: Option<String>,
    account: Mutex<Option<CachedAccount>>,
}

struct CachedAccount {
    directory_url: String,
    account: Account,
}

struct IssuedCert {
    chain_pem: String,
    key_pem: String,
}

impl AcmeController {
    pub fn new(
        store: StateStore,
        certs: Arc<CertStore>,
        challenges: Arc<ChallengeMap>,
        account_key_path: PathBuf,
        contact: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            certs,
            challenges,
            queue: Arc::new(CertQueue::new()),
            account_key_path,
            contact,
            account: Mutex::new(None),
        })
    }

    /// Reconcile disk and snapshot at boot, then start the dispatcher
    /// and the renewal scanner.
    pub async fn start(self: &Arc<Self>) {
        self.bootstrap().await;

        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch_loop().await });

        let scanner = self.clone();
        tokio::spawn(async move { scanner.scan_loop().await });
    }

    /// Load persisted certificates for every ssl route and queue work
    /// for the rest. Dangling in-flight states from a crash are
    /// normalized first.
    async fn bootstrap(&self) {
        let routes: Vec<(String, bool)> = self
            .store
            .read(|state| {
                state
                    .routes
                    .iter()
                    .map(|(host, route)| (host.clone(), route.ssl))
                    .collect()
            })
            .await;

        for (host, ssl) in routes {
            if !ssl {
                continue;
            }
            match self.certs.load_from_disk(&host).await {
                Ok(Some(validity)) => {
                    let _ = self
                        .store
                        .mutate(|state| {
                            let record = state
                                .certs
                                .entry(host.clone())
                                .or_insert_with(|| CertRecord::new(state_issuer(state.staging)));
                            record.state = CertState::Valid;
                            record.not_before = Some(validity.not_before);
                            record.not_after = Some(validity.not_after);
                        })
                        .await;
                    info!(host, "[CERT] restored certificate from disk");
                }
                Ok(None) => {
                    let _ = self
                        .store
                        .mutate(|state| {
                            let issuer = state_issuer(state.staging);
                            let record = state
                                .certs
                                .entry(host.clone())
                                .or_insert_with(|| CertRecord::new(issuer));
                            if matches!(record.state, CertState::Acquiring | CertState::Renewing) {
                                record.state = CertState::None;
                            }
                        })
                        .await;
                }
                Err(e) => warn!(host, "[CERT] could not restore certificate: {e}"),
            }
        }
    }

    /// Called when a route with ssl is created or re-enabled.
    pub async fn ensure_host(&self, host: &str) {
        let needs_cert = self
            .store
            .read(|state| match state.certs.get(host) {
                Some(record) => !matches!(record.state, CertState::Valid),
                None => true,
            })
            .await;
        if needs_cert {
            self.enqueue(CertJob::new(host, CertJobKind::Acquisition));
        }
    }

    /// `POST /api/cert/renew`: reset the attempt counter and force the
    /// host back through issuance.
    pub async fn force_renew(&self, host: &str) -> Result<(), AcmeError> {
        self.store
            .mutate(|state| {
                if let Some(record) = state.certs.get_mut(host) {
                    record.attempts = 0;
                    record.next_attempt = None;
                    record.last_error = None;
                    if record.state == CertState::Valid {
                        record.state = CertState::Renewing;
                    }
                }
            })
            .await
            .map_err(AcmeError::Storage)?;
        self.enqueue(CertJob::new(host, CertJobKind::Renewal));
        Ok(())
    }

    /// Remove every trace of a host: pending work, challenge tokens,
    /// served key, PEM files.
    pub async fn remove_host(&self, host: &str) -> Result<(), AcmeError> {
        self.queue.forget(host);
        self.challenges.clear_host(host);
        self.certs.remove(host);
        storage::remove_certificate(self.certs.certs_dir(), host).await?;
        Ok(())
    }

    /// Staging and production certificates chain to different roots, so
    /// flipping the toggle invalidates everything and reissues.
    pub async fn apply_staging_change(&self) {
        self.account.lock().await.take();
        let hosts: Vec<String> = self
            .store
            .read(|state| {
                state
                    .routes
                    .iter()
                    .filter(|(_, route)| route.ssl)
                    .map(|(host, _)| host.clone())
                    .collect()
            })
            .await;

        let _ = self
            .store
            .mutate(|state| {
                let issuer = state_issuer(state.staging);
                for record in state.certs.values_mut() {
                    *record = CertRecord::new(issuer);
                }
            })
            .await;

        for host in hosts {
            self.certs.remove(&host);
            self.queue.forget(&host);
            self.enqueue(CertJob::new(&host, CertJobKind::Acquisition));
        }
    }

    fn enqueue(&self, job: CertJob) {
        if self.queue.enqueue(job) {
            // The dispatcher polls; nothing to wake explicitly.
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let permits = Arc::new(Semaphore::new(WORKERS));
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            while permits.available_permits() > 0 {
                let Some(job) = self.queue.pop_ready(Utc::now()) else {
                    break;
                };
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // Closed semaphore means the dispatcher is the
                        // only survivor of a shutdown; park the job.
                        self.queue.done(&job.host);
                        return;
                    }
                };
                let controller = self.clone();
                tokio::spawn(async move {
                    controller.run_job(job).await;
                    drop(permit);
                });
            }
        }
    }

    /// Periodically queue renewals coming due and retries coming off
    /// back-off.
    async fn scan_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let now = Utc::now();
            let due: Vec<CertJob> = self
                .store
                .read(|state| {
                    state
                        .routes
                        .iter()
                        .filter(|(_, route)| route.ssl)
                        .filter_map(|(host, _)| {
                            let record = state.certs.get(host);
                            classify_due(host, record, now)
                        })
                        .collect()
                })
                .await;
            for job in due {
                self.enqueue(job);
            }
        }
    }

    async fn run_job(&self, job: CertJob) {
        let host = job.host.clone();
        let result = self.run_job_inner(&job).await;
        self.queue.done(&host);
        self.challenges.clear_host(&host);

        if let Err(e) = result {
            error!(host, "[ACME] operation failed: {e}");
            self.record_failure(&host, &job, &e).await;
        }
    }

    async fn run_job_inner(&self, job: &CertJob) -> Result<(), AcmeError> {
        let host = &job.host;

        // The route may have been deleted while the job sat in queue.
        let wanted = self
            .store
            .read(|state| state.routes.get(host).map(|r| r.ssl).unwrap_or(false))
            .await;
        if !wanted {
            return Ok(());
        }

        let renewing = matches!(job.kind, CertJobKind::Renewal);
        self.store
            .mutate(|state| {
                let issuer = state_issuer(state.staging);
                let record = state
                    .certs
                    .entry(host.clone())
                    .or_insert_with(|| CertRecord::new(issuer));
                record.state = if renewing && record.not_after.is_some() {
                    CertState::Renewing
                } else {
                    CertState::Acquiring
                };
            })
            .await
            .map_err(AcmeError::Storage)?;

        info!(host, "[ACME] starting certificate order");
        let issued = tokio::time::timeout(ATTEMPT_DEADLINE, self.issue(host))
            .await
            .map_err(|_| AcmeError::Deadline { host: host.clone() })??;

        // Re-check before persisting: the route may have been removed
        // mid-order.
        let still_wanted = self
            .store
            .read(|state| state.routes.contains_key(host))
            .await;
        if !still_wanted {
            return Ok(());
        }

        storage::write_certificate(
            self.certs.certs_dir(),
            host,
            &issued.chain_pem,
            &issued.key_pem,
        )
        .await?;

        let validity = self
            .certs
            .install(host, &issued.chain_pem, &issued.key_pem)
            .map_err(|e| AcmeError::BadCertificate {
                host: host.clone(),
                message: e.to_string(),
            })?;

        self.store
            .mutate(|state| {
                let issuer = state_issuer(state.staging);
                let record = state
                    .certs
                    .entry(host.clone())
                    .or_insert_with(|| CertRecord::new(issuer));
                record.state = CertState::Valid;
                record.issuer = issuer;
                record.not_before = Some(validity.not_before);
                record.not_after = Some(validity.not_after);
                record.attempts = 0;
                record.next_attempt = None;
                record.last_error = None;
            })
            .await
            .map_err(AcmeError::Storage)?;

        info!(
            host,
            not_after = %validity.not_after,
            "[CERT] certificate issued"
        );
        Ok(())
    }

    /// One full issuance: order, HTTP-01, finalize, download.
    async fn issue(&self, host: &str) -> Result<IssuedCert, AcmeError> {
        let account = self.account().await?;

        let identifier = Identifier::Dns(host.to_string());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in &authorizations {
            self.answer_challenge(&mut order, authz, host).await?;
        }

        self.poll_until(&mut order, host, OrderStatus::Ready).await?;

        let csr = {
            let mut params = rcgen::CertificateParams::new(vec![host.to_string()]);
            params.distinguished_name = rcgen::DistinguishedName::new();
            let cert =
                rcgen::Certificate::from_params(params).map_err(|e| AcmeError::Csr(e.to_string()))?;
            let der = cert
                .serialize_request_der()
                .map_err(|e| AcmeError::Csr(e.to_string()))?;
            (cert, der)
        };

        order.finalize(&csr.1).await?;

        let chain_pem = loop {
            match order.certificate().await? {
                Some(pem) => break pem,
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        };

        Ok(IssuedCert {
            chain_pem,
            key_pem: csr.0.serialize_private_key_pem(),
        })
    }

    async fn answer_challenge(
        &self,
        order: &mut Order,
        authz: &Authorization,
        host: &str,
    ) -> Result<(), AcmeError> {
        match authz.status {
            AuthorizationStatus::Valid => return Ok(()),
            AuthorizationStatus::Pending => {}
            status => {
                return Err(AcmeError::OrderRejected {
                    host: host.to_string(),
                    message: format!("authorization in unexpected status {status:?}"),
                });
            }
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01)
            .ok_or_else(|| AcmeError::ChallengeFailed {
                host: host.to_string(),
                message: "directory offered no http-01 challenge".to_string(),
            })?;

        let key_authorization = order.key_authorization(challenge);
        self.challenges
            .insert(host, &challenge.token, key_authorization.as_str());
        info!(host, token = %challenge.token, "[ACME] http-01 challenge staged");

        order.set_challenge_ready(&challenge.url).await?;
        Ok(())
    }

    async fn poll_until(
        &self,
        order: &mut Order,
        host: &str,
        wanted: OrderStatus,
    ) -> Result<(), AcmeError> {
        loop {
            let state = order.refresh().await?;
            match state.status {
                status if status == wanted => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(AcmeError::ChallengeFailed {
                        host: host.to_string(),
                        message: "order became invalid".to_string(),
                    });
                }
                OrderStatus::Valid if wanted == OrderStatus::Ready => return Ok(()),
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }

    /// Fetch or create the account for the currently selected
    /// directory. Credentials persist across restarts; a staging flip
    /// invalidates the cache and the stored file's URL stops matching.
    async fn account(&self) -> Result<Account, AcmeError> {
        let staging = self.store.read(|state| state.staging).await;
        let directory_url = if staging {
            LetsEncrypt::Staging.url().to_string()
        } else {
            LetsEncrypt::Production.url().to_string()
        };

        let mut cached = self.account.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.directory_url == directory_url {
                return Ok(entry.account.clone());
            }
        }

        if let Some(stored) = storage::load_account(&self.account_key_path).await? {
            if stored.directory_url == directory_url {
                let credentials: AccountCredentials =
                    serde_json::from_value(stored.credentials)
                        .map_err(|e| AcmeError::Account(e.to_string()))?;
                let account = Account::from_credentials(credentials)
                    .await
                    .map_err(|e| AcmeError::Account(e.to_string()))?;
                *cached = Some(CachedAccount {
                    directory_url,
                    account: account.clone(),
                });
                return Ok(account);
            }
        }

        let contact_urls: Vec<String> = self
            .contact
            .iter()
            .map(|mail| format!("mailto:{mail}"))
            .collect();
        let contact: Vec<&str> = contact_urls.iter().map(String::as_str).collect();

        info!(directory = %directory_url, "[ACME] creating account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::Account(e.to_string()))?;

        let stored = StoredAccount {
            directory_url: directory_url.clone(),
            credentials: serde_json::to_value(&credentials)
                .map_err(|e| AcmeError::Account(e.to_string()))?,
        };
        storage::store_account(&self.account_key_path, &stored).await?;

        *cached = Some(CachedAccount {
            directory_url,
            account: account.clone(),
        });
        Ok(account)
    }

    async fn record_failure(&self, host: &str, job: &CertJob, error: &AcmeError) {
        let now = Utc::now();
        let message = error.to_string();
        let renewal = matches!(job.kind, CertJobKind::Renewal);

        let retry_at = self
            .store
            .mutate(|state| {
                let issuer = state_issuer(state.staging);
                let record = state
                    .certs
                    .entry(host.to_string())
                    .or_insert_with(|| CertRecord::new(issuer));
                record.attempts += 1;
                record.last_error = Some(message.clone());

                let serving_unexpired = renewal
                    && record.not_after.map(|t| t > now).unwrap_or(false);
                record.state = if serving_unexpired {
                    // Keep serving the old certificate; only expiry
                    // demotes a failed renewal.
                    CertState::Valid
                } else {
                    CertState::Failed
                };

                if record.attempts >= MAX_ATTEMPTS {
                    record.next_attempt = None;
                    None
                } else {
                    let at = now + chrono::Duration::seconds(backoff_secs(record.attempts) as i64);
                    record.next_attempt = Some(at);
                    Some(at)
                }
            })
            .await;

        match retry_at {
            Ok(Some(at)) => {
                self.enqueue(CertJob::delayed(host, CertJobKind::Retry, at));
            }
            Ok(None) => warn!(host, "[ACME] attempts exhausted, giving up until manual renew"),
            Err(e) => error!(host, "[ACME] could not record failure: {e}"),
        }
    }
}

fn state_issuer(staging: bool) -> IssuerMode {
    if staging {
        IssuerMode::Staging
    } else {
        IssuerMode::Production
    }
}

/// Exponential back-off from the base, bounded at the cap.
fn backoff_secs(attempts: u32) -> u64 {
    let shift = attempts.saturating_sub(1).min(6);
    (BACKOFF_BASE_SECS << shift).min(BACKOFF_CAP_SECS)
}

/// Decide whether a record needs work right now.
fn classify_due(host: &str, record: Option<&CertRecord>, now: DateTime<Utc>) -> Option<CertJob> {
    let Some(record) = record else {
        return Some(CertJob::new(host, CertJobKind::Acquisition));
    };
    match record.state {
        CertState::None => Some(CertJob::new(host, CertJobKind::Acquisition)),
        CertState::Valid if record.renewal_due(now) && record.next_attempt.is_none() => {
            Some(CertJob::new(host, CertJobKind::Renewal))
        }
        CertState::Valid | CertState::Failed => match record.next_attempt {
            Some(at) if at <= now && record.attempts < MAX_ATTEMPTS => {
                Some(CertJob::new(host, CertJobKind::Retry))
            }
            _ => None,
        },
        CertState::Acquiring | CertState::Renewing => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        assert_eq!(backoff_secs(1), 15);
        assert_eq!(backoff_secs(2), 30);
        assert_eq!(backoff_secs(3), 60);
        assert_eq!(backoff_secs(6), 480);
        assert_eq!(backoff_secs(7), 600);
        assert_eq!(backoff_secs(100), 600);
    }

    #[test]
    fn classify_missing_record_as_acquisition() {
        let job = classify_due("demo.example", None, Utc::now()).unwrap();
        assert_eq!(job.kind, CertJobKind::Acquisition);
    }

    #[test]
    fn classify_due_renewal() {
        let now = Utc::now();
        let mut record = CertRecord::new(IssuerMode::Production);
        record.state = CertState::Valid;
        record.not_after = Some(now + chrono::Duration::days(20));

        let job = classify_due("demo.example", Some(&record), now).unwrap();
        assert_eq!(job.kind, CertJobKind::Renewal);

        record.not_after = Some(now + chrono::Duration::days(60));
        assert!(classify_due("demo.example", Some(&record), now).is_none());
    }

    #[test]
    fn classify_retry_waits_for_backoff() {
        let now = Utc::now();
        let mut record = CertRecord::new(IssuerMode::Production);
        record.state = CertState::Failed;
        record.attempts = 3;
        record.next_attempt = Some(now + chrono::Duration::minutes(5));
        assert!(classify_due("demo.example", Some(&record), now).is_none());

        record.next_attempt = Some(now - chrono::Duration::seconds(1));
        let job = classify_due("demo.example", Some(&record), now).unwrap();
        assert_eq!(job.kind, CertJobKind::Retry);

        record.attempts = MAX_ATTEMPTS;
        assert!(classify_due("demo.example", Some(&record), now).is_none());
    }

    #[test]
    fn in_flight_states_are_not_requeued() {
        let now = Utc::now();
        let mut record = CertRecord::new(IssuerMode::Staging);
        record.state = CertState::Acquiring;
        assert!(classify_due("demo.example", Some(&record), now).is_none());
    }
}
