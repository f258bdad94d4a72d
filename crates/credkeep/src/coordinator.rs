// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Refresh coordinator: single-flight renewal across the primary and
//! secondary channels, plus the credential surface other components consume.
//!
//! At most one renewal runs at a time. Concurrent [`RefreshCoordinator::renew`]
//! callers join the in-flight attempt and receive its outcome, or give up
//! after the wait timeout and get an answer from the current credential.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blacklist::{BlacklistRegistry, RevocationReason};
use crate::breaker::{Admission, CircuitBreaker, SILENT_FLOW_STATE_KEY, SILENT_LAST_ATTEMPT_KEY};
use crate::channel::{
    BackgroundSafety, GrantClient, Revoker, SilentFailure, SilentFailureKind, SilentReauth, TokenHint,
};
use crate::clock::{Clock, SystemClock};
use crate::config::LifecycleConfig;
use crate::error::RenewalError;
use crate::event::{LifecycleEvent, RenewalChannel};
use crate::principal::{PrincipalStore, SecurityAudit};
use crate::record::{CredentialRecord, TokenGrant};
use crate::secure_store::PersistReport;
use crate::storage::{KeyValueStore, Sealer};
use crate::tracker::{AuthState, TokenStateTracker};

static GLOBAL: OnceLock<Arc<RefreshCoordinator>> = OnceLock::new();

/// Result of one [`RefreshCoordinator::renew`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// A channel produced a new credential and it was persisted.
    Renewed { channel: RenewalChannel, expires_at: u64 },
    /// The current credential has more than the renewal buffer left.
    StillValid,
    /// A renewal succeeded moments ago; answered from current validity.
    Throttled { valid: bool },
    /// Both channels failed but the current credential still works.
    Degraded { error: RenewalError },
    /// The in-flight renewal did not report back within the wait timeout.
    TimedOut { still_valid: bool },
    /// The current access secret is blacklisted; credentials were purged.
    ForcedLogout,
    /// No principal is signed in.
    NotSignedIn,
    /// No usable credential remains. Interactive sign-in is required.
    Failed { error: RenewalError },
}

impl RenewalOutcome {
    /// True when the caller holds a usable credential afterwards.
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Renewed { .. } | Self::StillValid | Self::Degraded { .. } => true,
            Self::Throttled { valid } => *valid,
            Self::TimedOut { still_valid } => *still_valid,
            Self::ForcedLogout | Self::NotSignedIn | Self::Failed { .. } => false,
        }
    }
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    pub state: AuthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_expires_at: Option<u64>,
    pub expires_in_secs: u64,
    pub has_refresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<u64>,
    pub encrypted_at_rest: bool,
    pub renewal_in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<u64>,
    pub consecutive_failures: u32,
    pub secondary_channel: Admission,
    pub blacklisted: usize,
}

#[derive(Debug, Default)]
struct Marks {
    last_attempt_at: Option<u64>,
    last_success_at: Option<u64>,
    consecutive_failures: u32,
}

type Waiters = Vec<oneshot::Sender<RenewalOutcome>>;

/// Clears the in-flight flag if the renewal task unwinds before reporting.
struct InflightGuard<'a> {
    inflight: &'a Mutex<Option<Waiters>>,
    armed: bool,
}

impl InflightGuard<'_> {
    fn complete(mut self) -> Waiters {
        self.armed = false;
        self.inflight.lock().take().unwrap_or_default()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.lock().take();
        }
    }
}

pub struct CoordinatorBuilder {
    store: Arc<dyn KeyValueStore>,
    config: LifecycleConfig,
    sealer: Option<Arc<dyn Sealer>>,
    clock: Arc<dyn Clock>,
    primary: Option<Arc<dyn GrantClient>>,
    secondary: Option<Arc<dyn SilentReauth>>,
    revoker: Option<Arc<dyn Revoker>>,
    background_safe: BackgroundSafety,
}

impl CoordinatorBuilder {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            config: LifecycleConfig::default(),
            sealer: None,
            clock: Arc::new(SystemClock),
            primary: None,
            secondary: None,
            revoker: None,
            background_safe: Arc::new(|| true),
        }
    }

    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sealer(mut self, sealer: Arc<dyn Sealer>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn primary(mut self, client: Arc<dyn GrantClient>) -> Self {
        self.primary = Some(client);
        self
    }

    pub fn secondary(mut self, reauth: Arc<dyn SilentReauth>) -> Self {
        self.secondary = Some(reauth);
        self
    }

    pub fn revoker(mut self, revoker: Arc<dyn Revoker>) -> Self {
        self.revoker = Some(revoker);
        self
    }

    /// Predicate consulted before every silent re-authentication.
    pub fn background_safety(mut self, predicate: BackgroundSafety) -> Self {
        self.background_safe = predicate;
        self
    }

    pub fn build(self) -> (Arc<RefreshCoordinator>, broadcast::Receiver<LifecycleEvent>) {
        let (event_tx, event_rx) = broadcast::channel(64);
        let coordinator = RefreshCoordinator {
            tracker: TokenStateTracker::from_config(&self.config),
            principals: PrincipalStore::new(Arc::clone(&self.store), self.sealer, &self.config),
            blacklist: BlacklistRegistry::new(
                Arc::clone(&self.store),
                self.config.blacklist_retention_secs,
            ),
            breaker: CircuitBreaker::new(Arc::clone(&self.store), &self.config, event_tx.clone()),
            store: self.store,
            config: self.config,
            clock: self.clock,
            primary: self.primary,
            secondary: self.secondary,
            revoker: self.revoker,
            background_safe: self.background_safe,
            event_tx,
            inflight: Mutex::new(None),
            marks: Mutex::new(Marks::default()),
            revocations: Mutex::new(Vec::new()),
        };
        (Arc::new(coordinator), event_rx)
    }
}

pub struct RefreshCoordinator {
    store: Arc<dyn KeyValueStore>,
    config: LifecycleConfig,
    clock: Arc<dyn Clock>,
    tracker: TokenStateTracker,
    principals: PrincipalStore,
    blacklist: BlacklistRegistry,
    breaker: CircuitBreaker,
    primary: Option<Arc<dyn GrantClient>>,
    secondary: Option<Arc<dyn SilentReauth>>,
    revoker: Option<Arc<dyn Revoker>>,
    background_safe: BackgroundSafety,
    event_tx: broadcast::Sender<LifecycleEvent>,
    inflight: Mutex<Option<Waiters>>,
    marks: Mutex<Marks>,
    revocations: Mutex<Vec<JoinHandle<()>>>,
}

impl RefreshCoordinator {
    pub fn builder(store: Arc<dyn KeyValueStore>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(store)
    }

    /// Make `coordinator` reachable through [`RefreshCoordinator::global`].
    /// Returns false if one was already installed.
    pub fn install_global(coordinator: Arc<Self>) -> bool {
        GLOBAL.set(coordinator).is_ok()
    }

    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        debug!(event = event.name(), "lifecycle event");
        let _ = self.event_tx.send(event);
    }

    pub fn principals(&self) -> &PrincipalStore {
        &self.principals
    }

    pub fn blacklist(&self) -> &BlacklistRegistry {
        &self.blacklist
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn is_renewing(&self) -> bool {
        self.inflight.lock().is_some()
    }

    /// When the silent re-authentication session ends, if known.
    pub fn secondary_session_expires_at(&self) -> Option<u64> {
        self.secondary.as_ref().and_then(|s| s.session_expires_at())
    }

    fn current(&self) -> Result<Option<(String, Option<CredentialRecord>)>, RenewalError> {
        let Some(principal) = self.principals.current_principal()? else {
            return Ok(None);
        };
        let record = self.principals.load_record(&principal)?;
        Ok(Some((principal, record)))
    }

    fn current_record(&self) -> Option<CredentialRecord> {
        match self.current() {
            Ok(current) => current.and_then(|(_, record)| record),
            Err(e) => {
                warn!(err = %e, "failed to read current credential");
                None
            }
        }
    }

    fn currently_valid(&self) -> bool {
        let record = self.current_record();
        self.tracker.is_valid(record.as_ref(), self.clock.now_ms())
    }

    // -- Collaborator surface -------------------------------------------------

    /// Store the result of an interactive sign-in for `principal`.
    pub fn sign_in(
        &self,
        principal: &str,
        record: CredentialRecord,
    ) -> Result<PersistReport, RenewalError> {
        if self.blacklist.is_secret_revoked(&record.access_secret)? {
            return Err(RenewalError::SecretRevoked("access secret is blacklisted".to_owned()));
        }
        if let Some(ref refresh) = record.refresh_secret {
            if self.blacklist.is_secret_revoked(refresh)? {
                return Err(RenewalError::SecretRevoked("refresh secret is blacklisted".to_owned()));
            }
        }

        let report = self.principals.save_for_principal(principal, &record)?;
        *self.marks.lock() = Marks::default();
        info!(
            principal,
            encrypted = report.encrypted,
            expires_at = record.access_expires_at,
            "signed in"
        );
        self.emit(LifecycleEvent::SignedIn {
            principal: principal.to_owned(),
            expires_at: record.access_expires_at,
        });
        Ok(report)
    }

    /// Authentication state of the current principal.
    ///
    /// A blacklisted access secret forces logout and reports `Absent`. An
    /// expired credential with no renewal path is purged and reported as
    /// `Expired` once.
    pub fn auth_state(&self) -> AuthState {
        let now = self.clock.now_ms();
        let (principal, record) = match self.current() {
            Ok(Some((p, Some(r)))) => (p, r),
            Ok(_) => return AuthState::Absent,
            Err(e) => {
                warn!(err = %e, "failed to read current credential");
                return AuthState::Absent;
            }
        };

        match self.blacklist.is_secret_revoked(&record.access_secret) {
            Ok(false) => {}
            Ok(true) => {
                self.forced_logout(&principal, &record);
                return AuthState::Absent;
            }
            Err(e) => {
                warn!(err = %e, "blacklist unreadable, treating credential as absent");
                return AuthState::Absent;
            }
        }

        let state = self.tracker.auth_state(Some(&record), now);
        if state == AuthState::Expired {
            info!(principal = %principal, "credential expired with no renewal path");
            self.cleanup(&principal, Some(&record));
            self.emit(LifecycleEvent::Expired { principal });
        }
        state
    }

    /// An expired access secret with a usable refresh secret still counts.
    pub fn is_authenticated(&self) -> bool {
        self.auth_state().is_authenticated()
    }

    pub fn time_to_expiry(&self) -> u64 {
        let record = self.current_record();
        self.tracker.time_to_expiry(record.as_ref(), self.clock.now_ms())
    }

    pub fn needs_renewal(&self) -> bool {
        let record = self.current_record();
        let last_attempt = self.marks.lock().last_attempt_at;
        self.tracker.needs_renewal(record.as_ref(), last_attempt, self.clock.now_ms())
    }

    pub fn current_principal(&self) -> Option<String> {
        self.principals.current_principal().unwrap_or_else(|e| {
            warn!(err = %e, "failed to read current principal");
            None
        })
    }

    /// `"<kind> <access secret>"` for a valid, non-blacklisted credential.
    pub fn authorization_header(&self) -> Option<String> {
        let record = self.current_record()?;
        if !self.tracker.is_valid(Some(&record), self.clock.now_ms()) {
            return None;
        }
        match self.blacklist.is_secret_revoked(&record.access_secret) {
            Ok(false) => Some(format!("{} {}", record.token_kind, record.access_secret)),
            Ok(true) => None,
            Err(e) => {
                warn!(err = %e, "blacklist unreadable");
                None
            }
        }
    }

    pub fn status(&self) -> Result<CoordinatorStatus, RenewalError> {
        let now = self.clock.now_ms();
        let current = self.current()?;
        let (principal, record) = match current {
            Some((p, r)) => (Some(p), r),
            None => (None, None),
        };
        let encrypted_at_rest = principal
            .as_deref()
            .map(|p| self.principals.secure_store(p).is_encrypting())
            .unwrap_or(false);
        let marks = self.marks.lock();
        Ok(CoordinatorStatus {
            principal,
            state: self.tracker.auth_state(record.as_ref(), now),
            access_expires_at: record.as_ref().map(|r| r.access_expires_at),
            expires_in_secs: self.tracker.time_to_expiry(record.as_ref(), now),
            has_refresh: record.as_ref().is_some_and(|r| r.has_usable_refresh(now)),
            refresh_expires_at: record.as_ref().and_then(|r| r.refresh_expires_at),
            encrypted_at_rest,
            renewal_in_flight: self.is_renewing(),
            last_attempt_at: marks.last_attempt_at,
            last_success_at: marks.last_success_at,
            consecutive_failures: marks.consecutive_failures,
            secondary_channel: self.breaker.can_attempt(now)?,
            blacklisted: self.blacklist.len()?,
        })
    }

    /// Sign the current principal out. Both secrets are blacklisted and, when
    /// a revoker is configured, revoked server-side in the background.
    pub fn logout(&self) -> Result<bool, RenewalError> {
        let Some((principal, record)) = self.current()? else {
            return Ok(false);
        };
        let now = self.clock.now_ms();
        if let Some(ref record) = record {
            self.blacklist.revoke_secret(&record.access_secret, RevocationReason::Logout, now)?;
            if let Some(ref refresh) = record.refresh_secret {
                self.blacklist.revoke_secret(refresh, RevocationReason::Logout, now)?;
            }
            self.revoke_remote(record);
        }
        self.principals.clear_principal(&principal)?;
        *self.marks.lock() = Marks::default();
        info!(principal = %principal, "logged out");
        self.emit(LifecycleEvent::LoggedOut { principal: Some(principal) });
        Ok(true)
    }

    /// Blacklist and purge every resident credential. Returns the number of
    /// principal namespaces removed.
    pub fn clear_all_credentials(&self) -> Result<usize, RenewalError> {
        let now = self.clock.now_ms();
        for principal in self.principals.index()? {
            match self.principals.load_record(&principal) {
                Ok(Some(record)) => {
                    self.blacklist.revoke_secret(
                        &record.access_secret,
                        RevocationReason::Cleared,
                        now,
                    )?;
                    if let Some(ref refresh) = record.refresh_secret {
                        self.blacklist.revoke_secret(refresh, RevocationReason::Cleared, now)?;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(principal = %principal, err = %e, "unreadable credential, purging"),
            }
        }
        let removed = self.principals.clear_all()?;
        self.store.remove(SILENT_FLOW_STATE_KEY)?;
        self.store.remove(SILENT_LAST_ATTEMPT_KEY)?;
        *self.marks.lock() = Marks::default();
        info!(removed, "cleared all credentials");
        self.emit(LifecycleEvent::LoggedOut { principal: None });
        Ok(removed)
    }

    pub fn sweep_blacklist(&self) -> Result<usize, RenewalError> {
        Ok(self.blacklist.sweep(self.clock.now_ms())?)
    }

    pub fn audit(&self) -> Result<SecurityAudit, RenewalError> {
        self.principals.audit_security(self.clock.now_ms())
    }

    /// Move plaintext refresh secrets into the sealed slot. Returns how many
    /// principals were migrated.
    pub fn migrate_legacy(&self) -> Result<usize, RenewalError> {
        let mut migrated = 0;
        for principal in self.principals.index()? {
            if self.principals.secure_store(&principal).migrate_legacy()? {
                info!(principal = %principal, "migrated refresh secret to sealed storage");
                migrated += 1;
            }
        }
        Ok(migrated)
    }

    fn revoke_remote(&self, record: &CredentialRecord) {
        let Some(ref revoker) = self.revoker else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, skipping server-side revocation");
            return;
        };
        let revoker = Arc::clone(revoker);
        let mut secrets = vec![(record.access_secret.clone(), TokenHint::AccessToken)];
        if let Some(ref refresh) = record.refresh_secret {
            secrets.push((refresh.clone(), TokenHint::RefreshToken));
        }
        let task = handle.spawn(async move {
            for (secret, hint) in secrets {
                match revoker.revoke(&secret, hint).await {
                    Ok(()) => debug!(hint = hint.as_str(), "revoked server-side"),
                    Err(e) => warn!(hint = hint.as_str(), err = %e, "server-side revocation failed"),
                }
            }
        });
        let mut pending = self.revocations.lock();
        pending.retain(|t| !t.is_finished());
        pending.push(task);
    }

    /// Wait up to `grace` for background revocation calls to finish. For
    /// short-lived processes that would otherwise exit mid-request.
    pub async fn flush_revocations(&self, grace: Duration) {
        let pending: Vec<_> = std::mem::take(&mut *self.revocations.lock());
        if pending.is_empty() {
            return;
        }
        let wait = async {
            for task in pending {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "revocation still pending at exit");
        }
    }

    // -- Renewal --------------------------------------------------------------

    /// Renew the current credential, joining any renewal already in flight.
    pub async fn renew(self: &Arc<Self>) -> RenewalOutcome {
        let (tx, rx) = oneshot::channel();
        let leader = {
            let mut inflight = self.inflight.lock();
            match inflight.as_mut() {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    *inflight = Some(vec![tx]);
                    true
                }
            }
        };

        if leader {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let guard = InflightGuard { inflight: &this.inflight, armed: true };
                let outcome = this.run_renewal().await;
                let waiters = guard.complete();
                debug!(waiters = waiters.len(), ?outcome, "renewal settled");
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            });
        } else {
            debug!("joining in-flight renewal");
        }

        match tokio::time::timeout(self.config.wait_timeout(), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                warn!("renewal task ended without reporting");
                RenewalOutcome::TimedOut { still_valid: self.currently_valid() }
            }
            Err(_) => {
                warn!(timeout_ms = self.config.wait_timeout_ms, "timed out waiting for renewal");
                RenewalOutcome::TimedOut { still_valid: self.currently_valid() }
            }
        }
    }

    async fn run_renewal(&self) -> RenewalOutcome {
        let now = self.clock.now_ms();
        self.marks.lock().last_attempt_at = Some(now);

        let (principal, mut record) = match self.current() {
            Ok(Some(current)) => current,
            Ok(None) => return RenewalOutcome::NotSignedIn,
            Err(e) => return self.abort(None, None, e),
        };

        if let Some(ref rec) = record {
            match self.blacklist.is_secret_revoked(&rec.access_secret) {
                Ok(false) => {}
                Ok(true) => {
                    self.forced_logout(&principal, rec);
                    return RenewalOutcome::ForcedLogout;
                }
                Err(e) => return self.abort(Some(&principal), record.as_ref(), e.into()),
            }
        }

        if self.tracker.is_comfortably_valid(record.as_ref(), now) {
            debug!(principal = %principal, "credential comfortably valid, skipping renewal");
            return RenewalOutcome::StillValid;
        }

        let last_success = self.marks.lock().last_success_at;
        if self.tracker.within_anti_thrash(last_success, now) {
            let valid = self.tracker.is_valid(record.as_ref(), now);
            debug!(principal = %principal, valid, "renewed moments ago, not renewing again");
            return RenewalOutcome::Throttled { valid };
        }

        let mut last_error = RenewalError::SecondaryChannelFailed("no renewal path".to_owned());

        let refresh = record
            .as_ref()
            .filter(|r| r.has_usable_refresh(now))
            .and_then(|r| r.refresh_secret.clone());
        if let (Some(primary), Some(refresh)) = (self.primary.as_ref(), refresh) {
            match self.try_primary(primary.as_ref(), &refresh).await {
                Ok(grant) => {
                    return self.rotate(&principal, record.as_ref(), &grant, RenewalChannel::Primary)
                }
                Err(e) if e.is_refresh_terminal() => {
                    if let Err(se) = self.discard_refresh(&principal, &refresh, &e) {
                        return self.abort(Some(&principal), record.as_ref(), se);
                    }
                    if let Some(ref mut rec) = record {
                        rec.refresh_secret = None;
                        rec.refresh_expires_at = None;
                        rec.refresh_issued_at = None;
                    }
                    last_error = e;
                }
                Err(e) if e.is_storage() => return self.abort(Some(&principal), record.as_ref(), e),
                Err(e) => last_error = e,
            }
        }

        match self.try_secondary().await {
            Ok(grant) => {
                return self.rotate(&principal, record.as_ref(), &grant, RenewalChannel::Secondary)
            }
            Err(e) if e.is_storage() => return self.abort(Some(&principal), record.as_ref(), e),
            Err(e) => {
                debug!(err = %e, "secondary channel did not renew");
                if self.secondary.is_some() {
                    last_error = e;
                }
            }
        }

        self.exhausted(&principal, record.as_ref(), last_error)
    }

    async fn try_primary(
        &self,
        primary: &dyn GrantClient,
        refresh_secret: &str,
    ) -> Result<TokenGrant, RenewalError> {
        let backoff = self.config.backoff();
        let max_attempts = self.config.primary_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.config.attempt_timeout(), primary.exchange(refresh_secret))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RenewalError::NetworkError(format!(
                        "no response within {}ms",
                        self.config.attempt_timeout_ms
                    ))),
                };
            let result = result.and_then(|grant| grant.validate().map(|()| grant));

            match result {
                Ok(grant) => return Ok(grant),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff.delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        err = %e,
                        "refresh exchange failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
                Err(e) => {
                    warn!(attempt, err = %e, "refresh exchange failed");
                    return Err(e);
                }
            }
        }
    }

    /// Blacklist and drop a refresh secret the grant endpoint rejected.
    fn discard_refresh(
        &self,
        principal: &str,
        refresh_secret: &str,
        cause: &RenewalError,
    ) -> Result<(), RenewalError> {
        let reason = match cause {
            RenewalError::RefreshSecretExpired(_) => RevocationReason::Expired,
            _ => RevocationReason::Cleared,
        };
        self.blacklist.revoke_secret(refresh_secret, reason, self.clock.now_ms())?;
        self.principals.secure_store(principal).clear()?;
        info!(principal, reason = reason.as_str(), "discarded rejected refresh secret");
        Ok(())
    }

    async fn try_secondary(&self) -> Result<TokenGrant, RenewalError> {
        let Some(ref secondary) = self.secondary else {
            return Err(RenewalError::SecondaryChannelFailed("not configured".to_owned()));
        };
        if !(self.background_safe)() {
            debug!("background re-authentication not safe right now");
            return Err(RenewalError::SecondaryChannelFailed(
                "background re-authentication not safe".to_owned(),
            ));
        }

        let now = self.clock.now_ms();
        let admission = self.breaker.can_attempt(now)?;
        if !admission.allowed {
            info!(retry_after_secs = admission.retry_after_secs, "secondary channel circuit open");
            return Err(RenewalError::CircuitOpen { retry_after_secs: admission.retry_after_secs });
        }

        self.store.set(SILENT_FLOW_STATE_KEY, &uuid::Uuid::new_v4().to_string())?;
        self.store.set(SILENT_LAST_ATTEMPT_KEY, &now.to_string())?;

        let backoff = self.config.backoff();
        let max_attempts = self.config.secondary_max_attempts.max(1);
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.config.attempt_timeout(), secondary.reauthenticate())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SilentFailure::new(
                        SilentFailureKind::Timeout,
                        format!("no response within {}ms", self.config.attempt_timeout_ms),
                    )),
                };
            let result = result.and_then(|grant| match grant.validate() {
                Ok(()) => Ok(grant),
                Err(e) => Err(SilentFailure::new(SilentFailureKind::Other, e.to_string())),
            });

            match result {
                Ok(grant) => {
                    self.store.remove(SILENT_FLOW_STATE_KEY)?;
                    return Ok(grant);
                }
                Err(f) if f.is_critical() => {
                    warn!(attempt, err = %f, "silent re-authentication refused");
                    break f;
                }
                Err(f) if attempt < max_attempts => {
                    let delay = backoff.delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        err = %f,
                        "silent re-authentication failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
                Err(f) => {
                    warn!(attempt, err = %f, "silent re-authentication failed");
                    break f;
                }
            }
        };

        self.store.remove(SILENT_FLOW_STATE_KEY)?;
        self.breaker.record_failure(failure.kind.as_str(), self.clock.now_ms())?;
        Err(RenewalError::SecondaryChannelFailed(failure.to_string()))
    }

    fn rotate(
        &self,
        principal: &str,
        previous: Option<&CredentialRecord>,
        grant: &TokenGrant,
        channel: RenewalChannel,
    ) -> RenewalOutcome {
        let now = self.clock.now_ms();
        let record = CredentialRecord::from_grant(grant, previous, now);
        if let Err(e) = self.commit_rotation(principal, previous, &record, now) {
            return self.abort(Some(principal), previous, e);
        }

        info!(
            principal,
            channel = ?channel,
            fingerprint = record.access_fingerprint().short(),
            expires_at = record.access_expires_at,
            "credential renewed"
        );
        self.emit(LifecycleEvent::Renewed {
            principal: principal.to_owned(),
            channel,
            expires_at: record.access_expires_at,
        });
        RenewalOutcome::Renewed { channel, expires_at: record.access_expires_at }
    }

    fn commit_rotation(
        &self,
        principal: &str,
        previous: Option<&CredentialRecord>,
        record: &CredentialRecord,
        now: u64,
    ) -> Result<(), RenewalError> {
        if self.blacklist.is_secret_revoked(&record.access_secret)? {
            return Err(RenewalError::SecretRevoked("issued access secret is blacklisted".to_owned()));
        }
        self.principals.save_for_principal(principal, record)?;

        if let Some(prev) = previous {
            if prev.access_secret != record.access_secret {
                self.blacklist.revoke_secret(&prev.access_secret, RevocationReason::Rotated, now)?;
            }
            if let Some(ref old) = prev.refresh_secret {
                if record.refresh_secret.as_ref() != Some(old) {
                    self.blacklist.revoke_secret(old, RevocationReason::Rotated, now)?;
                }
            }
        }

        self.breaker.record_success()?;
        let mut marks = self.marks.lock();
        marks.last_success_at = Some(now);
        marks.consecutive_failures = 0;
        Ok(())
    }

    fn exhausted(
        &self,
        principal: &str,
        record: Option<&CredentialRecord>,
        error: RenewalError,
    ) -> RenewalOutcome {
        let now = self.clock.now_ms();
        let failures = {
            let mut marks = self.marks.lock();
            marks.consecutive_failures += 1;
            marks.consecutive_failures
        };

        if self.tracker.is_valid(record, now) {
            warn!(
                principal,
                failures,
                expires_in_secs = self.tracker.time_to_expiry(record, now),
                err = %error,
                "renewal failed, current credential still valid"
            );
            return RenewalOutcome::Degraded { error };
        }

        error!(principal, failures, err = %error, "renewal exhausted, clearing credentials");
        self.cleanup(principal, record);
        self.emit(LifecycleEvent::RenewalExhausted {
            principal: Some(principal.to_owned()),
            reason: error.to_string(),
        });
        RenewalOutcome::Failed { error }
    }

    /// Terminal storage or state failure. Corrupted writes take the
    /// credential down with them; a failed read leaves storage untouched.
    fn abort(
        &self,
        principal: Option<&str>,
        record: Option<&CredentialRecord>,
        error: RenewalError,
    ) -> RenewalOutcome {
        error!(principal, err = %error, "renewal aborted");
        if let Some(principal) = principal {
            if !matches!(error, RenewalError::StorageUnavailable(_)) {
                self.cleanup(principal, record);
            }
            self.emit(LifecycleEvent::RenewalExhausted {
                principal: Some(principal.to_owned()),
                reason: error.to_string(),
            });
        }
        self.marks.lock().consecutive_failures += 1;
        RenewalOutcome::Failed { error }
    }

    /// Best-effort purge of a principal's credential.
    fn cleanup(&self, principal: &str, record: Option<&CredentialRecord>) {
        let now = self.clock.now_ms();
        if let Some(record) = record {
            if let Err(e) =
                self.blacklist.revoke_secret(&record.access_secret, RevocationReason::Expired, now)
            {
                warn!(principal, err = %e, "failed to blacklist access secret");
            }
        }
        if let Err(e) = self.principals.clear_principal(principal) {
            warn!(principal, err = %e, "failed to clear principal");
        }
    }

    fn forced_logout(&self, principal: &str, record: &CredentialRecord) {
        warn!(
            principal,
            fingerprint = record.access_fingerprint().short(),
            "access secret is blacklisted, forcing logout"
        );
        if let Some(ref refresh) = record.refresh_secret {
            if let Err(e) =
                self.blacklist.revoke_secret(refresh, RevocationReason::Logout, self.clock.now_ms())
            {
                warn!(principal, err = %e, "failed to blacklist refresh secret");
            }
        }
        if let Err(e) = self.principals.clear_principal(principal) {
            warn!(principal, err = %e, "failed to clear principal");
        }
        *self.marks.lock() = Marks::default();
        self.emit(LifecycleEvent::LoggedOut { principal: Some(principal.to_owned()) });
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
