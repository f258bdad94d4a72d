// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Shared test infrastructure: a manual clock, scripted channels, and a
//! coordinator harness.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::channel::{
    ChannelFuture, GrantClient, Revoker, SilentFailure, SilentFailureKind, SilentReauth, TokenHint,
};
use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::coordinator::RefreshCoordinator;
use crate::error::RenewalError;
use crate::event::LifecycleEvent;
use crate::record::{CredentialRecord, TokenGrant};
use crate::storage::{AeadSealer, MemoryStore, Sealer};

/// Real sealer whose writes can be switched to unreadable output, so
/// read-back verification fails while earlier values still open.
pub struct CorruptingSealer {
    inner: AeadSealer,
    corrupt: AtomicBool,
}

impl CorruptingSealer {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self { inner: AeadSealer::new(&[7u8; 32])?, corrupt: AtomicBool::new(false) })
    }

    pub fn corrupt_writes(&self) {
        self.corrupt.store(true, Ordering::SeqCst);
    }
}

impl Sealer for CorruptingSealer {
    fn seal(&self, plaintext: &str, aad: &str) -> anyhow::Result<String> {
        let sealed = self.inner.seal(plaintext, aad)?;
        if self.corrupt.load(Ordering::SeqCst) {
            return Ok(format!("!{sealed}"));
        }
        Ok(sealed)
    }

    fn open(&self, sealed: &str, aad: &str) -> anyhow::Result<String> {
        self.inner.open(sealed, aad)
    }
}

/// Fixed epoch used as "now" across tests.
pub const T0: u64 = 1_700_000_000_000;

/// Clock that only moves when told to. `sleep` advances time by the requested
/// duration and returns immediately, recording the delay.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self { now: AtomicU64::new(start_ms), sleeps: Mutex::new(Vec::new()) })
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Every delay passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.sleeps.lock().push(duration);
        self.advance(duration.as_millis() as u64);
        Box::pin(tokio::task::yield_now())
    }
}

/// Scripted responses, repeating the last one once the script runs out.
struct Script<T> {
    queue: Mutex<VecDeque<T>>,
    last: Mutex<Option<T>>,
}

impl<T: Clone> Script<T> {
    fn new(items: Vec<T>) -> Self {
        Self { queue: Mutex::new(items.into()), last: Mutex::new(None) }
    }

    fn next(&self) -> Option<T> {
        match self.queue.lock().pop_front() {
            Some(item) => {
                *self.last.lock() = Some(item.clone());
                Some(item)
            }
            None => self.last.lock().clone(),
        }
    }
}

/// Primary channel double.
pub struct FakeGrantClient {
    script: Script<Result<TokenGrant, RenewalError>>,
    calls: AtomicU32,
    seen: Mutex<Vec<String>>,
    delay: Duration,
}

impl FakeGrantClient {
    pub fn new(script: Vec<Result<TokenGrant, RenewalError>>) -> Self {
        Self {
            script: Script::new(script),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Hold every exchange open for `delay` of real time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Refresh secrets presented, in order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl GrantClient for FakeGrantClient {
    fn exchange<'a>(&'a self, refresh_secret: &'a str) -> ChannelFuture<'a, Result<TokenGrant, RenewalError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(refresh_secret.to_owned());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .next()
                .unwrap_or_else(|| Err(RenewalError::NetworkError("script empty".to_owned())))
        })
    }
}

/// Secondary channel double.
pub struct FakeSilentReauth {
    script: Script<Result<TokenGrant, SilentFailure>>,
    calls: AtomicU32,
    session_expires_at: Mutex<Option<u64>>,
}

impl FakeSilentReauth {
    pub fn new(script: Vec<Result<TokenGrant, SilentFailure>>) -> Self {
        Self {
            script: Script::new(script),
            calls: AtomicU32::new(0),
            session_expires_at: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_session_expires_at(&self, at: Option<u64>) {
        *self.session_expires_at.lock() = at;
    }
}

impl SilentReauth for FakeSilentReauth {
    fn reauthenticate(&self) -> ChannelFuture<'_, Result<TokenGrant, SilentFailure>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.next().unwrap_or_else(|| {
                Err(SilentFailure::new(SilentFailureKind::Other, "script empty"))
            })
        })
    }

    fn session_expires_at(&self) -> Option<u64> {
        *self.session_expires_at.lock()
    }
}

/// Revoker that reports every call on a channel.
pub struct FakeRevoker {
    tx: mpsc::UnboundedSender<(String, TokenHint)>,
}

impl FakeRevoker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, TokenHint)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Revoker for FakeRevoker {
    fn revoke<'a>(&'a self, secret: &'a str, hint: TokenHint) -> ChannelFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let _ = self.tx.send((secret.to_owned(), hint));
            Ok(())
        })
    }
}

pub fn grant(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenGrant {
    TokenGrant {
        access_secret: access.to_owned(),
        token_kind: Some("Bearer".to_owned()),
        expires_in,
        scope: Some("openid".to_owned()),
        refresh_secret: refresh.map(str::to_owned),
        refresh_expires_in: refresh.map(|_| 86_400),
    }
}

/// A record issued at `issued_at` whose access secret expires `ttl_secs` later.
pub fn record(access: &str, refresh: Option<&str>, issued_at: u64, ttl_secs: u64) -> CredentialRecord {
    CredentialRecord::from_grant(&grant(access, refresh, ttl_secs), None, issued_at)
}

/// Everything currently queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// A coordinator wired to fakes over a memory store.
pub struct Harness {
    pub coordinator: Arc<RefreshCoordinator>,
    pub events: broadcast::Receiver<LifecycleEvent>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub primary: Option<Arc<FakeGrantClient>>,
    pub secondary: Option<Arc<FakeSilentReauth>>,
    pub background_safe: Arc<AtomicBool>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    pub fn primary_calls(&self) -> u32 {
        self.primary.as_ref().map(|p| p.calls()).unwrap_or(0)
    }

    pub fn secondary_calls(&self) -> u32 {
        self.secondary.as_ref().map(|s| s.calls()).unwrap_or(0)
    }

    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        drain(&mut self.events)
    }
}

pub struct HarnessBuilder {
    config: LifecycleConfig,
    primary: Option<FakeGrantClient>,
    secondary: Option<FakeSilentReauth>,
    revoker: Option<FakeRevoker>,
    sealed: bool,
    sealer: Option<Arc<dyn Sealer>>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self { config: LifecycleConfig::default(), primary: None, secondary: None, revoker: None, sealed: true, sealer: None }
    }

    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn primary(mut self, client: FakeGrantClient) -> Self {
        self.primary = Some(client);
        self
    }

    pub fn secondary(mut self, reauth: FakeSilentReauth) -> Self {
        self.secondary = Some(reauth);
        self
    }

    pub fn revoker(mut self, revoker: FakeRevoker) -> Self {
        self.revoker = Some(revoker);
        self
    }

    /// Store refresh secrets in plaintext.
    pub fn unsealed(mut self) -> Self {
        self.sealed = false;
        self
    }

    /// Seal with `sealer` instead of the default test key.
    pub fn sealer(mut self, sealer: Arc<dyn Sealer>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn build(self) -> anyhow::Result<Harness> {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::new());
        let background_safe = Arc::new(AtomicBool::new(true));
        let primary = self.primary.map(Arc::new);
        let secondary = self.secondary.map(Arc::new);

        let safe = Arc::clone(&background_safe);
        let mut builder = RefreshCoordinator::builder(store.clone())
            .config(self.config)
            .clock(clock.clone())
            .background_safety(Arc::new(move || safe.load(Ordering::SeqCst)));
        if let Some(sealer) = self.sealer {
            builder = builder.sealer(sealer);
        } else if self.sealed {
            builder = builder.sealer(Arc::new(AeadSealer::new(&[7u8; 32])?));
        }
        if let Some(ref p) = primary {
            builder = builder.primary(p.clone());
        }
        if let Some(ref s) = secondary {
            builder = builder.secondary(s.clone());
        }
        if let Some(r) = self.revoker {
            builder = builder.revoker(Arc::new(r));
        }
        let (coordinator, events) = builder.build();

        Ok(Harness { coordinator, events, clock, store, primary, secondary, background_safe })
    }
}
