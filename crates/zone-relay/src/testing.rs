//! Test doubles shared by the relay's unit tests.

use crate::authenticator::Authenticator;
use crate::monitor::FailureReporter;
use crate::relay::SessionSettings;
use crate::store::{CreateOutcome, CredentialRecord, CredentialStore, MemoryCredentialStore};
use crate::upstream::{UpstreamConnector, UpstreamHandle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use zone_core::{
    DeviceBinding, DownstreamTransport, Received, UpstreamEvent, UpstreamTarget, ZoneError,
    ZoneResult,
};

pub fn binding() -> DeviceBinding {
    DeviceBinding {
        device_type: "zone-sample".into(),
        device_id: "dev1".into(),
        auth_token: "tok".into(),
        client_id: "d:org1:zone-sample:dev1".into(),
        org_id: "org1".into(),
    }
}

pub async fn seeded_store(identifier: &str, secret: &str) -> Arc<MemoryCredentialStore> {
    let store = Arc::new(MemoryCredentialStore::new());
    let outcome = store
        .create(
            identifier,
            CredentialRecord {
                secret: secret.to_string(),
                binding: binding(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, CreateOutcome::Created);
    store
}

pub async fn seeded_authenticator(identifier: &str, secret: &str) -> Authenticator {
    Authenticator::new(seeded_store(identifier, secret).await, Duration::from_secs(1))
}

pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        liveness_interval: Duration::from_millis(20),
        auth_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(200),
        event_buffer: 16,
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// Stores

/// Counts lookups against a memory store.
pub struct CountingStore {
    inner: Arc<MemoryCredentialStore>,
    lookups: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<MemoryCredentialStore>) -> Self {
        Self {
            inner,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for CountingStore {
    async fn lookup(&self, identifier: &str) -> ZoneResult<Option<CredentialRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(identifier).await
    }

    async fn create(&self, identifier: &str, record: CredentialRecord) -> ZoneResult<CreateOutcome> {
        self.inner.create(identifier, record).await
    }
}

/// A store that never answers.
pub struct StalledStore;

#[async_trait]
impl CredentialStore for StalledStore {
    async fn lookup(&self, _identifier: &str) -> ZoneResult<Option<CredentialRecord>> {
        std::future::pending().await
    }

    async fn create(&self, _identifier: &str, _record: CredentialRecord) -> ZoneResult<CreateOutcome> {
        std::future::pending().await
    }
}

// Downstream

enum PeerAction {
    Message(Vec<u8>),
    Close,
    Fail(String),
}

#[derive(Default)]
struct MockShared {
    sent: Mutex<Vec<Vec<u8>>>,
    close_calls: AtomicUsize,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
    panic_on_send: AtomicBool,
    send_attempts: AtomicUsize,
}

/// In-memory downstream transport driven by a [`MockPeer`].
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<PeerAction>,
    shared: Arc<MockShared>,
    open: bool,
}

/// The client side of a [`MockTransport`].
pub struct MockPeer {
    outbound: mpsc::UnboundedSender<PeerAction>,
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn pair() -> (MockTransport, MockPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared::default());
        (
            MockTransport {
                inbound: rx,
                shared: shared.clone(),
                open: true,
            },
            MockPeer {
                outbound: tx,
                shared,
            },
        )
    }
}

impl DownstreamTransport for MockTransport {
    async fn send(&mut self, payload: &[u8]) -> ZoneResult<()> {
        self.shared.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.stall_sends.load(Ordering::SeqCst) {
            // A client that stopped reading: the write never completes.
            std::future::pending::<()>().await;
        }
        if self.shared.panic_on_send.load(Ordering::SeqCst) {
            panic!("mock transport exploded");
        }
        if !self.open {
            return Err(ZoneError::Transport("closed".into()));
        }
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(ZoneError::Transport("write failed".into()));
        }
        self.shared.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> ZoneResult<Received> {
        if !self.open {
            return Ok(Received::Closed);
        }
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(PeerAction::Message(data))) => Ok(Received::Message(data)),
            Ok(Some(PeerAction::Close)) | Ok(None) => {
                self.open = false;
                Ok(Received::Closed)
            }
            Ok(Some(PeerAction::Fail(reason))) => {
                self.open = false;
                Err(ZoneError::Transport(reason))
            }
            Err(_) => Ok(Received::Idle),
        }
    }

    async fn close(&mut self) {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl MockPeer {
    pub fn send(&self, data: Vec<u8>) {
        let _ = self.outbound.send(PeerAction::Message(data));
    }

    pub fn disconnect(&self) {
        let _ = self.outbound.send(PeerAction::Close);
    }

    pub fn error(&self, reason: &str) {
        let _ = self.outbound.send(PeerAction::Fail(reason.to_string()));
    }

    pub fn fail_sends(&self, on: bool) {
        self.shared.fail_sends.store(on, Ordering::SeqCst);
    }

    pub fn stall_sends(&self, on: bool) {
        self.shared.stall_sends.store(on, Ordering::SeqCst);
    }

    /// Wait until `send` was entered at least `n` times.
    pub async fn wait_send_attempts(&self, n: usize) {
        eventually(|| self.shared.send_attempts.load(Ordering::SeqCst) >= n).await;
    }

    pub fn panic_on_send(&self, on: bool) {
        self.shared.panic_on_send.store(on, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.sent.lock().unwrap().clone()
    }

    /// Wait until at least `n` payloads were written, then return them all.
    pub async fn wait_sent(&self, n: usize) -> Vec<Vec<u8>> {
        eventually(|| self.shared.sent.lock().unwrap().len() >= n).await;
        self.sent()
    }

    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }
}

// Upstream

/// What [`ScriptedConnector::open`] does.
pub enum Behavior {
    Succeed,
    Fail(String),
    Hang,
    Panic,
}

/// Connector that follows a script and tracks every handle it hands out.
pub struct ScriptedConnector {
    behavior: Behavior,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    events: Mutex<Option<mpsc::Sender<UpstreamEvent>>>,
}

struct ScriptedHandle {
    closes: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    closed: bool,
}

impl ScriptedConnector {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            events: Mutex::new(None),
        }
    }

    pub fn open_calls(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub async fn wait_opened(&self, n: usize) {
        eventually(|| self.events.lock().unwrap().is_some() && self.open_calls() >= n).await;
    }

    /// Deliver an event as the upstream would. False if nothing is subscribed.
    pub async fn push(&self, payload: &[u8]) -> bool {
        let sender = self.events.lock().unwrap().clone();
        let Some(sender) = sender else {
            return false;
        };
        sender
            .send(UpstreamEvent {
                event: "status".into(),
                format: "json".into(),
                payload: payload.to_vec(),
            })
            .await
            .is_ok()
    }

    /// Drop the event sender, as a lost upstream connection does.
    pub async fn drop_events(&self) {
        let sender = self.events.lock().unwrap().take();
        drop(sender);
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn open(
        &self,
        _target: &UpstreamTarget,
        _identity: &str,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> ZoneResult<Box<dyn UpstreamHandle>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => {
                self.live.fetch_add(1, Ordering::SeqCst);
                *self.events.lock().unwrap() = Some(events);
                Ok(Box::new(ScriptedHandle {
                    closes: self.closes.clone(),
                    live: self.live.clone(),
                    closed: false,
                }))
            }
            Behavior::Fail(reason) => Err(ZoneError::Upstream(reason.clone())),
            Behavior::Hang => std::future::pending().await,
            Behavior::Panic => panic!("connector exploded"),
        }
    }
}

#[async_trait]
impl UpstreamHandle for ScriptedHandle {
    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if !self.closed {
            self.closed = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// Monitor

/// Records every report for later inspection.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl FailureReporter for RecordingReporter {
    fn report(&self, summary: &str, detail: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((summary.to_string(), detail.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> UpstreamTarget {
        UpstreamTarget {
            org_id: "org1".into(),
            device_type: "zone-sample".into(),
            device_id: "dev1".into(),
        }
    }

    #[tokio::test]
    async fn scripted_handle_close_is_idempotent() {
        let connector = ScriptedConnector::new(Behavior::Succeed);
        let (tx, _rx) = mpsc::channel(1);
        let mut first = connector.open(&target(), "one", tx.clone()).await.unwrap();
        let _second = connector.open(&target(), "two", tx).await.unwrap();
        assert_eq!(connector.live_handles(), 2);

        first.close().await;
        first.close().await;
        assert_eq!(connector.close_calls(), 2);
        assert_eq!(connector.live_handles(), 1);

        drop(first);
        assert_eq!(connector.live_handles(), 1);
    }
}
