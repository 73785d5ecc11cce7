/// The one TCP session to the mixer.
///
/// The mixer keeps a session alive only while it keeps receiving the
/// keepalive byte every 300ms, and it never acknowledges anything. Liveness
/// is therefore inferred purely from write success: a failed keepalive or a
/// failed send is the signal to tear down and reconnect.
///
/// Invariants:
/// - at most one open stream, private to this module;
/// - every write goes through one async mutex, so a multi-group message
///   (NRPN, trigger pair) is never interleaved with anything else;
/// - `reconnecting` is a check-and-set flag, so simultaneous failures from
///   the keepalive loop and a sender produce a single reconnect sequence.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use cq_protocol::{decode_parameter_change, ProtocolMessage, KEEPALIVE_BYTE, TRIGGER_GAP};

use crate::discovery::DiscoveryScanner;
use crate::settings::LinkSettings;
use crate::{ConnectionState, Endpoint};

/// Write half of a mixer session. Reads are never used.
pub type MixerStream = Box<dyn AsyncWrite + Send + Unpin>;

/// How long `shutdown()` waits for background tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Opens streams to the mixer.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: Endpoint) -> io::Result<MixerStream>;
}

/// Plain TCP with Nagle disabled and OS-level keepalive as a backstop.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: Endpoint) -> io::Result<MixerStream> {
        let stream = TcpStream::connect(endpoint.socket_addr()).await?;
        stream.set_nodelay(true)?;

        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(10));
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(error = %e, "Could not enable TCP keepalive");
        }

        Ok(Box::new(stream))
    }
}

/// Handle to the mixer session. Cheap to clone; all clones share one
/// session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: LinkSettings,
    connector: Arc<dyn Connector>,
    discovery: Option<Arc<DiscoveryScanner>>,
    endpoint: StdMutex<Option<Endpoint>>,
    writer: Mutex<Option<MixerStream>>,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    reconnecting: AtomicBool,
    background_started: AtomicBool,
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ConnectionManager {
    /// Production manager: TCP to the static address, or TCP probes and
    /// discovery when no address is configured.
    pub fn new(settings: LinkSettings) -> Self {
        let discovery = settings.discovery.clone().map(|discovery| {
            Arc::new(DiscoveryScanner::with_tcp_probe(discovery, settings.mixer_port))
        });
        Self::with_parts(settings, Arc::new(TcpConnector), discovery)
    }

    pub fn with_parts(
        settings: LinkSettings,
        connector: Arc<dyn Connector>,
        discovery: Option<Arc<DiscoveryScanner>>,
    ) -> Self {
        let endpoint = settings
            .mixer_ip
            .map(|ip| Endpoint::new(ip, settings.mixer_port));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(32);

        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                discovery,
                endpoint: StdMutex::new(endpoint),
                writer: Mutex::new(None),
                state_tx,
                transitions,
                reconnecting: AtomicBool::new(false),
                background_started: AtomicBool::new(false),
                connect_attempts: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Latest state, for callers that want to wait on a change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Every state transition, in order.
    pub fn state_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions.subscribe()
    }

    /// Address the session targets (or last targeted).
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        *self.lock_endpoint()
    }

    /// TCP connects attempted since startup.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Reconnect sequences started since startup.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// Block until a session is established.
    ///
    /// Retries forever with `reconnect_delay` between cycles; only a
    /// shutdown ends the wait with an error. The first success starts the
    /// keepalive loop and, when discovering, the discovery monitor.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        let retry_ms = inner.settings.reconnect_delay.as_millis() as u64;

        loop {
            if inner.cancel.is_cancelled() {
                bail!("mixer link shut down before a connection was established");
            }
            self.set_state(ConnectionState::Connecting);

            let endpoint = tokio::select! {
                _ = inner.cancel.cancelled() => {
                    bail!("mixer link shut down during discovery");
                }
                endpoint = self.resolve_endpoint() => endpoint,
            };

            let Some(endpoint) = endpoint else {
                warn!(retry_ms = retry_ms, "Mixer not found on the network, retrying");
                self.backoff().await?;
                continue;
            };

            let attempt = inner.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            info!(endpoint = %endpoint, attempt = attempt, "Connecting to mixer");

            let opened = inner.connector.connect(endpoint);
            match timeout(inner.settings.connection_timeout, opened).await {
                Ok(Ok(stream)) => {
                    // `reconnecting` stays set; only run_reconnect releases it
                    *inner.writer.lock().await = Some(stream);
                    self.set_state(ConnectionState::Connected);
                    info!(endpoint = %endpoint, attempt = attempt, "Connected to mixer");
                    self.start_background();
                    return Ok(());
                }
                Ok(Err(e)) => {
                    error!(
                        endpoint = %endpoint,
                        error = %e,
                        retry_ms = retry_ms,
                        "Connection failed"
                    );
                }
                Err(_) => {
                    error!(
                        endpoint = %endpoint,
                        timeout_ms = inner.settings.connection_timeout.as_millis() as u64,
                        retry_ms = retry_ms,
                        "Connection timed out"
                    );
                }
            }

            self.backoff().await?;
        }
    }

    /// Tear down the current session and connect again. A reconnect that is
    /// already running makes this a no-op.
    pub async fn reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already in progress");
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.run_reconnect().await;
    }

    /// Write raw bytes. Returns whether the write happened; failures are
    /// logged and trigger a reconnect, never returned.
    pub async fn send(&self, bytes: &[u8]) -> bool {
        self.deliver(&[bytes], None, "raw").await
    }

    /// Write one protocol message, honoring the trigger gap, then pace the
    /// caller by `send_delay`.
    pub async fn send_message(&self, message: &ProtocolMessage) -> bool {
        let keepalive = [KEEPALIVE_BYTE];
        let sent = match message {
            ProtocolMessage::Keepalive => {
                self.deliver(&[keepalive.as_slice()], None, "keepalive").await
            }
            ProtocolMessage::ParameterChange(bytes) => {
                let sent = self.deliver(&[bytes.as_slice()], None, "nrpn").await;
                if sent {
                    if let Some((address, value, channel)) = decode_parameter_change(bytes) {
                        debug!(
                            parameter = %address,
                            value = value,
                            channel = channel,
                            bytes = message.wire_len(),
                            "Sent NRPN"
                        );
                    }
                }
                sent
            }
            ProtocolMessage::Trigger { on, off } => {
                let frames = [on.as_slice(), off.as_slice()];
                let sent = self.deliver(&frames, Some(TRIGGER_GAP), "trigger").await;
                if sent {
                    debug!(
                        note = on[1],
                        channel = on[0] & 0x0F,
                        bytes = message.wire_len(),
                        "Sent soft key"
                    );
                }
                sent
            }
        };

        if sent && !self.inner.settings.send_delay.is_zero() {
            sleep(self.inner.settings.send_delay).await;
        }
        sent
    }

    /// Address-change notification from discovery. Moves the session to the
    /// new address if it differs; a live session to the old one is dropped.
    pub fn on_discovered_address_changed(&self, endpoint: Endpoint) {
        {
            let mut current = self.lock_endpoint();
            if *current == Some(endpoint) {
                debug!(endpoint = %endpoint, "Discovered address unchanged");
                return;
            }
            let previous = *current;
            info!(previous = ?previous, current = %endpoint, "Mixer moved to a new address");
            *current = Some(endpoint);
        }

        if let Some(discovery) = &self.inner.discovery {
            discovery.remember(endpoint);
        }

        if self.is_connected() {
            self.schedule_reconnect();
        }
    }

    /// Stop background tasks, close the socket and mark the link
    /// disconnected.
    pub async fn shutdown(&self) {
        info!("Shutting down mixer link");
        self.inner.cancel.cancel();
        self.inner.tasks.close();

        if timeout(SHUTDOWN_GRACE, self.inner.tasks.wait()).await.is_err() {
            warn!(
                grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
                "Background tasks did not stop in time"
            );
        }

        if let Some(mut stream) = self.inner.writer.lock().await.take() {
            let _ = timeout(self.inner.settings.connection_timeout, stream.shutdown()).await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn lock_endpoint(&self) -> std::sync::MutexGuard<'_, Option<Endpoint>> {
        self.inner.endpoint.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, new: ConnectionState) {
        let old = self.inner.state_tx.send_replace(new);
        if old != new {
            debug!(from = %old, to = %new, "Connection state changed");
            let _ = self.inner.transitions.send(new);
        }
    }

    async fn resolve_endpoint(&self) -> Option<Endpoint> {
        let Some(discovery) = &self.inner.discovery else {
            return *self.lock_endpoint();
        };

        let found = discovery.find_mixer().await?;
        *self.lock_endpoint() = Some(found);
        Some(found)
    }

    async fn backoff(&self) -> anyhow::Result<()> {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                bail!("mixer link shut down while waiting to retry")
            }
            _ = sleep(self.inner.settings.reconnect_delay) => Ok(()),
        }
    }

    /// Guarded reconnect from a background failure; returns at once.
    fn schedule_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already in progress");
            return;
        }
        if self.inner.cancel.is_cancelled() {
            self.inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        let this = self.clone();
        self.inner.tasks.spawn(async move {
            this.run_reconnect().await;
        });
    }

    /// Caller must hold the `reconnecting` flag.
    async fn run_reconnect(&self) {
        let count = self.inner.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(reconnect = count, "Connection to mixer lost, reconnecting");

        if let Some(mut stale) = self.inner.writer.lock().await.take() {
            let _ = timeout(self.inner.settings.connection_timeout, stale.shutdown()).await;
        }

        if let Err(e) = self.connect().await {
            debug!(error = %e, "Reconnect abandoned");
        }
        self.inner.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Write `frames` back to back under the writer lock, sleeping `gap`
    /// between them.
    async fn deliver(&self, frames: &[&[u8]], gap: Option<Duration>, kind: &'static str) -> bool {
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!(state = %state, kind = kind, "Not connected to mixer, dropping message");
            return false;
        }

        match self.write_frames(frames, gap).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, kind = kind, "Send to mixer failed");
                self.schedule_reconnect();
                false
            }
        }
    }

    async fn write_frames(&self, frames: &[&[u8]], gap: Option<Duration>) -> io::Result<()> {
        let io_timeout = self.inner.settings.connection_timeout;
        let mut writer = self.inner.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no mixer session"))?;

        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                if let Some(gap) = gap {
                    sleep(gap).await;
                }
            }
            bounded(io_timeout, stream.write_all(frame)).await?;
        }

        if self.inner.settings.buffer_flush {
            bounded(io_timeout, stream.flush()).await?;
        }
        Ok(())
    }

    fn start_background(&self) {
        if self.inner.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        self.inner.tasks.spawn(async move { this.keepalive_loop().await });

        if let Some(discovery) = &self.inner.discovery {
            let (tx, rx) = mpsc::channel(4);
            self.inner
                .tasks
                .spawn(Arc::clone(discovery).run_monitor(tx, self.inner.cancel.clone()));

            let this = self.clone();
            self.inner
                .tasks
                .spawn(async move { this.address_change_loop(rx).await });
        }
    }

    async fn keepalive_loop(self) {
        let period = self.inner.settings.keepalive_interval;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = period.as_millis() as u64, "Keepalive started");

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.is_connected() {
                continue;
            }

            if let Err(e) = self.write_frames(&[[KEEPALIVE_BYTE].as_slice()], None).await {
                // A sender may have flipped the state while we waited for the lock
                if self.is_connected() {
                    error!(error = %e, "Keepalive failed");
                }
                self.schedule_reconnect();
            }
        }

        debug!("Keepalive stopped");
    }

    async fn address_change_loop(self, mut changes: mpsc::Receiver<Endpoint>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Some(endpoint) => self.on_discovered_address_changed(endpoint),
                    None => break,
                },
            }
        }
    }
}

async fn bounded<F>(limit: Duration, op: F) -> io::Result<()>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    match timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write to mixer timed out")),
    }
}
