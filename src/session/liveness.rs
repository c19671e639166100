//! Liveness monitoring and keep-alives
//!
//! The transport does not always report a peer that went silent (process
//! suspended, radio gone without a clean close). The receiving side runs a
//! [`LivenessMonitor`] fed by every command it receives; the sending side
//! runs a [`KeepAliveSender`] so there is always command traffic.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::debug_throttled;
use crate::protocol::{RemoteCommand, SendMode};
use crate::transport::{Channel, ChannelState};
use crate::utils::LogThrottler;

/// Default keep-alive interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Invoked once when the peer stops answering
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
enum LivenessCommand {
    Start,
    Beat,
    Stop,
}

/// Owned by the monitor task
struct LivenessRecord {
    last_beat: Instant,
}

/// Heartbeat watchdog
///
/// `start`, `beat` and `stop` never block; they queue a command for the
/// monitor task. After a timeout the monitor is disarmed until the next
/// `start`. Dropping every handle ends the task.
#[derive(Clone)]
pub struct LivenessMonitor {
    tx: mpsc::UnboundedSender<LivenessCommand>,
    armed: Arc<AtomicBool>,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn spawn(
        interval: Duration,
        timeout: Duration,
        on_timeout: TimeoutCallback,
        parent: &Span,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let armed = Arc::new(AtomicBool::new(false));
        let span = tracing::debug_span!(parent: parent, "liveness");
        tokio::spawn(
            Self::run(rx, interval, timeout, on_timeout, armed.clone()).instrument(span),
        );
        Self {
            tx,
            armed,
            interval,
            timeout,
        }
    }

    /// Arm the monitor, counting from now
    pub fn start(&self) {
        self.armed.store(true, Ordering::SeqCst);
        let _ = self.tx.send(LivenessCommand::Start);
    }

    /// Record a keep-alive (or any command standing in for one)
    pub fn beat(&self) {
        let _ = self.tx.send(LivenessCommand::Beat);
    }

    /// Disarm and clear. Idempotent.
    pub fn stop(&self) {
        self.armed.store(false, Ordering::SeqCst);
        let _ = self.tx.send(LivenessCommand::Stop);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<LivenessCommand>,
        interval: Duration,
        timeout: Duration,
        on_timeout: TimeoutCallback,
        armed: Arc<AtomicBool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut record: Option<LivenessRecord> = None;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(LivenessCommand::Start) => {
                        record = Some(LivenessRecord { last_beat: Instant::now() });
                        ticker.reset();
                        debug!("Armed (interval {:?}, timeout {:?})", interval, timeout);
                    }
                    Some(LivenessCommand::Beat) => {
                        if let Some(record) = record.as_mut() {
                            record.last_beat = Instant::now();
                        }
                    }
                    Some(LivenessCommand::Stop) => {
                        if record.take().is_some() {
                            debug!("Disarmed");
                        }
                    }
                    None => break,
                },
                _ = ticker.tick(), if record.is_some() => {
                    let silent = record.as_ref().map(|r| r.last_beat.elapsed()).unwrap_or_default();
                    if silent > timeout {
                        warn!("No keep-alive for {} ms", silent.as_millis());
                        record = None;
                        armed.store(false, Ordering::SeqCst);
                        on_timeout();
                    }
                }
            }
        }
        debug!("Liveness monitor finished");
    }
}

/// Periodically sends heartbeat commands on a reliable channel
pub struct KeepAliveSender {
    cancel: CancellationToken,
}

impl KeepAliveSender {
    /// Start sending; the first heartbeat goes out immediately
    pub fn spawn(channel: Arc<dyn Channel>, interval: Duration, parent: &Span) -> Self {
        let cancel = CancellationToken::new();
        let span = tracing::debug_span!(parent: parent, "keepalive", peer = %channel.peer().id);
        tokio::spawn(Self::run(channel, interval, cancel.clone()).instrument(span));
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(channel: Arc<dyn Channel>, interval: Duration, cancel: CancellationToken) {
        let heartbeat: Bytes = match RemoteCommand::Heartbeat.to_packet() {
            Ok(packet) => packet.to_bytes(),
            Err(e) => {
                warn!("Cannot encode heartbeat: {}", e);
                return;
            }
        };
        let throttler = LogThrottler::with_secs(5);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if channel.state() == ChannelState::NotConnected {
                        info!("Command channel gone, stopping keep-alives");
                        break;
                    }
                    if let Err(e) = channel.send(heartbeat.clone(), SendMode::Reliable).await {
                        debug_throttled!(throttler, "heartbeat", "Heartbeat send failed: {}", e);
                    }
                }
            }
        }
    }
}

impl Drop for KeepAliveSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
