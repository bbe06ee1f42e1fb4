//! Outbound TCP client for the command server.
//!
//! Risk-level changes, heartbeats and connection notices are streamed as
//! length-prefixed JSON (see [`bds_types::wire`]). The client owns a single
//! background task that connects, reconnects every few seconds while the
//! pipeline runs, and drains a bounded queue of outbound messages. No
//! failure here propagates into the pipeline: a dead peer only costs
//! events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use bds_types::{epoch_now, EventCodec, RiskLevel, WireMessage};

/// Bounded outbound queue; the newest message is dropped when full.
const QUEUE_CAPACITY: usize = 64;
/// Rate limit for queue-full warnings (one per this many drops).
const DROP_LOG_EVERY: u64 = 50;

#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    pub host: String,
    pub port: u16,
    /// Minimum interval between two accepted events of the same level.
    pub min_send_interval: Duration,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5200,
            min_send_interval: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Producer half handed to the pipeline: enqueue level changes.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<WireMessage>,
    min_send_interval: Duration,
    last_accepted: Arc<Mutex<Option<(RiskLevel, Instant)>>>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Enqueue a `BR_CHANGED` event.
    ///
    /// Returns false when the event was suppressed as a duplicate (same
    /// level as the previously accepted event within the minimum interval)
    /// or dropped because the queue is full.
    pub fn send_level_change(&self, level: RiskLevel) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last_accepted.lock().unwrap();
            if let Some((prev_level, prev_time)) = *last {
                if prev_level == level && now.duration_since(prev_time) < self.min_send_interval {
                    debug!("suppressing duplicate {level} event");
                    return false;
                }
            }
            *last = Some((level, now));
        }

        match self.tx.try_send(WireMessage::level_change(level, epoch_now())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed);
                if n % DROP_LOG_EVERY == 0 {
                    warn!("outbound event queue full, dropping {level} (total drops: {})", n + 1);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Owner half: connection status and shutdown.
pub struct TcpClientHandle {
    shutdown_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl TcpClientHandle {
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Stop the client: drains briefly, closes the socket, and waits for
    /// the background task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

/// Spawn the client task onto the current tokio runtime.
pub fn spawn(config: TcpClientConfig) -> (EventSender, TcpClientHandle) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (connected_tx, connected_rx) = watch::channel(false);

    let sender = EventSender {
        tx,
        min_send_interval: config.min_send_interval,
        last_accepted: Arc::new(Mutex::new(None)),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let join = tokio::spawn(run_client(config, rx, shutdown_rx, connected_tx));
    (
        sender,
        TcpClientHandle {
            shutdown_tx,
            connected_rx,
            join,
        },
    )
}

/// Resolves when shutdown is requested (or the handle is gone).
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_client(
    config: TcpClientConfig,
    mut rx: mpsc::Receiver<WireMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    connected_tx: watch::Sender<bool>,
) {
    // an event whose transmission failed, eligible for one more attempt
    let mut carryover: Option<WireMessage> = None;

    'outer: while !*shutdown_rx.borrow() {
        // ---- connecting ----
        let addr = (config.host.as_str(), config.port);
        let stream = tokio::select! {
            _ = wait_shutdown(&mut shutdown_rx) => break 'outer,
            res = timeout(config.connect_timeout, TcpStream::connect(addr)) => match res {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    warn!("connection to {}:{} failed: {e}", config.host, config.port);
                    None
                }
                Err(_) => {
                    warn!("connection to {}:{} timed out", config.host, config.port);
                    None
                }
            },
        };
        let Some(stream) = stream else {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown_rx) => break 'outer,
                _ = tokio::time::sleep(config.reconnect_interval) => {}
            }
            continue;
        };

        // ---- connected ----
        info!("connected to command server {}:{}", config.host, config.port);
        let mut framed = FramedWrite::new(stream, EventCodec::default());
        connected_tx.send_replace(true);

        if let Err(e) = framed.send(WireMessage::connected(epoch_now())).await {
            warn!("failed to send connection notice: {e}");
            connected_tx.send_replace(false);
            continue;
        }
        if let Some(msg) = carryover.take() {
            // second and last attempt for this event
            if let Err(e) = framed.send(msg).await {
                warn!("retried event lost: {e}");
                connected_tx.send_replace(false);
                continue;
            }
        }

        let mut heartbeat = interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown_rx) => {
                    drain(&mut rx, &mut framed).await;
                    let _ = framed.close().await;
                    break 'outer;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break 'outer };
                    if let Err(e) = framed.send(msg.clone()).await {
                        warn!("send failed: {e}");
                        if msg.is_event() {
                            carryover = Some(msg);
                        }
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = framed.send(WireMessage::heartbeat(epoch_now())).await {
                        warn!("heartbeat failed: {e}");
                        break;
                    }
                }
            }
        }

        info!("disconnected from command server");
        connected_tx.send_replace(false);
    }

    connected_tx.send_replace(false);
    debug!("tcp client task finished");
}

/// Best-effort flush of already-queued messages at shutdown.
async fn drain(rx: &mut mpsc::Receiver<WireMessage>, framed: &mut FramedWrite<TcpStream, EventCodec>) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while let Ok(msg) = rx.try_recv() {
        match timeout(deadline.saturating_duration_since(Instant::now()), framed.send(msg)).await {
            Ok(Ok(())) => {}
            _ => return,
        }
    }
}

// tests below here ---------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    fn test_config(port: u16) -> TcpClientConfig {
        TcpClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            min_send_interval: Duration::from_millis(50),
            reconnect_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    async fn recv_msg(framed: &mut FramedRead<TcpStream, EventCodec>) -> WireMessage {
        timeout(Duration::from_secs(5), framed.next())
            .await
            .expect("timed out waiting for message")
            .expect("peer closed")
            .expect("decode error")
    }

    #[tokio::test]
    async fn sends_connection_notice_then_events_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (sender, handle) = spawn(test_config(port));

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = FramedRead::new(stream, EventCodec::default());
        assert!(matches!(
            recv_msg(&mut framed).await,
            WireMessage::Connection { .. }
        ));

        assert!(sender.send_level_change(RiskLevel::High));
        assert!(sender.send_level_change(RiskLevel::Medium));
        assert_eq!(recv_msg(&mut framed).await.level(), Some(RiskLevel::High));
        assert_eq!(recv_msg(&mut framed).await.level(), Some(RiskLevel::Medium));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_levels_suppressed_within_interval() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (sender, handle) = spawn(test_config(port));

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = FramedRead::new(stream, EventCodec::default());
        recv_msg(&mut framed).await; // connection notice

        assert!(sender.send_level_change(RiskLevel::High));
        // same level immediately again: suppressed before enqueue
        assert!(!sender.send_level_change(RiskLevel::High));
        // a different level passes through right away
        assert!(sender.send_level_change(RiskLevel::Low));
        // and the same level after the interval passes too
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sender.send_level_change(RiskLevel::Low));

        assert_eq!(recv_msg(&mut framed).await.level(), Some(RiskLevel::High));
        assert_eq!(recv_msg(&mut framed).await.level(), Some(RiskLevel::Low));
        assert_eq!(recv_msg(&mut framed).await.level(), Some(RiskLevel::Low));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reconnects_and_delivers_events_queued_while_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (sender, handle) = spawn(test_config(port));

        // first connection, then the server drops it
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = FramedRead::new(stream, EventCodec::default());
        recv_msg(&mut framed).await;
        drop(framed);

        // give the client a moment to notice on its next write
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sender.send_level_change(RiskLevel::High));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sender.send_level_change(RiskLevel::Medium));

        // the client reconnects and replays what it still holds; the most
        // recent level must arrive
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = FramedRead::new(stream, EventCodec::default());
        assert!(matches!(
            recv_msg(&mut framed).await,
            WireMessage::Connection { .. }
        ));
        let mut last = None;
        loop {
            match timeout(Duration::from_millis(500), framed.next()).await {
                Ok(Some(Ok(msg))) => last = msg.level().or(last),
                _ => break,
            }
        }
        assert_eq!(last, Some(RiskLevel::Medium));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_while_disconnected_finishes_quickly() {
        // no listener at all: the client cycles connect failures
        let (sender, handle) = spawn(test_config(1));
        sender.send_level_change(RiskLevel::High);
        timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown must not hang");
    }
}
