use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use murmur_db::MessageArchive;
use murmur_types::events::{ChatMessage, InboundFrame};

use crate::error::HubError;

pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Messages waiting for the dispatcher.
    pub inbound_capacity: usize,
    /// Messages waiting for one connection's writer.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

struct ConnectionHandle {
    outbound: mpsc::Sender<ChatMessage>,
    cancel: CancellationToken,
}

/// What a connection gets back from [`ConnectionHub::register`].
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<ChatMessage>,
    /// Cancelled when the hub drops the connection.
    pub cancel: CancellationToken,
}

/// Owns the set of live realtime connections and the queue of messages
/// waiting to be broadcast to them.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    inbound_tx: mpsc::Sender<ChatMessage>,
    archive: Arc<dyn MessageArchive>,
    next_id: AtomicU64,
    outbound_capacity: usize,
}

/// The single fan-out task. Build with [`ConnectionHub::new`], then `run` it.
pub struct Dispatcher {
    hub: ConnectionHub,
    inbound_rx: mpsc::Receiver<ChatMessage>,
}

impl ConnectionHub {
    pub fn new(archive: Arc<dyn MessageArchive>, config: HubConfig) -> (Self, Dispatcher) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let hub = Self {
            inner: Arc::new(HubInner {
                connections: Mutex::new(HashMap::new()),
                inbound_tx,
                archive,
                next_id: AtomicU64::new(1),
                outbound_capacity: config.outbound_capacity.max(1),
            }),
        };
        let dispatcher = Dispatcher {
            hub: hub.clone(),
            inbound_rx,
        };
        (hub, dispatcher)
    }

    /// Build the hub and start its dispatcher on the current runtime.
    pub fn spawn(archive: Arc<dyn MessageArchive>, config: HubConfig) -> (Self, JoinHandle<()>) {
        let (hub, dispatcher) = Self::new(archive, config);
        (hub, tokio::spawn(dispatcher.run()))
    }

    /// Add a connection to the live set.
    pub async fn register(&self) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound) = mpsc::channel(self.inner.outbound_capacity);
        let cancel = CancellationToken::new();

        let mut connections = self.inner.connections.lock().await;
        connections.insert(
            id,
            ConnectionHandle {
                outbound: outbound_tx,
                cancel: cancel.clone(),
            },
        );
        info!("Connection {} registered ({} live)", id, connections.len());

        Registration {
            id,
            outbound,
            cancel,
        }
    }

    /// Remove a connection and cancel it. Removing twice is a no-op.
    pub async fn deregister(&self, id: ConnectionId) {
        let removed = self.inner.connections.lock().await.remove(&id);
        if let Some(handle) = removed {
            handle.cancel.cancel();
            info!("Connection {} deregistered", id);
        }
    }

    /// Cancel and forget every live connection (server shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.inner.connections.lock().await.drain().collect();
        for (_, handle) in &drained {
            handle.cancel.cancel();
        }
        info!("Closed {} connections", drained.len());
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Stamp a decoded frame with the server time, archive it, then queue it
    /// for broadcast. Nothing is queued when the archive write fails.
    pub async fn ingest(&self, frame: InboundFrame) -> Result<ChatMessage, HubError> {
        let message = frame.stamp(Utc::now());

        let archive = self.inner.archive.clone();
        let record = message.clone();
        tokio::task::spawn_blocking(move || archive.append(&record)).await??;

        self.inner
            .inbound_tx
            .send(message.clone())
            .await
            .map_err(|_| HubError::Closed)?;

        debug!("Queued message from {}", message.from);
        Ok(message)
    }

    /// Deliver one message to every live connection without waiting on any of
    /// them. Connections whose queue is full or closed are dropped.
    async fn fan_out(&self, message: &ChatMessage) {
        let mut connections = self.inner.connections.lock().await;

        let failed: Vec<ConnectionId> = connections
            .iter()
            .filter_map(|(id, handle)| match handle.outbound.try_send(message.clone()) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Connection {} is not keeping up, dropping it", id);
                    Some(*id)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Connection {} already closed", id);
                    Some(*id)
                }
            })
            .collect();

        for id in failed {
            if let Some(handle) = connections.remove(&id) {
                handle.cancel.cancel();
            }
        }
    }
}

impl Dispatcher {
    /// Relay queued messages until every hub handle is gone.
    pub async fn run(mut self) {
        info!("Dispatcher started");
        while let Some(message) = self.inbound_rx.recv().await {
            self.hub.fan_out(&message).await;
        }
        info!("Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use murmur_db::{DbError, DocumentArchive};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn frame(from: &str, message: &str) -> InboundFrame {
        InboundFrame {
            from: from.into(),
            message: message.into(),
            date: None,
        }
    }

    fn hub_with_archive() -> (ConnectionHub, Arc<DocumentArchive>, JoinHandle<()>) {
        let archive = Arc::new(DocumentArchive::open_in_memory().unwrap());
        let (hub, task) = ConnectionHub::spawn(archive.clone(), HubConfig::default());
        (hub, archive, task)
    }

    async fn next(reg: &mut Registration) -> ChatMessage {
        timeout(WAIT, reg.outbound.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn every_connection_receives_one_copy() {
        let (hub, archive, _task) = hub_with_archive();
        let mut regs = vec![hub.register().await, hub.register().await, hub.register().await];

        hub.ingest(frame("alice", "hi")).await.unwrap();

        for reg in &mut regs {
            let got = next(reg).await;
            assert_eq!(got.from, "alice");
            assert_eq!(got.message, "hi");
            assert!(reg.outbound.try_recv().is_err());
        }
        assert_eq!(archive.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatcher_keeps_relaying() {
        let (hub, _archive, _task) = hub_with_archive();
        let mut reg = hub.register().await;

        for i in 0..5 {
            hub.ingest(frame("bob", &format!("m{i}"))).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(next(&mut reg).await.message, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn closed_connection_is_dropped_others_still_receive() {
        let archive = Arc::new(DocumentArchive::open_in_memory().unwrap());
        let (hub, _dispatcher) = ConnectionHub::new(archive, HubConfig::default());
        let mut alive = hub.register().await;
        let gone = hub.register().await;
        let gone_cancel = gone.cancel.clone();
        drop(gone.outbound);

        hub.fan_out(&frame("carol", "still here").stamp(Utc::now())).await;

        assert_eq!(alive.outbound.try_recv().unwrap().message, "still here");
        assert_eq!(hub.connection_count().await, 1);
        assert!(gone_cancel.is_cancelled());
        assert!(!alive.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn slow_connection_is_dropped_when_queue_fills() {
        let archive = Arc::new(DocumentArchive::open_in_memory().unwrap());
        let config = HubConfig {
            inbound_capacity: 8,
            outbound_capacity: 1,
        };
        let (hub, _dispatcher) = ConnectionHub::new(archive, config);
        let slow = hub.register().await;
        let mut fast = hub.register().await;

        let first = frame("dave", "one").stamp(Utc::now());
        let second = frame("dave", "two").stamp(Utc::now());

        hub.fan_out(&first).await;
        assert_eq!(fast.outbound.try_recv().unwrap(), first);
        hub.fan_out(&second).await;
        assert_eq!(fast.outbound.try_recv().unwrap(), second);

        assert!(slow.cancel.is_cancelled());
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn deregister_cancels_and_is_idempotent() {
        let (hub, _archive, _task) = hub_with_archive();
        let reg = hub.register().await;
        assert_eq!(hub.connection_count().await, 1);

        hub.deregister(reg.id).await;
        hub.deregister(reg.id).await;
        assert!(reg.cancel.is_cancelled());
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn client_date_is_replaced() {
        let (hub, archive, _task) = hub_with_archive();
        let before = Utc::now();
        let mut stale = frame("erin", "from the past");
        stale.date = Some(before - chrono::Duration::days(365));

        let stamped = hub.ingest(stale).await.unwrap();
        assert!(stamped.date >= before);
        assert_eq!(archive.list_all().unwrap()[0].date, stamped.date);
    }

    #[tokio::test]
    async fn close_all_cancels_everyone() {
        let (hub, _archive, _task) = hub_with_archive();
        let a = hub.register().await;
        let b = hub.register().await;

        hub.close_all().await;
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert_eq!(hub.connection_count().await, 0);
    }

    struct RejectingArchive;

    impl MessageArchive for RejectingArchive {
        fn append(&self, _message: &ChatMessage) -> murmur_db::Result<()> {
            Err(DbError::Lock)
        }

        fn list_all(&self) -> murmur_db::Result<Vec<ChatMessage>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn archive_failure_is_not_broadcast() {
        let (hub, _task) = ConnectionHub::spawn(Arc::new(RejectingArchive), HubConfig::default());
        let mut reg = hub.register().await;

        let err = hub.ingest(frame("frank", "lost")).await.unwrap_err();
        assert!(matches!(err, HubError::Archive(_)));
        assert!(timeout(Duration::from_millis(100), reg.outbound.recv()).await.is_err());
    }

    #[tokio::test]
    async fn archive_order_matches_ingest_order_across_connections() {
        let (hub, archive, _task) = hub_with_archive();
        let senders = ["ann", "ben", "cat", "dan", "eve"];
        for name in senders {
            let _reg = hub.register().await;
            hub.ingest(frame(name, "hello")).await.unwrap();
        }

        let archived: Vec<String> = archive.list_all().unwrap().into_iter().map(|m| m.from).collect();
        assert_eq!(archived, senders);
    }
}
