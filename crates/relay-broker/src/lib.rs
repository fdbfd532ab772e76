// In-process pub/sub core: the topic subscription table, the session table,
// and the publish fan-out path. Transport-agnostic; sessions are reached
// through their outbound queues, never through their sockets.
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{mpsc, watch};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("outbound queue depth must be at least 1")]
    QueueDepthTooSmall,
}

const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 1024;

/// Stable identity of one client connection for the session's full lifetime.
///
/// Distinct from the peer address: two connections from the same address/port
/// pair over time get different ids, so subscription-table equality is never
/// confused by address reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Shared handle to a live session: its identity, peer address, outbound
/// queue, and cancellation signal.
///
/// Clones are cheap and are what the subscription table stores. Delivering to
/// a handle whose session is terminating is safe; the frame is either written
/// or abandoned with the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    cancel: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Enqueue one pre-formatted frame without blocking the caller.
    ///
    /// Returns `false` when the frame was not queued: the session is already
    /// gone, or its queue is full. A full queue cancels the session — a
    /// consumer that cannot keep up is dropped rather than allowed to stall
    /// publishers.
    pub fn deliver(&self, frame: Bytes) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("relay_slow_consumer_dropped_total").increment(1);
                tracing::info!(session = %self.id, peer = %self.peer, "outbound queue full, dropping session");
                self.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Signal the session's I/O loops to stop.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Receiver that flips to `true` once the session must terminate.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Record of one publish: the globally assigned sequence number, the broker
/// wall-clock at assignment, and how many subscriber queues accepted the
/// frame. Sequence and timestamp never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication {
    pub sequence: u64,
    pub timestamp: SystemTime,
    pub delivered: usize,
}

// The sequence counter lives beside the subscription table so a publish
// snapshot is atomic with sequence assignment.
#[derive(Default, Debug)]
struct TopicTable {
    subscriptions: HashMap<Bytes, HashMap<SessionId, SessionHandle>>,
    next_sequence: u64,
}

/// In-process broker core: subscription registry plus session table.
///
/// ```
/// use relay_broker::Broker;
///
/// let broker = Broker::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let peer = "127.0.0.1:40001".parse().expect("addr");
///     let (session, mut outbound) = broker.register_session(peer);
///     broker.subscribe("logs".into(), &session);
///     let publication = broker.publish(b"logs", b"ready");
///     assert_eq!(publication.delivered, 1);
///     let frame = outbound.recv().await.expect("frame");
///     assert_eq!(frame.as_ref(), b"MESSAGE:logs:ready\n");
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    topics: Mutex<TopicTable>,
    // Live sessions keyed by stable id; entries leave on disconnect/shutdown.
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_session_id: AtomicU64,
    outbound_queue_depth: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    // Start with empty tables and the default per-session queue depth.
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(TopicTable::default()),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
        }
    }

    pub fn with_outbound_queue_depth(mut self, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(BrokerError::QueueDepthTooSmall);
        }
        self.outbound_queue_depth = depth;
        Ok(self)
    }

    /// Admit a new connection: allocate a session id, create its outbound
    /// queue, and insert it into the session table. The returned receiver is
    /// handed to the session's writer loop and is the only consumer of the
    /// queue.
    pub fn register_session(&self, peer: SocketAddr) -> (SessionHandle, mpsc::Receiver<Bytes>) {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, outbound_rx) = mpsc::channel(self.outbound_queue_depth);
        let (cancel, _) = watch::channel(false);
        let handle = SessionHandle {
            id,
            peer,
            outbound,
            cancel,
        };
        self.sessions
            .lock()
            .expect("session table lock")
            .insert(id, handle.clone());
        metrics::gauge!("relay_sessions_active").increment(1.0);
        tracing::debug!(session = %id, peer = %peer, "session registered");
        (handle, outbound_rx)
    }

    /// Add `session` to `topic`'s subscriber set, creating the topic entry on
    /// first use. Subscribing twice to the same topic is idempotent.
    pub fn subscribe(&self, topic: Bytes, session: &SessionHandle) {
        let mut table = self.topics.lock().expect("registry lock");
        table
            .subscriptions
            .entry(topic)
            .or_default()
            .insert(session.id(), session.clone());
    }

    /// Remove `session` from `topic`'s subscriber set. The topic entry is
    /// dropped when its set empties; no empty buckets persist. A no-op when
    /// the topic or the subscription is absent.
    pub fn unsubscribe(&self, topic: &[u8], session: SessionId) -> bool {
        let mut table = self.topics.lock().expect("registry lock");
        let Some(subscribers) = table.subscriptions.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(&session).is_some();
        if subscribers.is_empty() {
            table.subscriptions.remove(topic);
        }
        removed
    }

    /// Remove `session` from every topic, collapsing emptied topics. This is
    /// the disconnect path; it must leave no reference behind.
    pub fn unsubscribe_all(&self, session: SessionId) {
        let mut table = self.topics.lock().expect("registry lock");
        table.subscriptions.retain(|_, subscribers| {
            subscribers.remove(&session);
            !subscribers.is_empty()
        });
    }

    /// Assign the next sequence number, snapshot `topic`'s subscribers, and
    /// queue the delivery frame to each of them.
    ///
    /// The snapshot is taken under the registry lock, atomically with the
    /// sequence assignment; the `deliver` calls happen after the lock is
    /// released. A subscriber present at sequence assignment receives the
    /// frame even if it unsubscribes concurrently; one that subscribes
    /// afterwards does not. Publishing to a topic nobody subscribes to is not
    /// an error and creates no topic entry.
    pub fn publish(&self, topic: &[u8], payload: &[u8]) -> Publication {
        let frame = relay_wire::delivery_frame(topic, payload);
        let timestamp = SystemTime::now();
        let (sequence, snapshot) = {
            let mut table = self.topics.lock().expect("registry lock");
            let sequence = table.next_sequence;
            table.next_sequence += 1;
            let snapshot: Vec<SessionHandle> = table
                .subscriptions
                .get(topic)
                .map(|subscribers| subscribers.values().cloned().collect())
                .unwrap_or_default();
            (sequence, snapshot)
        };
        let mut delivered = 0usize;
        for subscriber in &snapshot {
            if subscriber.deliver(frame.clone()) {
                delivered += 1;
            }
        }
        metrics::counter!("relay_publish_total").increment(1);
        metrics::counter!("relay_delivered_total").increment(delivered as u64);
        tracing::debug!(
            topic = %String::from_utf8_lossy(topic),
            sequence,
            subscribers = snapshot.len(),
            delivered,
            "publish fanned out"
        );
        Publication {
            sequence,
            timestamp,
            delivered,
        }
    }

    /// Disconnect hook: drop every subscription held by `session`, then
    /// forget the session itself. Idempotent; later publishes can no longer
    /// reach the session.
    pub fn remove_session(&self, session: SessionId) -> bool {
        self.unsubscribe_all(session);
        let removed = self
            .sessions
            .lock()
            .expect("session table lock")
            .remove(&session)
            .is_some();
        if removed {
            metrics::gauge!("relay_sessions_active").decrement(1.0);
        }
        removed
    }

    /// Cancel every live session and clear both tables. Queued frames that
    /// were never written are abandoned; shutdown does not wait for clients.
    pub fn shutdown(&self) {
        let drained: Vec<SessionHandle> = self
            .sessions
            .lock()
            .expect("session table lock")
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for session in &drained {
            session.cancel();
        }
        self.topics
            .lock()
            .expect("registry lock")
            .subscriptions
            .clear();
        metrics::gauge!("relay_sessions_active").set(0.0);
        tracing::info!(sessions = drained.len(), "broker shut down");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session table lock").len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("registry lock").subscriptions.len()
    }

    pub fn subscriber_count(&self, topic: &[u8]) -> usize {
        self.topics
            .lock()
            .expect("registry lock")
            .subscriptions
            .get(topic)
            .map_or(0, HashMap::len)
    }
}
