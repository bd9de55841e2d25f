//! Forwarding queue entries to peer brokers.
//!
//! A peer that has consumers for one of our queues is represented on that
//! queue by a [`RemoteSubscription`]. Entries selected for it are sent over a
//! [`ClusterTransport`] and stay acquired until the peer acknowledges them.
//! Sends are fire-and-forget: a failed send is reported, compensated and the
//! entry released, never retried.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::consumer::{next_subscription_id, DeliveryError, Subscription, SubscriptionId};
use crate::message::MessageMetaData;
use crate::queue::{Queue, QueueEntry};

/// Address of a peer broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberHandle {
    host: String,
    port: u16,
}

impl MemberHandle {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for MemberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A message transfer to a peer.
#[derive(Debug, Clone)]
pub struct Sendable {
    pub queue: String,
    pub entry_id: u64,
    pub message_number: u64,
    pub metadata: MessageMetaData,
    pub content: Bytes,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("peer {0} is not reachable")]
    Unreachable(MemberHandle),

    #[error("cluster transport closed")]
    Closed,
}

pub trait ClusterTransport: Send + Sync + fmt::Debug {
    fn send(&self, peer: &MemberHandle, sendable: Sendable) -> Result<(), ClusterError>;
}

/// In-process transport: one unbounded channel per registered peer.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    peers: DashMap<MemberHandle, mpsc::UnboundedSender<Sendable>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: MemberHandle) -> mpsc::UnboundedReceiver<Sendable> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(peer, tx);
        rx
    }

    pub fn unregister(&self, peer: &MemberHandle) -> bool {
        self.peers.remove(peer).is_some()
    }
}

impl ClusterTransport for ChannelTransport {
    fn send(&self, peer: &MemberHandle, sendable: Sendable) -> Result<(), ClusterError> {
        let sender = self
            .peers
            .get(peer)
            .ok_or_else(|| ClusterError::Unreachable(peer.clone()))?;
        sender.send(sendable).map_err(|_| ClusterError::Closed)
    }
}

type Outstanding = HashMap<u64, (Weak<Queue>, Arc<QueueEntry>)>;

/// A peer broker consuming from one of our queues.
pub struct RemoteSubscription {
    id: SubscriptionId,
    peer: MemberHandle,
    /// Forwarded but not yet acknowledged by the peer.
    count: AtomicU64,
    orphaned: AtomicBool,
    suspended: AtomicBool,
    closed: AtomicBool,
    outstanding: Mutex<Outstanding>,
    transport: Arc<dyn ClusterTransport>,
}

impl RemoteSubscription {
    pub fn new(peer: MemberHandle, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            id: next_subscription_id(),
            peer,
            count: AtomicU64::new(0),
            orphaned: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            outstanding: Mutex::new(HashMap::new()),
            transport,
        }
    }

    pub fn member(&self) -> &MemberHandle {
        &self.peer
    }

    pub fn increment(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_add(1));
        self.orphaned.store(false, Ordering::SeqCst);
    }

    /// Saturating decrement; returns `true` when the count is now zero, which
    /// also flags the subscription as orphaned.
    pub fn decrement(&self) -> bool {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        let now_zero = previous <= 1;
        if now_zero {
            self.orphaned.store(true, Ordering::SeqCst);
        }
        now_zero
    }

    /// Reports `true` exactly when nothing is outstanding at the peer.
    pub fn has_active_subscribers(&self) -> bool {
        self.weight() == 0
    }

    /// The peer acknowledged `entry_id`: the entry is dequeued.
    pub fn acknowledged(&self, entry_id: u64) -> bool {
        let Some((queue, entry)) = self.outstanding.lock().remove(&entry_id) else {
            return false;
        };
        self.decrement();
        match queue.upgrade() {
            Some(queue) => match queue.acknowledge(&entry) {
                Ok(done) => done,
                Err(e) => {
                    warn!(peer = %self.peer, entry_id, error = %e, "Failed to dequeue acknowledged entry");
                    false
                }
            },
            None => false,
        }
    }

    /// Puts every outstanding entry back on its queue.
    pub fn release_outstanding(&self) -> usize {
        let outstanding: Vec<_> = self.outstanding.lock().drain().map(|(_, v)| v).collect();
        let mut released = 0;
        for (queue, entry) in outstanding {
            self.decrement();
            if let Some(queue) = queue.upgrade() {
                if queue.release(&entry) {
                    released += 1;
                }
            }
        }
        released
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Subscription for RemoteSubscription {
    fn id(&self) -> SubscriptionId {
        self.id
    }

    fn weight(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, queue: &Arc<Queue>, entry: Arc<QueueEntry>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        let entry_id = entry.entry_id();
        let sendable = Sendable {
            queue: queue.name().to_string(),
            entry_id,
            message_number: entry.message().message_number(),
            metadata: entry.message().metadata().clone(),
            content: entry.message().content().clone(),
            redelivered: entry.is_redelivered(),
        };

        self.increment();
        self.outstanding
            .lock()
            .insert(entry_id, (Arc::downgrade(queue), entry));
        if let Err(e) = self.transport.send(&self.peer, sendable) {
            self.outstanding.lock().remove(&entry_id);
            self.decrement();
            warn!(peer = %self.peer, queue = %queue.name(), error = %e, "Failed to forward entry");
            return Err(e.into());
        }
        debug!(peer = %self.peer, queue = %queue.name(), entry_id, "Forwarded entry");
        Ok(())
    }

    fn queue_deleted(&self, queue: &Queue) {
        self.outstanding.lock().clear();
        queue.remove_remote_subscriptions(&self.peer);
    }

    fn peer(&self) -> Option<&MemberHandle> {
        Some(&self.peer)
    }

    fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RemoteSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSubscription")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("count", &self.weight())
            .finish()
    }
}
