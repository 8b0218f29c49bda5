//! The hub owns the set of live connections and fans broadcasts out to them.
//!
//! Every operation is an event on one queue drained by a single task, so the
//! live set needs no lock and events apply in exactly the order they were sent.
//! A broadcast reaches the connections registered at the moment it is
//! processed, once each. A connection whose outbound queue is full is evicted
//! instead of stalling delivery to everyone else.

use std::collections::HashMap;

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::Frame;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound path is closed")]
    Closed,
}

/// Producer side of a connection's bounded outbound queue.
///
/// Closing an outbox rejects further pushes and tells both halves of the
/// connection to wind down; frames already queued are still written.
#[derive(Debug, Clone)]
pub struct Outbox {
    id: ConnectionId,
    queue: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl Outbox {
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let outbox = Self {
            id,
            queue,
            closed: CancellationToken::new(),
        };
        (outbox, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Never waits: a full queue is reported, not awaited.
    pub fn try_push(&self, frame: Frame) -> Result<(), PushError> {
        if self.closed.is_cancelled() {
            return Err(PushError::Closed);
        }
        self.queue.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the outbox has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

enum HubEvent {
    Register(Outbox),
    Unregister(ConnectionId),
    Broadcast(Frame),
    LiveCount(oneshot::Sender<usize>),
    Shutdown,
}

impl std::fmt::Debug for HubEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubEvent::Register(outbox) => write!(f, "Register({})", outbox.id),
            HubEvent::Unregister(id) => write!(f, "Unregister({id})"),
            HubEvent::Broadcast(frame) => write!(f, "Broadcast({} bytes)", frame.len()),
            HubEvent::LiveCount(_) => f.write_str("LiveCount"),
            HubEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable handle for submitting events to the hub task.
#[derive(Debug, Clone)]
pub struct Hub {
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Hub {
    /// Starts the hub task. Must be called from within a Tokio runtime.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_hub(receiver));
        (Self { events }, task)
    }

    /// Adds a connection to the live set. Registering the same id twice is a no-op.
    pub fn register(&self, outbox: Outbox) {
        self.send(HubEvent::Register(outbox));
    }

    /// Removes a connection and closes its outbox. Repeated calls are no-ops.
    pub fn unregister(&self, id: ConnectionId) {
        self.send(HubEvent::Unregister(id));
    }

    pub fn broadcast(&self, frame: Frame) {
        self.send(HubEvent::Broadcast(frame));
    }

    /// Closes every live outbox and stops the hub task. Registrations that arrive
    /// afterwards are closed immediately; other late events are discarded.
    pub fn shutdown(&self) {
        self.send(HubEvent::Shutdown);
    }

    /// Number of live connections once every earlier event has been applied.
    /// `None` after the hub has stopped.
    pub async fn live_count(&self) -> Option<usize> {
        let (reply, response) = oneshot::channel();
        self.send(HubEvent::LiveCount(reply));
        response.await.ok()
    }

    fn send(&self, event: HubEvent) {
        if let Err(err) = self.events.send(event) {
            debug!(event = ?err.0, "hub stopped; event discarded");
            if let HubEvent::Register(outbox) = err.0 {
                outbox.close();
            }
        }
    }
}

async fn run_hub(mut events: mpsc::UnboundedReceiver<HubEvent>) {
    let mut clients: HashMap<ConnectionId, Outbox> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            HubEvent::Register(outbox) => {
                let id = outbox.id();
                if clients.contains_key(&id) {
                    continue;
                }
                clients.insert(id, outbox);
                info!(conn = id, total = clients.len(), "+client");
            }
            HubEvent::Unregister(id) => {
                if let Some(outbox) = clients.remove(&id) {
                    outbox.close();
                    info!(conn = id, total = clients.len(), "-client");
                }
            }
            HubEvent::Broadcast(frame) => fan_out(&mut clients, &frame),
            HubEvent::LiveCount(reply) => {
                let _ = reply.send(clients.len());
            }
            HubEvent::Shutdown => break,
        }
    }

    info!(remaining = clients.len(), "hub stopping");
    for outbox in clients.into_values() {
        outbox.close();
    }

    // Connections accepted just before shutdown may still be queued behind it.
    events.close();
    while let Some(event) = events.recv().await {
        if let HubEvent::Register(outbox) = event {
            debug!(conn = outbox.id(), "late registration after shutdown");
            outbox.close();
        }
    }
}

fn fan_out(clients: &mut HashMap<ConnectionId, Outbox>, frame: &Frame) {
    clients.retain(|&id, outbox| match outbox.try_push(Frame::clone(frame)) {
        Ok(()) => true,
        Err(PushError::Full) => {
            warn!(conn = id, "outbound queue full; dropping slow client");
            outbox.close();
            false
        }
        Err(PushError::Closed) => {
            debug!(conn = id, "outbound path already closed; removing client");
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Frame::from(text.as_bytes())
    }

    #[tokio::test]
    async fn broadcast_reaches_each_live_connection_once() {
        let (hub, _task) = Hub::spawn();
        let (alice, mut alice_rx) = Outbox::channel(1, 8);
        let (bob, mut bob_rx) = Outbox::channel(2, 8);

        hub.register(alice.clone());
        hub.register(bob);
        hub.register(alice);
        hub.broadcast(frame("one"));
        hub.broadcast(frame("two"));
        assert_eq!(hub.live_count().await, Some(2));

        for rx in [&mut alice_rx, &mut bob_rx] {
            assert_eq!(rx.try_recv().expect("first").as_ref(), b"one");
            assert_eq!(rx.try_recv().expect("second").as_ref(), b"two");
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn broadcast_skips_connections_registered_later() {
        let (hub, _task) = Hub::spawn();
        let (early, mut early_rx) = Outbox::channel(1, 8);
        let (late, mut late_rx) = Outbox::channel(2, 8);

        hub.register(early);
        hub.broadcast(frame("before"));
        hub.register(late);
        assert_eq!(hub.live_count().await, Some(2));

        assert_eq!(early_rx.try_recv().expect("early").as_ref(), b"before");
        assert!(late_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_closes_outbox_and_is_idempotent() {
        let (hub, _task) = Hub::spawn();
        let (outbox, _rx) = Outbox::channel(7, 8);

        hub.register(outbox.clone());
        hub.unregister(7);
        hub.unregister(7);
        assert_eq!(hub.live_count().await, Some(0));
        assert!(outbox.is_closed());
        assert_eq!(outbox.try_push(frame("late")), Err(PushError::Closed));
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_blocking_others() {
        let (hub, _task) = Hub::spawn();
        let (stuck, _stuck_rx) = Outbox::channel(1, 1);
        let (healthy, mut healthy_rx) = Outbox::channel(2, 8);

        hub.register(stuck.clone());
        hub.register(healthy);
        for text in ["a", "b", "c"] {
            hub.broadcast(frame(text));
        }
        assert_eq!(hub.live_count().await, Some(1));
        assert!(stuck.is_closed());

        for expected in [b"a", b"b", b"c"] {
            assert_eq!(healthy_rx.try_recv().expect("delivered").as_ref(), expected);
        }
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_stops_the_task() {
        let (hub, task) = Hub::spawn();
        let (first, _first_rx) = Outbox::channel(1, 8);
        let (second, _second_rx) = Outbox::channel(2, 8);

        hub.register(first.clone());
        hub.register(second.clone());
        hub.shutdown();
        task.await.expect("hub task");

        assert!(first.is_closed());
        assert!(second.is_closed());
        assert_eq!(hub.live_count().await, None);
    }

    #[tokio::test]
    async fn registrations_after_shutdown_are_closed() {
        let (hub, task) = Hub::spawn();
        let (queued, _queued_rx) = Outbox::channel(1, 8);
        let (late, _late_rx) = Outbox::channel(2, 8);

        hub.shutdown();
        hub.register(queued.clone());
        task.await.expect("hub task");
        hub.register(late.clone());

        assert!(queued.is_closed());
        assert!(late.is_closed());
    }
}
