use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Connection;

/// Lifecycle transitions of a single [`Connection`]. Each fires at most once.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(Arc<Connection>),
    Disconnected(Arc<Connection>),
}

/// Lifecycle transitions of a [`crate::Server`] and of the clients it tracks.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Started(SocketAddr),
    Stopped,
    ClientConnected(Arc<Connection>),
    ClientDisconnected(Arc<Connection>),
}

/// Fan-out of events to any number of subscribers.
///
/// Every subscriber gets its own unbounded channel, so a slow reader never makes another
/// one miss an event. Subscribers whose receiver was dropped are pruned on the next emit.
/// Once closed, the bus releases every sender and hands out only closed receivers.
#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: Mutex<Option<Vec<async_channel::Sender<E>>>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> async_channel::Receiver<E> {
        let (tx, rx) = async_channel::unbounded();
        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: E) {
        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.retain(|subscriber| subscriber.try_send(event.clone()).is_ok());
        }
    }

    /// Drop every sender. Events already queued stay readable, later emits go nowhere.
    pub fn close(&self) {
        self.subscribers.lock().take();
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().as_ref().map_or(0, Vec::len)
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
