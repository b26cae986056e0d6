//! Shared registry: single-flight socket ownership per channel key.
//!
//! All consumers requesting the same channel key observe the identical
//! connection, event stream, and send capability. The registry holds a
//! per-key reference count; releasing the last reference closes the socket
//! with a normal code and evicts the entry.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::ChannelDescriptor;
use crate::conn::Connection;
use crate::frame::FrameDecoder;

/// Registry deduplicating connection creation across consumers.
///
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

struct Entry {
    conn: Connection,
    refs: usize,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection for the descriptor's key, reusing a live one when present.
    ///
    /// Creates, stores, and connects a new connection otherwise; a dead
    /// entry (driver finished, e.g. after a user close) is replaced. Each
    /// call takes one reference that must be paired with
    /// [`ChannelRegistry::release`].
    pub fn acquire(&self, descriptor: ChannelDescriptor) -> Connection {
        self.acquire_with(descriptor, None)
    }

    /// Like [`ChannelRegistry::acquire`], with a custom frame decoder for
    /// newly created connections.
    pub fn acquire_with(
        &self,
        descriptor: ChannelDescriptor,
        decoder: Option<Arc<dyn FrameDecoder>>,
    ) -> Connection {
        let key = descriptor.key.clone();
        let mut map = self.inner.lock();
        if let Some(entry) = map.get_mut(&key) {
            if entry.conn.is_alive() {
                entry.refs += 1;
                debug!(key = %key, refs = entry.refs, "channel reused");
                return entry.conn.clone();
            }
            map.remove(&key);
        }

        let conn = Connection::with_decoder(descriptor, decoder);
        conn.connect();
        map.insert(
            key.clone(),
            Entry {
                conn: conn.clone(),
                refs: 1,
            },
        );
        debug!(key = %key, "channel created");
        conn
    }

    /// Drop one reference for the key.
    ///
    /// When the count reaches zero the connection is closed with code 1000,
    /// reason `"no subscribers"`, and removed. Releasing an unknown key is a
    /// no-op.
    pub fn release(&self, key: &str) {
        let mut map = self.inner.lock();
        let last = match map.get_mut(key) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if last {
            if let Some(entry) = map.remove(key) {
                debug!(key = %key, "last subscriber released, closing channel");
                entry.conn.close(Some(1000), Some("no subscribers"));
            }
        }
    }

    /// Acquire wrapped in an RAII guard that releases on drop.
    pub fn subscribe(&self, descriptor: ChannelDescriptor) -> Subscription {
        self.subscribe_with(descriptor, None)
    }

    /// Like [`ChannelRegistry::subscribe`], with a custom frame decoder.
    pub fn subscribe_with(
        &self,
        descriptor: ChannelDescriptor,
        decoder: Option<Arc<dyn FrameDecoder>>,
    ) -> Subscription {
        let key = descriptor.key.clone();
        let conn = self.acquire_with(descriptor, decoder);
        Subscription {
            registry: self.clone(),
            key,
            conn,
        }
    }

    /// Whether a connection is registered for the key.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Current reference count for the key.
    #[must_use]
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.lock().get(key).map_or(0, |entry| entry.refs)
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no channels are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// RAII handle to a shared channel connection.
///
/// Dereferences to [`Connection`]; dropping it releases one registry
/// reference (the last drop closes the socket).
pub struct Subscription {
    registry: ChannelRegistry,
    key: String,
    conn: Connection,
}

impl Subscription {
    /// Borrow the shared connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Deref for Subscription {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelDescriptor;

    fn descriptor(key: &str) -> ChannelDescriptor {
        ChannelDescriptor::new(key, "ws://localhost:9/chat")
    }

    #[test]
    fn release_unknown_key_is_noop() {
        let registry = ChannelRegistry::new();
        registry.release("ghost");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn acquire_same_key_counts_references() {
        let registry = ChannelRegistry::new();
        let a = registry.acquire(descriptor("ws:/chat"));
        let b = registry.acquire(descriptor("ws:/chat"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.subscriber_count("ws:/chat"), 2);
        // Both handles point at the same connection.
        assert_eq!(a.key(), b.key());

        registry.release("ws:/chat");
        assert!(registry.contains("ws:/chat"));
        registry.release("ws:/chat");
        assert!(!registry.contains("ws:/chat"));
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_connections() {
        let registry = ChannelRegistry::new();
        let _a = registry.acquire(descriptor("ws:/chat"));
        let _b = registry.acquire(descriptor("ws:/presence"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.subscriber_count("ws:/chat"), 1);
        assert_eq!(registry.subscriber_count("ws:/presence"), 1);
    }

    #[tokio::test]
    async fn subscription_guard_releases_on_drop() {
        let registry = ChannelRegistry::new();
        {
            let sub = registry.subscribe(descriptor("ws:/chat"));
            assert_eq!(sub.key(), "ws:/chat");
            assert_eq!(registry.subscriber_count("ws:/chat"), 1);
        }
        assert!(!registry.contains("ws:/chat"));
    }
}
