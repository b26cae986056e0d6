//! List aggregation: folds a decoded-event stream into bounded, ordered,
//! deduplicated lists.
//!
//! Lists are keyed independently of the channel key, so several UI surfaces
//! can maintain their own views fed by one connection, and list state
//! survives reconnect cycles of the underlying socket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::conn::{ChannelEvent, ConnToken, Connection};
use crate::frame::DecodedEvent;

/// Default bound on aggregated list length.
pub const DEFAULT_LIST_CAPACITY: usize = 200;

/// Reducer folding one event into the previous list.
pub type Reducer = dyn Fn(&[DecodedEvent], DecodedEvent) -> Vec<DecodedEvent> + Send + Sync;

/// Application-supplied equality used for redundant-delivery detection.
pub type EventEq = dyn Fn(&DecodedEvent, &DecodedEvent) -> bool + Send + Sync;

/// Configuration for one aggregated list.
#[derive(Clone)]
pub struct ListOptions {
    list_key: String,
    max: usize,
    reducer: Option<Arc<Reducer>>,
    same: Option<Arc<EventEq>>,
}

impl ListOptions {
    /// Options with the default capacity, append reducer, and structural
    /// equality.
    #[must_use]
    pub fn new(list_key: impl Into<String>) -> Self {
        Self {
            list_key: list_key.into(),
            max: DEFAULT_LIST_CAPACITY,
            reducer: None,
            same: None,
        }
    }

    /// Bound the list to `max` items (oldest evicted first).
    #[must_use]
    pub const fn with_capacity(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    /// Replace the default append reducer.
    #[must_use]
    pub fn with_reducer(
        mut self,
        reduce: impl Fn(&[DecodedEvent], DecodedEvent) -> Vec<DecodedEvent> + Send + Sync + 'static,
    ) -> Self {
        self.reducer = Some(Arc::new(reduce));
        self
    }

    /// Replace structural equality for the redundant-delivery guard, e.g. to
    /// compare an application sequence number.
    #[must_use]
    pub fn with_equality(
        mut self,
        same: impl Fn(&DecodedEvent, &DecodedEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.same = Some(Arc::new(same));
        self
    }
}

/// Bounded, ordered, deduplicated list of decoded events.
#[derive(Clone)]
pub struct EventList {
    inner: Arc<ListInner>,
}

struct ListInner {
    key: String,
    max: usize,
    reducer: Option<Arc<Reducer>>,
    same: Option<Arc<EventEq>>,
    state: Mutex<FoldState>,
    /// Connection the fold task follows, and the task itself.
    task: Mutex<Option<(ConnToken, JoinHandle<()>)>>,
}

#[derive(Default)]
struct FoldState {
    items: Vec<DecodedEvent>,
    /// Last event folded; used to skip redundant redelivery.
    last: Option<DecodedEvent>,
}

impl EventList {
    fn new(options: ListOptions) -> Self {
        Self {
            inner: Arc::new(ListInner {
                key: options.list_key,
                max: options.max,
                reducer: options.reducer,
                same: options.same,
                state: Mutex::new(FoldState::default()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to the connection's event stream and fold sequentially.
    ///
    /// Folding always composes from the latest accepted state, so a burst of
    /// frames cannot lose updates. The task ends when the connection is
    /// dropped for good.
    fn attach(&self, conn: &Connection) {
        let mut events = conn.events();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Message(event)) => inner.fold(event),
                    // Open/error/close cycles never touch list state.
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(list = %inner.key, missed, "event stream lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!(list = %inner.key, "event stream ended");
                        break;
                    }
                }
            }
        });
        *self.inner.task.lock() = Some((conn.token(), handle));
    }

    /// Point the fold task at `conn`, keeping list state.
    ///
    /// A no-op when the task already follows this exact connection. When the
    /// previous connection was dropped or replaced, the list would otherwise
    /// stay attached to a stream that never produces again.
    fn ensure_attached(&self, conn: &Connection) {
        {
            let mut task = self.inner.task.lock();
            let current = task
                .as_ref()
                .is_some_and(|(token, handle)| !handle.is_finished() && token.matches(conn));
            if current {
                return;
            }
            if let Some((_, old)) = task.take() {
                old.abort();
            }
        }
        debug!(list = %self.inner.key, "following replacement connection");
        self.attach(conn);
    }

    /// List key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Snapshot of the current items, in delivery order.
    #[must_use]
    pub fn items(&self) -> Vec<DecodedEvent> {
        self.inner.state.lock().items.clone()
    }

    /// Current length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Whether the list holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().items.is_empty()
    }

    /// Atomically empty the list.
    ///
    /// The underlying connection, its reconnect schedule, and the
    /// redundant-delivery guard are untouched.
    pub fn clear(&self) {
        self.inner.state.lock().items.clear();
    }
}

impl ListInner {
    fn fold(&self, event: DecodedEvent) {
        let mut state = self.state.lock();

        let duplicate = state.last.as_ref().is_some_and(|last| match &self.same {
            Some(same) => same(last, &event),
            None => last == &event,
        });
        if duplicate {
            return;
        }
        state.last = Some(event.clone());

        match &self.reducer {
            Some(reduce) => state.items = reduce(&state.items, event),
            None => state.items.push(event),
        }

        let overflow = state.items.len().saturating_sub(self.max);
        if overflow > 0 {
            // FIFO eviction: ordering here is delivery order, not access order.
            state.items.drain(..overflow);
        }
    }
}

/// Lazily created aggregated lists, keyed by list key.
#[derive(Clone, Default)]
pub struct ListRegistry {
    lists: Arc<Mutex<HashMap<String, EventList>>>,
}

impl ListRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// List for the options' key, created and attached to `conn` on first
    /// subscription. Later subscribers to the same key share the list (and
    /// keep its original options); if the list's connection has since been
    /// dropped or replaced, it re-attaches to `conn` with its items intact.
    pub fn subscribe(&self, conn: &Connection, options: ListOptions) -> EventList {
        let mut lists = self.lists.lock();
        if let Some(list) = lists.get(&options.list_key) {
            list.ensure_attached(conn);
            return list.clone();
        }
        let list = EventList::new(options);
        list.attach(conn);
        lists.insert(list.key().to_owned(), list.clone());
        list
    }

    /// Existing list for the key, if any.
    #[must_use]
    pub fn get(&self, list_key: &str) -> Option<EventList> {
        self.lists.lock().get(list_key).cloned()
    }
}
