//! chanlink - client-side realtime channel library
//!
//! Opens a persistent WebSocket per logical channel key, survives transient
//! network failures through automatic reconnection with exponential backoff
//! and jitter, decodes heterogeneous inbound frames into typed events, and
//! fans them out to any number of consumers over a single shared socket:
//!
//! - **Single-flight sockets**: a [`ChannelRegistry`] guarantees one physical
//!   connection per channel key, however many consumers subscribe.
//! - **Explicit state machine**: `connecting | open | closing | closed`, with
//!   guarded transitions and a user-close flag checked before every
//!   reconnect decision.
//! - **Typed decode boundary**: frames become [`DecodedEvent`] variants
//!   (`Json | Text | Unknown`); undecodable input degrades instead of being
//!   dropped, and a custom [`FrameDecoder`] can override the whole path.
//! - **Bounded views**: a [`ListRegistry`] folds the event stream into
//!   ordered, deduplicated lists keyed independently of the channel key, so
//!   list state survives reconnect cycles.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use chanlink::{ChannelDescriptor, ChannelRegistry, ListOptions, ListRegistry};
//!
//! let channels = ChannelRegistry::new();
//! let chat = channels.subscribe(
//!     ChannelDescriptor::new("ws:/chat", "wss://example.com/chat")
//!         .with_param("user", "b")
//!         .with_auto_reconnect(true),
//! );
//!
//! let lists = ListRegistry::new();
//! let history = lists.subscribe(&chat, ListOptions::new("chat:history").with_capacity(200));
//!
//! chat.send(&serde_json::json!({ "type": "hello" }));
//! let mut events = chat.events();
//! // events.recv().await yields ChannelEvent values shared by all consumers.
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod backoff;
mod channel;
mod conn;
mod error;
mod frame;
mod list;
mod registry;

pub use backoff::{Backoff, JITTER_MS};
pub use channel::ChannelDescriptor;
pub use conn::{ChannelEvent, Connection, ConnectionState};
pub use error::{ChannelError, ChannelResult};
pub use frame::{DecodedEvent, FrameDecoder, RawFrame};
pub use list::{DEFAULT_LIST_CAPACITY, EventList, ListOptions, ListRegistry};
pub use registry::{ChannelRegistry, Subscription};
