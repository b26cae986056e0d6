//! Channel descriptor: immutable per-connection configuration.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::time::Duration;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use url::Url;

use crate::error::{ChannelError, ChannelResult};

/// Configuration for one logical channel.
///
/// Immutable for the lifetime of a connection; changing any field means
/// tearing the connection down and creating a new one.
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    /// Logical identifier grouping all consumers that share one socket.
    pub key: String,
    /// WebSocket URL, e.g. `wss://example.com/chat`.
    pub url: String,
    /// Query parameters appended to the URL (e.g. an auth token).
    pub params: BTreeMap<String, String>,
    /// Optional WebSocket subprotocols.
    pub protocols: Vec<String>,
    /// Reconnect automatically on unexpected close.
    pub auto_reconnect: bool,
    /// Base delay of the reconnect backoff schedule.
    pub reconnect_base_delay: Duration,
    /// Maximum delay of the reconnect backoff schedule.
    pub reconnect_max_delay: Duration,
    /// Close codes that must not trigger a reconnect; 1000 and 1001 are
    /// always excluded regardless of this set.
    pub no_reconnect_close_codes: HashSet<u16>,
}

impl ChannelDescriptor {
    /// Create a descriptor with default reconnect settings.
    #[must_use]
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            params: BTreeMap::new(),
            protocols: Vec::new(),
            auto_reconnect: false,
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_millis(15_000),
            no_reconnect_close_codes: HashSet::new(),
        }
    }

    /// Append (or overwrite) a query parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    /// Request a WebSocket subprotocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Enable or disable automatic reconnection.
    #[must_use]
    pub const fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the backoff base and cap.
    #[must_use]
    pub const fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    /// Add a close code that must not trigger a reconnect.
    #[must_use]
    pub fn with_no_reconnect_close_code(mut self, code: u16) -> Self {
        self.no_reconnect_close_codes.insert(code);
        self
    }

    /// Whether an unexpected close with the given code schedules a reconnect.
    ///
    /// A close without a code (torn TCP stream, connect failure) reconnects
    /// whenever `auto_reconnect` is set.
    #[must_use]
    pub fn reconnects_on(&self, code: Option<u16>) -> bool {
        if !self.auto_reconnect {
            return false;
        }
        match code {
            // Normal and going-away closes never reconnect.
            Some(1000 | 1001) => false,
            Some(code) => !self.no_reconnect_close_codes.contains(&code),
            None => true,
        }
    }

    /// Full connect URL with query parameters applied.
    ///
    /// # Errors
    /// Returns [`ChannelError::InvalidUrl`] when the base URL does not parse.
    pub fn connect_url(&self) -> ChannelResult<Url> {
        let mut url = Url::parse(&self.url)?;
        if !self.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Handshake request for the transport, with subprotocols applied.
    pub(crate) fn client_request(&self) -> ChannelResult<Request> {
        let url = self.connect_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        if !self.protocols.is_empty() {
            let value = HeaderValue::from_str(&self.protocols.join(", "))
                .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let desc = ChannelDescriptor::new("ws:/chat", "ws://localhost:8080/chat");
        assert!(!desc.auto_reconnect);
        assert_eq!(desc.reconnect_base_delay, Duration::from_millis(1_000));
        assert_eq!(desc.reconnect_max_delay, Duration::from_millis(15_000));
        assert!(desc.no_reconnect_close_codes.is_empty());
    }

    #[test]
    fn connect_url_appends_params() {
        let desc = ChannelDescriptor::new("ws:/chat", "ws://localhost:8080/chat")
            .with_param("user", "b")
            .with_param("page", 2)
            .with_param("fresh", true);
        let url = desc.connect_url().unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8080/chat?fresh=true&page=2&user=b"
        );
    }

    #[test]
    fn connect_url_without_params_is_untouched() {
        let desc = ChannelDescriptor::new("k", "wss://example.com/ws");
        assert_eq!(desc.connect_url().unwrap().as_str(), "wss://example.com/ws");
    }

    #[test]
    fn connect_url_rejects_garbage() {
        let desc = ChannelDescriptor::new("k", "not a url");
        assert!(matches!(
            desc.connect_url(),
            Err(ChannelError::InvalidUrl(_))
        ));
    }

    #[test]
    fn param_overwrite_keeps_last_value() {
        let desc = ChannelDescriptor::new("k", "ws://h/x")
            .with_param("token", "old")
            .with_param("token", "new");
        assert_eq!(desc.connect_url().unwrap().as_str(), "ws://h/x?token=new");
    }

    #[test]
    fn reconnect_policy_excludes_normal_closes() {
        let desc = ChannelDescriptor::new("k", "ws://h/x")
            .with_auto_reconnect(true)
            .with_no_reconnect_close_code(4001);

        assert!(!desc.reconnects_on(Some(1000)));
        assert!(!desc.reconnects_on(Some(1001)));
        assert!(!desc.reconnects_on(Some(4001)));
        assert!(desc.reconnects_on(Some(1006)));
        assert!(desc.reconnects_on(None));
    }

    #[test]
    fn reconnect_policy_disabled() {
        let desc = ChannelDescriptor::new("k", "ws://h/x");
        assert!(!desc.reconnects_on(Some(1006)));
        assert!(!desc.reconnects_on(None));
    }

    #[test]
    fn client_request_carries_subprotocols() {
        let desc = ChannelDescriptor::new("k", "ws://localhost:9/x")
            .with_protocol("chat.v2")
            .with_protocol("chat.v1");
        let request = desc.client_request().unwrap();
        assert_eq!(
            request
                .headers()
                .get("Sec-WebSocket-Protocol")
                .unwrap()
                .to_str()
                .unwrap(),
            "chat.v2, chat.v1"
        );
    }
}
