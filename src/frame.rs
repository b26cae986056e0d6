//! Inbound frame decoding.
//!
//! Converts raw transport frames into [`DecodedEvent`] values. The built-in
//! path never fails past this boundary: text that is not JSON and binary that
//! is not UTF-8 degrade to fallback variants instead of being dropped. A
//! custom [`FrameDecoder`] is a full override, including its error behavior.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::ChannelError;

/// One raw inbound unit of data from the transport, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl RawFrame {
    /// Create a text frame.
    #[must_use]
    pub fn text(data: impl Into<String>) -> Self {
        Self::Text(data.into())
    }

    /// Create a binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }
}

/// Typed value produced by decoding a [`RawFrame`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    /// Frame parsed as JSON.
    Json(serde_json::Value),
    /// Text frame that was not valid JSON, carried verbatim.
    Text(String),
    /// Binary frame that could not be decoded as UTF-8, carried verbatim.
    Unknown(Bytes),
}

impl DecodedEvent {
    /// JSON value, if this event decoded as JSON.
    #[must_use]
    pub const fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Raw text, if this event carries undecoded text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Deserialize a JSON event into a concrete type.
    ///
    /// # Errors
    /// Returns [`ChannelError::Decode`] when the event is not JSON or does
    /// not match the target shape.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        match self {
            Self::Json(value) => serde_json::from_value(value.clone())
                .map_err(|e| ChannelError::Decode(e.to_string())),
            Self::Text(_) => Err(ChannelError::Decode("event is raw text, not JSON".into())),
            Self::Unknown(_) => Err(ChannelError::Decode("event is raw binary".into())),
        }
    }
}

/// Pluggable decode override.
///
/// When a connection carries a custom decoder, its result is used unmodified:
/// an `Err` surfaces on the connection's error surface without terminating
/// the connection and without a fallback event.
pub trait FrameDecoder: Send + Sync {
    /// Decode one raw frame.
    ///
    /// # Errors
    /// Implementations may fail for any frame they consider invalid.
    fn decode(&self, frame: RawFrame) -> Result<DecodedEvent, ChannelError>;
}

impl<F> FrameDecoder for F
where
    F: Fn(RawFrame) -> Result<DecodedEvent, ChannelError> + Send + Sync,
{
    fn decode(&self, frame: RawFrame) -> Result<DecodedEvent, ChannelError> {
        self(frame)
    }
}

/// Built-in decode path.
///
/// Text attempts a JSON parse and falls back to [`DecodedEvent::Text`].
/// Binary is decoded as UTF-8 and then follows the text rule; invalid UTF-8
/// yields [`DecodedEvent::Unknown`] with the decode error reported alongside
/// so the frame is never dropped silently.
pub(crate) fn decode_frame(frame: RawFrame) -> (DecodedEvent, Option<ChannelError>) {
    match frame {
        RawFrame::Text(text) => (decode_text(text), None),
        RawFrame::Binary(raw) => match String::from_utf8(raw.to_vec()) {
            Ok(text) => (decode_text(text), None),
            Err(err) => {
                let msg = err.utf8_error().to_string();
                (DecodedEvent::Unknown(raw), Some(ChannelError::Decode(msg)))
            }
        },
    }
}

fn decode_text(text: String) -> DecodedEvent {
    match serde_json::from_str(&text) {
        Ok(value) => DecodedEvent::Json(value),
        Err(_) => DecodedEvent::Text(text),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn text_json_parses() {
        let (event, err) = decode_frame(RawFrame::text(r#"{"a":1}"#));
        assert_eq!(event, DecodedEvent::Json(json!({"a": 1})));
        assert!(err.is_none());
    }

    #[test]
    fn text_non_json_falls_back_verbatim() {
        let (event, err) = decode_frame(RawFrame::text("not json"));
        assert_eq!(event, DecodedEvent::Text("not json".into()));
        assert!(err.is_none());
    }

    #[test]
    fn binary_utf8_follows_text_rule() {
        let (event, err) = decode_frame(RawFrame::binary(br#"{"k":"v"}"#.to_vec()));
        assert_eq!(event, DecodedEvent::Json(json!({"k": "v"})));
        assert!(err.is_none());

        let (event, err) = decode_frame(RawFrame::binary(b"plain".to_vec()));
        assert_eq!(event, DecodedEvent::Text("plain".into()));
        assert!(err.is_none());
    }

    #[test]
    fn binary_invalid_utf8_degrades_with_error() {
        let raw = vec![0xff, 0xfe, 0x01];
        let (event, err) = decode_frame(RawFrame::binary(raw.clone()));
        assert_eq!(event, DecodedEvent::Unknown(Bytes::from(raw)));
        assert!(matches!(err, Some(ChannelError::Decode(_))));
    }

    #[test]
    fn parse_extracts_typed_value() {
        #[derive(Debug, PartialEq, serde::Deserialize)]
        struct Envelope {
            a: i64,
        }

        let (event, _) = decode_frame(RawFrame::text(r#"{"a":1}"#));
        let envelope: Envelope = event.parse().unwrap();
        assert_eq!(envelope, Envelope { a: 1 });
    }

    #[test]
    fn parse_rejects_non_json_events() {
        let event = DecodedEvent::Text("hello".into());
        assert!(event.parse::<serde_json::Value>().is_err());

        let event = DecodedEvent::Unknown(Bytes::from_static(&[1, 2]));
        assert!(event.parse::<serde_json::Value>().is_err());
    }

    #[test]
    fn closure_acts_as_decoder() {
        let decoder = |frame: RawFrame| match frame {
            RawFrame::Text(text) => Ok(DecodedEvent::Text(text.to_uppercase())),
            RawFrame::Binary(_) => Err(ChannelError::Decode("binary unsupported".into())),
        };

        let event = decoder.decode(RawFrame::text("hi")).unwrap();
        assert_eq!(event, DecodedEvent::Text("HI".into()));
        assert!(decoder.decode(RawFrame::binary(vec![0u8])).is_err());
    }

    #[test]
    fn accessors() {
        assert_eq!(
            DecodedEvent::Json(json!(1)).as_json(),
            Some(&json!(1))
        );
        assert_eq!(DecodedEvent::Text("x".into()).as_text(), Some("x"));
        assert_eq!(DecodedEvent::Json(json!(1)).as_text(), None);
    }
}
