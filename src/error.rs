//! Channel error types.

/// Errors surfaced by the realtime channel core.
///
/// Every variant is local-recoverable: transport errors are informational
/// (the close notification that follows drives the state machine) and decode
/// errors never terminate the connection.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The connection attempt failed before the transport opened.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Transport-level failure on an established connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// An outbound payload could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// The channel URL could not be parsed.
    #[error("invalid channel url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failed_display() {
        let e = ChannelError::ConnectFailed("refused".into());
        assert_eq!(e.to_string(), "connect failed: refused");
    }

    #[test]
    fn transport_display() {
        let e = ChannelError::Transport("broken pipe".into());
        assert_eq!(e.to_string(), "transport error: broken pipe");
    }

    #[test]
    fn decode_display() {
        let e = ChannelError::Decode("invalid utf-8".into());
        assert_eq!(e.to_string(), "decode error: invalid utf-8");
    }

    #[test]
    fn invalid_url_from_parse_error() {
        let parse_err = url::Url::parse("not a url").unwrap_err();
        let e: ChannelError = parse_err.into();
        assert!(matches!(e, ChannelError::InvalidUrl(_)));
        assert!(e.to_string().starts_with("invalid channel url:"));
    }
}
