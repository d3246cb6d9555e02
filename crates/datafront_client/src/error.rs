use datafront_common::CodecError;

/// Errors raised by the client machinery itself.
///
/// Failures of individual queries and actions never surface here; they are
/// delivered as [`ErrorInfo`](datafront_common::ErrorInfo) through the query
/// state and the action error channel.
#[derive(Debug, thiserror::Error)]
pub enum DatafrontError {
    /// No transport is attached.
    #[error("not connected to the server")]
    NotConnected,

    /// The transport failed to connect or broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message could not be framed or parsed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The client was shut down; no further traffic is possible.
    #[error("client has been shut down")]
    ShutDown,
}
