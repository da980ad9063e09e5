//! Client error types.

use thiserror::Error;

/// Errors returned by the client API.
///
/// These signal misuse or a dead socket. Transport and channel failures are
/// recovered from automatically and reported through hooks instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// `join` was called more than once on the same channel.
    #[error("tried to join '{topic}' multiple times; join can only be called once per channel")]
    AlreadyJoined { topic: String },

    /// A push was attempted before the channel was ever joined.
    #[error("tried to push '{event}' to '{topic}' before joining")]
    PushBeforeJoin { topic: String, event: String },

    /// The socket task is gone.
    #[error("Socket closed")]
    SocketClosed,
}
