//! Error types for the player-control core.

use thiserror::Error;

/// Result type for all player-control operations.
pub type Result<T> = std::result::Result<T, PlayerError>;

/// Errors surfaced by the backends and the process channel.
#[derive(Error, Debug)]
pub enum PlayerError {
    /// The player process or daemon could not be started, or its handshake
    /// did not complete within the deadline. Fatal to the backend instance.
    #[error("player initialization failed: {0}")]
    Initialization(String),

    /// `load` did not observe the playback-started marker within its
    /// deadline. The backend has been terminated as a side effect.
    #[error("playback did not start: {reason}")]
    PlaybackStart {
        reason: String,
        /// Output collected from the player while waiting, for diagnosis.
        diagnostics: String,
    },

    /// A command was rejected by the player process or daemon. The backend
    /// remains usable.
    #[error("player command failed: {0}")]
    Command(String),

    /// The caller supplied an out-of-range value. Nothing was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted after `terminate`.
    #[error("player has been terminated and cannot be used anymore")]
    Terminated,
}
