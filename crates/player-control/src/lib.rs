//! Player-control core: drive an external media player and observe it.
//!
//! Two backend variants implement the same capability set — `load`,
//! `playpause`, `stop`, `set_volume`, `terminate`:
//!
//! - [`slave::SlaveBackend`] spawns a player binary and speaks its slave-mode
//!   line protocol over stdin/stdout.
//! - [`mpd::MpdBackend`] drives an already-running player daemon over its
//!   TCP idle protocol.
//!
//! Each live backend runs one background status monitor thread that watches
//! for the end of the current track and for the elapsed-time report
//! threshold, and delivers both as typed events through an [`EventBridge`].
//! The session owns the bridge, registers handlers, and drains the queue
//! from its own thread; handlers are free to call back into the backend.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod mpd;
pub mod process;
pub mod slave;

pub use backend::{PlaybackState, PlayerBackend};
pub use config::{BackendKind, MpdConfig, PlayerConfig, SlaveConfig, create_backend};
pub use error::{PlayerError, Result};
pub use events::{EventBridge, EventEmitter, PlayerEvent};
