//! Backend capability set shared by both protocol variants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use crate::error::{PlayerError, Result};

/// Playback lifecycle of a backend instance.
///
/// `Starting` is the initial state while the handshake is pending.
/// `Terminated` is absorbing: no transition leaves it, and every operation on
/// a terminated backend fails with [`PlayerError::Terminated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Starting,
    Idle,
    Loading,
    Playing,
    Paused,
    Stopped,
    Terminated,
}

/// Capability set consumed by the session layer.
///
/// Implementations are selected at construction time via
/// [`crate::config::BackendKind`]; there is no runtime backend switching.
pub trait PlayerBackend: Send {
    /// Load a track URL and start playing it.
    fn load(&mut self, url: &str) -> Result<()>;

    /// Pause or resume playback.
    fn playpause(&mut self) -> Result<()>;

    /// Stop playback.
    fn stop(&mut self) -> Result<()>;

    /// Set the playback volume, `0..=100` percent.
    fn set_volume(&mut self, amount: u8) -> Result<()>;

    /// Shut the backend down. Idempotent and infallible; afterwards every
    /// other operation fails with [`PlayerError::Terminated`].
    fn terminate(&mut self);

    fn state(&self) -> PlaybackState;
}

/// Playback state cell shared between the owning backend and its status
/// monitor thread.
#[derive(Clone)]
pub(crate) struct SharedPlaybackState(Arc<Mutex<PlaybackState>>);

impl SharedPlaybackState {
    pub(crate) fn new(initial: PlaybackState) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub(crate) fn get(&self) -> PlaybackState {
        *self.0.lock().unwrap()
    }

    /// Transition to `next`. `Terminated` is absorbing.
    pub(crate) fn set(&self, next: PlaybackState) {
        let mut state = self.0.lock().unwrap();
        if *state != PlaybackState::Terminated {
            *state = next;
        }
    }
}

/// Per-track at-most-once delivery flags, shared with the monitor thread.
pub(crate) struct TrackFlags {
    reported: AtomicBool,
    ended: AtomicBool,
}

impl TrackFlags {
    pub(crate) fn new() -> Self {
        Self {
            reported: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }

    /// Set the reported flag; true if this call was the one that set it.
    pub(crate) fn mark_reported(&self) -> bool {
        !self.reported.swap(true, Ordering::AcqRel)
    }

    /// Set the ended flag; true if this call was the one that set it.
    pub(crate) fn mark_ended(&self) -> bool {
        !self.ended.swap(true, Ordering::AcqRel)
    }
}

/// Handle to a running status monitor thread.
pub(crate) struct MonitorHandle {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn new(stop_tx: Sender<()>, join: JoinHandle<()>) -> Self {
        Self { stop_tx, join }
    }

    /// Signal the monitor to stop and join it. After this returns, no event
    /// from the old track context can fire.
    pub(crate) fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.join.join().is_err() {
            tracing::warn!("status monitor panicked");
        }
    }
}

/// The track a backend currently has loaded.
pub(crate) struct TrackSession {
    pub(crate) url: String,
    pub(crate) volume: Option<u8>,
    pub(crate) flags: Arc<TrackFlags>,
}

impl TrackSession {
    /// Fresh session for a newly loaded URL: both delivery flags cleared,
    /// volume carried over from the previous track.
    pub(crate) fn begin(url: String, previous: Option<&TrackSession>) -> Self {
        Self {
            url,
            volume: previous.and_then(|t| t.volume),
            flags: Arc::new(TrackFlags::new()),
        }
    }
}

/// Reject out-of-range volume values before any I/O happens.
pub(crate) fn validate_volume(amount: u8) -> Result<()> {
    if amount > 100 {
        return Err(PlayerError::InvalidArgument(format!(
            "volume must be between 0 and 100, got {amount}"
        )));
    }
    Ok(())
}

/// Follow HTTP redirects and return the final URL, so the player is handed a
/// directly playable address.
pub(crate) fn resolve_redirects(url: &str) -> Result<String> {
    use ureq::ResponseExt;
    let response = ureq::head(url)
        .call()
        .map_err(|e| PlayerError::Command(format!("could not resolve {url}: {e}")))?;
    Ok(response.get_uri().to_string())
}

/// Downgrade an `https` URL to `http` for players that only speak
/// unencrypted transport.
pub(crate) fn downgrade_https(url: &str) -> String {
    match url.strip_prefix("https:") {
        Some(rest) => format!("http:{rest}"),
        None => url.to_string(),
    }
}
