//! Backend selection and timing configuration.
//!
//! Every retry loop in the backends runs against an explicit deadline and
//! poll interval from here; nothing is hard-coded at the call sites.

use std::time::Duration;

use crate::backend::PlayerBackend;
use crate::error::Result;
use crate::events::EventEmitter;
use crate::mpd::MpdBackend;
use crate::slave::SlaveBackend;

/// Which protocol variant to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Drive a player binary directly over its slave-mode line protocol.
    Slave,
    /// Drive a standalone player daemon over its idle protocol.
    Mpd,
}

/// Configuration for the slave-mode backend.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    /// Player executable; looked up on `PATH` unless absolute.
    pub player_path: String,
    /// Extra arguments appended to the slave-mode command line.
    pub extra_args: Vec<String>,
    /// How long to wait for the startup banner.
    pub handshake_deadline: Duration,
    /// Poll granularity during handshake and capability probe.
    pub handshake_poll: Duration,
    /// Window for the capability probe response; no response within it means
    /// the capability is not supported.
    pub probe_window: Duration,
    /// How long `load` waits for the playback-started marker.
    pub load_deadline: Duration,
    /// Poll granularity of the `load` wait loop.
    pub load_poll: Duration,
    /// Status monitor poll interval; also bounds how quickly a stop request
    /// is observed.
    pub monitor_poll: Duration,
    /// Elapsed playback time at which the track must be reported.
    pub report_threshold: Duration,
    /// Resolve HTTP redirects before handing the URL to the player.
    pub resolve_redirects: bool,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            player_path: "mplayer".to_string(),
            extra_args: Vec::new(),
            handshake_deadline: Duration::from_secs(15),
            handshake_poll: Duration::from_millis(10),
            probe_window: Duration::from_millis(100),
            load_deadline: Duration::from_secs(15),
            load_poll: Duration::from_millis(100),
            monitor_poll: Duration::from_millis(500),
            report_threshold: Duration::from_secs(30),
            resolve_redirects: true,
        }
    }
}

/// Configuration for the idle-protocol backend.
#[derive(Debug, Clone)]
pub struct MpdConfig {
    pub host: String,
    pub port: u16,
    /// Socket read timeout for command exchanges.
    pub command_timeout: Duration,
    /// Read granularity of the idle wait; bounds how quickly the monitor
    /// observes a stop request.
    pub idle_wait: Duration,
    /// Delay between reconnection attempts after a lost connection.
    pub reconnect_backoff: Duration,
    /// Resolve HTTP redirects before enqueueing the URL.
    pub resolve_redirects: bool,
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6600,
            command_timeout: Duration::from_secs(15),
            idle_wait: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(1),
            resolve_redirects: true,
        }
    }
}

/// Full player configuration: the selected variant plus per-variant settings.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub backend: BackendKind,
    pub slave: SlaveConfig,
    pub mpd: MpdConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Slave,
            slave: SlaveConfig::default(),
            mpd: MpdConfig::default(),
        }
    }
}

/// Construct the configured backend variant. The returned backend has
/// completed its handshake and is ready for `load`.
pub fn create_backend(
    config: &PlayerConfig,
    events: EventEmitter,
) -> Result<Box<dyn PlayerBackend>> {
    match config.backend {
        BackendKind::Slave => Ok(Box::new(SlaveBackend::start(config.slave.clone(), events)?)),
        BackendKind::Mpd => Ok(Box::new(MpdBackend::start(config.mpd.clone(), events)?)),
    }
}
