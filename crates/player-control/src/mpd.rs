//! Idle-protocol backend: drives a standalone player daemon over TCP.
//!
//! Commands run on short-lived connections (connect, exchange, close), the
//! daemon's own discipline for occasional clients. The status monitor keeps
//! one persistent connection on which it issues blocking `idle player`
//! requests; the socket read timeout bounds how long a stop request can go
//! unobserved. Lost monitor connections are logged and reconnected with a
//! backoff, never surfaced to the caller.
//!
//! The mix service disallows returning to a previous track, so `load` clears
//! the daemon's queue before adding the new URL: exactly one track is ever
//! enqueued.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};

use crate::backend::{
    MonitorHandle, PlaybackState, PlayerBackend, SharedPlaybackState, TrackFlags, TrackSession,
    resolve_redirects, validate_volume,
};
use crate::config::MpdConfig;
use crate::error::{PlayerError, Result};
use crate::events::{EventEmitter, PlayerEvent};

const GREETING: &str = "OK MPD";

/// One TCP connection to the daemon.
struct MpdConnection {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    /// Partially received line carried across idle-wait timeouts.
    partial: String,
}

impl MpdConnection {
    fn connect(host: &str, port: u16, read_timeout: Duration) -> Result<Self> {
        let init_err = |e| {
            PlayerError::Initialization(format!(
                "could not connect to player daemon at {host}:{port}: {e}"
            ))
        };
        let stream = TcpStream::connect((host, port)).map_err(init_err)?;
        stream.set_read_timeout(Some(read_timeout)).map_err(init_err)?;
        let reader = BufReader::new(stream.try_clone().map_err(init_err)?);
        let mut conn = Self {
            stream,
            reader,
            partial: String::new(),
        };
        let greeting = conn.read_line().map_err(|e| {
            PlayerError::Initialization(format!("no greeting from player daemon: {e}"))
        })?;
        if !greeting.starts_with(GREETING) {
            return Err(PlayerError::Initialization(format!(
                "unexpected daemon greeting: {greeting}"
            )));
        }
        Ok(conn)
    }

    fn read_line(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed the connection",
            ));
        }
        Ok(line.trim_end().to_string())
    }

    fn send(&mut self, command: &str) -> Result<()> {
        self.stream
            .write_all(command.as_bytes())
            .and_then(|()| self.stream.write_all(b"\n"))
            .and_then(|()| self.stream.flush())
            .map_err(|e| PlayerError::Command(format!("{command}: write failed: {e}")))
    }

    /// Send a command and collect its `key: value` response pairs. `ACK`
    /// replies become [`PlayerError::Command`].
    fn exchange(&mut self, command: &str) -> Result<Vec<(String, String)>> {
        self.send(command)?;
        let mut pairs = Vec::new();
        loop {
            let line = self.read_line().map_err(|e| {
                PlayerError::Command(format!("{command}: connection lost: {e}"))
            })?;
            if line == "OK" {
                return Ok(pairs);
            }
            if line.starts_with("ACK") {
                return Err(PlayerError::Command(format!("{command}: {line}")));
            }
            if let Some((key, value)) = line.split_once(": ") {
                pairs.push((key.to_string(), value.to_string()));
            }
        }
    }

    /// Block on an in-flight `idle` response. Returns `Ok(None)` once the
    /// stop signal is observed (the idle is cancelled with `noidle` first);
    /// `Err` means the connection was lost.
    ///
    /// A read timeout can split a line; the partial tail is kept in
    /// `self.partial` so the next wait resumes mid-line.
    fn wait_idle(&mut self, stop_rx: &Receiver<()>) -> Result<Option<Vec<(String, String)>>> {
        let mut pairs = Vec::new();
        loop {
            let mut buf = std::mem::take(&mut self.partial);
            match self.reader.read_line(&mut buf) {
                Ok(0) => {
                    return Err(PlayerError::Command(
                        "idle: daemon closed the connection".to_string(),
                    ));
                }
                Ok(_) if buf.ends_with('\n') => {
                    let line = buf.trim_end();
                    if line == "OK" {
                        return Ok(Some(pairs));
                    }
                    if line.starts_with("ACK") {
                        return Err(PlayerError::Command(format!("idle: {line}")));
                    }
                    if let Some((key, value)) = line.split_once(": ") {
                        pairs.push((key.to_string(), value.to_string()));
                    }
                }
                // Output ended without a newline: the daemon is gone.
                Ok(_) => {
                    return Err(PlayerError::Command(
                        "idle: daemon closed the connection".to_string(),
                    ));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    self.partial = buf;
                    match stop_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => {
                            let _ = self.send("noidle");
                            return Ok(None);
                        }
                        Err(TryRecvError::Empty) => {}
                    }
                }
                Err(e) => {
                    return Err(PlayerError::Command(format!("idle: connection lost: {e}")));
                }
            }
        }
    }

    fn close(mut self) {
        let _ = self.send("close");
    }
}

/// Double-quote an argument per the daemon's command syntax.
fn quote_mpd_arg(arg: &str) -> String {
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

fn value_of(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

pub struct MpdBackend {
    config: MpdConfig,
    state: SharedPlaybackState,
    track: Option<TrackSession>,
    monitor: Option<MonitorHandle>,
    events: EventEmitter,
}

impl std::fmt::Debug for MpdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpdBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MpdBackend {
    /// Connect to the daemon, clear its queue and start the idle monitor.
    pub fn start(config: MpdConfig, events: EventEmitter) -> Result<Self> {
        let state = SharedPlaybackState::new(PlaybackState::Starting);
        let mut backend = Self {
            config,
            state,
            track: None,
            monitor: None,
            events,
        };
        // Leftover queue entries from an earlier session must not resume.
        backend.run_command("clear")?;
        backend.state.set(PlaybackState::Idle);
        backend.start_monitor(Arc::new(TrackFlags::new()));
        tracing::debug!("idle-protocol backend ready");
        Ok(backend)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state.get() == PlaybackState::Terminated {
            return Err(PlayerError::Terminated);
        }
        Ok(())
    }

    /// Run one command on a fresh connection.
    fn run_command(&self, command: &str) -> Result<Vec<(String, String)>> {
        let mut conn = MpdConnection::connect(
            &self.config.host,
            self.config.port,
            self.config.command_timeout,
        )?;
        let result = conn.exchange(command);
        conn.close();
        result
    }

    fn start_monitor(&mut self, flags: Arc<TrackFlags>) {
        let ctx = IdleMonitorContext {
            config: self.config.clone(),
            events: self.events.clone(),
            flags,
            state: self.state.clone(),
        };
        let (stop_tx, stop_rx) = bounded(1);
        let join = thread::spawn(move || idle_monitor_main(ctx, stop_rx));
        self.monitor = Some(MonitorHandle::new(stop_tx, join));
    }

    fn stop_monitor(&mut self) {
        if let Some(handle) = self.monitor.take() {
            handle.stop();
        }
    }

    fn terminate_inner(&mut self) {
        if self.state.get() == PlaybackState::Terminated {
            return;
        }
        self.stop_monitor();
        self.state.set(PlaybackState::Terminated);
        tracing::debug!("idle-protocol backend terminated");
    }
}

impl PlayerBackend for MpdBackend {
    fn load(&mut self, url: &str) -> Result<()> {
        self.ensure_live()?;
        let url = if self.config.resolve_redirects {
            resolve_redirects(url)?
        } else {
            url.to_string()
        };

        // Joined before the queue changes, so no event from the previous
        // track context can fire once the new one is enqueued.
        self.stop_monitor();
        self.state.set(PlaybackState::Loading);
        tracing::info!(url = %url, "loading track");

        let load = (|| -> Result<()> {
            let mut conn = MpdConnection::connect(
                &self.config.host,
                self.config.port,
                self.config.command_timeout,
            )?;
            conn.exchange("clear")?;
            conn.exchange(&format!("add {}", quote_mpd_arg(&url)))?;
            conn.exchange("play")?;
            conn.close();
            Ok(())
        })();

        match load {
            Ok(()) => {
                let track = TrackSession::begin(url, self.track.as_ref());
                let flags = track.flags.clone();
                self.track = Some(track);
                self.state.set(PlaybackState::Playing);
                self.start_monitor(flags);
                Ok(())
            }
            Err(e) => {
                // Leave the backend usable; the monitor resumes watching the
                // old (now cleared) queue.
                self.state.set(PlaybackState::Idle);
                self.start_monitor(Arc::new(TrackFlags::new()));
                Err(e)
            }
        }
    }

    fn playpause(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.run_command("pause")?;
        match self.state.get() {
            PlaybackState::Playing => self.state.set(PlaybackState::Paused),
            PlaybackState::Paused => self.state.set(PlaybackState::Playing),
            _ => {}
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.ensure_live()?;
        if let Some(track) = &self.track {
            tracing::debug!(url = %track.url, "stopping playback");
        }
        self.run_command("stop")?;
        self.state.set(PlaybackState::Stopped);
        Ok(())
    }

    fn set_volume(&mut self, amount: u8) -> Result<()> {
        self.ensure_live()?;
        validate_volume(amount)?;
        self.run_command(&format!("setvol {amount}"))?;
        if let Some(track) = self.track.as_mut() {
            track.volume = Some(amount);
        }
        Ok(())
    }

    /// Stops the monitor and poisons the backend. The daemon itself is left
    /// running; it belongs to the user.
    fn terminate(&mut self) {
        self.terminate_inner();
    }

    fn state(&self) -> PlaybackState {
        self.state.get()
    }
}

impl Drop for MpdBackend {
    fn drop(&mut self) {
        self.terminate_inner();
    }
}

struct IdleMonitorContext {
    config: MpdConfig,
    events: EventEmitter,
    flags: Arc<TrackFlags>,
    state: SharedPlaybackState,
}

fn wait_for_stop(stop_rx: &Receiver<()>, timeout: Duration) -> bool {
    matches!(
        stop_rx.recv_timeout(timeout),
        Ok(()) | Err(RecvTimeoutError::Disconnected)
    )
}

fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    matches!(
        stop_rx.try_recv(),
        Ok(()) | Err(TryRecvError::Disconnected)
    )
}

/// Idle monitor loop: block on `idle player`, and on every wakeup query the
/// status. A play-to-stop transition with no active song id means the track
/// ran out. Connection loss is transient: log, back off, reconnect.
fn idle_monitor_main(ctx: IdleMonitorContext, stop_rx: Receiver<()>) {
    tracing::debug!("idle status monitor started");
    'connection: loop {
        if stop_requested(&stop_rx) {
            break;
        }
        let mut conn = match MpdConnection::connect(
            &ctx.config.host,
            ctx.config.port,
            ctx.config.idle_wait,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("idle monitor cannot reach daemon, retrying: {e}");
                if wait_for_stop(&stop_rx, ctx.config.reconnect_backoff) {
                    break;
                }
                continue;
            }
        };

        // Prime the transition detector from the current status.
        let mut previous_state = match conn.exchange("status") {
            Ok(pairs) => value_of(&pairs, "state"),
            Err(e) => {
                tracing::warn!("status query failed, reconnecting: {e}");
                if wait_for_stop(&stop_rx, ctx.config.reconnect_backoff) {
                    break;
                }
                continue;
            }
        };

        loop {
            if conn.send("idle player").is_err() {
                tracing::warn!("idle request failed, reconnecting");
                continue 'connection;
            }
            match conn.wait_idle(&stop_rx) {
                Ok(Some(_changed)) => {}
                Ok(None) => break 'connection,
                Err(e) => {
                    tracing::warn!("idle wait failed, reconnecting: {e}");
                    if wait_for_stop(&stop_rx, ctx.config.reconnect_backoff) {
                        break 'connection;
                    }
                    continue 'connection;
                }
            }
            let status = match conn.exchange("status") {
                Ok(pairs) => pairs,
                Err(e) => {
                    tracing::warn!("status query failed, reconnecting: {e}");
                    continue 'connection;
                }
            };
            let new_state = value_of(&status, "state");
            let song_over = previous_state.as_deref() == Some("play")
                && new_state.as_deref() == Some("stop")
                && value_of(&status, "songid").is_none();
            if song_over && ctx.flags.mark_ended() {
                tracing::debug!("song has ended");
                ctx.state.set(PlaybackState::Stopped);
                ctx.events.emit(PlayerEvent::SongEnded);
            }
            previous_state = new_state;
        }
    }
    tracing::debug!("idle status monitor exiting");
}
