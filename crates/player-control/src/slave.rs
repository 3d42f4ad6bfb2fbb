//! Slave-mode backend: drives a player binary over its stdin/stdout line
//! protocol.
//!
//! Construction spawns the player, waits for its startup banner and probes
//! whether the `pausing_keep_force` command prefix is understood. `load`
//! sends `loadfile` and polls for the playback-started marker; on success a
//! status monitor thread watches the output for end-of-stream and the
//! report threshold. The monitor is always stopped and joined before a
//! foreground wait loop reads from the channel, so the two never compete for
//! output lines.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};

use crate::backend::{
    MonitorHandle, PlaybackState, PlayerBackend, SharedPlaybackState, TrackFlags, TrackSession,
    downgrade_https, resolve_redirects, validate_volume,
};
use crate::config::SlaveConfig;
use crate::error::{PlayerError, Result};
use crate::events::{EventEmitter, PlayerEvent};
use crate::process::ProcessChannel;

/// Banner printed once the player's command loop is ready.
const STARTUP_BANNER: &str = "CPLAYER: MPlayer";
/// Marker confirming that a `loadfile` actually started playing.
const PLAYBACK_STARTED: &str = "CPLAYER: Starting playback...";
/// End-of-stream marker.
const END_OF_STREAM: &str = "GLOBAL: EOF code: 1";
/// Prefix of an elapsed-position answer line.
const TIME_POSITION: &str = "GLOBAL: ANS_TIME_POSITION=";
/// Capability probe: a player that understands `pausing_keep_force` runs the
/// property query and answers with an unknown-property error. No answer
/// within the probe window means the prefix is not supported.
const PROBE_COMMAND: &str = "pausing_keep_force get_prop thisshouldntexist";
const PROBE_ANSWER: &str = "GLOBAL: ANS_ERROR=PROPERTY_UNKNOWN";

const PAUSING_KEEP_FORCE: &str = "pausing_keep_force";
const PAUSING_KEEP: &str = "pausing_keep";

/// Slave-mode invocation: line-buffered control on stdin, status lines on
/// stdout, no video output.
fn slave_mode_args(extra: &[String]) -> Vec<String> {
    let mut args: Vec<String> = [
        "-slave",
        "-idle",
        "-really-quiet",
        "-msglevel",
        "global=6:cplayer=4",
        "-msgmodule",
        "-input",
        "nodefault-bindings",
        "-vo",
        "null",
        "-cache",
        "1024",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend(extra.iter().cloned());
    args
}

pub struct SlaveBackend {
    channel: Arc<ProcessChannel>,
    config: SlaveConfig,
    /// Pause-preserving command prefix selected during the handshake probe.
    pause_prefix: &'static str,
    state: SharedPlaybackState,
    track: Option<TrackSession>,
    monitor: Option<MonitorHandle>,
    events: EventEmitter,
}

impl std::fmt::Debug for SlaveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveBackend")
            .field("config", &self.config)
            .field("pause_prefix", &self.pause_prefix)
            .finish_non_exhaustive()
    }
}

impl SlaveBackend {
    /// Spawn the player and complete the startup handshake.
    pub fn start(config: SlaveConfig, events: EventEmitter) -> Result<Self> {
        let args = slave_mode_args(&config.extra_args);
        let channel = Arc::new(ProcessChannel::spawn(&config.player_path, &args)?);
        let state = SharedPlaybackState::new(PlaybackState::Starting);

        let mut seen = String::new();
        let deadline = Instant::now() + config.handshake_deadline;
        loop {
            seen.push_str(&channel.read(config.handshake_poll)?);
            if seen.contains(STARTUP_BANNER) {
                break;
            }
            if Instant::now() >= deadline {
                channel.terminate();
                return Err(PlayerError::Initialization(format!(
                    "player did not start within {:.1}s; output so far: {}",
                    config.handshake_deadline.as_secs_f64(),
                    seen.trim()
                )));
            }
        }

        channel.write_line(PROBE_COMMAND)?;
        let mut supports_force = false;
        let probe_deadline = Instant::now() + config.probe_window;
        while Instant::now() < probe_deadline {
            if channel.read(config.handshake_poll)?.contains(PROBE_ANSWER) {
                supports_force = true;
                break;
            }
        }
        let pause_prefix = if supports_force {
            PAUSING_KEEP_FORCE
        } else {
            tracing::warn!(
                "player does not support pausing_keep_force; it will skip frames while paused"
            );
            PAUSING_KEEP
        };
        tracing::debug!(pause_prefix, "slave handshake complete");
        state.set(PlaybackState::Idle);

        Ok(Self {
            channel,
            config,
            pause_prefix,
            state,
            track: None,
            monitor: None,
            events,
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state.get() == PlaybackState::Terminated {
            return Err(PlayerError::Terminated);
        }
        Ok(())
    }

    fn start_monitor(&mut self, flags: Arc<TrackFlags>) {
        let ctx = MonitorContext {
            channel: self.channel.clone(),
            events: self.events.clone(),
            flags,
            state: self.state.clone(),
            pause_prefix: self.pause_prefix,
            poll: self.config.monitor_poll,
            threshold_secs: self.config.report_threshold.as_secs_f64(),
        };
        let (stop_tx, stop_rx) = bounded(1);
        let join = thread::spawn(move || monitor_thread_main(ctx, stop_rx));
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
        self.channel.terminate();
        self.state.set(PlaybackState::Terminated);
        tracing::debug!("slave backend terminated");
    }
}

impl PlayerBackend for SlaveBackend {
    fn load(&mut self, url: &str) -> Result<()> {
        self.ensure_live()?;
        let url = if self.config.resolve_redirects {
            resolve_redirects(url)?
        } else {
            url.to_string()
        };
        // The player only speaks unencrypted transport.
        let url = downgrade_https(&url);

        self.stop_monitor();
        self.state.set(PlaybackState::Loading);
        tracing::info!(url = %url, "loading track");

        if let Err(e) = self
            .channel
            .write_line(&format!("loadfile {}", quote_arg(&url)))
        {
            self.terminate_inner();
            return Err(PlayerError::PlaybackStart {
                reason: format!("could not send load command: {e}"),
                diagnostics: String::new(),
            });
        }

        let mut diagnostics = String::new();
        let deadline = Instant::now() + self.config.load_deadline;
        loop {
            diagnostics.push_str(&self.channel.read(self.config.load_poll)?);
            if diagnostics.contains(PLAYBACK_STARTED) {
                break;
            }
            if Instant::now() >= deadline {
                self.terminate_inner();
                return Err(PlayerError::PlaybackStart {
                    reason: format!(
                        "playback did not start within {:.1}s; are you experiencing \
                         network problems?",
                        self.config.load_deadline.as_secs_f64()
                    ),
                    diagnostics,
                });
            }
        }

        let track = TrackSession::begin(url, self.track.as_ref());
        let flags = track.flags.clone();
        self.track = Some(track);
        self.state.set(PlaybackState::Playing);
        self.start_monitor(flags);
        Ok(())
    }

    fn playpause(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.channel.write_line("pause")?;
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
        self.channel
            .write_line(&format!("{} stop", self.pause_prefix))?;
        self.stop_monitor();
        self.state.set(PlaybackState::Stopped);
        Ok(())
    }

    fn set_volume(&mut self, amount: u8) -> Result<()> {
        self.ensure_live()?;
        validate_volume(amount)?;
        self.channel
            .write_line(&format!("{} volume {} 1", self.pause_prefix, amount))?;
        if let Some(track) = self.track.as_mut() {
            track.volume = Some(amount);
        }
        Ok(())
    }

    fn terminate(&mut self) {
        self.terminate_inner();
    }

    fn state(&self) -> PlaybackState {
        self.state.get()
    }
}

impl Drop for SlaveBackend {
    fn drop(&mut self) {
        self.terminate_inner();
    }
}

struct MonitorContext {
    channel: Arc<ProcessChannel>,
    events: EventEmitter,
    flags: Arc<TrackFlags>,
    state: SharedPlaybackState,
    pause_prefix: &'static str,
    poll: Duration,
    threshold_secs: f64,
}

/// Status monitor loop: query the elapsed position (until the track has been
/// reported) and scan the output for the end-of-stream marker. Each
/// iteration ends with a bounded wait on the stop channel, so a stop request
/// is observed within one poll interval.
fn monitor_thread_main(ctx: MonitorContext, stop_rx: Receiver<()>) {
    tracing::debug!("status monitor started");
    loop {
        if !ctx.flags.is_reported()
            && ctx
                .channel
                .write_line(&format!("{} get_time_pos", ctx.pause_prefix))
                .is_err()
        {
            break;
        }
        match ctx.channel.read(Duration::ZERO) {
            Ok(output) if !output.is_empty() => {
                if output.contains(END_OF_STREAM) && ctx.flags.mark_ended() {
                    ctx.state.set(PlaybackState::Stopped);
                    ctx.events.emit(PlayerEvent::SongEnded);
                }
                if !ctx.flags.is_reported()
                    && let Some(position) = parse_time_position(&output)
                    && position >= ctx.threshold_secs
                    && ctx.flags.mark_reported()
                {
                    ctx.events.emit(PlayerEvent::ReportThreshold);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
        match stop_rx.recv_timeout(ctx.poll) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    tracing::debug!("status monitor exiting");
}

/// Extract the elapsed position from an `ANS_TIME_POSITION` answer line.
fn parse_time_position(output: &str) -> Option<f64> {
    let start = output.find(TIME_POSITION)? + TIME_POSITION.len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// POSIX single-quote quoting for the `loadfile` argument.
fn quote_arg(arg: &str) -> String {
    fn is_safe(c: char) -> bool {
        c.is_ascii_alphanumeric()
            || matches!(c, '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-' | '_')
    }
    if !arg.is_empty() && arg.chars().all(is_safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::events::EventBridge;

    static SCRIPT_ID: AtomicUsize = AtomicUsize::new(0);

    /// Write an executable fake player script. The script logs every command
    /// line it receives to a side file and reacts with `responses` inside the
    /// read loop's `case` statement.
    fn write_fake_player(probe_supported: bool, time_pos_response: &str) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let id = format!(
            "{}-{}",
            std::process::id(),
            SCRIPT_ID.fetch_add(1, Ordering::Relaxed)
        );
        let dir = std::env::temp_dir();
        let log = dir.join(format!("fake-player-{id}.log"));
        let path = dir.join(format!("fake-player-{id}.sh"));

        let probe_case = if probe_supported {
            "'pausing_keep_force get_prop thisshouldntexist') \
             echo 'GLOBAL: ANS_ERROR=PROPERTY_UNKNOWN' ;;"
        } else {
            ""
        };
        let script = format!(
            "#!/bin/sh\n\
             LOG='{log}'\n\
             : > \"$LOG\"\n\
             echo 'CPLAYER: MPlayer 1.5-fake (C) 2000-2024'\n\
             while IFS= read -r line; do\n\
               printf '%s\\n' \"$line\" >> \"$LOG\"\n\
               case \"$line\" in\n\
                 {probe_case}\n\
                 loadfile*) echo 'CPLAYER: Starting playback...' ;;\n\
                 *get_time_pos*) {time_pos_response} ;;\n\
               esac\n\
             done\n",
            log = log.display(),
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (path, log)
    }

    fn test_config(player: &Path) -> SlaveConfig {
        SlaveConfig {
            player_path: player.to_string_lossy().into_owned(),
            extra_args: Vec::new(),
            handshake_deadline: Duration::from_secs(5),
            handshake_poll: Duration::from_millis(10),
            probe_window: Duration::from_millis(300),
            load_deadline: Duration::from_secs(5),
            load_poll: Duration::from_millis(20),
            monitor_poll: Duration::from_millis(30),
            report_threshold: Duration::from_secs(30),
            resolve_redirects: false,
        }
    }

    fn counted_bridge() -> (EventBridge, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let mut bridge = EventBridge::new();
        let ended = Arc::new(AtomicUsize::new(0));
        let reported = Arc::new(AtomicUsize::new(0));
        let (ended_h, reported_h) = (ended.clone(), reported.clone());
        bridge.on_event(move |event| match event {
            PlayerEvent::SongEnded => {
                ended_h.fetch_add(1, Ordering::SeqCst);
            }
            PlayerEvent::ReportThreshold => {
                reported_h.fetch_add(1, Ordering::SeqCst);
            }
        });
        (bridge, ended, reported)
    }

    /// Dispatch events for `duration`, regardless of how many arrive.
    fn pump(bridge: &mut EventBridge, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            bridge.dispatch_wait(Duration::from_millis(20));
        }
    }

    fn wait_for_log_line(log: &Path, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let content = std::fs::read_to_string(log).unwrap_or_default();
            if content.lines().any(|l| l.contains(needle)) {
                return content;
            }
            if Instant::now() >= deadline {
                panic!("never saw {needle:?} in command log: {content:?}");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn handshake_selects_force_prefix_when_probe_answers() {
        let (player, _log) = write_fake_player(true, ":");
        let bridge = EventBridge::new();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        assert_eq!(backend.state(), PlaybackState::Idle);
        assert_eq!(backend.pause_prefix, PAUSING_KEEP_FORCE);
        backend.terminate();
    }

    #[test]
    fn silent_probe_falls_back_to_plain_prefix() {
        let (player, log) = write_fake_player(false, ":");
        let bridge = EventBridge::new();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        assert_eq!(backend.pause_prefix, PAUSING_KEEP);

        // The fallback form is used for subsequent commands.
        backend.set_volume(50).unwrap();
        let content = wait_for_log_line(&log, "volume 50 1");
        assert!(content.contains("pausing_keep volume 50 1"));
        assert!(!content.contains("pausing_keep_force volume"));
        backend.terminate();
    }

    #[test]
    fn handshake_timeout_is_initialization_error() {
        use std::os::unix::fs::PermissionsExt;
        let id = format!(
            "{}-{}",
            std::process::id(),
            SCRIPT_ID.fetch_add(1, Ordering::Relaxed)
        );
        let player = std::env::temp_dir().join(format!("fake-player-{id}.sh"));
        std::fs::write(&player, "#!/bin/sh\nsleep 60\n").unwrap();
        std::fs::set_permissions(&player, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = test_config(&player);
        config.handshake_deadline = Duration::from_millis(200);
        let bridge = EventBridge::new();
        let err = SlaveBackend::start(config, bridge.emitter()).unwrap_err();
        assert!(matches!(err, PlayerError::Initialization(_)));
    }

    #[test]
    fn load_sends_quoted_url_and_enters_playing() {
        let (player, log) = write_fake_player(true, ":");
        let bridge = EventBridge::new();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        backend.load("http://host/track.mp3").unwrap();
        assert_eq!(backend.state(), PlaybackState::Playing);
        wait_for_log_line(&log, "loadfile http://host/track.mp3");
        backend.terminate();
    }

    #[test]
    fn https_urls_are_downgraded_before_sending() {
        let (player, log) = write_fake_player(true, ":");
        let bridge = EventBridge::new();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        backend.load("https://host/track.mp3").unwrap();
        let content = wait_for_log_line(&log, "loadfile http://host/track.mp3");
        assert!(!content.contains("https://"));
        backend.terminate();
    }

    #[test]
    fn load_timeout_terminates_backend() {
        use std::os::unix::fs::PermissionsExt;
        // Handshakes fine, never confirms playback.
        let id = format!(
            "{}-{}",
            std::process::id(),
            SCRIPT_ID.fetch_add(1, Ordering::Relaxed)
        );
        let player = std::env::temp_dir().join(format!("fake-player-{id}.sh"));
        std::fs::write(
            &player,
            "#!/bin/sh\n\
             echo 'CPLAYER: MPlayer 1.5-fake'\n\
             while IFS= read -r line; do :; done\n",
        )
        .unwrap();
        std::fs::set_permissions(&player, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = test_config(&player);
        config.probe_window = Duration::from_millis(50);
        config.load_deadline = Duration::from_millis(300);
        let bridge = EventBridge::new();
        let mut backend = SlaveBackend::start(config, bridge.emitter()).unwrap();

        let err = backend.load("http://host/track.mp3").unwrap_err();
        assert!(matches!(err, PlayerError::PlaybackStart { .. }));
        assert_eq!(backend.state(), PlaybackState::Terminated);
        assert!(matches!(backend.playpause(), Err(PlayerError::Terminated)));
    }

    #[test]
    fn report_threshold_fires_once_and_resets_on_load() {
        let time_pos = "if [ \"${POS:-0}\" = 0 ]; then POS=1; \
                        echo 'GLOBAL: ANS_TIME_POSITION=31.2'; \
                        else echo 'GLOBAL: ANS_TIME_POSITION=45.0'; fi";
        let (player, _log) = write_fake_player(true, time_pos);
        let (mut bridge, ended, reported) = counted_bridge();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();

        backend.load("http://host/a.mp3").unwrap();
        pump(&mut bridge, Duration::from_millis(400));
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 0);

        // A new track gets a fresh threshold event.
        backend.load("http://host/b.mp3").unwrap();
        pump(&mut bridge, Duration::from_millis(400));
        assert_eq!(reported.load(Ordering::SeqCst), 2);
        backend.terminate();
    }

    #[test]
    fn position_below_threshold_does_not_report() {
        let (player, _log) = write_fake_player(true, "echo 'GLOBAL: ANS_TIME_POSITION=12.5'");
        let (mut bridge, _ended, reported) = counted_bridge();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        backend.load("http://host/a.mp3").unwrap();
        pump(&mut bridge, Duration::from_millis(300));
        assert_eq!(reported.load(Ordering::SeqCst), 0);
        backend.terminate();
    }

    #[test]
    fn song_ended_fires_once_despite_repeated_markers() {
        let (player, _log) = write_fake_player(true, "echo 'GLOBAL: EOF code: 1'");
        let (mut bridge, ended, _reported) = counted_bridge();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        backend.load("http://host/a.mp3").unwrap();
        pump(&mut bridge, Duration::from_millis(400));
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(backend.state(), PlaybackState::Stopped);
        backend.terminate();
    }

    #[test]
    fn invalid_volume_is_rejected_before_any_write() {
        let (player, log) = write_fake_player(true, ":");
        let bridge = EventBridge::new();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        assert!(matches!(
            backend.set_volume(101),
            Err(PlayerError::InvalidArgument(_))
        ));
        // Give the script a moment, then check nothing volume-ish was sent.
        thread::sleep(Duration::from_millis(100));
        let content = std::fs::read_to_string(&log).unwrap_or_default();
        assert!(!content.contains("volume"));
        backend.terminate();
    }

    #[test]
    fn terminate_is_idempotent_and_poisons_every_operation() {
        let (player, _log) = write_fake_player(true, ":");
        let bridge = EventBridge::new();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        backend.terminate();
        backend.terminate();
        assert_eq!(backend.state(), PlaybackState::Terminated);
        assert!(matches!(
            backend.load("http://host/a.mp3"),
            Err(PlayerError::Terminated)
        ));
        assert!(matches!(backend.playpause(), Err(PlayerError::Terminated)));
        assert!(matches!(backend.stop(), Err(PlayerError::Terminated)));
        assert!(matches!(
            backend.set_volume(10),
            Err(PlayerError::Terminated)
        ));
    }

    #[test]
    fn playpause_toggles_between_playing_and_paused() {
        let (player, _log) = write_fake_player(true, ":");
        let bridge = EventBridge::new();
        let mut backend = SlaveBackend::start(test_config(&player), bridge.emitter()).unwrap();
        backend.load("http://host/a.mp3").unwrap();
        backend.playpause().unwrap();
        assert_eq!(backend.state(), PlaybackState::Paused);
        backend.playpause().unwrap();
        assert_eq!(backend.state(), PlaybackState::Playing);
        backend.stop().unwrap();
        assert_eq!(backend.state(), PlaybackState::Stopped);
        backend.terminate();
    }

    #[test]
    fn parse_time_position_extracts_value() {
        assert_eq!(
            parse_time_position("GLOBAL: ANS_TIME_POSITION=31.2\n"),
            Some(31.2)
        );
        assert_eq!(
            parse_time_position("noise\nGLOBAL: ANS_TIME_POSITION=0.0\nmore"),
            Some(0.0)
        );
        assert_eq!(parse_time_position("GLOBAL: EOF code: 1\n"), None);
        assert_eq!(parse_time_position(""), None);
    }

    #[test]
    fn quote_arg_leaves_safe_urls_alone_and_quotes_the_rest() {
        assert_eq!(
            quote_arg("http://host/track.mp3"),
            "http://host/track.mp3"
        );
        assert_eq!(quote_arg("with space"), "'with space'");
        assert_eq!(quote_arg("it's"), r"'it'\''s'");
        assert_eq!(quote_arg(""), "''");
        assert_eq!(quote_arg("a;rm -rf"), "'a;rm -rf'");
    }
}
