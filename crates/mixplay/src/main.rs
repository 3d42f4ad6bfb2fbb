//! Mixplay — play a queue of track URLs through an external player backend.
//!
//! The heavy lifting lives in the `player-control` crate; this binary is the
//! session layer: it creates the configured backend, registers event
//! handlers, and drives the queue — advancing on song end and logging when a
//! track crosses the report threshold.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use player_control::{
    BackendKind, EventBridge, MpdConfig, PlaybackState, PlayerConfig, PlayerEvent, SlaveConfig,
    create_backend,
};

#[derive(Parser, Debug)]
#[command(name = "mixplay", version)]
struct Args {
    /// Track URLs to play, in order
    #[arg(required = true)]
    urls: Vec<String>,

    /// Which backend drives playback
    #[arg(long, value_enum, default_value_t = BackendArg::Slave)]
    backend: BackendArg,

    /// Player binary for the slave backend
    #[arg(long, default_value = "mplayer")]
    player: String,

    /// Extra argument for the player binary (repeatable)
    #[arg(long = "player-arg")]
    player_args: Vec<String>,

    /// Daemon host for the mpd backend
    #[arg(long, default_value = "127.0.0.1")]
    mpd_host: String,

    /// Daemon port for the mpd backend
    #[arg(long, default_value_t = 6600)]
    mpd_port: u16,

    /// Initial playback volume (0-100)
    #[arg(long)]
    volume: Option<u8>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Slave,
    Mpd,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = PlayerConfig {
        backend: match args.backend {
            BackendArg::Slave => BackendKind::Slave,
            BackendArg::Mpd => BackendKind::Mpd,
        },
        slave: SlaveConfig {
            player_path: args.player.clone(),
            extra_args: args.player_args.clone(),
            ..SlaveConfig::default()
        },
        mpd: MpdConfig {
            host: args.mpd_host.clone(),
            port: args.mpd_port,
            ..MpdConfig::default()
        },
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_for_signal = shutdown.clone();
    let _ = ctrlc::set_handler(move || {
        shutdown_for_signal.store(true, Ordering::SeqCst);
    });

    let mut bridge = EventBridge::new();
    let advance = Arc::new(AtomicBool::new(false));
    let report = Arc::new(AtomicBool::new(false));
    {
        let advance = advance.clone();
        let report = report.clone();
        bridge.on_event(move |event| match event {
            PlayerEvent::SongEnded => advance.store(true, Ordering::SeqCst),
            PlayerEvent::ReportThreshold => report.store(true, Ordering::SeqCst),
        });
    }

    let mut backend = create_backend(&config, bridge.emitter()).context("start player backend")?;
    let mut queue: VecDeque<String> = args.urls.into();
    let Some(mut current) = queue.pop_front() else {
        return Ok(());
    };

    tracing::info!(url = %current, "playing");
    backend.load(&current)?;
    if let Some(volume) = args.volume {
        backend.set_volume(volume)?;
    }

    loop {
        bridge.dispatch_wait(Duration::from_millis(250));

        if shutdown.load(Ordering::SeqCst) {
            tracing::info!("shutting down");
            backend.terminate();
            break;
        }
        if report.swap(false, Ordering::SeqCst) {
            // A wired-up mix service would report the play here.
            tracing::info!(url = %current, "track crossed the report threshold");
        }
        if advance.swap(false, Ordering::SeqCst) {
            match queue.pop_front() {
                Some(next) => {
                    current = next;
                    tracing::info!(url = %current, "playing next track");
                    backend.load(&current)?;
                    if let Some(volume) = args.volume {
                        backend.set_volume(volume)?;
                    }
                }
                None => {
                    tracing::info!("queue finished");
                    backend.terminate();
                    break;
                }
            }
        }
        if backend.state() == PlaybackState::Terminated {
            break;
        }
    }

    Ok(())
}
