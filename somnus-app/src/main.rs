//! Somnus device host.
//!
//! Wires the audio core to simulated hardware (default) or, with the
//! `host-audio` feature, to the host sound card, then runs the device loop:
//!
//! ```text
//! listen ──trigger──► record phrase ──► (save WAV) ──► play response ──► listen
//! ```
//!
//! Core calls block, so each trigger is handled on the blocking pool.

mod respond;
mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use settings::{apply_env_overrides, default_settings_path, load_settings, DeviceSettings};
use somnus_core::transport::sim::SimulatedChannel;
use somnus_core::{AudioCore, AudioCoreConfig, AudioHardware, TriggerEvent};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};

use respond::{scripted_microphone, Response};

const DEFAULT_LOG_FILTER: &str = "somnus=info,somnus_core=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = std::env::var_os("SOMNUS_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    apply_env_overrides(&mut settings);
    info!(
        path = %settings_path.display(),
        hardware = %settings.hardware,
        threshold = settings.trigger_threshold,
        "settings loaded"
    );

    // ── Core ──────────────────────────────────────────────────────────────
    let config = settings.core_config();
    let hardware = build_hardware(&settings, &config)?;
    let core = Arc::new(AudioCore::new(config, hardware).context("audio core init")?);
    let (capture_ok, playback_ok) = core.codec_paths_verified();
    if !(capture_ok && playback_ok) {
        warn!(capture_ok, playback_ok, "codec path verification failed; audio may be silent");
    }

    let response = match Response::load(settings.response_file.as_deref()) {
        Ok(r) => r,
        Err(e) => {
            warn!("response file unusable, falling back to chime: {e:#}");
            Response::load(None)?
        }
    };
    let response = Arc::new(response);

    spawn_status_logger(&core);
    core.on_progress(|p| debug!(fraction = p.fraction, playing = p.playing, "progress"));
    core.start()?;
    info!("listening");

    // ── Device loop ───────────────────────────────────────────────────────
    let mut triggers = core.subscribe_triggers();
    let record_for = Duration::from_secs_f32(settings.record_seconds);
    let recordings_dir = settings
        .save_recordings
        .then(|| settings.recordings_dir(&settings_path));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            received = triggers.recv() => match received {
                Ok(event) => {
                    let core = Arc::clone(&core);
                    let response = Arc::clone(&response);
                    let dir = recordings_dir.clone();
                    let outcome = tokio::task::spawn_blocking(move || {
                        handle_trigger(&core, &event, record_for, dir.as_deref(), &response)
                    })
                    .await?;
                    if let Err(e) = outcome {
                        warn!("trigger handling failed: {e:#}");
                    }
                    // Events raised by the phrase itself are stale by now.
                    let stale = drain(&mut triggers);
                    if stale > 0 {
                        debug!(stale, "discarded triggers raised during response");
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("trigger receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    let stats = core.capture_stats();
    let memory = core.memory_usage();
    let core_for_shutdown = Arc::clone(&core);
    tokio::task::spawn_blocking(move || core_for_shutdown.shutdown()).await??;
    info!(?stats, ?memory, "somnus stopped");
    Ok(())
}

fn handle_trigger(
    core: &AudioCore,
    event: &TriggerEvent,
    record_for: Duration,
    recordings_dir: Option<&Path>,
    response: &Response,
) -> anyhow::Result<()> {
    info!(seq = event.seq, score = event.score, "trigger phrase detected");
    let recording = core.record_trigger_phrase(record_for)?;
    info!(
        seconds = recording.duration().as_secs_f32(),
        rms = recording.rms(),
        peak = recording.peak(),
        "phrase recorded"
    );

    if let Some(dir) = recordings_dir {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("trigger-{:05}.wav", event.seq));
        std::fs::write(&path, recording.to_wav_bytes()?)
            .with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "recording saved");
    }

    if recording.is_near_silent() {
        info!("nothing said after trigger; not responding");
        return Ok(());
    }
    response.play(core)?;
    Ok(())
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<TriggerEvent>) -> usize {
    let mut n = 0;
    loop {
        match rx.try_recv() {
            Ok(_) => n += 1,
            Err(TryRecvError::Lagged(k)) => n += k as usize,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return n,
        }
    }
}

fn spawn_status_logger(core: &AudioCore) {
    let mut status_rx = core.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => info!(status = ?event.status, detail = ?event.detail, "core status"),
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn build_hardware(settings: &DeviceSettings, config: &AudioCoreConfig) -> anyhow::Result<AudioHardware> {
    if settings.hardware == "host" {
        return host_hardware(config);
    }
    Ok(simulated_hardware(config))
}

fn simulated_hardware(config: &AudioCoreConfig) -> AudioHardware {
    let capture = SimulatedChannel::generated(
        config.capture.sample_rate,
        config.capture.channels,
        scripted_microphone(config.capture.sample_rate),
    );
    let playback = SimulatedChannel::paced_playback(
        config.playback.default_sample_rate,
        config.playback.bus_channels,
    );
    let (hardware, _sim) = AudioHardware::simulated_with(capture, playback);
    info!("using simulated audio hardware");
    hardware
}

#[cfg(feature = "host-audio")]
fn host_hardware(config: &AudioCoreConfig) -> anyhow::Result<AudioHardware> {
    use somnus_core::codec::{sim::SimulatedCodecBus, RegisterBusHandle};
    use somnus_core::{HostCaptureChannel, HostPlaybackChannel};

    let capture = HostCaptureChannel::open(config.capture.sample_rate, config.capture.channels)
        .context("open host input device")?;
    let playback = HostPlaybackChannel::open(
        config.playback.default_sample_rate,
        config.playback.bus_channels,
    )
    .context("open host output device")?;
    info!("using host sound card");
    // A sound card has no codec registers; the simulated bus absorbs the sequences.
    Ok(AudioHardware {
        register_bus: RegisterBusHandle::new(SimulatedCodecBus::new()),
        capture_channel: Box::new(capture),
        playback_channel: Box::new(playback),
    })
}

#[cfg(not(feature = "host-audio"))]
fn host_hardware(config: &AudioCoreConfig) -> anyhow::Result<AudioHardware> {
    warn!("built without the host-audio feature; using simulated hardware");
    Ok(simulated_hardware(config))
}
