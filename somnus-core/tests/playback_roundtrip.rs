use std::io::Cursor;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use parking_lot::Mutex;
use somnus_core::transport::sim::ChannelEvent;
use somnus_core::{
    AudioCore, AudioCoreConfig, AudioHardware, EqualizerPreset, PlaybackError, PlaybackProgress,
    SimulatedHardware,
};

fn flat_core() -> (AudioCore, SimulatedHardware) {
    let mut config = AudioCoreConfig::default();
    config.capture.read_timeout_ms = 10;
    config.playback.equalizer = EqualizerPreset::Flat;
    let (hw, sim) = AudioHardware::simulated();
    (AudioCore::new(config, hw).unwrap(), sim)
}

fn wav_i16(rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    cursor.into_inner()
}

fn wav_f32(rate: u32, channels: u16, samples: &[f32]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    cursor.into_inner()
}

fn record_progress(core: &AudioCore) -> Arc<Mutex<Vec<PlaybackProgress>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    core.on_progress(move |p| sink.lock().push(p));
    seen
}

#[test]
fn integer_container_reaches_bus_unchanged() {
    let (core, sim) = flat_core();
    let samples: Vec<i16> = (0..44_100 * 2).map(|i| ((i * 37) % 20_000 - 10_000) as i16).collect();
    core.play_container(&wav_i16(44_100, 2, &samples)).unwrap();
    assert_eq!(sim.playback.written(), samples);
}

#[test]
fn voice_equalizer_starts_each_stream_from_rest() {
    let mut config = AudioCoreConfig::default();
    config.capture.read_timeout_ms = 10;
    config.playback.equalizer = EqualizerPreset::Voice;
    let (hw, sim) = AudioHardware::simulated();
    let core = AudioCore::new(config, hw).unwrap();

    // Impulse, then a tone that is still loud on the last frame so any
    // leftover filter state would colour the next stream.
    let mut clip = vec![0i16; 4_410];
    clip[0] = 20_000;
    for (i, s) in clip.iter_mut().enumerate().skip(1) {
        *s = ((i as f32 * 0.2).sin() * 8_000.0) as i16;
    }
    let container = wav_i16(44_100, 1, &clip);

    core.play_container(&container).unwrap();
    let first = sim.playback.written();
    sim.playback.clear_written();
    core.play_container(&container).unwrap();
    let second = sim.playback.written();

    assert_eq!(first.len(), 4_410 * 2);
    // The preset actually shaped the signal.
    assert!(first.iter().step_by(2).zip(&clip).any(|(a, b)| a != b));
    assert_eq!(first, second);
}

#[test]
fn float_container_is_scaled_by_headroom() {
    let (core, sim) = flat_core();
    core.play_container(&wav_f32(44_100, 1, &vec![1.0; 4_410])).unwrap();

    let written = sim.playback.written();
    // Mono duplicated onto the stereo bus.
    assert_eq!(written.len(), 4_410 * 2);
    for &s in &written {
        assert_abs_diff_eq!(s as f32 / 32_768.0, 0.9, epsilon = 1e-4);
    }
}

#[test]
fn progress_is_monotonic_and_ends_with_stop() {
    let (core, _sim) = flat_core();
    let seen = record_progress(&core);
    core.play_container(&wav_i16(44_100, 2, &vec![100; 44_100 * 2])).unwrap();

    let seen = seen.lock();
    assert!(seen.len() > 3);
    assert!(seen.windows(2).all(|w| w[1].fraction >= w[0].fraction));
    let tail = &seen[seen.len() - 2..];
    assert_eq!(tail[0], PlaybackProgress::new(1.0, true));
    assert_eq!(tail[1], PlaybackProgress::new(1.0, false));
    assert!(seen[..seen.len() - 2].iter().all(|p| p.playing && p.fraction < 1.0));
}

#[test]
fn stop_request_ends_session_early() {
    let (core, sim) = flat_core();
    let stop = core.playback_stop_handle();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    core.on_progress(move |p| {
        sink.lock().push(p);
        if p.fraction > 0.25 {
            stop.stop();
        }
    });

    let samples = vec![100i16; 44_100 * 2];
    core.play_container(&wav_i16(44_100, 2, &samples)).unwrap();

    let seen = seen.lock();
    let last = seen.last().copied().unwrap();
    assert!(!last.playing);
    assert!(last.fraction < 1.0);
    assert!(sim.playback.written().len() < samples.len());
    assert_eq!(core.pause_depth(), 0);
}

#[test]
fn truncated_data_chunk_is_corrupt_and_capture_resumes() {
    let (core, sim) = flat_core();
    core.start().unwrap();
    let mut bytes = wav_i16(44_100, 1, &vec![7; 1_000]);
    bytes.truncate(bytes.len() - 500);

    assert!(matches!(
        core.play_container(&bytes),
        Err(PlaybackError::Corrupt(_))
    ));
    assert!(sim.playback.written().is_empty());
    assert_eq!(core.pause_depth(), 0);
    assert!(!core.is_capture_paused());
    core.shutdown().unwrap();
}

#[test]
fn nested_pause_outlives_playback() {
    let (core, _sim) = flat_core();
    core.start().unwrap();
    core.pause_capture();
    core.pause_capture();
    core.resume_capture();

    core.submit_pcm(&[10; 2_000], 16_000, 1).unwrap();
    assert!(core.is_capture_paused());

    core.resume_capture();
    assert!(!core.is_capture_paused());
    core.shutdown().unwrap();
}

#[test]
fn matching_rate_does_not_reconfigure_again() {
    let (core, sim) = flat_core();
    let clip = wav_i16(22_050, 2, &vec![1; 2_000]);

    core.play_container(&clip).unwrap();
    let after_first = sim.playback.events();
    assert!(after_first.contains(&ChannelEvent::RateSet(22_050)));

    sim.registers.clear_log();
    core.play_container(&clip).unwrap();
    assert_eq!(sim.playback.events(), after_first);
    assert!(sim.registers.writes().is_empty());
}

#[test]
fn unclockable_rate_is_resampled_to_default() {
    let (core, sim) = flat_core();
    let frames = 37_000;
    core.submit_pcm(&vec![1_000; frames], 37_000, 1).unwrap();

    assert!(!sim
        .playback
        .events()
        .iter()
        .any(|e| *e == ChannelEvent::RateSet(37_000)));
    let written_frames = sim.playback.written().len() / 2;
    assert_abs_diff_eq!(written_frames as f64, 44_100.0, epsilon = 44_100.0 * 0.05);
}

#[test]
fn pcm_with_too_many_channels_is_rejected() {
    let (core, sim) = flat_core();
    assert!(matches!(
        core.submit_pcm(&[0; 600], 16_000, 3),
        Err(PlaybackError::Unsupported(_))
    ));
    assert!(sim.playback.written().is_empty());
}

#[test]
fn undecodable_compressed_stream_is_corrupt() {
    let (core, _sim) = flat_core();
    let mut progress = core.subscribe_progress();
    let noise: Vec<u8> = (0..8_192u32).map(|i| (i * 7 % 251) as u8).collect();

    assert!(matches!(
        core.play_compressed_stream(Cursor::new(noise), Some(8_192)),
        Err(PlaybackError::Corrupt(_))
    ));
    assert!(progress.try_recv().is_err());
    assert_eq!(core.pause_depth(), 0);
}
