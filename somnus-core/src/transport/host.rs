//! Host sound-card bus channels via cpal.
//!
//! # Design constraints
//!
//! cpal callbacks run on an OS audio thread at elevated priority and must not
//! block. They only touch an SPSC ring (`ringbuf`), whose `push_slice` /
//! `try_pop` are lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. Each channel therefore owns a
//! small keep-alive thread that builds the stream, reports the device format
//! back over a sync channel, and drops the stream on the same thread when the
//! channel is dropped.
//!
//! The sound card runs at its native rate; the channel converts between that
//! and the bus rate with [`RateConverter`], so `set_sample_rate` never has to
//! reopen the device.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SizedSample, Stream, StreamConfig,
};
use tracing::{error, info, warn};

use super::{BusChannel, Direction};
use crate::audio::resample::RateConverter;
use crate::buffering::{
    create_host_ring, Consumer, HostConsumer, HostProducer, Observer, Producer,
    HOST_RING_CAPACITY,
};
use crate::error::TransportError;

const RESAMPLE_CHUNK: usize = 480;
const KEEPALIVE_POLL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy)]
struct DeviceFormat {
    sample_rate: u32,
    channels: u16,
}

struct StreamThread {
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn stream_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Channel(e.to_string())
}

fn spawn_stream<F>(name: &str, build: F) -> Result<(StreamThread, DeviceFormat), TransportError>
where
    F: FnOnce() -> Result<(Stream, DeviceFormat), TransportError> + Send + 'static,
{
    let (open_tx, open_rx) = mpsc::channel::<Result<DeviceFormat, TransportError>>();
    let alive = Arc::new(AtomicBool::new(true));
    let alive_thread = Arc::clone(&alive);

    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok((stream, format)) => {
                    if let Err(e) = stream.play() {
                        let _ = open_tx.send(Err(stream_err(e)));
                        return;
                    }
                    let _ = open_tx.send(Ok(format));
                    stream
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            while alive_thread.load(Ordering::Acquire) {
                std::thread::sleep(KEEPALIVE_POLL);
            }
            drop(stream);
        })
        .map_err(|e| TransportError::Channel(format!("spawn stream thread: {e}")))?;

    let thread = StreamThread {
        alive,
        handle: Some(handle),
    };
    let format = open_rx
        .recv()
        .map_err(|_| TransportError::Channel("stream thread exited during open".into()))??;
    Ok((thread, format))
}

// ── Capture ─────────────────────────────────────────────────────────────────

/// Default input device presented as the capture bus channel.
pub struct HostCaptureChannel {
    consumer: HostConsumer,
    enabled: Arc<AtomicBool>,
    device: DeviceFormat,
    bus_rate: u32,
    bus_channels: u16,
    converter: RateConverter,
    scratch: Vec<i16>,
    pending: VecDeque<i16>,
    _thread: StreamThread,
}

impl HostCaptureChannel {
    pub fn open(bus_rate: u32, bus_channels: u16) -> Result<Self, TransportError> {
        let (producer, consumer) = create_host_ring(HOST_RING_CAPACITY);
        let enabled = Arc::new(AtomicBool::new(false));
        let enabled_cb = Arc::clone(&enabled);

        let (thread, device) = spawn_stream("somnus-host-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| TransportError::Channel("no default input device".into()))?;
            let supported = device.default_input_config().map_err(stream_err)?;
            let format = DeviceFormat {
                sample_rate: supported.sample_rate().0,
                channels: supported.channels(),
            };
            info!(
                device = device.name().unwrap_or_default().as_str(),
                sample_rate = format.sample_rate,
                channels = format.channels,
                "opening input device"
            );
            let config: StreamConfig = supported.config();
            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_input::<f32>(&device, &config, producer, enabled_cb, |s| {
                    (s.clamp(-1.0, 1.0) * 32767.0) as i16
                }),
                SampleFormat::I16 => build_input::<i16>(&device, &config, producer, enabled_cb, |s| s),
                SampleFormat::U16 => build_input::<u16>(&device, &config, producer, enabled_cb, |s| {
                    (s as i32 - 32768) as i16
                }),
                fmt => Err(TransportError::Channel(format!(
                    "unsupported input sample format: {fmt:?}"
                ))),
            }?;
            Ok((stream, format))
        })?;

        Ok(Self {
            consumer,
            enabled,
            device,
            bus_rate,
            bus_channels: bus_channels.max(1),
            converter: RateConverter::new(device.sample_rate, bus_rate, 1, RESAMPLE_CHUNK)?,
            scratch: vec![0; 4096],
            pending: VecDeque::new(),
            _thread: thread,
        })
    }

    fn drain_ring(&mut self) {
        loop {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                break;
            }
            for s in self.converter.process(&self.scratch[..n]) {
                for _ in 0..self.bus_channels {
                    self.pending.push_back(s);
                }
            }
        }
    }
}

fn build_input<T: SizedSample + Send + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HostProducer,
    enabled: Arc<AtomicBool>,
    to_i16: fn(T) -> i16,
) -> Result<Stream, TransportError> {
    let ch = config.channels.max(1) as usize;
    let mut mix: Vec<i16> = Vec::with_capacity(8192);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !enabled.load(Ordering::Relaxed) {
                    return;
                }
                mix.clear();
                for frame in data.chunks_exact(ch) {
                    let sum: i32 = frame.iter().map(|&s| to_i16(s) as i32).sum();
                    mix.push((sum / ch as i32) as i16);
                }
                let written = producer.push_slice(&mix);
                if written < mix.len() {
                    warn!("host capture ring full: dropped {} samples", mix.len() - written);
                }
            },
            |err| error!("capture stream error: {err}"),
            None,
        )
        .map_err(stream_err)
}

impl BusChannel for HostCaptureChannel {
    fn direction(&self) -> Direction {
        Direction::Capture
    }

    fn read(&mut self, out: &mut [i16], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_ring();
            if !self.pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(READ_POLL);
        }
        let n = out.len().min(self.pending.len());
        for (dst, src) in out.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn enable(&mut self) -> Result<(), TransportError> {
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable(&mut self) -> Result<(), TransportError> {
        self.enabled.store(false, Ordering::Release);
        self.pending.clear();
        Ok(())
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), TransportError> {
        self.converter = RateConverter::new(self.device.sample_rate, hz, 1, RESAMPLE_CHUNK)?;
        self.bus_rate = hz;
        self.pending.clear();
        Ok(())
    }
}

// ── Playback ────────────────────────────────────────────────────────────────

/// Default output device presented as the playback bus channel.
pub struct HostPlaybackChannel {
    producer: HostProducer,
    enabled: Arc<AtomicBool>,
    device: DeviceFormat,
    bus_rate: u32,
    bus_channels: u16,
    converter: RateConverter,
    staged: Vec<i16>,
    _thread: StreamThread,
}

impl HostPlaybackChannel {
    pub fn open(bus_rate: u32, bus_channels: u16) -> Result<Self, TransportError> {
        let (producer, consumer) = create_host_ring(HOST_RING_CAPACITY);
        let enabled = Arc::new(AtomicBool::new(false));
        let enabled_cb = Arc::clone(&enabled);

        let (thread, device) = spawn_stream("somnus-host-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| TransportError::Channel("no default output device".into()))?;
            let supported = device.default_output_config().map_err(stream_err)?;
            let format = DeviceFormat {
                sample_rate: supported.sample_rate().0,
                channels: supported.channels(),
            };
            info!(
                device = device.name().unwrap_or_default().as_str(),
                sample_rate = format.sample_rate,
                channels = format.channels,
                "opening output device"
            );
            let config: StreamConfig = supported.config();
            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &config, consumer, enabled_cb, |s| {
                    s as f32 / 32768.0
                }),
                SampleFormat::I16 => build_output::<i16>(&device, &config, consumer, enabled_cb, |s| s),
                SampleFormat::U16 => build_output::<u16>(&device, &config, consumer, enabled_cb, |s| {
                    (s as i32 + 32768) as u16
                }),
                fmt => Err(TransportError::Channel(format!(
                    "unsupported output sample format: {fmt:?}"
                ))),
            }?;
            Ok((stream, format))
        })?;

        let bus_channels = bus_channels.max(1);
        Ok(Self {
            producer,
            enabled,
            device,
            bus_rate,
            bus_channels,
            converter: RateConverter::new(bus_rate, device.sample_rate, bus_channels, RESAMPLE_CHUNK)?,
            staged: Vec::new(),
            _thread: thread,
        })
    }

    /// Map converted bus-layout samples onto the device channel layout.
    fn stage(&mut self, converted: &[i16]) {
        let src = self.bus_channels as usize;
        let dst = self.device.channels.max(1) as usize;
        for frame in converted.chunks_exact(src) {
            for c in 0..dst {
                self.staged.push(frame[c.min(src - 1)]);
            }
        }
    }
}

fn build_output<T: SizedSample + Send + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HostConsumer,
    enabled: Arc<AtomicBool>,
    from_i16: fn(i16) -> T,
) -> Result<Stream, TransportError> {
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let live = enabled.load(Ordering::Relaxed);
                for out in data.iter_mut() {
                    let s = if live { consumer.try_pop().unwrap_or(0) } else { 0 };
                    *out = from_i16(s);
                }
            },
            |err| error!("playback stream error: {err}"),
            None,
        )
        .map_err(stream_err)
}

impl BusChannel for HostPlaybackChannel {
    fn direction(&self) -> Direction {
        Direction::Playback
    }

    fn write(&mut self, samples: &[i16], _timeout: Duration) -> Result<usize, TransportError> {
        // Flush anything left over from a previous partial push first.
        if !self.staged.is_empty() {
            let n = self.producer.push_slice(&self.staged);
            self.staged.drain(..n);
            if !self.staged.is_empty() {
                return Ok(0);
            }
        }
        let whole = samples.len() - samples.len() % self.bus_channels as usize;
        let converted = self.converter.process(&samples[..whole]);
        self.stage(&converted);
        let n = self.producer.push_slice(&self.staged);
        self.staged.drain(..n);
        Ok(whole)
    }

    fn enable(&mut self) -> Result<(), TransportError> {
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable(&mut self) -> Result<(), TransportError> {
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), TransportError> {
        let tail = self.converter.flush();
        self.stage(&tail);
        self.converter =
            RateConverter::new(hz, self.device.sample_rate, self.bus_channels, RESAMPLE_CHUNK)?;
        self.bus_rate = hz;
        if self.producer.is_full() {
            warn!("host playback ring full during rate change");
        }
        Ok(())
    }
}
