use std::time::Duration;

use thiserror::Error;

use crate::memory::MemoryTier;

/// Failure on the register bus shared by the codec chips.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no acknowledge from device 0x{addr:02x}")]
    Nack { addr: u8 },

    #[error("register bus timed out")]
    Timeout,

    #[error("register bus error: {0}")]
    Other(String),
}

/// Codec register sequencing errors.
///
/// Probe and path-verification failures are *degraded* conditions: the codec
/// may still pass audio on some board revisions, so callers log and continue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{chip} probe failed: {source}")]
    ProbeFailed {
        chip: &'static str,
        #[source]
        source: BusError,
    },

    #[error("{chip} output path not enabled: register 0x{register:02x} read back 0x{readback:02x}")]
    PathNotEnabled {
        chip: &'static str,
        register: u8,
        readback: u8,
    },

    #[error("register write 0x{register:02x} on {chip} failed: {source}")]
    RegisterWrite {
        chip: &'static str,
        register: u8,
        #[source]
        source: BusError,
    },

    #[error("sample rate {0} Hz is not supported by the codec clock tree")]
    UnsupportedSampleRate(u32),

    #[error("codec has not been initialised")]
    NotInitialized,
}

impl CodecError {
    /// `true` for conditions that leave the codec usable (possibly silent).
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            CodecError::ProbeFailed { .. } | CodecError::PathNotEnabled { .. }
        )
    }
}

/// A memory pool could not satisfy an allocation.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("out of memory: {requested} bytes requested for {tier:?} buffer")]
pub struct OutOfMemory {
    pub requested: usize,
    pub tier: MemoryTier,
}

/// Audio bus transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No data arrived within the caller's timeout. Not a fault.
    #[error("bus transfer timed out")]
    Timeout,

    #[error("bus stalled: {transferred} of {expected} samples moved in {waited:?}")]
    Stalled {
        transferred: usize,
        expected: usize,
        waited: Duration,
    },

    #[error("frame of {len} samples is not a multiple of {channels} channels")]
    MalformedFrame { len: usize, channels: u16 },

    #[error("frame has {frame} channel(s) but the bus carries {bus}")]
    ChannelMismatch { frame: u16, bus: u16 },

    #[error("operation not supported on the {0} channel")]
    WrongDirection(&'static str),

    #[error("bus channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// Playback session errors. Each aborts the current session only.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("corrupt stream: {0}")]
    Corrupt(String),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("stream source stalled for {0:?}")]
    SourceStalled(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    #[error("stream read error: {0}")]
    Io(#[from] std::io::Error),
}

/// All errors produced by somnus-core.
#[derive(Debug, Error)]
pub enum SomnusError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    #[error("audio core is already running")]
    AlreadyRunning,

    #[error("audio core is not running")]
    NotRunning,

    #[error("task '{0}' did not exit within the stop deadline")]
    StopTimeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SomnusError>;
