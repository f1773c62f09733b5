//! Register profiles: ordered register operations plus the clock parameters
//! they were derived from.
//!
//! Derivation is a pure function of `(role, sample rate, master-clock source)`.
//! Deriving twice for the same inputs yields identical operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{es7210, es8311, CodecRole};
use crate::error::CodecError;

/// Rates the clock tree can produce with integer dividers.
pub const SUPPORTED_SAMPLE_RATES: [u32; 8] =
    [8_000, 11_025, 16_000, 22_050, 24_000, 32_000, 44_100, 48_000];

/// Master clock is always 256 × LRCK.
pub const MCLK_FS_RATIO: u32 = 256;

/// 16-bit samples in a two-slot frame.
pub const BCLK_FS_RATIO: u32 = 32;

/// Bit-clock divider. The codecs run as bus slaves, so this is fixed.
pub const BCLK_DIV: u8 = 4;

/// Oversampling ratio register value for ADC and DAC in single-speed mode.
pub const SINGLE_SPEED_OSR: u8 = 0x10;

pub fn is_supported_sample_rate(hz: u32) -> bool {
    SUPPORTED_SAMPLE_RATES.contains(&hz)
}

/// Where the codec's master clock comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MclkSource {
    /// A dedicated MCLK line at 256 × fs.
    External,
    /// Generated inside the codec by multiplying the bit clock.
    FromBitClock,
}

/// `(source, multiplier, register code)`.
const PRE_MULTI_TABLE: [(MclkSource, u8, u8); 2] = [
    (MclkSource::External, 1, 0),
    (MclkSource::FromBitClock, 8, 3),
];

impl MclkSource {
    fn pre_multi(self) -> (u8, u8) {
        PRE_MULTI_TABLE
            .iter()
            .find(|(source, _, _)| *source == self)
            .map(|&(_, multi, code)| (multi, code))
            .unwrap_or((1, 0))
    }
}

/// Clock-tree parameters for one sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockParams {
    pub sample_rate: u32,
    pub mclk_source: MclkSource,
    pub mclk_hz: u32,
    pub bclk_hz: u32,
    pub pre_div: u8,
    pub pre_multi: u8,
    /// Register encoding of `pre_multi` (0 = ×1 … 3 = ×8).
    pub pre_multi_code: u8,
    pub adc_div: u8,
    pub dac_div: u8,
    /// 0 = single speed.
    pub fs_mode: u8,
    pub adc_osr: u8,
    pub dac_osr: u8,
    /// LRCK divider minus one, 12 bits.
    pub lrck_div: u16,
    pub bclk_div: u8,
}

impl ClockParams {
    /// # Errors
    /// [`CodecError::UnsupportedSampleRate`] for rates outside
    /// [`SUPPORTED_SAMPLE_RATES`].
    pub fn derive(sample_rate: u32, mclk_source: MclkSource) -> Result<Self, CodecError> {
        if !is_supported_sample_rate(sample_rate) {
            return Err(CodecError::UnsupportedSampleRate(sample_rate));
        }
        let (pre_multi, pre_multi_code) = mclk_source.pre_multi();
        let bclk_hz = sample_rate * BCLK_FS_RATIO;
        let mclk_hz = sample_rate * MCLK_FS_RATIO;
        let pre_div = 1u8;
        // Internal clock after pre-divider and multiplier must equal MCLK.
        let source_hz = match mclk_source {
            MclkSource::External => mclk_hz,
            MclkSource::FromBitClock => bclk_hz,
        };
        let internal_hz = source_hz / pre_div as u32 * pre_multi as u32;
        let lrck_div = (internal_hz / sample_rate).saturating_sub(1) as u16;

        Ok(Self {
            sample_rate,
            mclk_source,
            mclk_hz,
            bclk_hz,
            pre_div,
            pre_multi,
            pre_multi_code,
            adc_div: 1,
            dac_div: 1,
            fs_mode: 0,
            adc_osr: SINGLE_SPEED_OSR,
            dac_osr: SINGLE_SPEED_OSR,
            lrck_div,
            bclk_div: BCLK_DIV,
        })
    }
}

/// One step of a register sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOp {
    Write {
        reg: u8,
        value: u8,
        settle: Duration,
    },
    /// Read-modify-write: `(current & keep_mask) | bits`.
    Update {
        reg: u8,
        keep_mask: u8,
        bits: u8,
        settle: Duration,
    },
}

impl RegisterOp {
    pub const fn write(reg: u8, value: u8) -> Self {
        Self::Write {
            reg,
            value,
            settle: Duration::ZERO,
        }
    }

    pub const fn update(reg: u8, keep_mask: u8, bits: u8) -> Self {
        Self::Update {
            reg,
            keep_mask,
            bits,
            settle: Duration::ZERO,
        }
    }

    /// Attach a post-write delay.
    pub const fn settle_ms(self, ms: u64) -> Self {
        let settle = Duration::from_millis(ms);
        match self {
            Self::Write { reg, value, .. } => Self::Write { reg, value, settle },
            Self::Update {
                reg,
                keep_mask,
                bits,
                ..
            } => Self::Update {
                reg,
                keep_mask,
                bits,
                settle,
            },
        }
    }

    pub fn reg(&self) -> u8 {
        match *self {
            Self::Write { reg, .. } | Self::Update { reg, .. } => reg,
        }
    }

    pub fn settle(&self) -> Duration {
        match *self {
            Self::Write { settle, .. } | Self::Update { settle, .. } => settle,
        }
    }
}

/// Clock-divider writes needed to move a codec to `sample_rate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecRegisterProfile {
    pub role: CodecRole,
    pub sample_rate: u32,
    pub clock: ClockParams,
    pub ops: Vec<RegisterOp>,
}

impl CodecRegisterProfile {
    pub fn derive(
        role: CodecRole,
        sample_rate: u32,
        mclk_source: MclkSource,
    ) -> Result<Self, CodecError> {
        let clock = ClockParams::derive(sample_rate, mclk_source)?;
        let ops = match role {
            CodecRole::Playback => es8311::clock_ops(&clock),
            CodecRole::Capture => es7210::clock_ops(&clock),
        };
        Ok(Self {
            role,
            sample_rate,
            clock,
            ops,
        })
    }
}
