//! RIFF/WAVE container indexing and sample decoding.
//!
//! The whole container is indexed before any hardware is touched, so a bad
//! file is rejected while the bus is still at its previous configuration.
//!
//! ```text
//! "RIFF" <u32 size> "WAVE" { <id:4> <u32 len> <body:len> [pad] }*
//! ```
//!
//! Indexing walks the chunk list. A chunk whose id is not printable ASCII or
//! whose declared length overruns the file is treated as damage: the walker
//! scans forward for the next recognizable chunk id and carries on. Only
//! when nothing usable can be found (or the data chunk itself is cut short)
//! is the container reported as corrupt.

use tracing::{debug, warn};

use crate::error::PlaybackError;

const FORMAT_PCM: u16 = 0x0001;
const FORMAT_IEEE_FLOAT: u16 = 0x0003;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Chunk ids the resync scan will lock on to.
const KNOWN_CHUNKS: [&[u8; 4]; 10] = [
    b"fmt ", b"data", b"LIST", b"fact", b"JUNK", b"cue ", b"smpl", b"bext", b"id3 ", b"PAD ",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Unsigned 8-bit, silence at 128.
    PcmU8,
    PcmI16,
    /// Signed 24-bit packed in three bytes.
    PcmI24,
    Float32,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::PcmU8 => 1,
            SampleEncoding::PcmI16 => 2,
            SampleEncoding::PcmI24 => 3,
            SampleEncoding::Float32 => 4,
        }
    }

    pub fn is_float(self) -> bool {
        self == SampleEncoding::Float32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerFormat {
    pub encoding: SampleEncoding,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl ContainerFormat {
    pub fn block_align(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }
}

/// Result of indexing a container: the format plus the sample payload.
#[derive(Debug, Clone)]
pub struct ContainerLayout<'a> {
    pub format: ContainerFormat,
    /// Whole frames only; a trailing partial frame is dropped.
    pub data: &'a [u8],
    /// Damaged regions skipped while indexing.
    pub resyncs: usize,
}

impl ContainerLayout<'_> {
    pub fn total_frames(&self) -> usize {
        self.data.len() / self.format.block_align()
    }
}

fn corrupt(msg: impl Into<String>) -> PlaybackError {
    PlaybackError::Corrupt(msg.into())
}

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn plausible_id(id: &[u8]) -> bool {
    id.iter().all(|&c| (0x20..=0x7E).contains(&c))
}

/// Offset of the next known chunk header at or after `from`.
fn resync(bytes: &[u8], from: usize) -> Option<usize> {
    (from..bytes.len().saturating_sub(7))
        .find(|&i| KNOWN_CHUNKS.iter().any(|id| &bytes[i..i + 4] == id.as_slice()))
}

/// Index a RIFF/WAVE container.
///
/// # Errors
/// - [`PlaybackError::Unsupported`] for a non-WAVE file or an encoding the
///   decoder does not handle.
/// - [`PlaybackError::Corrupt`] for a missing format/data chunk or a data
///   chunk shorter than declared.
pub fn parse(bytes: &[u8]) -> Result<ContainerLayout<'_>, PlaybackError> {
    if bytes.len() < 12 {
        return Err(corrupt(format!("{} bytes is too short for a header", bytes.len())));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(PlaybackError::Unsupported("not a RIFF/WAVE container".into()));
    }

    let mut format: Option<ContainerFormat> = None;
    let mut data: Option<&[u8]> = None;
    let mut resyncs = 0usize;
    let mut pos = 12usize;

    while pos + 8 <= bytes.len() && (format.is_none() || data.is_none()) {
        let id = &bytes[pos..pos + 4];
        let len = u32_at(bytes, pos + 4) as usize;
        let body = pos + 8;
        let end = body.checked_add(len);
        let fits = end.is_some_and(|e| e <= bytes.len());

        if !plausible_id(id) {
            match resync(bytes, pos + 1) {
                Some(next) => {
                    warn!(at = pos, next, "unrecognizable chunk header, resyncing");
                    resyncs += 1;
                    pos = next;
                    continue;
                }
                None => break,
            }
        }

        match id {
            b"data" => {
                if !fits {
                    return Err(corrupt(format!(
                        "data chunk truncated: {len} bytes declared, {} present",
                        bytes.len() - body
                    )));
                }
                data = Some(&bytes[body..body + len]);
            }
            b"fmt " if fits && len >= 16 => {
                format = Some(parse_format(&bytes[body..body + len])?);
            }
            _ if fits => {
                debug!(
                    chunk = String::from_utf8_lossy(id).as_ref(),
                    len, "skipping chunk"
                );
            }
            _ => {
                // Malformed fmt or an overrunning auxiliary chunk.
                match resync(bytes, pos + 1) {
                    Some(next) => {
                        warn!(
                            chunk = String::from_utf8_lossy(id).as_ref(),
                            at = pos,
                            next,
                            "malformed chunk, resyncing"
                        );
                        resyncs += 1;
                        pos = next;
                        continue;
                    }
                    None => break,
                }
            }
        }
        // Chunks are padded to even length.
        pos = body + len + (len & 1);
    }

    let format = format.ok_or_else(|| corrupt("no usable format chunk"))?;
    let data = data.ok_or_else(|| corrupt("no data chunk"))?;
    let whole = data.len() - data.len() % format.block_align();
    Ok(ContainerLayout {
        format,
        data: &data[..whole],
        resyncs,
    })
}

fn parse_format(body: &[u8]) -> Result<ContainerFormat, PlaybackError> {
    let mut tag = u16_at(body, 0);
    let channels = u16_at(body, 2);
    let sample_rate = u32_at(body, 4);
    let bits_per_sample = u16_at(body, 14);

    if tag == FORMAT_EXTENSIBLE {
        // cbSize(2) validBits(2) channelMask(4) subFormat GUID(16)
        if body.len() < 40 {
            return Err(corrupt("extensible format chunk too short"));
        }
        tag = u16_at(body, 24);
    }
    if channels == 0 || sample_rate == 0 {
        return Err(corrupt(format!(
            "format declares {channels} channels at {sample_rate} Hz"
        )));
    }

    let encoding = match (tag, bits_per_sample) {
        (FORMAT_PCM, 8) => SampleEncoding::PcmU8,
        (FORMAT_PCM, 16) => SampleEncoding::PcmI16,
        (FORMAT_PCM, 24) => SampleEncoding::PcmI24,
        (FORMAT_IEEE_FLOAT, 32) => SampleEncoding::Float32,
        (tag, bits) => {
            return Err(PlaybackError::Unsupported(format!(
                "format tag 0x{tag:04x} with {bits} bits per sample"
            )))
        }
    };

    Ok(ContainerFormat {
        encoding,
        channels,
        sample_rate,
        bits_per_sample,
    })
}

/// Decode whole frames of `bytes` to normalized floats, appending to `out`.
pub fn decode_into(encoding: SampleEncoding, bytes: &[u8], out: &mut Vec<f32>) {
    let width = encoding.bytes_per_sample();
    out.reserve(bytes.len() / width);
    for b in bytes.chunks_exact(width) {
        let s = match encoding {
            SampleEncoding::PcmU8 => (b[0] as f32 - 128.0) / 128.0,
            SampleEncoding::PcmI16 => i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0,
            SampleEncoding::PcmI24 => {
                let v = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                v as f32 / 8_388_608.0
            }
            SampleEncoding::Float32 => {
                let v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                if v.is_finite() {
                    v
                } else {
                    0.0
                }
            }
        };
        out.push(s);
    }
}
