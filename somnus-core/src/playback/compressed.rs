//! Compressed (MP3) stream input.
//!
//! [`ReadAhead`] sits between a possibly slow source and the frame decoder:
//!
//! - it is filled completely before the first frame is decoded;
//! - it is refilled only once it drops below half capacity, so slow storage
//!   is read in large batches;
//! - a source that reports `WouldBlock` is waited on (up to the stall bound)
//!   only when the buffer is empty, since dropping playback data is audible.
//!
//! MP3 frames are self-synchronizing, so the decoder skips damaged regions on
//! its own; skipped regions are counted, not treated as fatal.

use std::io::{self, ErrorKind, Read};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::PlaybackError;

const SOURCE_POLL: Duration = Duration::from_millis(2);

/// Read-ahead buffer over a byte source.
pub struct ReadAhead<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    stall: Duration,
    /// Bytes handed to the decoder so far.
    consumed: Arc<AtomicU64>,
    refills: u64,
}

impl<R: Read> ReadAhead<R> {
    pub fn new(inner: R, capacity: usize, stall: Duration) -> Self {
        Self {
            inner,
            buf: vec![0; capacity.max(64)],
            start: 0,
            end: 0,
            eof: false,
            stall,
            consumed: Arc::new(AtomicU64::new(0)),
            refills: 0,
        }
    }

    pub fn available(&self) -> usize {
        self.end - self.start
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn refills(&self) -> u64 {
        self.refills
    }

    pub fn consumed_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.consumed)
    }

    /// Fill to capacity (or end of stream) before output starts.
    ///
    /// A source that stalls part-way is tolerated as long as something was
    /// buffered.
    pub fn prefill(&mut self) -> io::Result<()> {
        match self.fill(true) {
            Err(e) if e.kind() == ErrorKind::TimedOut && self.available() > 0 => {
                warn!(buffered = self.available(), "source stalled during prefill");
                Ok(())
            }
            other => other,
        }
    }

    /// `wait_full`: keep waiting on a blocked source even when data is
    /// already buffered.
    fn fill(&mut self, wait_full: bool) -> io::Result<()> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let mut last_progress = Instant::now();
        while self.end < self.buf.len() && !self.eof {
            match self.inner.read(&mut self.buf[self.end..]) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    self.end += n;
                    last_progress = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if self.end > 0 && !wait_full {
                        break;
                    }
                    if last_progress.elapsed() >= self.stall {
                        return Err(io::Error::new(
                            ErrorKind::TimedOut,
                            format!("source made no progress for {:?}", self.stall),
                        ));
                    }
                    std::thread::sleep(SOURCE_POLL);
                }
                Err(e) => return Err(e),
            }
        }
        self.refills += 1;
        Ok(())
    }
}

impl<R: Read> Read for ReadAhead<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.available() < self.buf.len() / 2 && !self.eof {
            self.fill(false)?;
        }
        let n = out.len().min(self.available());
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// One decoded block of interleaved i16 samples.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

pub struct CompressedDecoder<R: Read> {
    decoder: minimp3::Decoder<ReadAhead<R>>,
    consumed: Arc<AtomicU64>,
    stall: Duration,
    skipped: u64,
    frames: u64,
}

impl<R: Read> CompressedDecoder<R> {
    /// Wrap `reader` and prefill the read-ahead buffer.
    pub fn new(reader: R, read_ahead_bytes: usize, stall: Duration) -> Result<Self, PlaybackError> {
        let mut ahead = ReadAhead::new(reader, read_ahead_bytes, stall);
        ahead.prefill().map_err(|e| map_io(e, stall))?;
        debug!(
            buffered = ahead.available(),
            capacity = ahead.capacity(),
            "read-ahead prefilled"
        );
        let consumed = ahead.consumed_counter();
        Ok(Self {
            decoder: minimp3::Decoder::new(ahead),
            consumed,
            stall,
            skipped: 0,
            frames: 0,
        })
    }

    /// Next audio frame, or `None` at end of stream.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>, PlaybackError> {
        loop {
            match self.decoder.next_frame() {
                Ok(frame) => {
                    if frame.data.is_empty() || frame.channels == 0 || frame.sample_rate <= 0 {
                        continue;
                    }
                    self.frames += 1;
                    return Ok(Some(DecodedFrame {
                        samples: frame.data,
                        sample_rate: frame.sample_rate as u32,
                        channels: frame.channels as u16,
                    }));
                }
                Err(minimp3::Error::SkippedData) => {
                    self.skipped += 1;
                    debug!(skipped = self.skipped, "skipped undecodable data");
                }
                Err(minimp3::Error::Eof) | Err(minimp3::Error::InsufficientData) => {
                    return Ok(None)
                }
                Err(minimp3::Error::Io(e)) => return Err(map_io(e, self.stall)),
            }
        }
    }

    pub fn consumed_bytes(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames
    }

    pub fn skipped_regions(&self) -> u64 {
        self.skipped
    }
}

fn map_io(e: io::Error, stall: Duration) -> PlaybackError {
    if e.kind() == ErrorKind::TimedOut {
        PlaybackError::SourceStalled(stall)
    } else {
        PlaybackError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out bytes in small pieces and logs every read request.
    struct TrickleSource {
        data: VecDeque<u8>,
        piece: usize,
        reads: Arc<AtomicU64>,
        block_first: usize,
    }

    impl Read for TrickleSource {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            if self.block_first > 0 {
                self.block_first -= 1;
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = out.len().min(self.piece).min(self.data.len());
            for (dst, src) in out.iter_mut().zip(self.data.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    fn trickle(len: usize, piece: usize) -> (TrickleSource, Arc<AtomicU64>) {
        let reads = Arc::new(AtomicU64::new(0));
        (
            TrickleSource {
                data: (0..len).map(|i| i as u8).collect(),
                piece,
                reads: Arc::clone(&reads),
                block_first: 0,
            },
            reads,
        )
    }

    #[test]
    fn prefill_fills_to_capacity() {
        let (src, _) = trickle(10_000, 100);
        let mut ahead = ReadAhead::new(src, 1024, Duration::from_millis(100));
        ahead.prefill().unwrap();
        assert_eq!(ahead.available(), 1024);
    }

    #[test]
    fn refill_waits_until_below_half() {
        let (src, reads) = trickle(10_000, 4096);
        let mut ahead = ReadAhead::new(src, 1024, Duration::from_millis(100));
        ahead.prefill().unwrap();
        let after_prefill = reads.load(Ordering::Relaxed);

        let mut out = [0u8; 100];
        for _ in 0..5 {
            ahead.read_exact(&mut out).unwrap();
        }
        // 524 bytes left: still above half, no source reads yet.
        assert_eq!(reads.load(Ordering::Relaxed), after_prefill);

        ahead.read_exact(&mut out).unwrap();
        ahead.read_exact(&mut out).unwrap();
        assert!(reads.load(Ordering::Relaxed) > after_prefill);
        assert_eq!(ahead.consumed_counter().load(Ordering::Relaxed), 700);
    }

    #[test]
    fn data_passes_through_in_order() {
        let (src, _) = trickle(3000, 333);
        let mut ahead = ReadAhead::new(src, 512, Duration::from_millis(100));
        ahead.prefill().unwrap();
        let mut all = Vec::new();
        ahead.read_to_end(&mut all).unwrap();
        assert_eq!(all.len(), 3000);
        assert!(all.iter().enumerate().all(|(i, &b)| b == i as u8));
    }

    #[test]
    fn blocked_source_is_waited_on() {
        let (mut src, _) = trickle(100, 100);
        src.block_first = 3;
        let mut ahead = ReadAhead::new(src, 256, Duration::from_millis(500));
        ahead.prefill().unwrap();
        assert_eq!(ahead.available(), 100);
        assert!(ahead.is_eof());
    }

    #[test]
    fn permanently_blocked_source_stalls() {
        let (mut src, _) = trickle(100, 100);
        src.block_first = usize::MAX;
        let result = CompressedDecoder::new(src, 256, Duration::from_millis(20));
        assert!(matches!(result, Err(PlaybackError::SourceStalled(_))));
    }

    #[test]
    fn garbage_yields_no_frames() {
        let (src, _) = trickle(2048, 2048);
        let mut dec = CompressedDecoder::new(src, 4096, Duration::from_millis(50)).unwrap();
        assert!(dec.next_frame().unwrap().is_none());
        assert_eq!(dec.frames_decoded(), 0);
    }
}
