//! Sample containers shared between tasks.
//!
//! - [`SampleFrame`]: immutable block of interleaved i16 samples.
//! - [`CaptureQueue`]: bounded capture → trigger FIFO.
//! - [`create_host_ring`]: lock-free SPSC ring between a host audio callback
//!   and the bus channel that drains it.

pub mod frame;
pub mod queue;

use ringbuf::{traits::Split, HeapRb};

pub use frame::SampleFrame;
pub use queue::{CaptureQueue, PushOutcome};
pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the host audio callback (or the bus writer).
pub type HostProducer = ringbuf::HeapProd<i16>;

/// Consumer half, held by the bus reader (or the host output callback).
pub type HostConsumer = ringbuf::HeapCons<i16>;

/// Ring capacity used by the host backend: ~2 s of stereo audio at 48 kHz.
pub const HOST_RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap ring buffer.
pub fn create_host_ring(capacity: usize) -> (HostProducer, HostConsumer) {
    HeapRb::<i16>::new(capacity.max(1)).split()
}
