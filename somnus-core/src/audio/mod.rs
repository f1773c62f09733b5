//! Sample-level DSP shared by capture, playback and the host backend.
//!
//! | Module       | Role                                               |
//! |--------------|----------------------------------------------------|
//! | [`resample`] | interleaved i16 rate conversion (rubato)           |
//! | [`convert`]  | sample-format widening/narrowing and channel mixes |

pub mod convert;
pub mod resample;
