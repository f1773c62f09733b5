//! Sample-format conversion and channel adaptation for the i16 bus.

/// Narrow a float sample in [-1, 1] after scaling by `gain`.
///
/// Integer sources decoded as `s / 32768` come back exactly with `gain = 1.0`.
#[inline]
pub fn f32_to_i16(s: f32, gain: f32) -> i16 {
    (s * gain * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[inline]
pub fn i16_to_f32(s: i16) -> f32 {
    s as f32 / 32768.0
}

/// Average interleaved frames down to one channel.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(ch)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / ch as i32) as i16
        })
        .collect()
}

/// Keep the first two channels of frames with more than two.
pub fn fold_to_stereo(samples: &[i16], channels: u16) -> Vec<i16> {
    let ch = channels.max(1) as usize;
    if ch <= 2 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(ch)
        .flat_map(|frame| [frame[0], frame[1]])
        .collect()
}

/// Channel count [`adapt_for_bus`] produces for a `channels`-wide source.
pub fn adapted_channels(channels: u16, bus_channels: u16) -> u16 {
    match (channels.min(2), bus_channels) {
        (2, 1) => 1,
        (ch, _) => ch.max(1),
    }
}

/// Bring `channels`-wide frames down to what a `bus_channels` bus accepts.
///
/// Mono sources are left alone; the transport duplicates them onto stereo.
pub fn adapt_for_bus(samples: Vec<i16>, channels: u16, bus_channels: u16) -> Vec<i16> {
    let (samples, channels) = if channels > 2 {
        (fold_to_stereo(&samples, channels), 2)
    } else {
        (samples, channels)
    };
    if adapted_channels(channels, bus_channels) < channels {
        downmix_to_mono(&samples, channels)
    } else {
        samples
    }
}
