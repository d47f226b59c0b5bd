//! # CS16 Sample Codec
//!
//! DMA buffers always carry two channels of interleaved CS16 samples, one
//! 32-bit I/Q word per channel per sample position:
//!
//! ```text
//! word:    0      1      2      3      4      5
//!        ┌──────┬──────┬──────┬──────┬──────┬──────┐
//!        │ ch0  │ ch1  │ ch0  │ ch1  │ ch0  │ ch1  │ ...
//!        │ s0   │ s0   │ s1   │ s1   │ s2   │ s2   │
//!        └──────┴──────┴──────┴──────┴──────┴──────┘
//! ```
//!
//! The ADC delivers 12-bit lanes in the low bits of each 16-bit lane, so the
//! receive path sign-extends from bit 11. The transmit path writes full-width
//! values untouched.

use crate::types::Cs16;

/// Width of the hardware's native sample lanes
pub const NATIVE_BITS: u32 = 12;

const SIGN_BIT: u16 = 1 << (NATIVE_BITS - 1);
const LANE_SPAN: u16 = 1 << NATIVE_BITS;

/// Sign-extend one 16-bit lane from the hardware's 12-bit precision
///
/// Any lane whose unsigned value is `>= 0x0800` has `0x1000` subtracted,
/// wrapping in 16 bits. Lanes carrying bits above the 12-bit field are not
/// masked first.
#[inline]
pub fn sign_extend_lane(lane: i16) -> i16 {
    let value = lane as u16;
    if value >= SIGN_BIT {
        value.wrapping_sub(LANE_SPAN) as i16
    } else {
        lane
    }
}

/// Truncate a full-width lane to the 12-bit field the hardware delivers
#[inline]
pub fn to_native_lane(lane: i16) -> i16 {
    (lane as u16 & (LANE_SPAN - 1)) as i16
}

/// Sign-extend both lanes of a CS16 sample
#[inline]
pub fn sign_extend(sample: Cs16) -> Cs16 {
    Cs16::new(sign_extend_lane(sample.re), sign_extend_lane(sample.im))
}

/// Extract one channel from an interleaved buffer
///
/// Copies `src[src_offset..src_offset + len, channel]` into
/// `dst[dst_offset..dst_offset + len]`, sign-extending every lane.
///
/// # Arguments
/// * `src` - Interleaved DMA buffer
/// * `src_offset` - First sample position to read
/// * `dst` - Per-channel destination
/// * `dst_offset` - First destination sample to write
/// * `num_channels` - Channels interleaved in `src`
/// * `channel` - Channel to extract
/// * `len` - Number of samples
///
/// # Panics
/// Panics if either range falls outside its slice.
pub fn deinterleave(
    src: &[Cs16],
    src_offset: usize,
    dst: &mut [Cs16],
    dst_offset: usize,
    num_channels: usize,
    channel: usize,
    len: usize,
) {
    if len == 0 {
        return;
    }
    debug_assert!(channel < num_channels);

    let first = src_offset * num_channels + channel;
    let last = (src_offset + len - 1) * num_channels + channel;
    let frames = src[first..=last].iter().step_by(num_channels);

    for (out, sample) in dst[dst_offset..dst_offset + len].iter_mut().zip(frames) {
        *out = sign_extend(*sample);
    }
}

/// Scatter one channel into an interleaved buffer
///
/// Copies `src[src_offset..src_offset + len]` into
/// `dst[dst_offset..dst_offset + len, channel]`.
///
/// # Panics
/// Panics if either range falls outside its slice.
pub fn interleave(
    src: &[Cs16],
    src_offset: usize,
    dst: &mut [Cs16],
    dst_offset: usize,
    num_channels: usize,
    channel: usize,
    len: usize,
) {
    if len == 0 {
        return;
    }
    debug_assert!(channel < num_channels);

    let first = dst_offset * num_channels + channel;
    let last = (dst_offset + len - 1) * num_channels + channel;
    let frames = dst[first..=last].iter_mut().step_by(num_channels);

    for (slot, sample) in frames.zip(&src[src_offset..src_offset + len]) {
        *slot = *sample;
    }
}

/// Pack a CS16 sample into its on-wire 32-bit word (I in the low half)
#[inline]
pub fn to_word(sample: Cs16) -> u32 {
    (sample.re as u16 as u32) | ((sample.im as u16 as u32) << 16)
}

/// Unpack an on-wire 32-bit word into a CS16 sample
#[inline]
pub fn from_word(word: u32) -> Cs16 {
    Cs16::new(word as u16 as i16, (word >> 16) as u16 as i16)
}
