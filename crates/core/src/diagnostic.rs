//! The reserved liveness-diagnostic channel (spec.md §4.6, §7).
//!
//! The core only reserves the index and exposes a pure waveform function;
//! scheduling the periodic write is `crates/firmware`'s job.

use crate::config::DIAGNOSTIC_CHANNEL;
use crate::sample::Sample;

/// The logical channel index reserved for the diagnostic waveform. Re-export
/// of [`crate::config::DIAGNOSTIC_CHANNEL`] at the module a caller would
/// naturally look for it in.
pub const CHANNEL: usize = DIAGNOSTIC_CHANNEL;

/// Period of the triangle wave, in ticks (the unit a caller chooses — e.g.
/// one tick per force-refresh period).
const PERIOD_TICKS: u32 = 256;
const HALF_PERIOD: u32 = PERIOD_TICKS / 2;

/// Integer-only triangle wave centred on `0x8000`, ranging the full
/// `Sample` span, with period [`PERIOD_TICKS`]. Pure function of `tick`
/// (wraps via modulo, never panics) — a slow, visually obvious liveness
/// signal for an oscilloscope or logic analyser on the diagnostic channel.
#[inline]
pub fn diagnostic_waveform(tick: u32) -> Sample {
    let phase = tick % PERIOD_TICKS;
    let ramp = if phase < HALF_PERIOD {
        phase
    } else {
        PERIOD_TICKS - phase
    };
    // ramp is 0..=HALF_PERIOD; scale to the full u16 span
    ((ramp * u32::from(u16::MAX)) / HALF_PERIOD) as Sample
}
