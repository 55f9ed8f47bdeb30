//! The shared-value fabric: a lock-protected, fixed-size mapping from
//! logical channel to the most recently received [`Sample`].
//!
//! Named after the bandleader of Dr. Teeth and the Electric Mayhem, in
//! keeping with this codebase's Muppets theme.
//!
//! Writes come from the MIDI intake context; reads come from worker
//! contexts. Both take the same synchronous "inspiration lock" — a
//! [`embassy_sync::blocking_mutex::Mutex`] guarding a `RefCell`, so there is
//! no possibility of a torn read and no suspension point is ever reached
//! while the lock is held (spec.md §3, §5).

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};

use crate::sample::Sample;

/// Fixed-size, lock-protected input buffer. `TOTAL` is `DAC_COUNT *
/// CHANNELS_PER_DAC`.
pub struct InputFabric<const TOTAL: usize> {
    values: Mutex<CriticalSectionRawMutex, RefCell<[Sample; TOTAL]>>,
}

impl<const TOTAL: usize> InputFabric<TOTAL> {
    /// Construct a fabric with every channel centred (`0x8000`).
    pub const fn new() -> Self {
        Self {
            values: Mutex::new(RefCell::new([0x8000; TOTAL])),
        }
    }

    /// Write a single channel. A no-op (never panics) if `channel` is out of
    /// range, matching [`crate::dac_driver::DacDriver::set_channel`]'s
    /// contract so the whole pipeline treats out-of-range indices
    /// consistently.
    pub fn write(&self, channel: usize, sample: Sample) {
        if channel >= TOTAL {
            return;
        }
        self.values.lock(|cell| cell.borrow_mut()[channel] = sample);
    }

    /// Read a single channel, or `None` if out of range.
    pub fn read(&self, channel: usize) -> Option<Sample> {
        if channel >= TOTAL {
            return None;
        }
        Some(self.values.lock(|cell| cell.borrow()[channel]))
    }

    /// Copy `len` consecutive channels starting at `first` into `out`.
    /// Used by a worker to snapshot its slice of the fabric into its local
    /// buffer while holding only the fabric's lock, never its own
    /// [`crate::muppet_state::MuppetState`] lock at the same time (spec.md
    /// §5: the two locks are never held simultaneously).
    pub fn read_slice(&self, first: usize, out: &mut [Sample]) {
        let len = out.len();
        if first + len > TOTAL {
            return;
        }
        self.values.lock(|cell| {
            let all = cell.borrow();
            out.copy_from_slice(&all[first..first + len]);
        });
    }
}

impl<const TOTAL: usize> Default for InputFabric<TOTAL> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `true` if at least `period` has elapsed since `last`, meaning the
/// periodic, unconditional "force refresh" broadcast is due. This bounds
/// divergence after transient faults and supports the diagnostic heartbeat
/// channel (spec.md §4.6, §5).
#[inline]
pub fn should_force_refresh(last: Instant, now: Instant, period: Duration) -> bool {
    match now.checked_duration_since(last) {
        Some(elapsed) => elapsed >= period,
        // `now` somehow precedes `last`; treat as not yet due rather than panic.
        None => false,
    }
}
