//! Per-device operation deadline tracking (spec.md §4.4).
//!
//! One slot per DAC. A cooperative tick inspects every armed slot; an
//! expired slot is reported to the [`crate::error_handler::ErrorHandler`] as
//! a [`crate::error_handler::ErrorKind::Timeout`] and cleared.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};

#[derive(Clone, Copy)]
struct Slot {
    start: Instant,
}

/// Running statistics kept alongside the watchdog's slots (spec.md §4.4).
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    /// Longest observed operation duration, in microseconds.
    pub max_operation_us: u64,
    /// Integer exponential moving average of operation duration, in
    /// microseconds (no floating point on the hot path).
    pub moving_average_us: u64,
    /// Total number of timeouts reported.
    pub total_timeouts: u32,
    /// Total number of recoveries that succeeded after a timeout.
    pub successful_recoveries: u32,
    /// Total number of recoveries that failed after a timeout.
    pub failed_recoveries: u32,
}

/// Weight (out of 8) given to the new sample in the moving average; matches
/// a simple `avg += (sample - avg) / 8` integer EMA.
const EMA_SHIFT: u32 = 3;

impl Stats {
    fn record_operation(&mut self, duration_us: u64) {
        if duration_us > self.max_operation_us {
            self.max_operation_us = duration_us;
        }
        if self.moving_average_us == 0 {
            self.moving_average_us = duration_us;
        } else {
            let delta = duration_us as i64 - self.moving_average_us as i64;
            self.moving_average_us = (self.moving_average_us as i64 + (delta >> EMA_SHIFT)) as u64;
        }
    }
}

/// One armed-deadline slot per DAC, plus shared statistics.
pub struct TimeoutWatchdog<const DAC_COUNT: usize> {
    slots: [Option<Slot>; DAC_COUNT],
    stats: Stats,
}

impl<const DAC_COUNT: usize> TimeoutWatchdog<DAC_COUNT> {
    /// Construct a watchdog with every slot disarmed.
    pub const fn new() -> Self {
        Self {
            slots: [None; DAC_COUNT],
            stats: Stats {
                max_operation_us: 0,
                moving_average_us: 0,
                total_timeouts: 0,
                successful_recoveries: 0,
                failed_recoveries: 0,
            },
        }
    }

    /// Arm `dac`'s deadline starting at `now`. A no-op if `dac` is out of
    /// range.
    pub fn arm(&mut self, dac: usize, now: Instant) {
        if let Some(slot) = self.slots.get_mut(dac) {
            *slot = Some(Slot { start: now });
        }
    }

    /// Disarm `dac`'s deadline, e.g. because its transaction completed
    /// successfully. Records the operation's duration into [`Stats`].
    pub fn disarm(&mut self, dac: usize, now: Instant) {
        if let Some(slot) = self.slots.get_mut(dac) {
            if let Some(armed) = slot.take() {
                if let Some(elapsed) = now.checked_duration_since(armed.start) {
                    self.stats.record_operation(elapsed.as_micros());
                }
            }
        }
    }

    /// Inspect every armed slot against `now` and `threshold`; any slot
    /// whose deadline has expired is cleared and its DAC index yielded.
    /// Armed slots whose deadline has not yet expired are left untouched.
    pub fn tick(&mut self, now: Instant, threshold: Duration) -> impl Iterator<Item = usize> + '_ {
        let slots = &mut self.slots;
        let stats = &mut self.stats;
        (0..DAC_COUNT).filter_map(move |dac| {
            let expired = match slots[dac] {
                Some(slot) => match now.checked_duration_since(slot.start) {
                    Some(elapsed) => elapsed > threshold,
                    None => false,
                },
                None => false,
            };
            if expired {
                slots[dac] = None;
                stats.total_timeouts = stats.total_timeouts.saturating_add(1);
                Some(dac)
            } else {
                None
            }
        })
    }

    /// Record the outcome of a recovery attempt that followed a reported
    /// timeout.
    pub fn record_recovery(&mut self, succeeded: bool) {
        if succeeded {
            self.stats.successful_recoveries = self.stats.successful_recoveries.saturating_add(1);
        } else {
            self.stats.failed_recoveries = self.stats.failed_recoveries.saturating_add(1);
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> Stats {
        self.stats
    }
}

impl<const DAC_COUNT: usize> Default for TimeoutWatchdog<DAC_COUNT> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`TimeoutWatchdog`] shared across every worker via a synchronous mutex,
/// for the same reason [`crate::error_handler::SharedErrorHandler`] exists.
pub struct SharedWatchdog<const DAC_COUNT: usize> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<TimeoutWatchdog<DAC_COUNT>>>,
}

impl<const DAC_COUNT: usize> SharedWatchdog<DAC_COUNT> {
    /// Construct a shared watchdog with every slot disarmed.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(TimeoutWatchdog::new())),
        }
    }

    /// See [`TimeoutWatchdog::arm`].
    pub fn arm(&self, dac: usize, now: Instant) {
        self.inner.lock(|cell| cell.borrow_mut().arm(dac, now));
    }

    /// See [`TimeoutWatchdog::disarm`].
    pub fn disarm(&self, dac: usize, now: Instant) {
        self.inner.lock(|cell| cell.borrow_mut().disarm(dac, now));
    }

    /// Run one cooperative tick, calling `on_expired` for every DAC whose
    /// deadline has just expired.
    pub fn tick(&self, now: Instant, threshold: Duration, mut on_expired: impl FnMut(usize)) {
        self.inner.lock(|cell| {
            let mut wd = cell.borrow_mut();
            for dac in wd.tick(now, threshold).collect::<heapless::Vec<usize, DAC_COUNT>>() {
                on_expired(dac);
            }
        });
    }

    /// See [`TimeoutWatchdog::record_recovery`].
    pub fn record_recovery(&self, succeeded: bool) {
        self.inner.lock(|cell| cell.borrow_mut().record_recovery(succeeded));
    }

    /// See [`TimeoutWatchdog::stats`].
    pub fn stats(&self) -> Stats {
        self.inner.lock(|cell| cell.borrow().stats())
    }
}

impl<const DAC_COUNT: usize> Default for SharedWatchdog<DAC_COUNT> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_slot_expires_after_threshold() {
        let mut wd = TimeoutWatchdog::<2>::new();
        let t0 = Instant::from_millis(0);
        wd.arm(0, t0);

        let threshold = Duration::from_millis(50);
        let expired: heapless::Vec<usize, 2> =
            wd.tick(Instant::from_millis(10), threshold).collect();
        assert!(expired.is_empty(), "should not have expired yet");

        let expired: heapless::Vec<usize, 2> =
            wd.tick(Instant::from_millis(60), threshold).collect();
        assert_eq!(&[0][..], expired.as_slice());

        // cleared after expiring: ticking again should not re-report it
        let expired: heapless::Vec<usize, 2> =
            wd.tick(Instant::from_millis(1000), threshold).collect();
        assert!(expired.is_empty());
    }

    #[test]
    fn disarm_before_expiry_records_no_timeout() {
        let mut wd = TimeoutWatchdog::<1>::new();
        wd.arm(0, Instant::from_millis(0));
        wd.disarm(0, Instant::from_millis(5));
        let expired: heapless::Vec<usize, 1> =
            wd.tick(Instant::from_millis(1000), Duration::from_millis(50)).collect();
        assert!(expired.is_empty());
        assert_eq!(0, wd.stats().total_timeouts);
    }

    #[test]
    fn stats_track_max_and_average() {
        let mut wd = TimeoutWatchdog::<1>::new();
        wd.arm(0, Instant::from_millis(0));
        wd.disarm(0, Instant::from_millis(10));
        assert_eq!(10_000, wd.stats().max_operation_us);

        wd.arm(0, Instant::from_millis(10));
        wd.disarm(0, Instant::from_millis(30));
        assert_eq!(20_000, wd.stats().max_operation_us);
    }

    #[test]
    fn out_of_range_dac_is_ignored() {
        let mut wd = TimeoutWatchdog::<1>::new();
        wd.arm(5, Instant::from_millis(0));
        wd.disarm(5, Instant::from_millis(10));
        // should not panic; no slots exist at index 5
    }
}
