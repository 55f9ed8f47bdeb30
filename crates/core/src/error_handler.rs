//! Pure error classification, recovery-strategy selection, and a bounded
//! circular error log (spec.md §4.3).
//!
//! `ErrorHandler` is deliberately dumb: [`classify`] is a pure function of
//! `(error_kind, retry_count, consecutive_error_count)`, with no side
//! effects, so it is trivially unit-testable against the table in spec.md
//! §4.3 without any transport or clock involved.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Duration;
use heapless::HistoryBuffer;
use rand_core::RngCore;

use crate::config::{ERROR_LOG_CAPACITY, FALLBACK_REARM_SUCCESS_COUNT};

/// The transport error taxonomy (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// Peripheral not ready.
    Busy,
    /// Operation deadline exceeded.
    Timeout,
    /// Device did not acknowledge.
    Nak,
    /// Bus arbitration was lost (multi-master contention).
    ArbitrationLost,
    /// The DMA engine reported an error.
    DmaError,
    /// A caller passed an invalid parameter to the transport.
    InvalidParameter,
    /// The transport or driver was used before initialisation completed.
    NotInitialized,
}

/// The recovery strategies the [`ErrorHandler`] can select (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecoveryStrategy {
    /// No recovery needed.
    None,
    /// Retry the same transaction immediately.
    RetryImmediate,
    /// Retry after an exponential backoff delay.
    RetryWithDelay,
    /// Route this DAC through the synchronous transport until rearmed.
    FallbackToSync,
    /// Reset the I²C peripheral and retry from a clean slate.
    ResetPeripheral,
    /// Escalate to a full system restart; the core should stop accepting
    /// new requests.
    SystemRestart,
}

/// One recorded error event, kept in the bounded circular log.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorEvent {
    /// Which DAC (index into the orchestrator's DAC array) the error
    /// occurred on.
    pub dac: usize,
    /// The classified error kind.
    pub kind: ErrorKind,
    /// The recovery strategy selected in response.
    pub strategy: RecoveryStrategy,
}

/// Pure decision function implementing the table in spec.md §4.3.
///
/// `retry_count` is the number of retries already attempted for the
/// *current* transaction; `consecutive_error_count` is the DAC's running
/// count of consecutive failures across transactions (used only by the
/// `DmaError` rule, which escalates to a peripheral reset once it is
/// persistent).
pub fn classify(kind: ErrorKind, retry_count: u8, consecutive_error_count: u8) -> RecoveryStrategy {
    match kind {
        ErrorKind::Busy => {
            if retry_count < 2 {
                RecoveryStrategy::RetryWithDelay
            } else {
                RecoveryStrategy::FallbackToSync
            }
        }
        ErrorKind::Timeout => {
            if retry_count < crate::config::TIMEOUT_MAX_RETRIES {
                RecoveryStrategy::RetryWithDelay
            } else {
                RecoveryStrategy::FallbackToSync
            }
        }
        ErrorKind::Nak => {
            if retry_count < 3 {
                RecoveryStrategy::RetryImmediate
            } else {
                RecoveryStrategy::FallbackToSync
            }
        }
        ErrorKind::ArbitrationLost => RecoveryStrategy::RetryWithDelay,
        ErrorKind::DmaError => {
            if consecutive_error_count > 5 {
                RecoveryStrategy::ResetPeripheral
            } else if retry_count < 2 {
                RecoveryStrategy::RetryImmediate
            } else {
                RecoveryStrategy::FallbackToSync
            }
        }
        ErrorKind::InvalidParameter | ErrorKind::NotInitialized => RecoveryStrategy::SystemRestart,
    }
}

/// Exponential backoff with jitter: `base_ms << retry_count`, clamped to
/// `max_ms`, plus up to 10% uniform jitter (spec.md §4.3).
pub fn backoff_delay(retry_count: u8, base_ms: u32, max_ms: u32, rng: &mut impl RngCore) -> Duration {
    let shifted = base_ms.checked_shl(retry_count as u32).unwrap_or(u32::MAX);
    let base = shifted.min(max_ms);
    let jitter_ceiling = base / 10; // <= 10%
    let jitter = if jitter_ceiling == 0 {
        0
    } else {
        rng.next_u32() % (jitter_ceiling + 1)
    };
    Duration::from_millis(u64::from(base + jitter))
}

/// Per-DAC bookkeeping plus a shared bounded circular error log (spec.md
/// §4.3). `DAC_COUNT` is a const generic so the handler's storage is fixed
/// at compile time, matching the crate's no-dynamic-memory non-goal.
pub struct ErrorHandler<const DAC_COUNT: usize> {
    consecutive_errors: [u8; DAC_COUNT],
    consecutive_fallback_successes: [u8; DAC_COUNT],
    fallback_active: [bool; DAC_COUNT],
    total_errors: u32,
    total_operations: u32,
    log: HistoryBuffer<ErrorEvent, ERROR_LOG_CAPACITY>,
}

impl<const DAC_COUNT: usize> ErrorHandler<DAC_COUNT> {
    /// Construct a handler with a clean slate: no DAC in fallback, no
    /// errors recorded.
    pub fn new() -> Self {
        Self {
            consecutive_errors: [0; DAC_COUNT],
            consecutive_fallback_successes: [0; DAC_COUNT],
            fallback_active: [false; DAC_COUNT],
            total_errors: 0,
            total_operations: 0,
            log: HistoryBuffer::new(),
        }
    }

    /// Whether `dac` is currently routed through the synchronous fallback
    /// transport.
    pub fn is_fallback_active(&self, dac: usize) -> bool {
        self.fallback_active.get(dac).copied().unwrap_or(false)
    }

    /// Record a successful operation: resets the DAC's consecutive-error
    /// counter, and if the DAC is in fallback, counts toward the rearm
    /// threshold (spec.md §4.3: "after ten consecutive successes in
    /// fallback, sync fallback is rearmed to DMA").
    pub fn record_success(&mut self, dac: usize) {
        self.total_operations = self.total_operations.saturating_add(1);
        if dac >= DAC_COUNT {
            return;
        }
        self.consecutive_errors[dac] = 0;
        if self.fallback_active[dac] {
            self.consecutive_fallback_successes[dac] =
                self.consecutive_fallback_successes[dac].saturating_add(1);
            if self.consecutive_fallback_successes[dac] >= FALLBACK_REARM_SUCCESS_COUNT {
                self.fallback_active[dac] = false;
                self.consecutive_fallback_successes[dac] = 0;
            }
        }
    }

    /// Record a failed operation on `dac`, classify it given the current
    /// retry count, log the event, and update fallback/consecutive-error
    /// bookkeeping. Returns the selected [`RecoveryStrategy`].
    pub fn record_error(&mut self, dac: usize, kind: ErrorKind, retry_count: u8) -> RecoveryStrategy {
        self.total_operations = self.total_operations.saturating_add(1);
        self.total_errors = self.total_errors.saturating_add(1);

        let consecutive = if dac < DAC_COUNT {
            self.consecutive_errors[dac] = self.consecutive_errors[dac].saturating_add(1);
            self.consecutive_errors[dac]
        } else {
            0
        };

        let strategy = classify(kind, retry_count, consecutive);

        if dac < DAC_COUNT {
            self.consecutive_fallback_successes[dac] = 0;
            if matches!(strategy, RecoveryStrategy::FallbackToSync) {
                self.fallback_active[dac] = true;
            }
        }

        self.log.write(ErrorEvent { dac, kind, strategy });
        strategy
    }

    /// Total operations observed (successes and failures combined).
    pub fn total_operations(&self) -> u32 {
        self.total_operations
    }

    /// Total failed operations observed.
    pub fn total_errors(&self) -> u32 {
        self.total_errors
    }

    /// Error rate in parts-per-million, integer rounding (spec.md §8,
    /// invariant 4): `1e6 * total_errors / total_operations`. `0` if no
    /// operations have been recorded yet.
    pub fn error_rate_ppm(&self) -> u32 {
        if self.total_operations == 0 {
            return 0;
        }
        ((u64::from(self.total_errors) * 1_000_000) / u64::from(self.total_operations)) as u32
    }

    /// Iterate the circular error log, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &ErrorEvent> {
        self.log.oldest_ordered()
    }
}

impl<const DAC_COUNT: usize> Default for ErrorHandler<DAC_COUNT> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`ErrorHandler`] shared across every worker via a synchronous mutex.
///
/// Workers run cooperatively (never truly in parallel), but each lives in
/// its own task, so the handler still needs a lock to avoid aliasing the
/// interior state. The lock is only ever held for the duration of a pure,
/// non-suspending computation (spec.md §5: "no suspension holds a mutex").
pub struct SharedErrorHandler<const DAC_COUNT: usize> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<ErrorHandler<DAC_COUNT>>>,
}

impl<const DAC_COUNT: usize> SharedErrorHandler<DAC_COUNT> {
    /// Construct a shared handler with a clean slate.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(ErrorHandler::new())),
        }
    }

    /// See [`ErrorHandler::record_success`].
    pub fn record_success(&self, dac: usize) {
        self.inner.lock(|cell| cell.borrow_mut().record_success(dac));
    }

    /// See [`ErrorHandler::record_error`].
    pub fn record_error(&self, dac: usize, kind: ErrorKind, retry_count: u8) -> RecoveryStrategy {
        self.inner
            .lock(|cell| cell.borrow_mut().record_error(dac, kind, retry_count))
    }

    /// See [`ErrorHandler::is_fallback_active`].
    pub fn is_fallback_active(&self, dac: usize) -> bool {
        self.inner.lock(|cell| cell.borrow().is_fallback_active(dac))
    }

    /// See [`ErrorHandler::total_operations`]/[`ErrorHandler::total_errors`]/[`ErrorHandler::error_rate_ppm`],
    /// returned together as a snapshot.
    pub fn totals(&self) -> (u32, u32, u32) {
        self.inner.lock(|cell| {
            let handler = cell.borrow();
            (handler.total_operations(), handler.total_errors(), handler.error_rate_ppm())
        })
    }
}

impl<const DAC_COUNT: usize> Default for SharedErrorHandler<DAC_COUNT> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_xorshift::XorShiftRng;
    use rand_core::SeedableRng;

    #[test]
    fn busy_retries_then_falls_back() {
        assert_eq!(RecoveryStrategy::RetryWithDelay, classify(ErrorKind::Busy, 0, 0));
        assert_eq!(RecoveryStrategy::RetryWithDelay, classify(ErrorKind::Busy, 1, 0));
        assert_eq!(RecoveryStrategy::FallbackToSync, classify(ErrorKind::Busy, 2, 0));
    }

    #[test]
    fn timeout_retries_then_falls_back() {
        assert_eq!(RecoveryStrategy::RetryWithDelay, classify(ErrorKind::Timeout, 0, 0));
        assert_eq!(
            RecoveryStrategy::FallbackToSync,
            classify(ErrorKind::Timeout, crate::config::TIMEOUT_MAX_RETRIES, 0)
        );
    }

    #[test]
    fn nak_retries_immediately_then_falls_back() {
        assert_eq!(RecoveryStrategy::RetryImmediate, classify(ErrorKind::Nak, 0, 0));
        assert_eq!(RecoveryStrategy::RetryImmediate, classify(ErrorKind::Nak, 2, 0));
        assert_eq!(RecoveryStrategy::FallbackToSync, classify(ErrorKind::Nak, 3, 0));
    }

    #[test]
    fn arbitration_lost_always_retries_with_delay() {
        assert_eq!(
            RecoveryStrategy::RetryWithDelay,
            classify(ErrorKind::ArbitrationLost, 10, 10)
        );
    }

    #[test]
    fn dma_error_resets_peripheral_when_persistent() {
        assert_eq!(
            RecoveryStrategy::ResetPeripheral,
            classify(ErrorKind::DmaError, 0, 6)
        );
        assert_eq!(
            RecoveryStrategy::RetryImmediate,
            classify(ErrorKind::DmaError, 0, 1)
        );
        assert_eq!(
            RecoveryStrategy::FallbackToSync,
            classify(ErrorKind::DmaError, 5, 1)
        );
    }

    #[test]
    fn fatal_kinds_request_system_restart() {
        assert_eq!(
            RecoveryStrategy::SystemRestart,
            classify(ErrorKind::InvalidParameter, 0, 0)
        );
        assert_eq!(
            RecoveryStrategy::SystemRestart,
            classify(ErrorKind::NotInitialized, 0, 0)
        );
    }

    #[test]
    fn backoff_is_exponential_and_clamped() {
        let mut rng = XorShiftRng::seed_from_u64(1);
        let d0 = backoff_delay(0, 10, 1000, &mut rng);
        let d1 = backoff_delay(1, 10, 1000, &mut rng);
        let d5 = backoff_delay(5, 10, 1000, &mut rng); // would be 320 unclamped
        let d10 = backoff_delay(10, 10, 100, &mut rng); // clamps to 100 (+jitter)

        assert!(d0.as_millis() >= 10 && d0.as_millis() <= 11);
        assert!(d1.as_millis() >= 20 && d1.as_millis() <= 22);
        assert!(d5.as_millis() >= 320);
        assert!(d10.as_millis() <= 110);
    }

    #[test]
    fn error_rate_ppm_matches_integer_rounding() {
        let mut handler = ErrorHandler::<2>::new();
        for _ in 0..3 {
            handler.record_success(0);
        }
        handler.record_error(0, ErrorKind::Nak, 0);
        // 1 error out of 4 operations -> 250_000 ppm
        assert_eq!(250_000, handler.error_rate_ppm());
        assert!(handler.total_errors() <= handler.total_operations());
    }

    #[test]
    fn error_rate_ppm_zero_operations() {
        let handler = ErrorHandler::<2>::new();
        assert_eq!(0, handler.error_rate_ppm());
    }

    #[test]
    fn fallback_rearms_after_ten_successes() {
        let mut handler = ErrorHandler::<1>::new();
        for _ in 0..3 {
            handler.record_error(0, ErrorKind::Nak, 3);
        }
        assert!(handler.is_fallback_active(0));

        for _ in 0..(FALLBACK_REARM_SUCCESS_COUNT - 1) {
            handler.record_success(0);
        }
        assert!(handler.is_fallback_active(0), "not yet rearmed");

        handler.record_success(0);
        assert!(!handler.is_fallback_active(0), "should have rearmed to DMA");
    }

    #[test]
    fn log_is_bounded_and_ordered() {
        let mut handler = ErrorHandler::<1>::new();
        for i in 0..(ERROR_LOG_CAPACITY + 5) {
            handler.record_error(0, ErrorKind::Busy, (i % 3) as u8);
        }
        let events: heapless::Vec<_, 32> = handler.log().copied().collect();
        assert_eq!(ERROR_LOG_CAPACITY, events.len());
    }
}
