//! Compile-time sizing and timing constants.
//!
//! These are design parameters, not user-configurable settings: there is no
//! persisted configuration surface (see the crate's non-goals). A real
//! deployment picks `DAC_COUNT`/`CHANNELS_PER_DAC` once, at compile time, and
//! the rest of the crate is generic over those numbers via const generics.

/// Typical DAC count for the reference hardware (two 8-channel I²C DACs).
pub const DAC_COUNT: usize = 2;

/// Channels per DAC for the reference hardware.
pub const CHANNELS_PER_DAC: usize = 8;

/// Total logical channels across all DACs.
pub const TOTAL_CHANNELS: usize = DAC_COUNT * CHANNELS_PER_DAC;

/// Cooperative scheduling time slice, in microseconds.
pub const TIME_SLICE_US: u32 = 10;

/// Period of the unconditional "force refresh" broadcast, in milliseconds.
pub const FORCE_REFRESH_PERIOD_MS: u64 = 100;

/// Base delay for `RetryWithDelay` backoff, in milliseconds.
pub const RETRY_BASE_MS: u32 = 2;

/// Maximum delay for `RetryWithDelay` backoff, in milliseconds.
pub const RETRY_MAX_MS: u32 = 200;

/// Maximum retry count before `Timeout` escalates to `FallbackToSync`.
pub const TIMEOUT_MAX_RETRIES: u8 = 3;

/// Per-DAC operation deadline before the watchdog reports a `Timeout`, in
/// milliseconds.
pub const TIMEOUT_THRESHOLD_MS: u64 = 50;

/// Interval at which the watchdog inspects all slots, in milliseconds.
pub const WATCHDOG_INTERVAL_MS: u64 = 5;

/// Number of consecutive successful sync transmissions required before a
/// DAC in fallback mode is rearmed to DMA. A policy knob (spec.md §9 Open
/// Questions); not load-bearing.
pub const FALLBACK_REARM_SUCCESS_COUNT: u8 = 10;

/// Capacity of the bounded circular error log kept by the [`crate::error_handler::ErrorHandler`].
pub const ERROR_LOG_CAPACITY: usize = 16;

/// Logical channel index reserved for the liveness diagnostic waveform.
pub const DIAGNOSTIC_CHANNEL: usize = TOTAL_CHANNELS - 1;
