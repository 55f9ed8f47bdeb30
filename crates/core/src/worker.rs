//! The cooperative per-DAC worker loop (spec.md §4.5), expressed as an
//! explicit stackless state machine rather than an async task body (spec.md
//! §9 Design Notes: "a stackless state machine per worker works equally
//! well").
//!
//! [`Worker::poll`] and [`Worker::on_transport_result`] never await and never
//! touch a transport or a DAC driver directly: they only decide *what*
//! should happen next and hand that decision back as a [`WorkerAction`].
//! The actual I²C/DMA calls happen in the thin async loop that drives a
//! `Worker` (in `crates/firmware`, or in this crate's tests via a
//! synchronous mock). This keeps every mutex acquisition (steps 2–5 of
//! spec.md §4.5) structurally unable to overlap a suspension point —
//! satisfying testable property 6 of spec.md §8 by construction, since
//! `poll`/`on_transport_result` are plain synchronous functions.

use embassy_time::Duration;
use rand_core::SeedableRng;
use rand_xorshift::XorShiftRng;

use crate::config::{RETRY_BASE_MS, RETRY_MAX_MS};
use crate::dr_teeth::InputFabric;
use crate::error_handler::{backoff_delay, ErrorKind, RecoveryStrategy, SharedErrorHandler};
use crate::muppet_state::MuppetState;
use crate::sample::Sample;
use crate::watchdog::SharedWatchdog;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    AwaitingDoorbell,
    Transmitting,
    AwaitingBackoff,
    Resetting,
    Latching,
    Fatal,
}

/// What the driving loop must do next, as decided by the worker's state
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    /// Nothing to do; yield and poll the doorbell again later (suspension
    /// point (a) of spec.md §5).
    WaitForDoorbell,
    /// Write [`Worker::pending_values`] to the DAC, through the sync
    /// transport if the bool is `true`, otherwise through DMA. Report the
    /// outcome via [`Worker::on_transport_result`] (suspension point (b)).
    Transmit { use_fallback: bool },
    /// Sleep for the given duration before retrying (suspension point (c)).
    Backoff(Duration),
    /// Reset the I²C peripheral, then report the outcome via
    /// [`Worker::on_reset_result`].
    ResetPeripheral,
    /// Pulse the DAC latch (disable, then enable) so the committed sample
    /// vector is released to the outputs atomically, then call
    /// [`Worker::latch_done`].
    Latch,
    /// This DAC has exhausted every recovery strategy. The orchestrator
    /// should expose this to the supervising program; this worker will
    /// never issue another transaction.
    Halted,
}

/// One cooperative worker, driving exactly one DAC.
pub struct Worker<const CH: usize> {
    dac: usize,
    first_channel: usize,
    state: WorkerState,
    pending_values: [Sample; CH],
    retry_count: u8,
    rng: XorShiftRng,
}

impl<const CH: usize> Worker<CH> {
    /// Construct a worker for DAC index `dac`, whose channels begin at
    /// `first_channel` in the shared [`InputFabric`].
    pub fn new(dac: usize, first_channel: usize) -> Self {
        // seed deterministically per DAC so behaviour (jitter aside) is
        // reproducible across runs and easy to unit test
        let seed = 0x5EED_0000_u64 | dac as u64;
        Self {
            dac,
            first_channel,
            state: WorkerState::AwaitingDoorbell,
            pending_values: [0x8000; CH],
            retry_count: 0,
            rng: XorShiftRng::seed_from_u64(seed),
        }
    }

    /// The DAC index this worker drives.
    pub fn dac_index(&self) -> usize {
        self.dac
    }

    /// The values the driving loop should currently be transmitting.
    pub fn pending_values(&self) -> &[Sample; CH] {
        &self.pending_values
    }

    /// Whether this worker has permanently given up on its DAC.
    pub fn is_fatal(&self) -> bool {
        self.state == WorkerState::Fatal
    }

    /// Steps 1–6 of spec.md §4.5: check the doorbell; if set, snapshot the
    /// fabric into the local buffer under the per-DAC mutex, commit the
    /// sequence number, and hand back the values to transmit. If the
    /// doorbell was not set, or the pending sequence turned out to be
    /// stale by the time we tried to commit (a race with another commit),
    /// there is nothing to do this round.
    pub fn poll<const TOTAL: usize>(
        &mut self,
        fabric: &InputFabric<TOTAL>,
        muppet: &MuppetState<CH>,
    ) -> WorkerAction {
        if self.state == WorkerState::Fatal {
            return WorkerAction::Halted;
        }
        if self.state != WorkerState::AwaitingDoorbell {
            // a poll() call while mid-transaction is a caller bug; stay put.
            return WorkerAction::WaitForDoorbell;
        }
        if !muppet.take_update_request() {
            return WorkerAction::WaitForDoorbell;
        }

        let pending_seq = muppet.pending_sequence();
        let mut snapshot = [0 as Sample; CH];
        fabric.read_slice(self.first_channel, &mut snapshot);

        if !muppet.commit(&snapshot, pending_seq) {
            // a newer commit already landed; nothing stale to send
            return WorkerAction::WaitForDoorbell;
        }

        self.pending_values = snapshot;
        self.retry_count = 0;
        self.state = WorkerState::Transmitting;
        WorkerAction::Transmit {
            use_fallback: muppet.is_fallback_active(),
        }
    }

    /// Step 7 of spec.md §4.5: report the outcome of the transmission
    /// requested by the last [`WorkerAction::Transmit`].
    pub fn on_result<const DAC_COUNT: usize>(
        &mut self,
        result: Result<(), ErrorKind>,
        muppet: &MuppetState<CH>,
        errors: &SharedErrorHandler<DAC_COUNT>,
    ) -> WorkerAction {
        match result {
            Ok(()) => {
                errors.record_success(self.dac);
                // ErrorHandler owns the rearm count; mirror its verdict back
                // onto the atomic the worker actually reads from (spec.md
                // §4.3: "after ten consecutive successes in fallback, sync
                // fallback is rearmed to DMA").
                if !errors.is_fallback_active(self.dac) {
                    muppet.set_fallback_active(false);
                }
                self.state = WorkerState::Latching;
                WorkerAction::Latch
            }
            Err(kind) => self.recover(kind, muppet, errors),
        }
    }

    fn recover<const DAC_COUNT: usize>(
        &mut self,
        kind: ErrorKind,
        muppet: &MuppetState<CH>,
        errors: &SharedErrorHandler<DAC_COUNT>,
    ) -> WorkerAction {
        let strategy = errors.record_error(self.dac, kind, self.retry_count);
        self.retry_count = self.retry_count.saturating_add(1);

        match strategy {
            RecoveryStrategy::None | RecoveryStrategy::RetryImmediate => {
                self.state = WorkerState::Transmitting;
                WorkerAction::Transmit {
                    use_fallback: muppet.is_fallback_active(),
                }
            }
            RecoveryStrategy::RetryWithDelay => {
                self.state = WorkerState::AwaitingBackoff;
                WorkerAction::Backoff(backoff_delay(
                    self.retry_count,
                    RETRY_BASE_MS,
                    RETRY_MAX_MS,
                    &mut self.rng,
                ))
            }
            RecoveryStrategy::FallbackToSync => {
                muppet.set_fallback_active(true);
                self.state = WorkerState::Transmitting;
                WorkerAction::Transmit { use_fallback: true }
            }
            RecoveryStrategy::ResetPeripheral => {
                self.state = WorkerState::Resetting;
                WorkerAction::ResetPeripheral
            }
            RecoveryStrategy::SystemRestart => {
                muppet.mark_fatal();
                self.state = WorkerState::Fatal;
                WorkerAction::Halted
            }
        }
    }

    /// Called after sleeping for the duration from a
    /// [`WorkerAction::Backoff`]; resumes the transmit attempt.
    pub fn backoff_elapsed(&mut self, muppet: &MuppetState<CH>) -> WorkerAction {
        debug_assert!(self.state == WorkerState::AwaitingBackoff);
        self.state = WorkerState::Transmitting;
        WorkerAction::Transmit {
            use_fallback: muppet.is_fallback_active(),
        }
    }

    /// Called after attempting a [`WorkerAction::ResetPeripheral`]. On
    /// success the worker retries the transmission; on failure this DAC is
    /// fatal (spec.md §4.7: "persistent failure after reset →
    /// worker-fatal flag").
    pub fn on_reset_result(&mut self, succeeded: bool, muppet: &MuppetState<CH>) -> WorkerAction {
        if succeeded {
            self.state = WorkerState::Transmitting;
            WorkerAction::Transmit {
                use_fallback: muppet.is_fallback_active(),
            }
        } else {
            muppet.mark_fatal();
            self.state = WorkerState::Fatal;
            WorkerAction::Halted
        }
    }

    /// Called after pulsing the latch in response to a
    /// [`WorkerAction::Latch`]. Clears `dirty`, returns to
    /// `AwaitingDoorbell`, and signals whether the driving loop should
    /// immediately call [`Worker::poll`] again because a newer request
    /// arrived mid-transaction (spec.md §4.5 step 9).
    pub fn latch_done(&mut self, muppet: &MuppetState<CH>) -> bool {
        muppet.clear_dirty();
        self.state = WorkerState::AwaitingDoorbell;
        muppet.pending_sequence() > muppet.committed_sequence()
    }
}
