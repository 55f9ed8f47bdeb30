//! Per-DAC shared cell: local buffer, dirty flag, mutex, doorbell, and
//! sequence number (spec.md §3, §4.5).
//!
//! `local_buffer` and `dirty` are updated together and so share one
//! synchronous mutex; `sequence`, `pending_sequence`, `update_requested` and
//! `fallback_active` are simple enough to be plain atomics (spec.md §9).

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::sample::Sample;

struct Inner<const CH: usize> {
    local_buffer: [Sample; CH],
    dirty: bool,
}

/// Per-DAC shared state: the snapshot currently being transmitted (or last
/// transmitted), plus the bookkeeping a [`crate::worker::Worker`] needs to
/// know whether and what to transmit next.
pub struct MuppetState<const CH: usize> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner<CH>>>,
    /// Sequence number committed by the worker's last successful snapshot.
    committed_sequence: AtomicU32,
    /// Sequence number most recently broadcast by the orchestrator.
    pending_sequence: AtomicU32,
    /// Producer→worker doorbell.
    update_requested: AtomicBool,
    /// Whether this DAC is currently routed through the sync transport.
    fallback_active: AtomicBool,
    /// Set once this DAC has exhausted every recovery strategy for a
    /// transaction; never cleared (spec.md §4.7 Failure semantics).
    fatal: AtomicBool,
}

impl<const CH: usize> MuppetState<CH> {
    /// Construct state with a centred local buffer, sequence zero, and no
    /// pending request.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                local_buffer: [0x8000; CH],
                dirty: false,
            })),
            committed_sequence: AtomicU32::new(0),
            pending_sequence: AtomicU32::new(0),
            update_requested: AtomicBool::new(false),
            fallback_active: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }

    /// Orchestrator-side: advance the pending sequence and raise the
    /// doorbell. Lock-free, constant-time (spec.md §4.7).
    pub fn request_update(&self) {
        self.pending_sequence.fetch_add(1, Ordering::Release);
        self.update_requested.store(true, Ordering::Release);
    }

    /// Worker-side: check and clear the doorbell.
    pub fn take_update_request(&self) -> bool {
        self.update_requested.swap(false, Ordering::AcqRel)
    }

    /// The orchestrator's most recently broadcast sequence number.
    pub fn pending_sequence(&self) -> u32 {
        self.pending_sequence.load(Ordering::Acquire)
    }

    /// The sequence number of the last snapshot this worker committed.
    pub fn committed_sequence(&self) -> u32 {
        self.committed_sequence.load(Ordering::Acquire)
    }

    /// Snapshot `source` into the local buffer under the mutex, mark dirty,
    /// and commit `pending_seq` as the new committed sequence — but only if
    /// `pending_seq` is newer than what is already committed (spec.md §3:
    /// "a worker commits only if its committed sequence is older than the
    /// pending sequence"). Returns `true` if the commit took place.
    ///
    /// Never awaits: the mutex is held only for the duration of the copy,
    /// never across a suspension point (spec.md §8, testable property 6).
    pub fn commit(&self, source: &[Sample], pending_seq: u32) -> bool {
        if pending_seq <= self.committed_sequence.load(Ordering::Acquire) {
            return false;
        }
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            inner.local_buffer.copy_from_slice(source);
            inner.dirty = true;
        });
        self.committed_sequence.store(pending_seq, Ordering::Release);
        true
    }

    /// Copy the current local buffer out, for handing to a transport.
    pub fn snapshot(&self, out: &mut [Sample]) {
        self.inner.lock(|cell| out.copy_from_slice(&cell.borrow().local_buffer));
    }

    /// Clear the dirty flag, e.g. after a successful transmission.
    pub fn clear_dirty(&self) {
        self.inner.lock(|cell| cell.borrow_mut().dirty = false);
    }

    /// Whether the local buffer holds a snapshot not yet fully transmitted.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock(|cell| cell.borrow().dirty)
    }

    /// Whether this DAC is currently routed through the sync fallback
    /// transport.
    pub fn is_fallback_active(&self) -> bool {
        self.fallback_active.load(Ordering::Acquire)
    }

    /// Set/clear the fallback flag.
    pub fn set_fallback_active(&self, active: bool) {
        self.fallback_active.store(active, Ordering::Release);
    }

    /// Whether this DAC has exhausted every recovery strategy and should no
    /// longer be driven.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Mark this DAC fatal. Irreversible for the lifetime of the process.
    pub fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }
}

impl<const CH: usize> Default for MuppetState<CH> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_update_bumps_sequence_and_sets_doorbell() {
        let state = MuppetState::<8>::new();
        assert_eq!(0, state.pending_sequence());
        state.request_update();
        assert_eq!(1, state.pending_sequence());
        assert!(state.take_update_request());
        assert!(!state.take_update_request(), "doorbell should clear once taken");
    }

    #[test]
    fn commit_only_advances_on_newer_sequence() {
        let state = MuppetState::<4>::new();
        let values = [1, 2, 3, 4];
        assert!(state.commit(&values, 1));
        assert_eq!(1, state.committed_sequence());
        assert!(state.is_dirty());

        // stale sequence: commit must be rejected, buffer untouched
        let stale = [9, 9, 9, 9];
        assert!(!state.commit(&stale, 1));
        assert_eq!(1, state.committed_sequence());

        let mut out = [0u16; 4];
        state.snapshot(&mut out);
        assert_eq!(values, out, "stale commit must not overwrite newer data");
    }

    #[test]
    fn commit_with_newer_sequence_wins_tiebreak() {
        let state = MuppetState::<2>::new();
        state.commit(&[1, 1], 5);
        assert!(state.commit(&[2, 2], 6));
        let mut out = [0u16; 2];
        state.snapshot(&mut out);
        assert_eq!([2, 2], out);
    }

    #[test]
    fn clear_dirty_resets_flag() {
        let state = MuppetState::<2>::new();
        state.commit(&[1, 1], 1);
        assert!(state.is_dirty());
        state.clear_dirty();
        assert!(!state.is_dirty());
    }

    #[test]
    fn fatal_flag_is_sticky() {
        let state = MuppetState::<2>::new();
        assert!(!state.is_fatal());
        state.mark_fatal();
        assert!(state.is_fatal());
    }
}
