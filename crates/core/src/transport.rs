//! Synchronous and DMA-asynchronous single-transaction I²C transport
//! (spec.md §4.2).
//!
//! Two trait families behind one descriptor type: [`SyncI2cTransport`] for
//! blocking single-master writes, and [`AsyncI2cTransport`] for DMA-scheduled
//! transfers polled to completion. A worker picks between them at runtime
//! via [`TransportMode`]; within one bus, transactions complete in
//! submission order. Between buses, ordering is independent.

use crate::error_handler::ErrorKind;

/// Describes a single I²C transaction. Scoped to one worker iteration: the
/// `payload` is a borrow, never owned or boxed, and never outlives the
/// worker's stack frame (spec.md §3 Data Model).
pub struct TransactionDescriptor<'a> {
    /// Which I²C bus this transaction targets.
    pub bus_id: u8,
    /// 7-bit I²C device address.
    pub device_addr: u8,
    /// Bytes to write. Borrowed from the caller's local buffer; the
    /// transport holds it exclusively until completion or timeout.
    pub payload: &'a [u8],
    /// Deadline for this transaction, in microseconds since an
    /// implementation-defined epoch (compared against
    /// [`crate::watchdog::TimeoutWatchdog`]).
    pub deadline_us: u64,
}

/// Opaque handle to an in-flight DMA transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId(pub u32);

/// Result of polling an in-flight DMA transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Still in flight.
    Pending,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Error(ErrorKind),
}

/// Blocking, single-master I²C write. Returns once the transaction has
/// either succeeded or definitively failed.
pub trait SyncI2cTransport {
    /// Perform one blocking write, retrying internally up to the
    /// implementation's handshake retry count before giving up.
    fn write(&mut self, descriptor: &TransactionDescriptor<'_>) -> Result<(), ErrorKind>;
}

/// DMA-scheduled I²C transfer, polled to completion.
pub trait AsyncI2cTransport {
    /// Schedule a transfer and return immediately with a handle to poll.
    fn start(&mut self, descriptor: &TransactionDescriptor<'_>) -> TransactionId;

    /// Non-blocking poll of an in-flight transaction.
    fn poll(&mut self, id: TransactionId) -> PollOutcome;

    /// Cooperative cancellation: disarms the DMA channel and invalidates
    /// `id`. Idempotent — safe to call on an already-completed transaction.
    /// In-flight hardware state is released before this returns, so a
    /// cancelled operation is indistinguishable from the caller's
    /// perspective from a [`ErrorKind::Timeout`] (spec.md §5).
    fn cancel(&mut self, id: TransactionId);
}

/// Which transport family a DAC is currently routed through. `DmaRequired`
/// is an initialisation-time request, not a runtime state: see
/// [`crate::electric_mayhem::Orchestrator::set_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportMode {
    /// DMA-backed transport, falling back to sync automatically on
    /// repeated failure (the default).
    Dma,
    /// DMA-backed transport; refuses to initialise if DMA channels cannot
    /// be reserved.
    DmaRequired,
    /// Always use the blocking synchronous transport.
    Sync,
}

/// Outcome of attempting a transaction through whichever transport family is
/// presently active for a DAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The sync transport finished the write before returning.
    Complete,
    /// The async transport scheduled the write; poll it with
    /// [`AsyncI2cTransport::poll`].
    InFlight(TransactionId),
    /// Failed immediately.
    Error(ErrorKind),
}

/// Dispatched by [`AnyTransport`]: start a transaction through whichever
/// concrete handle is currently active.
#[enum_dispatch::enum_dispatch]
pub trait StartTransaction {
    /// Begin `descriptor`'s transaction on this handle's transport family.
    fn start_transaction(&mut self, descriptor: &TransactionDescriptor<'_>) -> TransactionOutcome;
}

/// Wraps a blocking transport so it satisfies [`StartTransaction`].
pub struct SyncHandle<T: SyncI2cTransport>(pub T);

/// Wraps a DMA-scheduled transport so it satisfies [`StartTransaction`].
pub struct AsyncHandle<T: AsyncI2cTransport>(pub T);

impl<T: SyncI2cTransport> StartTransaction for SyncHandle<T> {
    fn start_transaction(&mut self, descriptor: &TransactionDescriptor<'_>) -> TransactionOutcome {
        match self.0.write(descriptor) {
            Ok(()) => TransactionOutcome::Complete,
            Err(kind) => TransactionOutcome::Error(kind),
        }
    }
}

impl<T: AsyncI2cTransport> StartTransaction for AsyncHandle<T> {
    fn start_transaction(&mut self, descriptor: &TransactionDescriptor<'_>) -> TransactionOutcome {
        TransactionOutcome::InFlight(self.0.start(descriptor))
    }
}

/// A tagged variant over the two concrete transport handles a worker might
/// hold for one DAC — a `SyncI2cTransport` or an `AsyncI2cTransport`, never
/// both at once, switched by [`crate::electric_mayhem::Orchestrator::set_mode`]
/// or by [`crate::error_handler::RecoveryStrategy::FallbackToSync`]. Grounded
/// directly on the teacher's own use of `enum_dispatch` to dispatch
/// `Midi`/`Gate`/`ControlVoltage` over its `Instrument` enum: "a tagged
/// variant with an inlined, small, fixed set of concrete drivers is
/// acceptable" when only two families ever coexist (spec.md §9 Design
/// Notes).
#[enum_dispatch::enum_dispatch(StartTransaction)]
pub enum AnyTransport<S: SyncI2cTransport, A: AsyncI2cTransport> {
    /// Routed through the blocking transport.
    Sync(SyncHandle<S>),
    /// Routed through the DMA-scheduled transport.
    Async(AsyncHandle<A>),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOkSync;
    impl SyncI2cTransport for AlwaysOkSync {
        fn write(&mut self, _descriptor: &TransactionDescriptor<'_>) -> Result<(), ErrorKind> {
            Ok(())
        }
    }

    struct AlwaysNakSync;
    impl SyncI2cTransport for AlwaysNakSync {
        fn write(&mut self, _descriptor: &TransactionDescriptor<'_>) -> Result<(), ErrorKind> {
            Err(ErrorKind::Nak)
        }
    }

    struct RecordingAsync {
        next_id: u32,
    }
    impl AsyncI2cTransport for RecordingAsync {
        fn start(&mut self, _descriptor: &TransactionDescriptor<'_>) -> TransactionId {
            let id = TransactionId(self.next_id);
            self.next_id += 1;
            id
        }
        fn poll(&mut self, _id: TransactionId) -> PollOutcome {
            PollOutcome::Pending
        }
        fn cancel(&mut self, _id: TransactionId) {}
    }

    fn descriptor<'a>(payload: &'a [u8]) -> TransactionDescriptor<'a> {
        TransactionDescriptor {
            bus_id: 0,
            device_addr: 0x60,
            payload,
            deadline_us: 1_000,
        }
    }

    #[test]
    fn sync_handle_completes_immediately_on_success() {
        let mut handle = SyncHandle(AlwaysOkSync);
        let payload = [0u8; 3];
        assert_eq!(
            TransactionOutcome::Complete,
            handle.start_transaction(&descriptor(&payload))
        );
    }

    #[test]
    fn sync_handle_reports_error_immediately() {
        let mut handle = SyncHandle(AlwaysNakSync);
        let payload = [0u8; 3];
        assert_eq!(
            TransactionOutcome::Error(ErrorKind::Nak),
            handle.start_transaction(&descriptor(&payload))
        );
    }

    #[test]
    fn async_handle_reports_in_flight() {
        let mut handle = AsyncHandle(RecordingAsync { next_id: 7 });
        let payload = [0u8; 3];
        assert_eq!(
            TransactionOutcome::InFlight(TransactionId(7)),
            handle.start_transaction(&descriptor(&payload))
        );
    }

    #[test]
    fn any_transport_dispatches_to_the_active_variant() {
        let mut any: AnyTransport<AlwaysOkSync, RecordingAsync> =
            AnyTransport::Sync(SyncHandle(AlwaysOkSync));
        let payload = [0u8; 3];
        assert_eq!(
            TransactionOutcome::Complete,
            any.start_transaction(&descriptor(&payload))
        );

        let mut any: AnyTransport<AlwaysOkSync, RecordingAsync> =
            AnyTransport::Async(AsyncHandle(RecordingAsync { next_id: 0 }));
        assert_eq!(
            TransactionOutcome::InFlight(TransactionId(0)),
            any.start_transaction(&descriptor(&payload))
        );
    }
}
