//! Shared `#[cfg(test)]` mocks: a scriptable [`DacDriver`], used across the
//! crate's test modules as "the backbone of the test suite" (spec.md §9).
//!
//! Kept in its own module (rather than copy-pasted per test module)
//! because several of `electric_mayhem`/`worker`'s higher-level tests need
//! the exact same recording/scripting behaviour the teacher's
//! `portamento.rs` tests get from a shared `MockDriver`.

use heapless::Vec;

use crate::dac_driver::{DacDriver, DacError};
use crate::error_handler::ErrorKind;
use crate::sample::Sample;

/// Maximum number of calls a [`MockDacDriver`] will remember; generous for
/// any single test.
const MOCK_LOG_CAPACITY: usize = 64;

/// One observed call into a [`MockDacDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `set_channel(idx, sample)`.
    SetChannel(usize, Sample),
    /// `set_all_same(sample)`.
    SetAllSame(Sample),
    /// `set_values(values)`.
    SetValues(Vec<Sample, 16>),
    /// `enable()`.
    Enable,
    /// `disable()`.
    Disable,
}

/// A scriptable [`DacDriver`] for host tests: every call is recorded, and
/// the next call can be made to fail by pushing an [`ErrorKind`] onto
/// [`MockDacDriver::fail_next`].
pub struct MockDacDriver<const CHANNELS: usize> {
    initialised: bool,
    enabled: bool,
    values: [Sample; CHANNELS],
    calls: Vec<MockCall, MOCK_LOG_CAPACITY>,
    fail_next: Option<ErrorKind>,
}

impl<const CHANNELS: usize> MockDacDriver<CHANNELS> {
    /// A driver that has not yet been initialised.
    pub fn new() -> Self {
        Self {
            initialised: false,
            enabled: false,
            values: [0x8000; CHANNELS],
            calls: Vec::new(),
            fail_next: None,
        }
    }

    /// Arrange for the next fallible call to fail with `kind`, once.
    pub fn fail_next(&mut self, kind: ErrorKind) {
        self.fail_next = Some(kind);
    }

    /// Every call recorded so far, oldest first.
    pub fn calls(&self) -> &[MockCall] {
        &self.calls
    }

    /// The values most recently landed (whether or not currently latched
    /// visible via `enable`).
    pub fn values(&self) -> &[Sample; CHANNELS] {
        &self.values
    }

    /// Whether the latch is currently open.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn take_failure(&mut self) -> Option<DacError> {
        self.fail_next.take().map(DacError::Transport)
    }
}

impl<const CHANNELS: usize> Default for MockDacDriver<CHANNELS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CHANNELS: usize> DacDriver for MockDacDriver<CHANNELS> {
    type Descriptor = ();
    const CHANNELS: usize = CHANNELS;

    async fn initialise(&mut self, _descriptor: Self::Descriptor) -> Result<(), DacError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.values = [0; CHANNELS];
        self.enabled = false;
        self.initialised = true;
        Ok(())
    }

    async fn enable(&mut self) -> Result<(), DacError> {
        if !self.initialised {
            return Err(DacError::NotInitialized);
        }
        let _ = self.calls.push(MockCall::Enable);
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.enabled = true;
        Ok(())
    }

    async fn disable(&mut self) -> Result<(), DacError> {
        if !self.initialised {
            return Err(DacError::NotInitialized);
        }
        let _ = self.calls.push(MockCall::Disable);
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.enabled = false;
        Ok(())
    }

    async fn set_channel(&mut self, idx: usize, sample: Sample) -> Result<(), DacError> {
        if !self.initialised {
            return Err(DacError::NotInitialized);
        }
        let _ = self.calls.push(MockCall::SetChannel(idx, sample));
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if let Some(slot) = self.values.get_mut(idx) {
            *slot = sample;
        }
        Ok(())
    }

    async fn set_all_same(&mut self, sample: Sample) -> Result<(), DacError> {
        if !self.initialised {
            return Err(DacError::NotInitialized);
        }
        let _ = self.calls.push(MockCall::SetAllSame(sample));
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.values = [sample; CHANNELS];
        Ok(())
    }

    async fn set_values(&mut self, values: &[Sample]) -> Result<(), DacError> {
        if !self.initialised {
            return Err(DacError::NotInitialized);
        }
        let mut recorded = Vec::new();
        let _ = recorded.extend_from_slice(values);
        let _ = self.calls.push(MockCall::SetValues(recorded));
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if values.len() == CHANNELS {
            self.values.copy_from_slice(values);
        }
        Ok(())
    }
}

/// Polls a future to completion on the spot. Every future in this crate's
/// test suite resolves on its first poll (the mocks never actually suspend),
/// so a real executor is unnecessary — this just avoids pulling one in as a
/// dependency for tests alone.
#[cfg(test)]
pub(crate) fn block_on<F: core::future::Future>(fut: F) -> F::Output {
    use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(core::ptr::null(), &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

    let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
    let mut cx = Context::from_waker(&waker);
    let mut fut = core::pin::pin!(fut);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(v) => return v,
            Poll::Pending => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_in_order() {
        let mut driver = MockDacDriver::<4>::new();
        block_on(async {
            driver.initialise(()).await.unwrap();
            driver.set_channel(0, 0x1234).await.unwrap();
            driver.enable().await.unwrap();
        });
        assert_eq!(
            &[MockCall::SetChannel(0, 0x1234), MockCall::Enable],
            driver.calls()
        );
        assert_eq!(0x1234, driver.values()[0]);
        assert!(driver.is_enabled());
    }

    #[test]
    fn fail_next_fails_exactly_one_call() {
        let mut driver = MockDacDriver::<4>::new();
        block_on(async {
            driver.initialise(()).await.unwrap();
            driver.fail_next(ErrorKind::Nak);
            let first = driver.set_channel(0, 0x1234).await;
            assert_eq!(Err(DacError::Transport(ErrorKind::Nak)), first);
            let second = driver.set_channel(0, 0x1234).await;
            assert_eq!(Ok(()), second);
        });
    }
}
