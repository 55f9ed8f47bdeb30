//! The orchestrator (spec.md §4.7): the single owning aggregate of the
//! shared-value fabric, per-DAC state, and the shared error/watchdog
//! handlers. Named after the Muppets' house band, the group Dr. Teeth
//! (the [`crate::dr_teeth::InputFabric`]) leads.
//!
//! `Orchestrator` itself never touches a transport or a [`crate::worker::Worker`]
//! directly; it owns the data those types borrow. Workers live in
//! `crates/firmware`'s per-DAC tasks and are handed `&InputFabric` /
//! `&MuppetState` / `&SharedErrorHandler` / `&SharedWatchdog` references with
//! the orchestrator's lifetime (spec.md §9 Design Notes: "workers receive
//! borrowed handles with the orchestrator's lifetime").

use crate::dr_teeth::InputFabric;
use crate::error_handler::SharedErrorHandler;
use crate::muppet_state::MuppetState;
use crate::sample::{dac_index, local_index, signed_pitch_bend_to_sample};
use crate::transport::TransportMode;
use crate::watchdog::SharedWatchdog;

/// Per-DAC runtime mode, set at `initialise` time and adjustable afterwards
/// via [`Orchestrator::set_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    /// `set_mode(DmaRequired)` was requested for a DAC but DMA channels
    /// could not be reserved for it (spec.md §4.7).
    DmaUnavailable,
}

/// The single owning aggregate: shared-value fabric, one [`MuppetState`] per
/// DAC, and the handlers shared across every worker.
///
/// `DAC_COUNT` and `CH` (channels per DAC) are const generics so every
/// buffer here is fixed-size at compile time (no dynamic memory, spec.md
/// §1 non-goals). `TOTAL` must equal `DAC_COUNT * CH`; callers that get this
/// wrong will see it fail at the `InputFabric` boundary (out-of-range writes
/// are silently dropped, never a panic).
pub struct Orchestrator<const DAC_COUNT: usize, const CH: usize, const TOTAL: usize> {
    fabric: InputFabric<TOTAL>,
    muppets: [MuppetState<CH>; DAC_COUNT],
    modes: [TransportMode; DAC_COUNT],
    errors: SharedErrorHandler<DAC_COUNT>,
    watchdog: SharedWatchdog<DAC_COUNT>,
}

impl<const DAC_COUNT: usize, const CH: usize, const TOTAL: usize> Orchestrator<DAC_COUNT, CH, TOTAL> {
    /// Construct an orchestrator with every channel centred, every DAC in
    /// `TransportMode::Dma`, and no errors recorded. Infallible: hardware
    /// initialisation happens separately in `crates/firmware`, driving each
    /// [`crate::dac_driver::DacDriver`] concretely.
    pub fn new() -> Self {
        Self {
            fabric: InputFabric::new(),
            muppets: core::array::from_fn(|_| MuppetState::new()),
            modes: [TransportMode::Dma; DAC_COUNT],
            errors: SharedErrorHandler::new(),
            watchdog: SharedWatchdog::new(),
        }
    }

    /// The shared-value fabric, for read access by per-DAC workers.
    pub fn fabric(&self) -> &InputFabric<TOTAL> {
        &self.fabric
    }

    /// The per-DAC state cell at `dac`, or `None` if out of range.
    pub fn muppet(&self, dac: usize) -> Option<&MuppetState<CH>> {
        self.muppets.get(dac)
    }

    /// The error handler shared across every worker.
    pub fn errors(&self) -> &SharedErrorHandler<DAC_COUNT> {
        &self.errors
    }

    /// The timeout watchdog shared across every worker.
    pub fn watchdog(&self) -> &SharedWatchdog<DAC_COUNT> {
        &self.watchdog
    }

    /// Set the transport mode for `dac`. Requesting `DmaRequired` when DMA
    /// channels are unavailable for that bus is the caller's
    /// (`crates/firmware`'s) responsibility to detect and report as
    /// [`InitError::DmaUnavailable`]; this method only records the
    /// requested mode and, for `Sync`, forces the DAC's fallback flag on so
    /// workers route through the blocking transport immediately rather than
    /// waiting for a DMA failure to discover it.
    pub fn set_mode(&mut self, dac: usize, mode: TransportMode) {
        if let Some(slot) = self.modes.get_mut(dac) {
            *slot = mode;
        }
        if let Some(muppet) = self.muppets.get(dac) {
            muppet.set_fallback_active(matches!(mode, TransportMode::Sync));
        }
    }

    /// The transport mode most recently requested for `dac`, or `None` if
    /// out of range.
    pub fn mode(&self, dac: usize) -> Option<TransportMode> {
        self.modes.get(dac).copied()
    }

    /// Request a fresh broadcast to every DAC (e.g. for the periodic
    /// force-refresh tick, spec.md §4.6): bumps every `pending_sequence` and
    /// raises every doorbell, lock-free and constant-time per DAC (spec.md
    /// §4.7).
    pub fn request_update(&self) {
        for muppet in &self.muppets {
            muppet.request_update();
        }
    }

    /// The inbound entry point of spec.md §6: a 1-indexed MIDI channel and
    /// its pitch-bend deviation from centre (`0` = centre, spec.md §4.6).
    /// Converts to a [`crate::sample::Sample`], writes it into the fabric,
    /// and rings the doorbell for the owning DAC only. Silently a no-op if
    /// `channel_1_based` is out of range (scenario S3 of spec.md §8) — never
    /// panics, never blocks.
    pub fn on_pitch_bend(&self, channel_1_based: u8, bend: i16) {
        let Some(channel) = (channel_1_based as usize).checked_sub(1) else {
            return;
        };
        if channel >= TOTAL {
            return;
        }
        let sample = signed_pitch_bend_to_sample(bend);
        self.fabric.write(channel, sample);

        let dac = dac_index(channel, CH);
        if let Some(muppet) = self.muppets.get(dac) {
            muppet.request_update();
        }
    }

    /// Map a logical channel to its `(dac, local_channel)` pair, or `None`
    /// if out of range.
    pub fn route(&self, channel: usize) -> Option<(usize, usize)> {
        if channel >= TOTAL {
            return None;
        }
        Some((dac_index(channel, CH), local_index(channel, CH)))
    }

    /// Whether `dac` has exhausted every recovery strategy and should no
    /// longer be driven (spec.md §4.7 Failure semantics). Other DACs keep
    /// operating independently of this one's failure.
    pub fn is_fatal(&self, dac: usize) -> bool {
        self.muppets.get(dac).is_some_and(MuppetState::is_fatal)
    }
}

impl<const DAC_COUNT: usize, const CH: usize, const TOTAL: usize> Default
    for Orchestrator<DAC_COUNT, CH, TOTAL>
{
    fn default() -> Self {
        Self::new()
    }
}
