//! Architecture-agnostic core for a device that converts 14-bit MIDI
//! pitch-bend messages into sixteen analog control-voltage (CV) outputs
//! driven through two 8-channel I²C DACs.
//!
//! Three subsystems, tightly coupled and described in the modules below:
//! the shared-value fabric ([`dr_teeth`]), the per-DAC worker scheduling
//! and dispatch core ([`electric_mayhem`] + [`worker`] + [`muppet_state`]),
//! and the asynchronous I²C transport with fallback ([`transport`] +
//! [`error_handler`] + [`watchdog`]).
//!
//! Everything here is `no_std`, allocation-free, and deterministic: no
//! MIDI feature beyond pitch-bend-to-CV, no persisted configuration, no
//! floating point on the hot path.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

pub mod config;
pub mod dac_driver;
pub mod diagnostic;
pub mod dr_teeth;
pub mod electric_mayhem;
pub mod error_handler;
pub mod muppet_state;
pub mod sample;
pub mod transport;
pub mod watchdog;
pub mod worker;

#[cfg(test)]
mod test_support;
