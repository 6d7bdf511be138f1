//! Instrument sessions
//!
//! Transport traits at the bottom, the line protocol on top of them, and one session per
//! physical instrument. `mock` substitutes every transport for tests and the demo.

pub mod capabilities;
pub mod lockin;
pub mod mock;
pub mod modulator;
pub mod monochromator;
pub mod protocol;
#[cfg(feature = "instrument_serial")]
pub mod serial;
