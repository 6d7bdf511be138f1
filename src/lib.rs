//! # CPL DAQ Core Library
//!
//! Acquisition engine for circularly polarized luminescence spectroscopy. A photoelastic
//! modulator and a monochromator select polarization and wavelength, a lock-in amplifier
//! demodulates the photomultiplier signal, and the engine turns its sample streams into
//! spectra of the dissymmetry factor `glum`.
//!
//! ## Crate Structure
//!
//! - **`app`**: `CplApp`, owner of the instruments and controllers, with graceful shutdown.
//! - **`config`**: `CplConfig`, loaded from defaults, a TOML file and `CPL_DAQ_*` env vars.
//! - **`error`**: the `DaqError` taxonomy.
//! - **`logging`**: tracing subscriber setup and the error alert layer.
//! - **`cancel`**: `AbortSignal` and interruptible sleeps.
//! - **`hardware`**: transport traits, the line protocol, instrument sessions and mocks.
//! - **`instruments`**: the shared instrument set, one lock per session.
//! - **`acquisition`**: timestamp alignment of the three demodulator streams.
//! - **`processing`**: `DataPoint` and `Spectrum` from aligned frames.
//! - **`correction`**: detector and blank corrections.
//! - **`averaging`**: running and final averages over repetitions.
//! - **`scan`**, **`calibration`**, **`safety`**: the three controllers.
//! - **`store`**: persistence boundary.

pub mod acquisition;
pub mod app;
pub mod averaging;
pub mod calibration;
pub mod cancel;
pub mod config;
pub mod correction;
pub mod error;
pub mod hardware;
pub mod instruments;
pub mod logging;
pub mod processing;
pub mod safety;
pub mod scan;
pub mod store;

pub use app::CplApp;
pub use config::CplConfig;
pub use error::{AppResult, DaqError};
