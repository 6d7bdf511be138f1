//! Instrument set shared by the controllers.
//!
//! Every session sits behind its own `tokio::sync::Mutex`; a guard is held for the whole
//! exchange including protocol retries and released on every exit path. No method holds
//! two guards at once, in particular never the acquisition and the oscilloscope session of
//! the lock-in together.

use crate::cancel::AbortSignal;
use crate::config::{CplConfig, PmtConfig};
use crate::error::{AppResult, DaqError};
use crate::hardware::lockin::{LockinSession, LockinState, ScopeReading, ScopeSession};
use crate::hardware::modulator::Modulator;
use crate::hardware::monochromator::Monochromator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// PMT gain at control voltage `volt`
pub fn volt_to_gain(pmt: &PmtConfig, volt: f64) -> f64 {
    10f64.powf(volt * pmt.gain_slope + pmt.gain_offset) / pmt.gain_norm
}

/// Control voltage for `gain`, limited to `[0, high_limit]`.
pub fn gain_to_volt(pmt: &PmtConfig, high_limit: f64, gain: f64) -> f64 {
    if gain < 1.0 {
        0.0
    } else if gain >= pmt.max_gain {
        high_limit
    } else {
        (((gain * pmt.gain_norm).log10() - pmt.gain_offset) / pmt.gain_slope).clamp(0.0, high_limit)
    }
}

pub struct Instruments {
    modulator: Mutex<Modulator>,
    monochromator: Mutex<Monochromator>,
    lockin: Mutex<LockinSession>,
    scope: Mutex<ScopeSession>,
    config: Arc<CplConfig>,
    initialized: AtomicBool,
    modulation_active: AtomicBool,
    range_rx: watch::Receiver<f64>,
}

impl Instruments {
    pub fn new(
        modulator: Modulator,
        monochromator: Monochromator,
        lockin: LockinSession,
        scope: ScopeSession,
        config: Arc<CplConfig>,
    ) -> Self {
        let range_rx = lockin.range_watch();
        Self {
            modulator: Mutex::new(modulator),
            monochromator: Mutex::new(monochromator),
            lockin: Mutex::new(lockin),
            scope: Mutex::new(scope),
            config,
            initialized: AtomicBool::new(false),
            modulation_active: AtomicBool::new(false),
            range_rx,
        }
    }

    /// Open the serial instruments from the configuration; the lock-in transports come
    /// from the caller since the vendor API has no Rust binding here.
    #[cfg(feature = "instrument_serial")]
    pub fn open_serial(
        config: Arc<CplConfig>,
        lockin: Box<dyn crate::hardware::capabilities::LockinApi>,
        scope: Box<dyn crate::hardware::capabilities::ScopeStream>,
    ) -> AppResult<Self> {
        Ok(Self::new(
            Modulator::open_serial(config.modulator.clone())?,
            Monochromator::open_serial(config.monochromator.clone())?,
            LockinSession::new(lockin, config.lockin.clone()),
            ScopeSession::new(scope),
            config,
        ))
    }

    pub fn config(&self) -> &Arc<CplConfig> {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> AppResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DaqError::NotInitialized("instruments".to_string()))
        }
    }

    /// Self-test both positioning devices, set up the lock-in, start the oscilloscope and
    /// park at the configured wavelength. Fails closed.
    pub async fn initialize(self: &Arc<Self>) -> AppResult<()> {
        self.initialized.store(false, Ordering::SeqCst);
        info!("Initializing instruments...");

        let bessel = {
            let mut pem = self.modulator.lock().await;
            pem.initialize().await?;
            pem.bessel_correction()
        };
        self.monochromator.lock().await.initialize().await?;
        self.lockin.lock().await.setup_for_daq(bessel).await?;
        self.scope.lock().await.start().await?;

        self.initialized.store(true, Ordering::SeqCst);
        self.modulation_active.store(true, Ordering::SeqCst);

        let park = self.config.monochromator.park_nm;
        if let Err(e) = self.move_nm(park, true, None).await {
            self.initialized.store(false, Ordering::SeqCst);
            error!("Initialization error: park move failed: {}", e);
            return Err(e);
        }
        info!("Instruments initialized, parked at {} nm", park);
        Ok(())
    }

    /// Move monochromator and (optionally) modulator to `nm` in parallel, then wait the
    /// move delay. With an abort signal the delay is cut short on abort.
    pub async fn move_nm(
        self: &Arc<Self>,
        nm: f64,
        move_modulator: bool,
        abort: Option<&AbortSignal>,
    ) -> AppResult<()> {
        self.ensure_initialized()?;

        let mono = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.monochromator.lock().await.set_nm(nm).await })
        };
        let pem = if move_modulator {
            Some(self.modulator.lock().await.set_nm(nm).await)
        } else {
            None
        };
        let mono = mono
            .await
            .map_err(|e| DaqError::Instrument(format!("monochromator move task: {}", e)))?;

        mono?;
        if let Some(pem) = pem {
            pem?;
        }

        let delay = self.config.scan.move_delay();
        match abort {
            Some(signal) => {
                signal
                    .sleep_interruptible(delay, self.config.scan.abort_granularity())
                    .await;
            }
            None => tokio::time::sleep(delay).await,
        }
        debug!(wavelength = nm, "move complete");
        Ok(())
    }

    /// External reference and modulator output on or off, for AC background scans.
    pub async fn set_modulation_active(&self, active: bool) -> AppResult<()> {
        self.ensure_initialized()?;
        self.lockin.lock().await.set_extref_active(0, active).await?;
        let echoed = self.modulator.lock().await.set_active(active).await?;
        if echoed != active {
            return Err(DaqError::Instrument(format!(
                "modulator output reports {} after switching to {}",
                echoed, active
            )));
        }
        self.modulation_active.store(active, Ordering::SeqCst);
        info!("Modulation {}", if active { "on" } else { "off" });
        Ok(())
    }

    pub fn is_modulation_active(&self) -> bool {
        self.modulation_active.load(Ordering::SeqCst)
    }

    pub async fn set_pmt_voltage(&self, volt: f64, autorange: bool) -> AppResult<()> {
        self.lockin.lock().await.set_pmt_voltage(volt, autorange).await
    }

    /// Set the PMT gain, returning the control voltage used.
    pub async fn set_pmt_gain(&self, gain: f64, autorange: bool) -> AppResult<f64> {
        let volt = gain_to_volt(&self.config.pmt, self.config.lockin.pmt_high_limit_v, gain);
        self.set_pmt_voltage(volt, autorange).await?;
        Ok(volt)
    }

    pub async fn pmt_gain(&self) -> f64 {
        volt_to_gain(&self.config.pmt, self.lockin_state().await.pmt_volt)
    }

    /// High voltage to 0 V; failures are logged and returned.
    pub async fn safe_pmt(&self) -> AppResult<()> {
        let result = self.set_pmt_voltage(0.0, false).await;
        match &result {
            Ok(()) => warn!("PMT voltage set to 0 V"),
            Err(e) => error!("Error while zeroing the PMT voltage: {}", e),
        }
        result
    }

    pub async fn autorange(&self) -> AppResult<f64> {
        self.lockin.lock().await.autorange().await
    }

    pub async fn set_input_range(&self, range: f64) -> AppResult<f64> {
        self.lockin.lock().await.set_input_range(range).await
    }

    pub async fn set_phase_offset(&self, degrees: f64) -> AppResult<()> {
        self.lockin.lock().await.set_phase_offset(degrees).await
    }

    pub async fn set_dwell_time(&self, seconds: f64) {
        self.lockin.lock().await.set_dwell_time(seconds)
    }

    pub async fn lockin_state(&self) -> LockinState {
        self.lockin.lock().await.state()
    }

    /// Acquisition session, for the sampler and the calibration recorder
    pub fn lockin(&self) -> &Mutex<LockinSession> {
        &self.lockin
    }

    /// Last input range reported by the lock-in
    pub fn signal_range(&self) -> f64 {
        *self.range_rx.borrow()
    }

    pub fn range_watch(&self) -> watch::Receiver<f64> {
        self.range_rx.clone()
    }

    pub async fn read_scope(&self) -> AppResult<ScopeReading> {
        self.scope.lock().await.read().await
    }

    pub async fn stop_scope(&self) -> AppResult<()> {
        self.scope.lock().await.stop().await
    }

    /// Zero the PMT, stop the oscilloscope and close every session.
    ///
    /// All steps run; their errors are collected.
    pub async fn shutdown(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        if self.is_initialized() {
            if let Err(e) = self.safe_pmt().await {
                errors.push(e);
            }
        }
        self.initialized.store(false, Ordering::SeqCst);

        {
            let mut scope = self.scope.lock().await;
            if scope.is_running() {
                if let Err(e) = scope.stop().await {
                    errors.push(e);
                }
            }
        }
        if let Err(e) = self.lockin.lock().await.disconnect().await {
            errors.push(e);
        }
        if let Err(e) = self.modulator.lock().await.close().await {
            errors.push(e);
        }
        if let Err(e) = self.monochromator.lock().await.close().await {
            errors.push(e);
        }

        if errors.is_empty() {
            info!("All instruments disconnected");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockModulator, MockRig};

    async fn initialized_rig() -> (MockRig, Arc<Instruments>) {
        let rig = MockRig::new();
        let instruments = Arc::new(rig.instruments(Arc::new(CplConfig::default())));
        instruments.initialize().await.unwrap();
        (rig, instruments)
    }

    #[test]
    fn gain_curve_round_trip() {
        let pmt = PmtConfig::default();
        let gain = volt_to_gain(&pmt, 0.8);
        assert!((gain_to_volt(&pmt, 1.1, gain) - 0.8).abs() < 1e-9);
        assert_eq!(gain_to_volt(&pmt, 1.1, 0.5), 0.0);
        assert_eq!(gain_to_volt(&pmt, 1.1, 900.0), 1.1);
        assert!(volt_to_gain(&pmt, 0.0) < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_parks_both_devices() {
        let (rig, instruments) = initialized_rig().await;
        assert!(instruments.is_initialized());
        assert_eq!(rig.monochromator.position().await, 1000.0);
        assert!((rig.modulator.amplitude().await - 250.0).abs() < 1e-9);
        assert!(rig.modulator.is_active().await);
        assert!(rig.scope.is_running().await);
        assert_eq!(instruments.signal_range(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_self_test_leaves_instruments_unusable() {
        let mut rig = MockRig::new();
        rig.modulator = MockModulator::with_model("unknown");
        let instruments = Arc::new(rig.instruments(Arc::new(CplConfig::default())));

        assert!(instruments.initialize().await.is_err());
        assert!(!instruments.is_initialized());
        assert!(matches!(
            instruments.move_nm(500.0, true, None).await,
            Err(DaqError::NotInitialized(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn move_without_modulator() {
        let (rig, instruments) = initialized_rig().await;
        instruments.move_nm(420.0, false, None).await.unwrap();
        assert_eq!(rig.monochromator.position().await, 420.0);
        assert!((rig.modulator.amplitude().await - 250.0).abs() < 1e-9);

        instruments.move_nm(430.0, true, None).await.unwrap();
        assert!((rig.modulator.amplitude().await - 107.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_monochromator_move_is_reported() {
        let (rig, instruments) = initialized_rig().await;
        rig.monochromator.fail_next(3).await;
        assert!(matches!(
            instruments.move_nm(600.0, true, None).await,
            Err(DaqError::Communication { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn modulation_off_disables_reference_and_output() {
        let (rig, instruments) = initialized_rig().await;
        instruments.set_modulation_active(false).await.unwrap();
        assert_eq!(rig.lockin.setting("extrefs/0/enable").await, Some(0.0));
        assert!(!rig.modulator.is_active().await);
        assert!(!instruments.is_modulation_active());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_zeroes_pmt_and_stops_scope() {
        let (rig, instruments) = initialized_rig().await;
        instruments.set_pmt_voltage(0.9, false).await.unwrap();
        instruments.shutdown().await.unwrap();
        assert_eq!(rig.lockin.setting("auxouts/0/offset").await, Some(0.0));
        assert!(!rig.scope.is_running().await);
        assert!(!instruments.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_collects_errors() {
        let (rig, instruments) = initialized_rig().await;
        rig.lockin.fail_settings(true).await;
        match instruments.shutdown().await {
            Err(DaqError::ShutdownFailed(errors)) => assert!(!errors.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
