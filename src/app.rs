//! The core application state.
//!
//! [`CplApp`] owns the instrument set, the scan and calibration controllers and the
//! safety monitor, and is what a front end talks to.
use crate::calibration::CalibrationController;
use crate::config::CplConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::lockin::ScopeReading;
use crate::instruments::Instruments;
use crate::safety::{SafetyAlarm, SafetyMonitor};
use crate::scan::{ScanController, ScanParameters, ScanState};
use crate::store::{ParameterRecord, SpectrumStore, LAST_PARAMETERS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info};

/// Front-end facing handle on the acquisition core.
pub struct CplApp {
    instruments: Arc<Instruments>,
    store: Arc<dyn SpectrumStore>,
    scan: Arc<ScanController>,
    calibration: CalibrationController,
    safety: Mutex<Option<SafetyMonitor>>,
    /// Serializes starting a scan against starting a calibration
    start_guard: Mutex<()>,
    last_scan: Mutex<Option<ScanParameters>>,
    shutdown_flag: AtomicBool,
}

impl CplApp {
    /// Wire the controllers around `instruments`; nothing is initialized yet.
    pub fn new(instruments: Instruments, store: Arc<dyn SpectrumStore>) -> Self {
        let instruments = Arc::new(instruments);
        let scan = Arc::new(ScanController::new(
            Arc::clone(&instruments),
            Arc::clone(&store),
        ));
        Self {
            calibration: CalibrationController::new(
                Arc::clone(&instruments),
                Arc::clone(&store),
                scan.state_watch(),
            ),
            scan,
            instruments,
            store,
            safety: Mutex::new(None),
            start_guard: Mutex::new(()),
            last_scan: Mutex::new(None),
            shutdown_flag: AtomicBool::new(false),
        }
    }

    /// Shared configuration
    pub fn config(&self) -> &Arc<CplConfig> {
        self.instruments.config()
    }

    /// The instrument set
    pub fn instruments(&self) -> &Arc<Instruments> {
        &self.instruments
    }

    /// Scan controller; start scans through [`start_scan`](Self::start_scan)
    pub fn scan(&self) -> &Arc<ScanController> {
        &self.scan
    }

    /// Calibration controller; start through [`start_calibration`](Self::start_calibration)
    pub fn calibration(&self) -> &CalibrationController {
        &self.calibration
    }

    /// Initialize every instrument and start the safety monitor.
    pub async fn initialize(&self) -> AppResult<()> {
        if self.shutdown_flag.load(Ordering::SeqCst) {
            return Err(DaqError::InvalidState("application is shut down".into()));
        }
        self.instruments.initialize().await?;

        let mut safety = self.safety.lock().await;
        if safety.is_none() {
            *safety = Some(SafetyMonitor::spawn(
                Arc::clone(&self.instruments),
                self.scan.abort_signal(),
                self.scan.state_watch(),
            ));
        }
        Ok(())
    }

    /// Start a scan unless a calibration holds the lock-in.
    pub async fn start_scan(&self, params: ScanParameters) -> AppResult<()> {
        let _guard = self.start_guard.lock().await;
        if self.calibration.state().is_active() {
            return Err(DaqError::InvalidState(
                "cannot start a scan while calibrating".into(),
            ));
        }
        self.scan.start(params.clone()).await?;
        *self.last_scan.lock().await = Some(params);
        Ok(())
    }

    /// Start a phase calibration unless a scan is running.
    pub async fn start_calibration(&self) -> AppResult<()> {
        let _guard = self.start_guard.lock().await;
        self.calibration.start().await
    }

    /// Oscilloscope readings of the safety monitor, once initialized
    pub async fn scope_watch(&self) -> Option<watch::Receiver<ScopeReading>> {
        self.safety.lock().await.as_ref().map(|s| s.reading_watch())
    }

    /// Safety alarms, once initialized
    pub async fn safety_alarms(&self) -> Option<broadcast::Receiver<SafetyAlarm>> {
        self.safety.lock().await.as_ref().map(|s| s.subscribe())
    }

    /// Recent trace maxima for the live plot, once initialized
    pub async fn scope_history_watch(&self) -> Option<watch::Receiver<Vec<f64>>> {
        self.safety.lock().await.as_ref().map(|s| s.history_watch())
    }

    /// Parameters that pre-populate the next session
    pub async fn last_parameters(&self) -> AppResult<Option<ParameterRecord>> {
        self.store.load_parameters(LAST_PARAMETERS).await
    }

    async fn save_last_parameters(&self) -> AppResult<()> {
        let record = match self.last_scan.lock().await.as_ref() {
            Some(params) => self.scan.parameter_record(params).await,
            None => {
                let state = self.instruments.lockin_state().await;
                let mut record = self.last_parameters().await?.unwrap_or_default();
                record.timestamp = chrono::Local::now();
                record.phase_offset_deg = state.phase_offset;
                record.pmt_volt = state.pmt_volt;
                record.input_range_v = state.signal_range;
                record
            }
        };
        self.store.save_parameters(LAST_PARAMETERS, &record).await
    }

    /// Abort active work, persist the last parameters and disconnect everything.
    ///
    /// Every step runs even if an earlier one failed.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.shutdown_flag.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down...");
        let mut errors = Vec::new();

        if self.scan.state() != ScanState::Idle {
            self.scan.abort("application shutdown");
            if let Err(e) = self.scan.wait().await {
                errors.push(e);
            }
        }
        if let Err(e) = self.calibration.cancel().await {
            errors.push(e);
        }
        if let Err(e) = self.save_last_parameters().await {
            errors.push(e);
        }
        if let Some(safety) = self.safety.lock().await.take() {
            safety.stop().await;
        }
        match self.instruments.shutdown().await {
            Ok(()) => {}
            Err(DaqError::ShutdownFailed(inner)) => errors.extend(inner),
            Err(e) => errors.push(e),
        }

        if errors.is_empty() {
            info!("Shutdown complete");
            Ok(())
        } else {
            for e in &errors {
                error!("Error during shutdown: {}", e);
            }
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockRig;
    use crate::store::MemoryStore;

    fn app(rig: &MockRig) -> (CplApp, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let instruments = rig.instruments(Arc::new(CplConfig::default()));
        (CplApp::new(instruments, store.clone()), store)
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_persists_last_parameters() {
        let rig = MockRig::new();
        let (app, store) = app(&rig);
        app.initialize().await.unwrap();
        assert!(app.scope_watch().await.is_some());

        app.shutdown().await.unwrap();
        let last = store.load_parameters(LAST_PARAMETERS).await.unwrap().unwrap();
        assert!((last.phase_offset_deg - 158.056).abs() < 1e-9);
        assert_eq!(last.pmt_volt, 0.0);
        assert!(!rig.scope.is_running().await);

        // Second call is a no-op
        app.shutdown().await.unwrap();
        assert!(app.initialize().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_rejected_while_calibrating() {
        let rig = MockRig::new();
        let (app, _) = app(&rig);
        app.initialize().await.unwrap();
        app.start_calibration().await.unwrap();

        let params = ScanParameters::new(500.0, 499.0, 1.0, 0.1, "s");
        assert!(matches!(
            app.start_scan(params).await,
            Err(DaqError::InvalidState(_))
        ));
        app.shutdown().await.unwrap();
    }
}
