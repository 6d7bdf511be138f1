//! Scan Controller
//!
//! Runs spectral scans on a dedicated worker task:
//!
//! ```text
//! Idle --start--> Running --loop done--> Completing --> Idle
//!                    |
//!                    +--abort / fatal--> Aborting ----> Idle
//! ```
//!
//! Per wavelength the monochromator and the modulator move in parallel, the lock-in
//! filter settles, and the alignment sampler and signal processor produce one point.
//! A point that fails is retried up to `max_point_attempts` times, after which the whole
//! scan aborts. On abort the PMT high voltage is zeroed. Whatever happened, the worker
//! switches modulation back on, returns to the start wavelength and clears the abort
//! signal before the state goes back to `Idle`.
//!
//! Observers follow a scan through `watch` channels (state, progress, running average)
//! and a `broadcast` channel of [`ScanEvent`]s.

use crate::averaging::{average_spectra, AverageEntry, RunningAverage};
use crate::cancel::AbortSignal;
use crate::config::CplConfig;
use crate::correction::{apply_corrections, CorrectionSet, CorrectionTable};
use crate::error::{AppResult, DaqError};
use crate::instruments::{volt_to_gain, Instruments};
use crate::processing::{process_frame, DataPoint, Spectrum, WAVELENGTH_EPSILON};
use crate::store::{ParameterRecord, SpectrumStore};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

// =============================================================================
// Parameters
// =============================================================================

/// User-entered scan settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// First wavelength in nm
    pub start_nm: f64,
    /// Last wavelength in nm
    pub end_nm: f64,
    /// Step width, positive; the direction follows from start and end
    pub step_nm: f64,
    /// Lock-in integration time per point in seconds
    pub dwell_time_s: f64,
    /// Number of passes over the range
    pub repetitions: u32,
    /// Output name in the spectrum store
    pub name: String,
    /// AC baseline correction, empty for none
    pub ac_blank: String,
    /// DC baseline correction, empty for none
    pub dc_blank: String,
    /// Detector sensitivity correction, empty for none
    pub detector_correction: String,
    /// Measure without modulation (AC background)
    pub modulation_off: bool,
    /// Free text stored with the parameters
    pub comment: String,
}

impl ScanParameters {
    /// One repetition, no corrections, modulation on.
    pub fn new(start_nm: f64, end_nm: f64, step_nm: f64, dwell_time_s: f64, name: &str) -> Self {
        Self {
            start_nm,
            end_nm,
            step_nm,
            dwell_time_s,
            repetitions: 1,
            name: name.to_string(),
            ac_blank: String::new(),
            dc_blank: String::new(),
            detector_correction: String::new(),
            modulation_off: false,
            comment: String::new(),
        }
    }

    /// Set the number of passes
    pub fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Check numbers and the output name; nothing else is touched.
    pub fn validate(&self, illegal_chars: &str) -> AppResult<()> {
        let numbers = [
            ("start wavelength", self.start_nm),
            ("end wavelength", self.end_nm),
            ("step", self.step_nm),
            ("dwell time", self.dwell_time_s),
        ];
        for (what, value) in numbers {
            if !value.is_finite() || value <= 0.0 {
                return Err(DaqError::Precondition(format!(
                    "{} must be a positive number, got {}",
                    what, value
                )));
            }
        }
        if self.repetitions == 0 {
            return Err(DaqError::Precondition(
                "at least one repetition is required".into(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(DaqError::Precondition("an output name is required".into()));
        }
        if let Some(c) = self.name.chars().find(|c| illegal_chars.contains(*c)) {
            return Err(DaqError::Precondition(format!(
                "Filename contains the illegal character '{}' (not allowed: {})",
                c, illegal_chars
            )));
        }
        Ok(())
    }

    /// Wavelengths of one pass. The last step may overshoot `end_nm` when the range is
    /// not a multiple of the step.
    pub fn wavelengths(&self) -> Vec<f64> {
        let distance = (self.end_nm - self.start_nm).abs();
        if distance < WAVELENGTH_EPSILON {
            return vec![self.start_nm];
        }
        let increment = if self.end_nm < self.start_nm {
            -self.step_nm
        } else {
            self.step_nm
        };
        let steps = (distance / self.step_nm - 1e-9).ceil() as usize;
        (0..=steps)
            .map(|i| self.start_nm + i as f64 * increment)
            .collect()
    }

    /// Any correction file is selected
    pub fn has_corrections(&self) -> bool {
        !(self.ac_blank.is_empty() && self.dc_blank.is_empty() && self.detector_correction.is_empty())
    }

    /// `name` for a single pass, `name_<n>` (1-based) when repeating
    pub fn output_name(&self, repetition: usize) -> String {
        if self.repetitions > 1 {
            format!("{}_{}", self.name, repetition + 1)
        } else {
            self.name.clone()
        }
    }
}

// =============================================================================
// Observation
// =============================================================================

/// Lifecycle of the scan worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// No scan; a new one may start
    Idle,
    /// Stepping through wavelengths
    Running,
    /// Loop done, averaging and saving
    Completing,
    /// Abort requested, winding down
    Aborting,
}

/// Progress of the current repetition and the estimated time left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Progress through the current repetition
    pub percent: f64,
    /// 1-based repetition
    pub run: u32,
    /// Total repetitions
    pub runs: u32,
    /// Time since the first point
    pub elapsed_s: f64,
    /// Estimated time left over all repetitions
    pub remaining_s: f64,
}

impl ScanProgress {
    /// Progress at `current_nm`, extrapolating the ETA from `elapsed`.
    pub fn compute(
        start_nm: f64,
        end_nm: f64,
        current_nm: f64,
        run: u32,
        runs: u32,
        elapsed: Duration,
    ) -> Self {
        let percent = if (end_nm - start_nm).abs() < WAVELENGTH_EPSILON {
            100.0
        } else if end_nm > start_nm {
            (1.0 - (end_nm - current_nm) / (end_nm - start_nm)) * 100.0
        } else {
            (1.0 - (current_nm - end_nm) / (start_nm - end_nm)) * 100.0
        };

        let elapsed_s = elapsed.as_secs_f64();
        let remaining_s = if percent > 0.0 {
            let done = percent + 100.0 * f64::from(run.saturating_sub(1));
            ((f64::from(runs) * 100.0 / done - 1.0) * elapsed_s).max(0.0)
        } else {
            0.0
        };

        Self {
            percent,
            run,
            runs,
            elapsed_s,
            remaining_s,
        }
    }
}

impl fmt::Display for ScanProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, unit) = if self.remaining_s < 60.0 {
            (self.remaining_s, "s")
        } else if self.remaining_s < 3600.0 {
            (self.remaining_s / 60.0, "min")
        } else {
            (self.remaining_s / 3600.0, "h")
        };
        write!(
            f,
            "{:.1} % ({}/{}), ca. {:.1} {}",
            self.percent, self.run, self.runs, value, unit
        )
    }
}

/// Notifications of a running scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The worker began; `points_per_run` wavelengths per repetition
    Started { runs: u32, points_per_run: usize },
    /// A repetition (1-based) began
    RepetitionStarted { run: u32 },
    /// A point was accepted
    Point { run: u32, point: DataPoint },
    /// The running average changed at one wavelength
    Average(AverageEntry),
    /// Possibly linearly polarized emission
    LinearPolarization { wavelength: f64, lp_theta_std: f64 },
    /// A repetition ended with `points` accepted points
    RepetitionFinished { run: u32, points: usize },
    /// Zeroing the PMT high voltage failed during an abort
    PmtNotZeroed { error: String },
    /// The worker is back to idle
    Finished { aborted: bool },
}

/// Result of a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutcome {
    /// Raw spectrum of each repetition that ran, partial if aborted
    pub spectra: Vec<Spectrum>,
    /// Corrected copy of each spectrum, when corrections were selected
    pub corrected: Vec<Spectrum>,
    /// Average over complete repetitions
    pub average: Option<Spectrum>,
    /// Corrected average
    pub average_corrected: Option<Spectrum>,
    /// The scan stopped before its last point
    pub aborted: bool,
    /// First abort reason
    pub abort_reason: Option<String>,
    /// Linear polarization was flagged at some wavelength
    pub lp_detected: bool,
    /// Set when the PMT could not be zeroed on abort
    pub pmt_zero_error: Option<String>,
}

enum PointResult {
    Accepted(DataPoint),
    Aborted,
    Failed(DaqError),
}

// =============================================================================
// Controller
// =============================================================================

/// Owns the scan worker and its observation channels.
pub struct ScanController {
    instruments: Arc<Instruments>,
    store: Arc<dyn SpectrumStore>,
    config: Arc<CplConfig>,
    abort: AbortSignal,
    state_tx: watch::Sender<ScanState>,
    progress_tx: watch::Sender<ScanProgress>,
    average_tx: watch::Sender<Vec<AverageEntry>>,
    events: broadcast::Sender<ScanEvent>,
    worker: Mutex<Option<JoinHandle<AppResult<ScanOutcome>>>>,
}

impl ScanController {
    /// An idle controller on `instruments`, saving to `store`.
    pub fn new(instruments: Arc<Instruments>, store: Arc<dyn SpectrumStore>) -> Self {
        let (state_tx, _) = watch::channel(ScanState::Idle);
        let (progress_tx, _) = watch::channel(ScanProgress::default());
        let (average_tx, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(256);
        Self {
            config: Arc::clone(instruments.config()),
            instruments,
            store,
            abort: AbortSignal::new(),
            state_tx,
            progress_tx,
            average_tx,
            events,
            worker: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> ScanState {
        *self.state_tx.borrow()
    }

    /// Follow state changes
    pub fn state_watch(&self) -> watch::Receiver<ScanState> {
        self.state_tx.subscribe()
    }

    /// Follow progress and ETA
    pub fn progress_watch(&self) -> watch::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    /// Follow the running average of a repeated scan
    pub fn average_watch(&self) -> watch::Receiver<Vec<AverageEntry>> {
        self.average_tx.subscribe()
    }

    /// Receive [`ScanEvent`]s from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// The signal shared with the safety monitor
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Request an abort of the running scan. Does nothing while no scan runs.
    pub fn abort(&self, reason: &str) {
        self.state_tx.send_if_modified(|state| {
            if *state == ScanState::Running {
                self.abort.request(reason);
                *state = ScanState::Aborting;
                true
            } else {
                false
            }
        });
    }

    fn set_state(&self, state: ScanState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ScanEvent) {
        // No receiver is fine
        let _ = self.events.send(event);
    }

    /// Reject a scan before anything is touched.
    pub async fn check_preconditions(&self, params: &ScanParameters) -> AppResult<()> {
        params.validate(&self.config.scan.illegal_name_chars)?;

        let mut problems = Vec::new();
        for (what, name) in [
            ("AC-blank", &params.ac_blank),
            ("DC-blank", &params.dc_blank),
            ("Detector correction", &params.detector_correction),
        ] {
            if !name.is_empty() && !self.store.correction_exists(name).await? {
                error!("Error: {} file {} does not exist!", what, name);
                problems.push(format!("{} '{}' does not exist", what, name));
            }
        }
        let first = params.output_name(0);
        if self.store.exists(&first).await? {
            error!("Error: Spectra filename '{}' already exists!", first);
            problems.push(format!("output '{}' already exists", first));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DaqError::Precondition(problems.join("; ")))
        }
    }

    async fn load_correction(&self, name: &str) -> AppResult<Option<CorrectionTable>> {
        if name.is_empty() {
            Ok(None)
        } else {
            self.store.load_correction(name).await.map(Some)
        }
    }

    async fn load_corrections(&self, params: &ScanParameters) -> AppResult<CorrectionSet> {
        Ok(CorrectionSet {
            detector: self.load_correction(&params.detector_correction).await?,
            ac_blank: self.load_correction(&params.ac_blank).await?,
            dc_blank: self.load_correction(&params.dc_blank).await?,
        })
    }

    /// Validate and start a scan on a worker task.
    pub async fn start(self: &Arc<Self>, params: ScanParameters) -> AppResult<()> {
        let mut worker = self.worker.lock().await;
        if self.state() != ScanState::Idle {
            return Err(DaqError::InvalidState("a scan is already running".into()));
        }
        if !self.instruments.is_initialized() {
            return Err(DaqError::NotInitialized("instruments".into()));
        }
        self.check_preconditions(&params).await?;
        let corrections = self.load_corrections(&params).await?;

        // No worker runs here, so a leftover request is stale
        self.abort.reset();
        self.set_state(ScanState::Running);
        let this = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            this.run_worker(params, corrections).await
        }));
        Ok(())
    }

    /// Wait for the worker started by [`start`](Self::start).
    pub async fn wait(&self) -> AppResult<ScanOutcome> {
        let handle = self
            .worker
            .lock()
            .await
            .take()
            .ok_or_else(|| DaqError::InvalidState("no scan was started".into()))?;
        handle
            .await
            .map_err(|e| DaqError::InvalidState(format!("scan worker failed: {}", e)))?
    }

    /// Start a scan and wait for its outcome.
    pub async fn run(self: &Arc<Self>, params: ScanParameters) -> AppResult<ScanOutcome> {
        self.start(params).await?;
        self.wait().await
    }

    async fn run_worker(
        &self,
        params: ScanParameters,
        corrections: CorrectionSet,
    ) -> AppResult<ScanOutcome> {
        let result = self.execute(&params, &corrections).await;
        if let Err(e) = &result {
            error!("Error in scan: {}", e);
            self.abort.request(e.to_string());
            self.set_state(ScanState::Aborting);
            if let Err(e) = self.instruments.safe_pmt().await {
                error!("Error: PMT may still be under high voltage: {}", e);
                self.emit(ScanEvent::PmtNotZeroed {
                    error: e.to_string(),
                });
            }
        }

        info!("Returning to start wavelength");
        if let Err(e) = self.instruments.set_modulation_active(true).await {
            error!("Error: could not switch modulation back on: {}", e);
        }
        if let Err(e) = self.instruments.move_nm(params.start_nm, true, None).await {
            error!("Error: could not return to {} nm: {}", params.start_nm, e);
        }

        let aborted = self.abort.is_requested();
        self.abort.reset();
        self.set_state(ScanState::Idle);
        self.emit(ScanEvent::Finished { aborted });
        result
    }

    async fn execute(
        &self,
        params: &ScanParameters,
        corrections: &CorrectionSet,
    ) -> AppResult<ScanOutcome> {
        let scan = &self.config.scan;
        let granularity = scan.abort_granularity();
        let wavelengths = params.wavelengths();
        let runs = params.repetitions;

        info!(
            "Spectra acquisition: {:.2} to {:.2} nm with {:.2} nm steps and {:.3} s per step",
            params.start_nm, params.end_nm, params.step_nm, params.dwell_time_s
        );
        self.emit(ScanEvent::Started {
            runs,
            points_per_run: wavelengths.len(),
        });

        self.instruments.set_dwell_time(params.dwell_time_s).await;
        // Let the lock-in buffer fill
        self.abort
            .sleep_interruptible(Duration::from_secs_f64(params.dwell_time_s), granularity)
            .await;

        self.instruments
            .set_modulation_active(!params.modulation_off)
            .await?;

        let mut outcome = ScanOutcome::default();
        let mut running = RunningAverage::new();
        self.average_tx.send_replace(Vec::new());
        self.progress_tx
            .send_replace(ScanProgress::compute(0.0, 1.0, 0.0, 1, runs, Duration::ZERO));
        let t0 = Instant::now();

        for rep in 0..runs as usize {
            if self.abort.is_requested() {
                break;
            }
            let run = rep as u32 + 1;
            info!("Run {}/{}", run, runs);
            self.emit(ScanEvent::RepetitionStarted { run });

            let mut spectrum = Spectrum::new();
            let mut lp_detected = false;

            for &nm in &wavelengths {
                if self.abort.is_requested() {
                    break;
                }
                if let Err(e) = self
                    .instruments
                    .move_nm(nm, !params.modulation_off, Some(&self.abort))
                    .await
                {
                    error!("Error: move to {:.2} nm failed, aborting: {}", nm, e);
                    self.abort(&format!("move to {:.2} nm failed: {}", nm, e));
                    break;
                }
                self.abort
                    .sleep_interruptible(scan.filter_rise_time(), granularity)
                    .await;

                let point = match self.measure_point(nm).await {
                    PointResult::Accepted(point) => point,
                    PointResult::Aborted => break,
                    PointResult::Failed(e) => {
                        error!(
                            "Error: could not collect data after {} tries, aborting: {}",
                            scan.max_point_attempts, e
                        );
                        self.abort(&format!("no data at {:.2} nm: {}", nm, e));
                        break;
                    }
                };

                if point.lp_theta_std < scan.lp_theta_std_warning {
                    warn!(
                        "Warning: Possibly linearly polarized emission at {:.2} (lp_theta_std = {:.3})!",
                        nm, point.lp_theta_std
                    );
                    lp_detected = true;
                    self.emit(ScanEvent::LinearPolarization {
                        wavelength: nm,
                        lp_theta_std: point.lp_theta_std,
                    });
                }

                spectrum.push(point);
                self.emit(ScanEvent::Point { run, point });

                if runs > 1 {
                    if let Some(entry) = running.update(&point, rep) {
                        self.average_tx.send_replace(running.entries().to_vec());
                        self.emit(ScanEvent::Average(entry));
                    }
                }

                self.progress_tx.send_replace(ScanProgress::compute(
                    params.start_nm,
                    params.end_nm,
                    nm,
                    run,
                    runs,
                    t0.elapsed(),
                ));
            }

            if self.abort.is_requested() {
                self.set_state(ScanState::Aborting);
                if let Err(e) = self.instruments.safe_pmt().await {
                    error!("Error: PMT may still be under high voltage: {}", e);
                    self.emit(ScanEvent::PmtNotZeroed {
                        error: e.to_string(),
                    });
                    outcome.pmt_zero_error = Some(e.to_string());
                }
            }
            info!("This scan took {:.0} s.", t0.elapsed().as_secs_f64());

            let name = params.output_name(rep);
            let record = self.parameter_record(params).await;
            self.save(&name, &spectrum, &record).await;
            if params.has_corrections() {
                let (corrected, _) = apply_corrections(&spectrum, corrections);
                self.save(&format!("{}_corr", name), &corrected, &record).await;
                outcome.corrected.push(corrected);
            }

            if lp_detected {
                error!("Warning: Possibly linearly polarized emission!");
                outcome.lp_detected = true;
            }
            self.emit(ScanEvent::RepetitionFinished {
                run,
                points: spectrum.len(),
            });
            outcome.spectra.push(spectrum);
        }

        info!("Stopping data acquisition.");
        outcome.aborted = self.abort.is_requested();
        outcome.abort_reason = self.abort.reason();

        if runs > 1 && !outcome.aborted {
            self.set_state(ScanState::Completing);
            let record = self.parameter_record(params).await;
            let average = average_spectra(&outcome.spectra)?;
            self.save(&format!("{}_avg", params.name), &average, &record)
                .await;
            if params.has_corrections() {
                let (corrected, _) = apply_corrections(&average, corrections);
                self.save(&format!("{}_avg_corr", params.name), &corrected, &record)
                    .await;
                outcome.average_corrected = Some(corrected);
            }
            outcome.average = Some(average);
        } else if !outcome.aborted {
            self.set_state(ScanState::Completing);
        }

        Ok(outcome)
    }

    /// Acquire and process one point, retrying failed attempts.
    async fn measure_point(&self, nm: f64) -> PointResult {
        let attempts = self.config.scan.max_point_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.abort.is_requested() {
                return PointResult::Aborted;
            }
            let (frame, bessel) = {
                let mut lockin = tokio::select! {
                    lockin = self.instruments.lockin().lock() => lockin,
                    _ = self.abort.cancelled(self.config.scan.abort_granularity()) => {
                        return PointResult::Aborted;
                    }
                };
                let bessel = lockin.bessel();
                (lockin.acquire(&self.abort).await, bessel)
            };

            let failure = match (frame, bessel) {
                (Ok(Some(frame)), Some(bessel)) => match process_frame(&frame, &bessel, nm) {
                    Ok(point) => return PointResult::Accepted(point),
                    Err(e) => e,
                },
                (Ok(Some(_)), None) => {
                    return PointResult::Failed(DaqError::NotInitialized(
                        "lock-in is not set up for acquisition".into(),
                    ))
                }
                (Ok(None), _) if self.abort.is_requested() => return PointResult::Aborted,
                (Ok(None), _) => {
                    DaqError::EmptyDataset(format!("no aligned samples at {:.2} nm", nm))
                }
                (Err(e), _) if !e.is_retryable() => return PointResult::Failed(e),
                (Err(e), _) => e,
            };
            warn!(wavelength = nm, attempt, "point failed: {}", failure);
            last_error = Some(failure);
        }

        PointResult::Failed(last_error.unwrap_or_else(|| {
            DaqError::EmptyDataset(format!("no data at {:.2} nm", nm))
        }))
    }

    /// Record of `params` with the current lock-in state
    pub async fn parameter_record(&self, params: &ScanParameters) -> ParameterRecord {
        let lockin = self.instruments.lockin_state().await;
        ParameterRecord {
            timestamp: Local::now(),
            start_nm: params.start_nm,
            end_nm: params.end_nm,
            step_nm: params.step_nm,
            dwell_time_s: params.dwell_time_s,
            repetitions: params.repetitions,
            name: params.name.clone(),
            ac_blank: params.ac_blank.clone(),
            dc_blank: params.dc_blank.clone(),
            detector_correction: params.detector_correction.clone(),
            modulation_off: params.modulation_off,
            comment: params.comment.clone(),
            pmt_volt: lockin.pmt_volt,
            pmt_gain: volt_to_gain(&self.config.pmt, lockin.pmt_volt),
            input_range_v: lockin.signal_range,
            phase_offset_deg: lockin.phase_offset,
        }
    }

    async fn save(&self, name: &str, spectrum: &Spectrum, record: &ParameterRecord) {
        if let Err(e) = self.store.save_spectrum(name, spectrum, record).await {
            error!("Error saving spectrum '{}': {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockRig;
    use crate::store::MemoryStore;

    const ILLEGAL: &str = "#@$%^&*{}:;\"|<>/?\\`~'";

    #[test]
    fn descending_single_step() {
        let params = ScanParameters::new(800.0, 799.0, 1.0, 0.5, "s");
        assert_eq!(params.wavelengths(), vec![800.0, 799.0]);
    }

    #[test]
    fn last_step_overshoots_uneven_range() {
        let params = ScanParameters::new(400.0, 410.0, 3.0, 0.5, "s");
        assert_eq!(params.wavelengths(), vec![400.0, 403.0, 406.0, 409.0, 412.0]);
        let single = ScanParameters::new(500.0, 500.0, 1.0, 0.5, "s");
        assert_eq!(single.wavelengths(), vec![500.0]);
    }

    #[test]
    fn fractional_steps_do_not_add_a_point() {
        let params = ScanParameters::new(500.0, 501.0, 0.1, 0.5, "s");
        assert_eq!(params.wavelengths().len(), 11);
    }

    #[test]
    fn rejects_illegal_names_and_numbers() {
        let ok = ScanParameters::new(500.0, 400.0, 1.0, 0.5, "sample_01");
        assert!(ok.validate(ILLEGAL).is_ok());

        let bad_name = ScanParameters::new(500.0, 400.0, 1.0, 0.5, "a/b");
        assert!(matches!(
            bad_name.validate(ILLEGAL),
            Err(DaqError::Precondition(_))
        ));

        let bad_step = ScanParameters::new(500.0, 400.0, 0.0, 0.5, "s");
        assert!(bad_step.validate(ILLEGAL).is_err());
        let bad_dwell = ScanParameters::new(500.0, 400.0, 1.0, f64::NAN, "s");
        assert!(bad_dwell.validate(ILLEGAL).is_err());
        let no_reps = ScanParameters::new(500.0, 400.0, 1.0, 0.5, "s").with_repetitions(0);
        assert!(no_reps.validate(ILLEGAL).is_err());
    }

    #[test]
    fn output_names() {
        let single = ScanParameters::new(500.0, 400.0, 1.0, 0.5, "s");
        assert_eq!(single.output_name(0), "s");
        let repeated = single.clone().with_repetitions(3);
        assert_eq!(repeated.output_name(0), "s_1");
        assert_eq!(repeated.output_name(2), "s_3");
        assert!(!single.has_corrections());
    }

    #[test]
    fn progress_and_eta() {
        let p = ScanProgress::compute(400.0, 500.0, 450.0, 1, 2, Duration::from_secs(50));
        assert!((p.percent - 50.0).abs() < 1e-9);
        assert!((p.remaining_s - 150.0).abs() < 1e-9);

        let down = ScanProgress::compute(800.0, 700.0, 725.0, 2, 2, Duration::from_secs(175));
        assert!((down.percent - 75.0).abs() < 1e-9);
        // 200 / 175 - 1
        assert!((down.remaining_s - 25.0).abs() < 1e-9);

        let start = ScanProgress::compute(800.0, 799.0, 800.0, 1, 1, Duration::from_secs(3));
        assert_eq!(start.percent, 0.0);
        assert_eq!(start.remaining_s, 0.0);
    }

    #[test]
    fn progress_text_units() {
        let p = ScanProgress {
            percent: 12.34,
            run: 1,
            runs: 3,
            elapsed_s: 10.0,
            remaining_s: 5400.0,
        };
        assert_eq!(p.to_string(), "12.3 % (1/3), ca. 1.5 h");
    }

    #[tokio::test(start_paused = true)]
    async fn point_gives_up_waiting_for_a_busy_lockin_on_abort() {
        let rig = MockRig::new();
        let instruments = Arc::new(rig.instruments(Arc::new(CplConfig::default())));
        let scan = ScanController::new(Arc::clone(&instruments), Arc::new(MemoryStore::new()));
        let _held = instruments.lockin().lock().await;

        let signal = scan.abort_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            signal.request("user request");
        });

        let result = tokio::time::timeout(Duration::from_secs(5), scan.measure_point(500.0)).await;
        assert!(matches!(result, Ok(PointResult::Aborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_while_idle_is_ignored() {
        let rig = MockRig::new();
        let instruments = Arc::new(rig.instruments(Arc::new(CplConfig::default())));
        let scan = ScanController::new(instruments, Arc::new(MemoryStore::new()));

        scan.abort("nothing to stop");
        assert!(!scan.abort_signal().is_requested());
        assert_eq!(scan.state(), ScanState::Idle);
    }
}
