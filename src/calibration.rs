//! Phase offset calibration.
//!
//! The user measures a reference sample of nominally positive and then negative
//! circular polarisation. For each polarity a worker records the AC phase until the step
//! is finished; either polarity may be skipped.
//!
//! ```text
//! Idle -> CollectingPositive -> CollectingNegative -> Summarizing -> Applied
//!                 \                     \                   \
//!                  +---------------------+-------------------+--> Cancelled
//! ```
//!
//! The new offset is `current + mean(pos - 90, neg + 90)` over the recorded polarities.

use crate::cancel::AbortSignal;
use crate::error::{AppResult, DaqError};
use crate::hardware::lockin::PhaseAverage;
use crate::instruments::Instruments;
use crate::scan::ScanState;
use crate::store::{ParameterRecord, SpectrumStore, LAST_PARAMETERS};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Step of the calibration workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationState {
    /// Never started
    Idle,
    /// Recording the positive reference
    CollectingPositive,
    /// Recording the negative reference
    CollectingNegative,
    /// Waiting for the new offset to be applied or cancelled
    Summarizing,
    /// New offset written
    Applied,
    /// Stopped without a change
    Cancelled,
}

impl CalibrationState {
    /// A recording task runs
    pub fn is_collecting(&self) -> bool {
        matches!(
            self,
            CalibrationState::CollectingPositive | CalibrationState::CollectingNegative
        )
    }

    /// Holds the lock-in or waits for a decision
    pub fn is_active(&self) -> bool {
        self.is_collecting() || *self == CalibrationState::Summarizing
    }
}

/// Offset proposed from the recorded polarities.
pub fn derive_phase_offset(current: f64, positive: Option<f64>, negative: Option<f64>) -> Option<f64> {
    let deltas: Vec<f64> = positive
        .map(|p| p - 90.0)
        .into_iter()
        .chain(negative.map(|n| n + 90.0))
        .collect();
    if deltas.is_empty() {
        return None;
    }
    Some(current + deltas.iter().sum::<f64>() / deltas.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    /// Offset in use while recording
    pub current_offset: f64,
    /// Positive reference, unless skipped
    pub positive: Option<PhaseAverage>,
    /// Negative reference, unless skipped
    pub negative: Option<PhaseAverage>,
    /// Proposed offset
    pub new_offset: f64,
}

impl CalibrationSummary {
    /// Change of the offset in degrees
    pub fn delta(&self) -> f64 {
        self.new_offset - self.current_offset
    }
}

struct Recording {
    abort: AbortSignal,
    handle: JoinHandle<AppResult<PhaseAverage>>,
}

#[derive(Default)]
struct Session {
    recording: Option<Recording>,
    positive: Option<PhaseAverage>,
    negative: Option<PhaseAverage>,
    summary: Option<CalibrationSummary>,
}

/// Runs the phase calibration workflow on the shared lock-in.
pub struct CalibrationController {
    instruments: Arc<Instruments>,
    store: Arc<dyn SpectrumStore>,
    state_tx: watch::Sender<CalibrationState>,
    live_tx: Arc<watch::Sender<PhaseAverage>>,
    scan_state: watch::Receiver<ScanState>,
    session: Mutex<Session>,
}

impl CalibrationController {
    /// `scan_state` follows the scan controller sharing the lock-in.
    pub fn new(
        instruments: Arc<Instruments>,
        store: Arc<dyn SpectrumStore>,
        scan_state: watch::Receiver<ScanState>,
    ) -> Self {
        let (state_tx, _) = watch::channel(CalibrationState::Idle);
        let (live_tx, _) = watch::channel(PhaseAverage::default());
        Self {
            instruments,
            store,
            state_tx,
            live_tx: Arc::new(live_tx),
            scan_state,
            session: Mutex::new(Session::default()),
        }
    }

    /// Current step
    pub fn state(&self) -> CalibrationState {
        *self.state_tx.borrow()
    }

    /// Follow step changes
    pub fn state_watch(&self) -> watch::Receiver<CalibrationState> {
        self.state_tx.subscribe()
    }

    /// Live mean phase and sample count of the current recording
    pub fn live_watch(&self) -> watch::Receiver<PhaseAverage> {
        self.live_tx.subscribe()
    }

    /// Result awaiting [`apply`](Self::apply)
    pub async fn summary(&self) -> Option<CalibrationSummary> {
        self.session.lock().await.summary
    }

    /// Begin with the positive reference. Rejected unless the scan controller is idle.
    pub async fn start(&self) -> AppResult<()> {
        let mut session = self.session.lock().await;
        if self.state().is_active() {
            return Err(DaqError::InvalidState("calibration already running".into()));
        }
        let scan = *self.scan_state.borrow();
        if scan != ScanState::Idle {
            return Err(DaqError::InvalidState(format!(
                "cannot calibrate while the scan is {:?}",
                scan
            )));
        }
        if !self.instruments.is_initialized() {
            return Err(DaqError::NotInitialized("instruments".into()));
        }
        *session = Session::default();
        info!("Calibration: measure the positive reference");
        session.recording = Some(self.spawn_recording());
        self.state_tx.send_replace(CalibrationState::CollectingPositive);
        Ok(())
    }

    /// Finish the current polarity and keep its result.
    pub async fn next(&self) -> AppResult<CalibrationState> {
        self.advance(true).await
    }

    /// Finish the current polarity and discard it.
    pub async fn skip(&self) -> AppResult<CalibrationState> {
        self.advance(false).await
    }

    async fn advance(&self, keep: bool) -> AppResult<CalibrationState> {
        let mut session = self.session.lock().await;
        let state = self.state();
        if !state.is_collecting() {
            return Err(DaqError::InvalidState(format!(
                "no calibration step to finish in state {:?}",
                state
            )));
        }

        let recorded = match self.stop_recording(&mut session).await {
            Ok(recorded) => recorded,
            Err(e) => {
                error!("Error during phase recording: {}", e);
                self.state_tx.send_replace(CalibrationState::Cancelled);
                return Err(e);
            }
        };
        let result = match recorded {
            Some(avg) if keep && avg.count > 0 => Some(avg),
            Some(_) if keep => {
                warn!("No phase samples recorded, treating the step as skipped");
                None
            }
            _ => None,
        };

        let next = if state == CalibrationState::CollectingPositive {
            session.positive = result;
            info!("Calibration: measure the negative reference");
            session.recording = Some(self.spawn_recording());
            CalibrationState::CollectingNegative
        } else {
            session.negative = result;
            self.summarize(&mut session).await
        };
        self.state_tx.send_replace(next);
        Ok(next)
    }

    async fn summarize(&self, session: &mut Session) -> CalibrationState {
        let current = self.instruments.lockin_state().await.phase_offset;
        let proposed = derive_phase_offset(
            current,
            session.positive.map(|p| p.average_deg),
            session.negative.map(|n| n.average_deg),
        );
        match proposed {
            Some(new_offset) => {
                let summary = CalibrationSummary {
                    current_offset: current,
                    positive: session.positive,
                    negative: session.negative,
                    new_offset,
                };
                info!(
                    "Calibration: old offset {:.3}, new offset {:.3} (delta {:.3})",
                    current,
                    new_offset,
                    summary.delta()
                );
                session.summary = Some(summary);
                CalibrationState::Summarizing
            }
            None => {
                info!("Calibration: both references skipped, offset unchanged");
                CalibrationState::Cancelled
            }
        }
    }

    /// Write the new offset to the lock-in and persist it with the last parameters.
    pub async fn apply(&self) -> AppResult<f64> {
        let session = self.session.lock().await;
        let summary = match (self.state(), session.summary) {
            (CalibrationState::Summarizing, Some(summary)) => summary,
            (state, _) => {
                return Err(DaqError::InvalidState(format!(
                    "no calibration result to apply in state {:?}",
                    state
                )))
            }
        };

        self.instruments.set_phase_offset(summary.new_offset).await?;

        let mut record = self
            .store
            .load_parameters(LAST_PARAMETERS)
            .await?
            .unwrap_or_default();
        record.timestamp = Local::now();
        record.phase_offset_deg = summary.new_offset;
        self.store.save_parameters(LAST_PARAMETERS, &record).await?;

        info!("Phase offset set to {:.3}", summary.new_offset);
        self.state_tx.send_replace(CalibrationState::Applied);
        Ok(summary.new_offset)
    }

    /// Stop any recording and discard the calibration.
    pub async fn cancel(&self) -> AppResult<()> {
        let mut session = self.session.lock().await;
        if !self.state().is_active() {
            return Ok(());
        }
        let stopped = self.stop_recording(&mut session).await;
        session.summary = None;
        self.state_tx.send_replace(CalibrationState::Cancelled);
        info!("Calibration cancelled");
        stopped.map(|_| ())
    }

    fn spawn_recording(&self) -> Recording {
        let abort = AbortSignal::new();
        let instruments = Arc::clone(&self.instruments);
        let live = Arc::clone(&self.live_tx);
        let signal = abort.clone();
        let handle = tokio::spawn(async move {
            let mut lockin = instruments.lockin().lock().await;
            lockin.record_phase(&signal, &live).await
        });
        Recording { abort, handle }
    }

    async fn stop_recording(&self, session: &mut Session) -> AppResult<Option<PhaseAverage>> {
        let Some(recording) = session.recording.take() else {
            return Ok(None);
        };
        recording.abort.request("calibration step finished");
        let average = recording
            .handle
            .await
            .map_err(|e| DaqError::InvalidState(format!("phase recording task: {}", e)))??;
        Ok(Some(average))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_from_both_polarities() {
        let new = derive_phase_offset(158.0, Some(95.0), Some(-88.0)).unwrap();
        assert!((new - 161.5).abs() < 1e-12);
    }

    #[test]
    fn offset_from_one_polarity() {
        assert_eq!(derive_phase_offset(10.0, Some(92.0), None), Some(12.0));
        assert_eq!(derive_phase_offset(10.0, None, Some(-91.0)), Some(9.0));
        assert_eq!(derive_phase_offset(10.0, None, None), None);
    }

    #[test]
    fn active_states() {
        assert!(CalibrationState::CollectingNegative.is_active());
        assert!(CalibrationState::Summarizing.is_active());
        assert!(!CalibrationState::Summarizing.is_collecting());
        assert!(!CalibrationState::Applied.is_active());
    }
}
