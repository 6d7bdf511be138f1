//! Safety Monitor
//!
//! A background worker reads the oscilloscope trace of the lock-in input every
//! `refresh_ms`, keeps a rolling history of trace maxima and watches for two conditions:
//!
//! - **saturation**: the last `saturation_window` maxima are equal within
//!   `saturation_tolerance_v` and at least `saturation_fraction` of the input range.
//!   The input is autoranged and a running scan is aborted.
//! - **overexposure**: the last `overexposure_window` maxima reach
//!   `shutdown_threshold_v`. The PMT high voltage goes to 0 V and a running scan is
//!   aborted.
//!
//! Each alarm is edge-triggered: it fires on the cycle its condition becomes true and is
//! re-armed by the first cycle where the condition is false again.

use crate::cancel::AbortSignal;
use crate::config::SafetyConfig;
use crate::error::DaqError;
use crate::hardware::lockin::ScopeReading;
use crate::instruments::Instruments;
use crate::scan::ScanState;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Alarms raised by one evaluation cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub saturation: bool,
    pub overexposure: bool,
}

impl SafetyVerdict {
    pub fn any(&self) -> bool {
        self.saturation || self.overexposure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SafetyAlarm {
    Saturation { max_v: f64, range_v: f64 },
    Overexposure { max_v: f64 },
}

/// Rolling history and alarm state, free of I/O.
#[derive(Debug, Clone)]
pub struct SafetyEvaluator {
    config: SafetyConfig,
    history: VecDeque<f64>,
    saturation_armed: bool,
    overexposure_armed: bool,
}

impl SafetyEvaluator {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_len),
            config,
            saturation_armed: true,
            overexposure_armed: true,
        }
    }

    /// Add one trace maximum and evaluate both alarms against `range_v`.
    ///
    /// NaN readings are not recorded and leave the alarm state untouched.
    pub fn push(&mut self, max_v: f64, range_v: f64) -> SafetyVerdict {
        if max_v.is_nan() {
            return SafetyVerdict::default();
        }
        if self.history.len() == self.config.history_len.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(max_v);

        let saturated = self.is_saturated(range_v);
        let overexposed = self.is_overexposed();
        SafetyVerdict {
            saturation: edge(&mut self.saturation_armed, saturated),
            overexposure: edge(&mut self.overexposure_armed, overexposed),
        }
    }

    /// The protective command for an overexposure failed; fire again next cycle.
    pub fn overexposure_action_failed(&mut self) {
        self.overexposure_armed = true;
    }

    pub fn history(&self) -> Vec<f64> {
        self.history.iter().copied().collect()
    }

    fn tail(&self, n: usize) -> Option<impl Iterator<Item = f64> + Clone + '_> {
        if n == 0 || self.history.len() < n {
            return None;
        }
        Some(self.history.iter().skip(self.history.len() - n).copied())
    }

    fn is_saturated(&self, range_v: f64) -> bool {
        let Some(tail) = self.tail(self.config.saturation_window) else {
            return false;
        };
        let min = tail.clone().fold(f64::INFINITY, f64::min);
        let max = tail.fold(f64::NEG_INFINITY, f64::max);
        max - min <= self.config.saturation_tolerance_v
            && min >= self.config.saturation_fraction * range_v
    }

    fn is_overexposed(&self) -> bool {
        match self.tail(self.config.overexposure_window) {
            Some(mut tail) => tail.all(|v| v >= self.config.shutdown_threshold_v),
            None => false,
        }
    }
}

fn edge(armed: &mut bool, condition: bool) -> bool {
    if !condition {
        *armed = true;
        return false;
    }
    let fire = *armed;
    *armed = false;
    fire
}

/// Handle to the background monitor.
pub struct SafetyMonitor {
    stop: AbortSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
    reading_rx: watch::Receiver<ScopeReading>,
    history_rx: watch::Receiver<Vec<f64>>,
    alarms: broadcast::Sender<SafetyAlarm>,
}

struct Worker {
    instruments: Arc<Instruments>,
    evaluator: SafetyEvaluator,
    scan_abort: AbortSignal,
    scan_state: watch::Receiver<ScanState>,
    reading_tx: watch::Sender<ScopeReading>,
    history_tx: watch::Sender<Vec<f64>>,
    alarms: broadcast::Sender<SafetyAlarm>,
}

impl SafetyMonitor {
    /// Start monitoring. `scan_abort` and `scan_state` belong to the scan controller.
    pub fn spawn(
        instruments: Arc<Instruments>,
        scan_abort: AbortSignal,
        scan_state: watch::Receiver<ScanState>,
    ) -> Self {
        let config = instruments.config().safety.clone();
        let (reading_tx, reading_rx) = watch::channel(ScopeReading::missing());
        let (history_tx, history_rx) = watch::channel(Vec::new());
        let (alarms, _) = broadcast::channel(64);
        let stop = AbortSignal::new();

        let worker = Worker {
            instruments,
            evaluator: SafetyEvaluator::new(config),
            scan_abort,
            scan_state,
            reading_tx,
            history_tx,
            alarms: alarms.clone(),
        };
        let handle = tokio::spawn(worker.run(stop.clone()));
        info!("Safety monitor started");

        Self {
            stop,
            handle: Mutex::new(Some(handle)),
            reading_rx,
            history_rx,
            alarms,
        }
    }

    /// Latest oscilloscope max/avg
    pub fn reading_watch(&self) -> watch::Receiver<ScopeReading> {
        self.reading_rx.clone()
    }

    pub fn history_watch(&self) -> watch::Receiver<Vec<f64>> {
        self.history_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyAlarm> {
        self.alarms.subscribe()
    }

    /// Stop the worker and wait for it to exit.
    pub async fn stop(&self) {
        self.stop.request("safety monitor stopped");
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Error: safety monitor task failed: {}", e);
            }
        }
        info!("Safety monitor stopped");
    }
}

impl Worker {
    async fn run(mut self, stop: AbortSignal) {
        let refresh = self.instruments.config().safety.refresh();
        let granularity = self.instruments.config().scan.abort_granularity();

        while !stop.is_requested() {
            match self.instruments.read_scope().await {
                Ok(reading) => self.check(reading).await,
                Err(e) => warn!("oscilloscope read failed: {}", e),
            }
            stop.sleep_interruptible(refresh, granularity).await;
        }
    }

    async fn check(&mut self, reading: ScopeReading) {
        self.reading_tx.send_replace(reading);
        if reading.is_missing() {
            return;
        }
        let range_v = self.instruments.signal_range();
        let verdict = self.evaluator.push(reading.max_v, range_v);
        self.history_tx.send_replace(self.evaluator.history());
        if !verdict.any() {
            return;
        }
        debug!(?verdict, max_v = reading.max_v, range_v, "safety alarm");

        if verdict.overexposure {
            let trip = DaqError::SafetyTrip(format!(
                "PMT overexposure, trace maximum {:.3} V",
                reading.max_v
            ));
            error!("{}", trip);
            self.abort_scan(&trip);
            let _ = self.alarms.send(SafetyAlarm::Overexposure {
                max_v: reading.max_v,
            });
            if self.instruments.safe_pmt().await.is_err() {
                self.evaluator.overexposure_action_failed();
            }
        }

        if verdict.saturation {
            let trip = DaqError::SafetyTrip(format!(
                "input range saturated at {:.3} V of {:.3} V",
                reading.max_v, range_v
            ));
            warn!("{}, autoranging", trip);
            self.abort_scan(&trip);
            let _ = self.alarms.send(SafetyAlarm::Saturation {
                max_v: reading.max_v,
                range_v,
            });
            match self.instruments.autorange().await {
                Ok(range) => info!("Input range is now {:.3} V", range),
                Err(e) => error!("Error during autorange: {}", e),
            }
        }
    }

    fn abort_scan(&self, trip: &DaqError) {
        if *self.scan_state.borrow() == ScanState::Running {
            self.scan_abort.request(trip.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> SafetyEvaluator {
        SafetyEvaluator::new(SafetyConfig::default())
    }

    #[test]
    fn saturation_fires_once_per_window() {
        let mut eval = evaluator();
        let level = 0.96 * 3.0;
        let fired: Vec<bool> = (0..8).map(|_| eval.push(level, 3.0).saturation).collect();
        assert_eq!(
            fired,
            vec![false, false, false, false, true, false, false, false]
        );

        // A differing value re-arms; the next full window fires again
        assert!(!eval.push(2.0, 3.0).saturation);
        let fired: Vec<bool> = (0..5).map(|_| eval.push(level, 3.0).saturation).collect();
        assert_eq!(fired, vec![false, false, false, false, true]);
    }

    #[test]
    fn constant_level_below_fraction_is_not_saturated() {
        let mut eval = evaluator();
        for _ in 0..10 {
            assert!(!eval.push(0.9 * 3.0, 3.0).saturation);
        }
        // Range dropped under the signal
        assert!(eval.push(0.9 * 3.0, 2.7).saturation);
    }

    #[test]
    fn overexposure_after_three_readings() {
        let mut eval = evaluator();
        assert!(!eval.push(2.96, 10.0).overexposure);
        assert!(!eval.push(3.0, 10.0).overexposure);
        assert!(eval.push(2.95, 10.0).overexposure);
        assert!(!eval.push(3.1, 10.0).overexposure);

        eval.overexposure_action_failed();
        assert!(eval.push(3.1, 10.0).overexposure);
    }

    #[test]
    fn both_alarms_in_one_cycle() {
        let mut eval = SafetyEvaluator::new(SafetyConfig {
            overexposure_window: 5,
            ..SafetyConfig::default()
        });
        let verdicts: Vec<SafetyVerdict> = (0..5).map(|_| eval.push(3.0, 3.0)).collect();
        assert!(!verdicts[3].any());
        assert_eq!(
            verdicts[4],
            SafetyVerdict {
                saturation: true,
                overexposure: true
            }
        );
    }

    #[test]
    fn nan_is_ignored_and_history_is_bounded() {
        let mut eval = SafetyEvaluator::new(SafetyConfig {
            history_len: 4,
            ..SafetyConfig::default()
        });
        assert!(!eval.push(f64::NAN, 3.0).any());
        assert!(eval.history().is_empty());
        for v in 0..6 {
            eval.push(v as f64 * 0.1, 3.0);
        }
        assert_eq!(eval.history().len(), 4);
        assert!((eval.history()[0] - 0.2).abs() < 1e-12);
    }
}
