//! Lock-in amplifier sessions.
//!
//! The lock-in is opened twice: a [`LockinSession`] for configuration and synchronized
//! demodulator acquisition, and a [`ScopeSession`] for the oscilloscope stream watched by
//! the safety monitor. Each sits behind its own lock in [`crate::instruments`].
//!
//! Demodulator layout after [`LockinSession::setup_for_daq`]:
//!
//! | demod | role | reference |
//! |---|---|---|
//! | 0 | AC, circular polarisation | modulator fundamental (ext. ref 0) |
//! | 1 | external reference input | transfer disabled |
//! | 2 | DC | oscillator 1 at 0 Hz |
//! | 3 | LP, linear polarisation | 2nd harmonic of the fundamental |

use crate::acquisition::{acquire_aligned, AlignedFrame, SamplerSettings};
use crate::cancel::AbortSignal;
use crate::config::LockinConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{LockinApi, ScopeStream};
use crate::processing::BesselCorrection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const DEVICE: &str = "MFLI";

/// Mutable per-session values. Configuration holds only the start values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockinState {
    pub phase_offset: f64,
    pub signal_range: f64,
    pub pmt_volt: f64,
    pub dwell_time: f64,
    /// Samples per data point
    pub target_count: usize,
}

/// Running average of the AC phase while recording for calibration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseAverage {
    /// Arithmetic mean in degrees
    pub average_deg: f64,
    pub count: usize,
}

fn api_error(what: &str) -> impl Fn(anyhow::Error) -> DaqError + '_ {
    move |e| DaqError::Instrument(format!("{} {}: {:#}", DEVICE, what, e))
}

pub struct LockinSession {
    api: Box<dyn LockinApi>,
    config: LockinConfig,
    dev_path: String,
    state: LockinState,
    bessel: Option<BesselCorrection>,
    range_tx: watch::Sender<f64>,
}

impl LockinSession {
    pub fn new(api: Box<dyn LockinApi>, config: LockinConfig) -> Self {
        let dwell_time = config.default_dwell_time_s.max(1.0 / config.sampling_rate);
        let state = LockinState {
            phase_offset: config.phase_offset_deg,
            signal_range: config.default_signal_range_v,
            pmt_volt: 0.0,
            dwell_time,
            target_count: (dwell_time * config.sampling_rate).ceil() as usize,
        };
        let (range_tx, _) = watch::channel(state.signal_range);
        Self {
            api,
            dev_path: format!("/{}/", config.device_id),
            config,
            state,
            bessel: None,
            range_tx,
        }
    }

    fn node(&self, suffix: &str) -> String {
        format!("{}{}", self.dev_path, suffix)
    }

    async fn set_double(&mut self, suffix: &str, value: f64) -> AppResult<()> {
        let path = self.node(suffix);
        self.api
            .set_double(&path, value)
            .await
            .map_err(api_error(suffix))
    }

    async fn set_int(&mut self, suffix: &str, value: i64) -> AppResult<()> {
        let path = self.node(suffix);
        self.api.set_int(&path, value).await.map_err(api_error(suffix))
    }

    async fn sync(&mut self) -> AppResult<()> {
        self.api.sync().await.map_err(api_error("sync"))
    }

    /// Configure PMT control, the four demodulators and the transfer rate.
    ///
    /// `bessel` is kept for the signal processor of this session.
    pub async fn setup_for_daq(&mut self, bessel: BesselCorrection) -> AppResult<()> {
        info!(device = DEVICE, "Setting up device...");
        match self.configure(bessel).await {
            Ok(()) => {
                info!(device = DEVICE, "Setup complete.");
                Ok(())
            }
            Err(e) => {
                error!(device = DEVICE, "Error in lock-in setup: {}", e);
                Err(e)
            }
        }
    }

    async fn configure(&mut self, bessel: BesselCorrection) -> AppResult<()> {
        let order = self.config.filter_order;
        let tc = self.config.time_constant_s;
        let rate = self.config.sampling_rate;
        let phase = self.state.phase_offset;

        // PMT high voltage through aux out 0, manual output
        self.set_double("auxouts/0/limitlower", self.config.pmt_low_limit_v)
            .await?;
        self.set_double("auxouts/0/limitupper", self.config.pmt_high_limit_v)
            .await?;
        self.set_int("auxouts/0/outputselect", -1).await?;
        self.set_pmt_voltage(0.0, false).await?;
        self.set_input_range(self.config.default_signal_range_v)
            .await?;

        // AC
        self.set_int("demods/0/adcselect", 0).await?;
        self.set_int("extrefs/0/enable", 0).await?;
        self.set_double("demods/0/phaseshift", phase).await?;
        self.set_int("demods/0/oscselect", 0).await?;
        self.set_double("sigins/0/scaling", 1.0).await?;
        self.set_int("demods/0/order", order).await?;
        self.set_double("demods/0/timeconstant", tc).await?;
        self.set_double("demods/0/rate", rate).await?;
        self.set_int("demods/0/enable", 1).await?;

        // External reference
        self.set_int("demods/1/adcselect", 8).await?;
        self.set_int("extrefs/0/enable", 1).await?;
        self.set_int("demods/1/enable", 0).await?;

        // DC
        self.set_int("demods/2/adcselect", 0).await?;
        self.set_double("oscs/1/freq", 0.0).await?;
        self.set_double("demods/2/phaseshift", self.config.dc_phase_offset_deg)
            .await?;
        self.set_int("demods/2/order", order).await?;
        self.set_double("demods/2/timeconstant", tc).await?;
        self.set_double("demods/2/rate", rate).await?;
        self.set_int("demods/2/enable", 1).await?;

        // LP
        self.set_int("extrefs/1/enable", 0).await?;
        self.set_int("demods/3/adcselect", 0).await?;
        self.set_double(
            "demods/3/phaseshift",
            phase + self.config.rel_lp_phase_offset_deg,
        )
        .await?;
        self.set_int("demods/3/oscselect", 0).await?;
        self.set_int("demods/3/harmonic", 2).await?;
        self.set_int("demods/3/order", order).await?;
        self.set_double("demods/3/timeconstant", tc).await?;
        self.set_double("demods/3/rate", rate).await?;
        self.set_int("demods/3/enable", 1).await?;

        self.bessel = Some(bessel);
        self.sync().await
    }

    /// Set the PMT control voltage. Out-of-range values are rejected untouched.
    pub async fn set_pmt_voltage(&mut self, volt: f64, autorange: bool) -> AppResult<()> {
        let (low, high) = (self.config.pmt_low_limit_v, self.config.pmt_high_limit_v);
        if !(low..=high).contains(&volt) {
            warn!(
                device = DEVICE,
                "PMT voltage not set because out of range ({:.1}-{:.1} V): {} V", low, high, volt
            );
            return Err(DaqError::Precondition(format!(
                "PMT voltage {} V outside {}..{} V",
                volt, low, high
            )));
        }

        info!(device = DEVICE, "Setting PMT voltage to: {:.3} V", volt);
        self.set_double("auxouts/0/offset", volt).await?;
        self.state.pmt_volt = volt;
        self.sync().await?;

        if autorange {
            tokio::time::sleep(self.config.pmt_settle()).await;
            self.autorange().await?;
        }
        Ok(())
    }

    /// Fixed input range; returns the range the device settled on.
    pub async fn set_input_range(&mut self, range: f64) -> AppResult<f64> {
        self.set_double("sigins/0/range", range).await?;
        self.settle_range().await
    }

    /// Let the device pick the input range; returns the range it settled on.
    pub async fn autorange(&mut self) -> AppResult<f64> {
        self.set_int("sigins/0/autorange", 1).await?;
        self.settle_range().await
    }

    async fn settle_range(&mut self) -> AppResult<f64> {
        self.sync().await?;
        tokio::time::sleep(self.config.range_settle()).await;
        self.sync().await?;
        let path = self.node("sigins/0/range");
        let range = self
            .api
            .get_double(&path)
            .await
            .map_err(api_error("sigins/0/range"))?;
        self.state.signal_range = range;
        self.range_tx.send_replace(range);
        info!(device = DEVICE, "Signal range adjusted to {:.3} V.", range);
        Ok(range)
    }

    /// `dwell = max(t, 1 / rate)`, samples per point `ceil(dwell * rate)`.
    pub fn set_dwell_time(&mut self, seconds: f64) {
        let rate = self.config.sampling_rate;
        self.state.dwell_time = seconds.max(1.0 / rate);
        self.state.target_count = (self.state.dwell_time * rate).ceil() as usize;
        info!(
            device = DEVICE,
            "Dwell time set to {} s = {} data points.",
            self.state.dwell_time,
            self.state.target_count
        );
    }

    /// Phase of the AC demodulator; the LP demodulator follows at its relative offset.
    pub async fn set_phase_offset(&mut self, degrees: f64) -> AppResult<()> {
        self.set_double("demods/0/phaseshift", degrees).await?;
        self.set_double(
            "demods/3/phaseshift",
            degrees + self.config.rel_lp_phase_offset_deg,
        )
        .await?;
        self.sync().await?;
        self.state.phase_offset = degrees;
        info!(device = DEVICE, "Phase offset set to {:.3} deg", degrees);
        Ok(())
    }

    /// Toggle an external reference, used to measure without modulation.
    pub async fn set_extref_active(&mut self, index: usize, active: bool) -> AppResult<()> {
        self.set_int(&format!("extrefs/{}/enable", index), i64::from(active))
            .await?;
        self.sync().await
    }

    /// AC, DC and LP sample paths
    pub fn node_paths(&self) -> [String; 3] {
        [
            self.node("demods/0/sample"),
            self.node("demods/2/sample"),
            self.node("demods/3/sample"),
        ]
    }

    pub fn sampler_settings(&self) -> SamplerSettings {
        SamplerSettings::new(
            self.node_paths(),
            self.state.dwell_time,
            self.state.target_count,
            &self.config,
        )
    }

    /// One aligned frame at the current dwell time.
    pub async fn acquire(&mut self, abort: &AbortSignal) -> AppResult<Option<AlignedFrame>> {
        let settings = self.sampler_settings();
        acquire_aligned(self.api.as_mut(), &settings, abort).await
    }

    /// Record the AC phase until `abort` fires, publishing the running mean.
    ///
    /// The mean is a plain arithmetic mean of degrees. The signal is reset on return.
    pub async fn record_phase(
        &mut self,
        abort: &AbortSignal,
        live: &watch::Sender<PhaseAverage>,
    ) -> AppResult<PhaseAverage> {
        let path = self.node("demods/0/sample");
        let poll = Duration::from_secs_f64(self.config.phase_poll_s);
        info!(device = DEVICE, "Recording AC theta...");

        let result = self.poll_phase(&path, poll, abort, live).await;

        let released = self.api.unsubscribe_all().await;
        let synced = self.api.sync().await;
        info!(device = DEVICE, "Stop recording AC theta...");
        abort.reset();

        let average = result?;
        released.map_err(api_error("unsubscribe"))?;
        synced.map_err(api_error("sync"))?;
        Ok(average)
    }

    async fn poll_phase(
        &mut self,
        path: &str,
        poll: Duration,
        abort: &AbortSignal,
        live: &watch::Sender<PhaseAverage>,
    ) -> AppResult<PhaseAverage> {
        self.api.subscribe(path).await.map_err(api_error("subscribe"))?;
        self.sync().await?;

        let mut sum = 0.0;
        let mut average = PhaseAverage::default();
        live.send_replace(average);

        while !abort.is_requested() {
            let mut data = self.api.poll(poll).await.map_err(api_error("poll"))?;
            if let Some(chunk) = data.remove(path) {
                for (x, y) in chunk.x.iter().zip(&chunk.y) {
                    sum += y.atan2(*x).to_degrees();
                }
                average.count += chunk.len();
                if average.count > 0 {
                    average.average_deg = sum / average.count as f64;
                }
                debug!(device = DEVICE, count = average.count, "theta {:.3}", average.average_deg);
                live.send_replace(average);
            }
        }
        Ok(average)
    }

    pub fn state(&self) -> LockinState {
        self.state
    }

    pub fn config(&self) -> &LockinConfig {
        &self.config
    }

    /// Bessel factors set during setup
    pub fn bessel(&self) -> Option<BesselCorrection> {
        self.bessel
    }

    /// Observe the input range after every change.
    pub fn range_watch(&self) -> watch::Receiver<f64> {
        self.range_tx.subscribe()
    }

    pub async fn disconnect(&mut self) -> AppResult<()> {
        self.api.disconnect().await.map_err(api_error("disconnect"))
    }
}

/// Max and mean of one oscilloscope trace; NaN when no trace was available.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScopeReading {
    pub max_v: f64,
    pub avg_v: f64,
}

impl ScopeReading {
    pub fn missing() -> Self {
        Self {
            max_v: f64::NAN,
            avg_v: f64::NAN,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.max_v.is_nan()
    }
}

pub struct ScopeSession {
    stream: Box<dyn ScopeStream>,
    running: bool,
}

impl ScopeSession {
    pub fn new(stream: Box<dyn ScopeStream>) -> Self {
        Self {
            stream,
            running: false,
        }
    }

    pub async fn start(&mut self) -> AppResult<()> {
        self.stream.start().await.map_err(api_error("scope start"))?;
        self.running = true;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub async fn read(&mut self) -> AppResult<ScopeReading> {
        let trace = self
            .stream
            .read_trace()
            .await
            .map_err(api_error("scope read"))?;
        Ok(match trace {
            Some(t) if !t.is_empty() => ScopeReading {
                max_v: t.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                avg_v: t.iter().sum::<f64>() / t.len() as f64,
            },
            _ => ScopeReading::missing(),
        })
    }

    pub async fn stop(&mut self) -> AppResult<()> {
        self.running = false;
        self.stream.stop().await.map_err(api_error("scope stop"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockLockin, MockScope};

    fn session(mock: &MockLockin) -> LockinSession {
        LockinSession::new(Box::new(mock.clone()), LockinConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn setup_writes_demodulator_layout() {
        let mock = MockLockin::new();
        let mut lockin = session(&mock);
        lockin
            .setup_for_daq(BesselCorrection::from_retardation(0.25))
            .await
            .unwrap();

        assert_eq!(mock.setting("demods/3/harmonic").await, Some(2.0));
        assert_eq!(mock.setting("demods/1/adcselect").await, Some(8.0));
        assert_eq!(mock.setting("auxouts/0/offset").await, Some(0.0));
        assert_eq!(mock.setting("demods/0/phaseshift").await, Some(158.056));
        let lp = mock.setting("demods/3/phaseshift").await.unwrap();
        assert!((lp - (158.056 - 22.0)).abs() < 1e-9);
        assert!(lockin.bessel().is_some());
        assert_eq!(lockin.state().signal_range, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn pmt_voltage_limits() {
        let mock = MockLockin::new();
        let mut lockin = session(&mock);
        assert!(matches!(
            lockin.set_pmt_voltage(1.5, false).await,
            Err(DaqError::Precondition(_))
        ));
        assert_eq!(mock.setting("auxouts/0/offset").await, None);

        lockin.set_pmt_voltage(0.8, false).await.unwrap();
        assert_eq!(lockin.state().pmt_volt, 0.8);
        assert_eq!(mock.setting("auxouts/0/offset").await, Some(0.8));
    }

    #[tokio::test(start_paused = true)]
    async fn autorange_publishes_new_range() {
        let mock = MockLockin::new();
        mock.set_autorange_result(0.3).await;
        let mut lockin = session(&mock);
        let mut rx = lockin.range_watch();

        assert_eq!(lockin.autorange().await.unwrap(), 0.3);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 0.3);
    }

    #[tokio::test(start_paused = true)]
    async fn pmt_change_waits_configured_settle_before_autorange() {
        let mock = MockLockin::new();
        mock.set_autorange_result(1.0).await;
        let config = LockinConfig {
            pmt_settle_ms: 300,
            range_settle_ms: 100,
            ..LockinConfig::default()
        };
        let mut lockin = LockinSession::new(Box::new(mock.clone()), config);

        let start = tokio::time::Instant::now();
        lockin.set_pmt_voltage(0.5, true).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(2000));
        assert_eq!(lockin.state().signal_range, 1.0);
    }

    #[test]
    fn dwell_time_floor_and_target_count() {
        let mut lockin = session(&MockLockin::new());
        lockin.set_dwell_time(0.5);
        assert_eq!(lockin.state().target_count, 53);
        lockin.set_dwell_time(0.0);
        assert_eq!(lockin.state().target_count, 1);
        assert!((lockin.state().dwell_time - 1.0 / 104.6).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn phase_offset_moves_lp_demodulator_along() {
        let mock = MockLockin::new();
        let mut lockin = session(&mock);
        lockin.set_phase_offset(160.0).await.unwrap();
        assert_eq!(mock.setting("demods/0/phaseshift").await, Some(160.0));
        assert_eq!(mock.setting("demods/3/phaseshift").await, Some(138.0));
        assert_eq!(lockin.state().phase_offset, 160.0);
    }

    #[tokio::test(start_paused = true)]
    async fn phase_recording_until_abort() {
        let mock = MockLockin::new();
        mock.set_ac_phase(95.0).await;
        let mut lockin = session(&mock);
        let abort = AbortSignal::new();
        let (tx, rx) = watch::channel(PhaseAverage::default());

        let stopper = {
            let abort = abort.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(550)).await;
                abort.request("stop recording");
            })
        };
        let average = lockin.record_phase(&abort, &tx).await.unwrap();
        stopper.await.unwrap();

        assert!(average.count > 0);
        assert!((average.average_deg - 95.0).abs() < 1e-6);
        assert_eq!(rx.borrow().count, average.count);
        assert!(!abort.is_requested());
        assert!(mock.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn scope_reading_from_trace() {
        let scope = MockScope::scripted(vec![Some(vec![0.5, 1.5, 1.0]), None]);
        let mut session = ScopeSession::new(Box::new(scope));
        session.start().await.unwrap();

        let reading = session.read().await.unwrap();
        assert_eq!(reading.max_v, 1.5);
        assert_eq!(reading.avg_v, 1.0);
        assert!(session.read().await.unwrap().is_missing());
    }
}
