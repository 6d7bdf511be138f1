//! Mock Hardware Implementations
//!
//! Simulated instruments for tests and the demo binary. All mocks are cheap to clone: a
//! clone shares the device state, so a test keeps one handle for fault injection and
//! inspection while the session owns the other.
//!
//! # Available Mocks
//!
//! - `MockModulator` - `[GROUP](VALUE)` controller with echoing set commands
//! - `MockMonochromator` - grating drive acknowledging with `ok`
//! - `MockLockin` - demodulator stream with a deterministic clock
//! - `MockScope` - scripted oscilloscope traces
//! - `MockRig` - all four, wired into [`Instruments`]
//!
//! Time is simulated with `tokio::time::sleep`, so tests running with a paused clock
//! advance instantly.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::CplConfig;
use crate::hardware::capabilities::{DemodChunk, LineTransport, LockinApi, ScopeStream};
use crate::hardware::lockin::{LockinSession, ScopeSession};
use crate::hardware::modulator::Modulator;
use crate::hardware::monochromator::Monochromator;
use crate::instruments::Instruments;

// =============================================================================
// MockModulator
// =============================================================================

#[derive(Debug)]
struct PemState {
    model: String,
    amplitude: f64,
    drive: f64,
    active: bool,
    idle: bool,
    fail_next: u32,
    garble_next: u32,
    commands: Vec<String>,
}

/// Simulated modulator controller
#[derive(Clone, Debug)]
pub struct MockModulator {
    state: Arc<Mutex<PemState>>,
}

impl Default for MockModulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModulator {
    pub fn new() -> Self {
        Self::with_model(crate::config::ModulatorConfig::default().model)
    }

    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PemState {
                model: model.into(),
                amplitude: 0.0,
                drive: 1.0,
                active: false,
                idle: false,
                fail_next: 0,
                garble_next: 0,
                commands: Vec::new(),
            })),
        }
    }

    /// The next `n` queries time out.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    /// The next `n` replies carry a wrong group tag.
    pub async fn garble_next(&self, n: u32) {
        self.state.lock().await.garble_next = n;
    }

    pub async fn amplitude(&self) -> f64 {
        self.state.lock().await.amplitude
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }
}

fn pem_reply(state: &mut PemState, command: &str) -> String {
    let (head, arg) = match command.split_once(' ') {
        Some((h, a)) => (h, Some(a.trim())),
        None => (command, None),
    };
    let number = arg.and_then(|a| a.parse::<f64>().ok());

    match (head, number) {
        ("*IDN?", None) => format!("[IDN]({})", state.model),
        (":SYS:PEMO", Some(v)) => {
            state.active = v == 1.0;
            format!("[PEMOUT]({})", v as i64)
        }
        (":SYS:IDLE", Some(v)) => {
            state.idle = v == 1.0;
            format!("[PIDLE]({})", v as i64)
        }
        (":MOD:STABLE?", None) => "[STABLE](1)".to_string(),
        (":MOD:FREQ?", None) => "[FREQUENCY](50000)".to_string(),
        (":MOD:AMP?", None) => format!("[AMP]({:.2})", state.amplitude),
        (":MOD:AMP", Some(v)) => {
            state.amplitude = v;
            format!("[AMP]({:.2})", v)
        }
        (":MOD:AMPR?", None) => "[AMPR](0,1200)".to_string(),
        (":MOD:DRV?", None) => format!("[DRIVE]({:.2})", state.drive),
        (":MOD:DRV", Some(v)) => {
            state.drive = v;
            format!("[DRIVE]({:.2})", v)
        }
        (":SYS:CPE?", None) => "[CPE](0.12,0.03)".to_string(),
        (":SYS:VC?", None) => "[VC](1.50)".to_string(),
        _ => format!("[ERR](unknown command {})", command),
    }
}

#[async_trait]
impl LineTransport for MockModulator {
    async fn query(&mut self, command: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.commands.push(command.to_string());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(anyhow!("read timeout"));
        }
        let reply = pem_reply(&mut state, command);
        if state.garble_next > 0 {
            state.garble_next -= 1;
            return Ok("[ERR](garbled)".to_string());
        }
        Ok(reply)
    }

    fn describe(&self) -> String {
        "mock://pem".to_string()
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// MockMonochromator
// =============================================================================

#[derive(Debug)]
struct MonoState {
    model: String,
    serial: String,
    position: f64,
    fail_next: u32,
    garble_next: u32,
    commands: Vec<String>,
}

/// Simulated monochromator
#[derive(Clone, Debug)]
pub struct MockMonochromator {
    state: Arc<Mutex<MonoState>>,
}

impl Default for MockMonochromator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMonochromator {
    pub fn new() -> Self {
        let config = crate::config::MonochromatorConfig::default();
        Self::with_identity(config.model, config.serial)
    }

    pub fn with_identity(model: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonoState {
                model: model.into(),
                serial: serial.into(),
                position: 500.0,
                fail_next: 0,
                garble_next: 0,
                commands: Vec::new(),
            })),
        }
    }

    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    /// The next `n` replies lack the `ok` marker.
    pub async fn garble_next(&self, n: u32) {
        self.state.lock().await.garble_next = n;
    }

    pub async fn position(&self) -> f64 {
        self.state.lock().await.position
    }

    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    pub async fn clear_commands(&self) {
        self.state.lock().await.commands.clear();
    }
}

#[async_trait]
impl LineTransport for MockMonochromator {
    async fn query(&mut self, command: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        state.commands.push(command.to_string());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(anyhow!("read timeout"));
        }
        if state.garble_next > 0 {
            state.garble_next -= 1;
            return Ok(" ?".to_string());
        }

        let reply = match command {
            "MODEL" => format!(" {}  ok", state.model),
            "SERIAL" => format!(" {}  ok", state.serial),
            "?NM" => format!("  {:.3} nm  ok", state.position),
            _ => match command.strip_suffix(" GOTO").map(str::parse::<f64>) {
                Some(Ok(nm)) => {
                    state.position = nm;
                    "  ok".to_string()
                }
                _ => " ?".to_string(),
            },
        };
        Ok(reply)
    }

    fn describe(&self) -> String {
        "mock://monochromator".to_string()
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// MockLockin
// =============================================================================

/// Signal of one demodulator: amplitude and phase, phase optionally jittered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSignal {
    pub amplitude: f64,
    pub phase_deg: f64,
    pub jitter_deg: f64,
}

impl ChannelSignal {
    pub fn new(amplitude: f64, phase_deg: f64) -> Self {
        Self {
            amplitude,
            phase_deg,
            jitter_deg: 0.0,
        }
    }
}

#[derive(Debug)]
struct LockinState {
    settings: HashMap<String, f64>,
    subscriptions: Vec<String>,
    autorange_result: f64,
    sampling_rate: f64,
    /// demods 0 (AC), 2 (DC), 3 (LP)
    signals: HashMap<usize, ChannelSignal>,
    carry: f64,
    clock: u64,
    sample_index: u64,
    drop_every: HashMap<String, u64>,
    omit_polls: HashMap<String, u32>,
    nan_samples: u32,
    acquisitions: u32,
    fail_from: Option<u32>,
    fail_settings: bool,
}

/// Clock ticks between two samples
const TICKS_PER_SAMPLE: u64 = 573_614;

/// Simulated lock-in amplifier
#[derive(Clone, Debug)]
pub struct MockLockin {
    state: Arc<Mutex<LockinState>>,
}

impl Default for MockLockin {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLockin {
    pub fn new() -> Self {
        let signals = HashMap::from([
            (0, ChannelSignal::new(0.002, 90.0)),
            (2, ChannelSignal::new(1.0, 90.0)),
            (3, ChannelSignal::new(0.0005, 90.0)),
        ]);
        Self {
            state: Arc::new(Mutex::new(LockinState {
                settings: HashMap::new(),
                subscriptions: Vec::new(),
                autorange_result: 1.0,
                sampling_rate: crate::config::LockinConfig::default().sampling_rate,
                signals,
                carry: 0.0,
                clock: 1_000_000,
                sample_index: 0,
                drop_every: HashMap::new(),
                omit_polls: HashMap::new(),
                nan_samples: 0,
                acquisitions: 0,
                fail_from: None,
                fail_settings: false,
            })),
        }
    }

    /// Random phase noise on every channel, LP fully unpolarised.
    pub async fn with_noise(self, jitter_deg: f64) -> Self {
        {
            let mut state = self.state.lock().await;
            for (demod, signal) in state.signals.iter_mut() {
                signal.jitter_deg = if *demod == 3 { 180.0 } else { jitter_deg };
            }
        }
        self
    }

    /// Value of the setting whose path ends in `suffix`
    pub async fn setting(&self, suffix: &str) -> Option<f64> {
        let state = self.state.lock().await;
        state
            .settings
            .iter()
            .find(|(path, _)| path.ends_with(suffix))
            .map(|(_, v)| *v)
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.state.lock().await.subscriptions.clone()
    }

    pub async fn set_signal(&self, demod: usize, signal: ChannelSignal) {
        self.state.lock().await.signals.insert(demod, signal);
    }

    pub async fn set_ac_phase(&self, phase_deg: f64) {
        let mut state = self.state.lock().await;
        if let Some(ac) = state.signals.get_mut(&0) {
            ac.phase_deg = phase_deg;
        }
    }

    /// Range the device settles on after an autorange
    pub async fn set_autorange_result(&self, range: f64) {
        self.state.lock().await.autorange_result = range;
    }

    /// Drop every `every`-th sample of `path`.
    pub async fn drop_every(&self, path: &str, every: u64) {
        self.state
            .lock()
            .await
            .drop_every
            .insert(path.to_string(), every.max(1));
    }

    /// Leave `path` out of the next `polls` poll results.
    pub async fn omit_from_polls(&self, path: &str, polls: u32) {
        self.state
            .lock()
            .await
            .omit_polls
            .insert(path.to_string(), polls);
    }

    /// The next `count` AC samples are NaN.
    pub async fn inject_nan(&self, count: u32) {
        self.state.lock().await.nan_samples = count;
    }

    /// Polls fail from the `k`-th acquisition on (1-based, counted by AC subscriptions).
    pub async fn fail_acquisitions_from(&self, k: u32) {
        self.state.lock().await.fail_from = Some(k);
    }

    pub async fn fail_settings(&self, fail: bool) {
        self.state.lock().await.fail_settings = fail;
    }
}

fn demod_index(path: &str) -> Option<usize> {
    let rest = path.split("demods/").nth(1)?;
    rest.split('/').next()?.parse().ok()
}

impl LockinState {
    fn sample(&self, demod: usize, rng: &mut impl Rng) -> (f64, f64) {
        let signal = self
            .signals
            .get(&demod)
            .copied()
            .unwrap_or(ChannelSignal::new(0.0, 0.0));
        let jitter = if signal.jitter_deg > 0.0 {
            rng.gen_range(-signal.jitter_deg..signal.jitter_deg)
        } else {
            0.0
        };
        let phase = (signal.phase_deg + jitter).to_radians();
        (signal.amplitude * phase.cos(), signal.amplitude * phase.sin())
    }

    fn check_settings(&self) -> Result<()> {
        if self.fail_settings {
            Err(anyhow!("settings API unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockinApi for MockLockin {
    async fn set_double(&mut self, path: &str, value: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_settings()?;
        state.settings.insert(path.to_string(), value);
        Ok(())
    }

    async fn set_int(&mut self, path: &str, value: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_settings()?;
        if path.ends_with("sigins/0/autorange") && value == 1 {
            let range_path = path.replace("autorange", "range");
            let range = state.autorange_result;
            state.settings.insert(range_path, range);
        }
        state.settings.insert(path.to_string(), value as f64);
        Ok(())
    }

    async fn get_double(&mut self, path: &str) -> Result<f64> {
        let state = self.state.lock().await;
        state.check_settings()?;
        state
            .settings
            .get(path)
            .copied()
            .ok_or_else(|| anyhow!("node {} not found", path))
    }

    async fn sync(&mut self) -> Result<()> {
        self.state.lock().await.check_settings()
    }

    async fn subscribe(&mut self, path: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if demod_index(path) == Some(0) {
            state.acquisitions += 1;
        }
        state.subscriptions.push(path.to_string());
        Ok(())
    }

    async fn unsubscribe_all(&mut self) -> Result<()> {
        self.state.lock().await.subscriptions.clear();
        Ok(())
    }

    async fn get_as_event(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn poll(&mut self, duration: Duration) -> Result<HashMap<String, DemodChunk>> {
        {
            let state = self.state.lock().await;
            if let Some(k) = state.fail_from {
                if state.acquisitions >= k {
                    return Err(anyhow!("poll timed out"));
                }
            }
        }

        tokio::time::sleep(duration).await;

        let mut state = self.state.lock().await;
        let produced = state.carry + duration.as_secs_f64() * state.sampling_rate;
        let count = produced.floor() as u64;
        state.carry = produced - count as f64;

        let mut rng = rand::thread_rng();
        let paths = state.subscriptions.clone();
        let mut chunks: HashMap<String, DemodChunk> = HashMap::new();
        let first_index = state.sample_index;
        let first_tick = state.clock;

        for path in &paths {
            if let Some(left) = state.omit_polls.get_mut(path) {
                if *left > 0 {
                    *left -= 1;
                    continue;
                }
            }
            let Some(demod) = demod_index(path) else {
                continue;
            };
            let drop_every = state.drop_every.get(path).copied();
            let mut chunk = DemodChunk::default();
            for i in 0..count {
                let index = first_index + i;
                if drop_every.is_some_and(|k| index % k == 0) {
                    continue;
                }
                let (mut x, y) = state.sample(demod, &mut rng);
                if demod == 0 && (i as u32) < state.nan_samples {
                    x = f64::NAN;
                }
                chunk.timestamps.push(first_tick + i * TICKS_PER_SAMPLE);
                chunk.x.push(x);
                chunk.y.push(y);
            }
            chunks.insert(path.clone(), chunk);
        }

        state.nan_samples = state.nan_samples.saturating_sub(count as u32);
        state.sample_index += count;
        state.clock += count * TICKS_PER_SAMPLE;
        Ok(chunks)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.lock().await.subscriptions.clear();
        Ok(())
    }
}

// =============================================================================
// MockScope
// =============================================================================

#[derive(Debug, Default)]
struct ScopeState {
    traces: VecDeque<Option<Vec<f64>>>,
    level: Option<f64>,
    running: bool,
    reads: usize,
}

/// Simulated oscilloscope stream
///
/// Scripted traces are served first; afterwards a constant `level` (if set) or no trace.
#[derive(Clone, Debug, Default)]
pub struct MockScope {
    state: Arc<Mutex<ScopeState>>,
}

impl MockScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(traces: Vec<Option<Vec<f64>>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScopeState {
                traces: traces.into(),
                ..ScopeState::default()
            })),
        }
    }

    /// Queue traces whose maximum is `max_v` each.
    pub async fn push_levels(&self, levels: &[f64]) {
        let mut state = self.state.lock().await;
        for v in levels {
            state.traces.push_back(Some(vec![0.0, *v, v / 2.0]));
        }
    }

    pub async fn set_level(&self, level: Option<f64>) {
        self.state.lock().await.level = level;
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn reads(&self) -> usize {
        self.state.lock().await.reads
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.traces.len()
    }
}

#[async_trait]
impl ScopeStream for MockScope {
    async fn start(&mut self) -> Result<()> {
        self.state.lock().await.running = true;
        Ok(())
    }

    async fn read_trace(&mut self) -> Result<Option<Vec<f64>>> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Err(anyhow!("scope is not running"));
        }
        state.reads += 1;
        if let Some(trace) = state.traces.pop_front() {
            return Ok(trace);
        }
        Ok(state.level.map(|v| vec![v; 16]))
    }

    async fn stop(&mut self) -> Result<()> {
        self.state.lock().await.running = false;
        Ok(())
    }
}

// =============================================================================
// MockRig
// =============================================================================

/// A full simulated setup. Keep the rig to inject faults into running instruments.
#[derive(Clone, Debug, Default)]
pub struct MockRig {
    pub modulator: MockModulator,
    pub monochromator: MockMonochromator,
    pub lockin: MockLockin,
    pub scope: MockScope,
}

impl MockRig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions over the mocks, not yet initialized.
    pub fn instruments(&self, config: Arc<CplConfig>) -> Instruments {
        Instruments::new(
            Modulator::new(Box::new(self.modulator.clone()), config.modulator.clone()),
            Monochromator::new(
                Box::new(self.monochromator.clone()),
                config.monochromator.clone(),
            ),
            LockinSession::new(Box::new(self.lockin.clone()), config.lockin.clone()),
            ScopeSession::new(Box::new(self.scope.clone())),
            config,
        )
    }
}
