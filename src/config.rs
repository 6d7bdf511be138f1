//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the acquisition core.
//! Configuration is layered from:
//! 1. Built-in defaults (the calibrated constants of the CPL setup)
//! 2. A TOML file (by default `config/cpl_daq.toml`, optional)
//! 3. Environment variables prefixed with `CPL_DAQ_`, nested with `__`
//!
//! The resulting [`CplConfig`] is immutable. It is wrapped in an `Arc` and handed to each
//! component at construction; per-session mutable values (phase offset, signal range,
//! PMT voltage) live in the session state of [`crate::hardware::lockin`], not here.
//!
//! # Example
//! ```no_run
//! use cpl_daq::config::CplConfig;
//!
//! let config = CplConfig::load()?;
//! println!("Lock-in device: {}", config.lockin.device_id);
//! # Ok::<(), cpl_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/cpl_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CplConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Photoelastic modulator controller
    pub modulator: ModulatorConfig,
    /// Monochromator
    pub monochromator: MonochromatorConfig,
    /// Lock-in amplifier (acquisition and oscilloscope sessions)
    pub lockin: LockinConfig,
    /// Scan controller timing and limits
    pub scan: ScanConfig,
    /// Safety monitor thresholds
    pub safety: SafetyConfig,
    /// Photomultiplier gain curve
    pub pmt: PmtConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "CPL DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Serial line parameters and self-test identity of the modulator controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModulatorConfig {
    /// Serial port name
    #[serde(default = "default_modulator_port")]
    pub port: String,
    #[serde(default = "default_modulator_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_modulator_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_semicolon")]
    pub write_terminator: String,
    #[serde(default = "default_newline")]
    pub read_terminator: String,
    /// Identity string the controller must report
    #[serde(default = "default_modulator_model")]
    pub model: String,
    /// Retardation in waves; the amplitude command is `nm * retardation`
    #[serde(default = "default_retardation")]
    pub retardation: f64,
    /// Absolute tolerance for echoed floating-point values
    #[serde(default = "default_float_tolerance")]
    pub float_tolerance: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ModulatorConfig {
    fn default() -> Self {
        Self {
            port: default_modulator_port(),
            baud_rate: default_modulator_baud(),
            timeout_ms: default_modulator_timeout(),
            write_terminator: default_semicolon(),
            read_terminator: default_newline(),
            model: default_modulator_model(),
            retardation: default_retardation(),
            float_tolerance: default_float_tolerance(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Serial line parameters and self-test identity of the monochromator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonochromatorConfig {
    #[serde(default = "default_monochromator_port")]
    pub port: String,
    #[serde(default = "default_monochromator_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_monochromator_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_carriage_return")]
    pub write_terminator: String,
    #[serde(default = "default_crlf")]
    pub read_terminator: String,
    /// Substring expected in the `MODEL` reply
    #[serde(default = "default_monochromator_model")]
    pub model: String,
    /// Substring expected in the `SERIAL` reply
    #[serde(default = "default_monochromator_serial")]
    pub serial: String,
    /// Success marker of the weak protocol
    #[serde(default = "default_ok_marker")]
    pub ok_marker: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Far end of the self-test round trip
    #[serde(default = "default_self_test_far_nm")]
    pub self_test_far_nm: f64,
    /// Near end of the self-test round trip
    #[serde(default)]
    pub self_test_near_nm: f64,
    /// Grating position on disconnect
    #[serde(default = "default_self_test_far_nm")]
    pub park_nm: f64,
}

impl Default for MonochromatorConfig {
    fn default() -> Self {
        Self {
            port: default_monochromator_port(),
            baud_rate: default_monochromator_baud(),
            timeout_ms: default_monochromator_timeout(),
            write_terminator: default_carriage_return(),
            read_terminator: default_crlf(),
            model: default_monochromator_model(),
            serial: default_monochromator_serial(),
            ok_marker: default_ok_marker(),
            max_attempts: default_max_attempts(),
            self_test_far_nm: default_self_test_far_nm(),
            self_test_near_nm: 0.0,
            park_nm: default_self_test_far_nm(),
        }
    }
}

/// Lock-in amplifier calibration constants and alignment sampler tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockinConfig {
    pub device_id: String,
    /// Demodulator transfer rate in Hz
    pub sampling_rate: f64,
    pub time_constant_s: f64,
    pub filter_order: i64,
    pub pmt_low_limit_v: f64,
    pub pmt_high_limit_v: f64,
    pub default_signal_range_v: f64,
    pub phase_offset_deg: f64,
    pub dc_phase_offset_deg: f64,
    /// Offset of the 2nd-harmonic demodulator relative to the fundamental
    pub rel_lp_phase_offset_deg: f64,
    /// Wait after changing the input range before re-reading it
    pub range_settle_ms: u64,
    /// Wait after a PMT voltage change before an autorange
    pub pmt_settle_ms: u64,
    pub max_poll_s: f64,
    pub min_poll_s: f64,
    /// Extra poll iterations allowed beyond the nominal count
    pub poll_slack: u32,
    /// Poll slice of the calibration phase sampler
    pub phase_poll_s: f64,
    pub default_dwell_time_s: f64,
}

impl Default for LockinConfig {
    fn default() -> Self {
        Self {
            device_id: "dev3902".to_string(),
            sampling_rate: 104.6,
            time_constant_s: 0.008_114_109_38,
            filter_order: 3,
            pmt_low_limit_v: 0.0,
            pmt_high_limit_v: 1.1,
            default_signal_range_v: 3.0,
            phase_offset_deg: 158.056,
            dc_phase_offset_deg: 0.0,
            rel_lp_phase_offset_deg: -22.0,
            range_settle_ms: 1500,
            pmt_settle_ms: 2000,
            max_poll_s: 0.1,
            min_poll_s: 0.025,
            poll_slack: 10,
            phase_poll_s: 0.1,
            default_dwell_time_s: 0.5,
        }
    }
}

impl LockinConfig {
    pub fn range_settle(&self) -> Duration {
        Duration::from_millis(self.range_settle_ms)
    }

    pub fn pmt_settle(&self) -> Duration {
        Duration::from_millis(self.pmt_settle_ms)
    }
}

/// Scan controller timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    /// Settle time after a move, equal to the lock-in filter rise time
    pub filter_rise_time_s: f64,
    /// Extra wait once both devices reached the wavelength
    pub move_delay_s: f64,
    pub max_point_attempts: u32,
    /// LP phase standard deviation below which linear polarisation is suspected
    pub lp_theta_std_warning: f64,
    /// Re-check period of interruptible waits
    pub abort_granularity_ms: u64,
    /// Characters rejected in output names
    pub illegal_name_chars: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            filter_rise_time_s: 0.6,
            move_delay_s: 0.2,
            max_point_attempts: 5,
            lp_theta_std_warning: 1.0,
            abort_granularity_ms: 10,
            illegal_name_chars: "#@$%^&*{}:;\"|<>/?\\`~'".to_string(),
        }
    }
}

impl ScanConfig {
    pub fn filter_rise_time(&self) -> Duration {
        Duration::from_secs_f64(self.filter_rise_time_s)
    }

    pub fn move_delay(&self) -> Duration {
        Duration::from_secs_f64(self.move_delay_s)
    }

    pub fn abort_granularity(&self) -> Duration {
        Duration::from_millis(self.abort_granularity_ms)
    }
}

/// Safety monitor thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Max-voltage level that zeroes the PMT high voltage
    pub shutdown_threshold_v: f64,
    pub history_len: usize,
    pub refresh_ms: u64,
    pub saturation_window: usize,
    /// Fraction of the input range that counts as saturated
    pub saturation_fraction: f64,
    pub saturation_tolerance_v: f64,
    pub overexposure_window: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            shutdown_threshold_v: 2.95,
            history_len: 75,
            refresh_ms: 100,
            saturation_window: 5,
            saturation_fraction: 0.95,
            saturation_tolerance_v: 1e-9,
            overexposure_window: 3,
        }
    }
}

impl SafetyConfig {
    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }
}

/// PMT gain curve, `gain = 10^(v * slope + offset) / norm`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PmtConfig {
    pub gain_slope: f64,
    pub gain_offset: f64,
    pub max_gain: f64,
    pub gain_norm: f64,
}

impl Default for PmtConfig {
    fn default() -> Self {
        Self {
            gain_slope: 4.913,
            gain_offset: 1.222,
            max_gain: 885.6,
            gain_norm: 4775.0,
        }
    }
}

// Default value functions
fn default_modulator_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_modulator_baud() -> u32 {
    250_000
}

fn default_modulator_timeout() -> u64 {
    3000
}

fn default_semicolon() -> String {
    ";".to_string()
}

fn default_newline() -> String {
    "\n".to_string()
}

fn default_modulator_model() -> String {
    "Hinds PEM controller 200 V01".to_string()
}

fn default_retardation() -> f64 {
    0.25
}

fn default_float_tolerance() -> f64 {
    0.025
}

fn default_max_attempts() -> u32 {
    3
}

fn default_monochromator_port() -> String {
    "/dev/ttyUSB1".to_string()
}

fn default_monochromator_baud() -> u32 {
    9600
}

fn default_monochromator_timeout() -> u64 {
    5000
}

fn default_carriage_return() -> String {
    "\r".to_string()
}

fn default_crlf() -> String {
    "\r\n".to_string()
}

fn default_monochromator_model() -> String {
    "SP-2-150i".to_string()
}

fn default_monochromator_serial() -> String {
    "21551915".to_string()
}

fn default_ok_marker() -> String {
    "ok".to_string()
}

fn default_self_test_far_nm() -> f64 {
    1000.0
}

impl CplConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `CPL_DAQ_`, sections
    /// separated by a double underscore.
    /// Example: `CPL_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: CplConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, exposed for callers that merge extra sources.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(CplConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CPL_DAQ_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let positive = [
            ("lockin.sampling_rate", self.lockin.sampling_rate),
            ("lockin.time_constant_s", self.lockin.time_constant_s),
            ("lockin.max_poll_s", self.lockin.max_poll_s),
            ("lockin.min_poll_s", self.lockin.min_poll_s),
            ("lockin.phase_poll_s", self.lockin.phase_poll_s),
            ("lockin.default_dwell_time_s", self.lockin.default_dwell_time_s),
            ("lockin.default_signal_range_v", self.lockin.default_signal_range_v),
            ("modulator.retardation", self.modulator.retardation),
            ("safety.shutdown_threshold_v", self.safety.shutdown_threshold_v),
            ("pmt.gain_norm", self.pmt.gain_norm),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        let non_negative = [
            ("scan.filter_rise_time_s", self.scan.filter_rise_time_s),
            ("scan.move_delay_s", self.scan.move_delay_s),
            ("modulator.float_tolerance", self.modulator.float_tolerance),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(DaqError::Configuration(format!(
                    "{} must not be negative, got {}",
                    name, value
                )));
            }
        }

        if self.lockin.min_poll_s > self.lockin.max_poll_s {
            return Err(DaqError::Configuration(format!(
                "lockin.min_poll_s ({}) exceeds lockin.max_poll_s ({})",
                self.lockin.min_poll_s, self.lockin.max_poll_s
            )));
        }

        if self.lockin.pmt_low_limit_v > self.lockin.pmt_high_limit_v {
            return Err(DaqError::Configuration(format!(
                "PMT low limit {} V is above high limit {} V",
                self.lockin.pmt_low_limit_v, self.lockin.pmt_high_limit_v
            )));
        }

        if self.modulator.max_attempts == 0
            || self.monochromator.max_attempts == 0
            || self.scan.max_point_attempts == 0
        {
            return Err(DaqError::Configuration(
                "attempt bounds must be at least 1".to_string(),
            ));
        }

        if self.scan.abort_granularity_ms == 0 || self.safety.refresh_ms == 0 {
            return Err(DaqError::Configuration(
                "scan.abort_granularity_ms and safety.refresh_ms must be non-zero".to_string(),
            ));
        }

        if self.safety.saturation_window == 0 || self.safety.overexposure_window == 0 {
            return Err(DaqError::Configuration(
                "safety windows must be non-zero".to_string(),
            ));
        }

        let longest_window = self
            .safety
            .saturation_window
            .max(self.safety.overexposure_window);
        if self.safety.history_len < longest_window {
            return Err(DaqError::Configuration(format!(
                "safety.history_len {} is shorter than the longest alarm window {}",
                self.safety.history_len, longest_window
            )));
        }

        if !(self.safety.saturation_fraction > 0.0 && self.safety.saturation_fraction <= 1.0) {
            return Err(DaqError::Configuration(format!(
                "safety.saturation_fraction {} must be in (0, 1]",
                self.safety.saturation_fraction
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = CplConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.modulator.baud_rate, 250_000);
        assert_eq!(config.monochromator.read_terminator, "\r\n");
        assert_eq!(config.scan.max_point_attempts, 5);
        assert_eq!(config.safety.history_len, 75);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CplConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.lockin.device_id, "dev3902");
    }

    #[test]
    fn toml_overrides_single_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[lockin]
phase_offset_deg = 160.5

[safety]
shutdown_threshold_v = 2.5
"#
        )
        .unwrap();

        let config = CplConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.lockin.phase_offset_deg, 160.5);
        assert_eq!(config.safety.shutdown_threshold_v, 2.5);
        // Untouched fields keep their defaults
        assert_eq!(config.lockin.sampling_rate, 104.6);
        assert_eq!(config.modulator.model, "Hinds PEM controller 200 V01");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = CplConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_inverted_pmt_limits() {
        let mut config = CplConfig::default();
        config.lockin.pmt_low_limit_v = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_saturation_fraction_out_of_range() {
        let mut config = CplConfig::default();
        config.safety.saturation_fraction = 1.5;
        assert!(config.validate().is_err());
        config.safety.saturation_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_file_value_is_a_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lockin]\nsampling_rate = -5.0").unwrap();
        assert!(CplConfig::load_from(file.path()).is_err());
    }
}
