//! Photoelastic modulator controller session.
//!
//! Every command is answered with `[GROUP](VALUE)`; set commands echo the applied value.
//! Wavelength is not a native quantity of the controller: the retardation amplitude is
//! commanded as `nm * retardation` and read back the same way.
//!
//! | operation | command | group |
//! |---|---|---|
//! | output on/off | `:SYS:PEMO n` | `PEMOUT` |
//! | idle | `:SYS:IDLE n` | `PIDLE` |
//! | identity | `*IDN?` | `IDN` |
//! | stability | `:MOD:STABLE?` | `STABLE` |
//! | frequency | `:MOD:FREQ?` | `FREQUENCY` |
//! | amplitude | `:MOD:AMP?`, `:MOD:AMP x` | `AMP` |
//! | amplitude range | `:MOD:AMPR?` | `AMPR` |
//! | drive | `:MOD:DRV?`, `:MOD:DRV x` | `DRIVE` |
//! | current/phase error | `:SYS:CPE?` | `CPE` |
//! | voltage info | `:SYS:VC?` | `VC` |

use crate::config::ModulatorConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::LineTransport;
use crate::hardware::protocol::{exchange, Query, Reply};
use crate::processing::BesselCorrection;
use tracing::{error, info};

pub const DEVICE: &str = "PEM";

pub struct Modulator {
    transport: Box<dyn LineTransport>,
    config: ModulatorConfig,
    initialized: bool,
    identity: Option<String>,
}

impl Modulator {
    pub fn new(transport: Box<dyn LineTransport>, config: ModulatorConfig) -> Self {
        Self {
            transport,
            config,
            initialized: false,
            identity: None,
        }
    }

    /// Open the configured serial port.
    #[cfg(feature = "instrument_serial")]
    pub fn open_serial(config: ModulatorConfig) -> AppResult<Self> {
        use crate::hardware::serial::SerialLineBuilder;

        let line = SerialLineBuilder::new(&config.port, config.baud_rate)
            .with_timeout(std::time::Duration::from_millis(config.timeout_ms))
            .with_write_terminator(config.write_terminator.clone())
            .with_read_terminator(config.read_terminator.clone())
            .open()
            .map_err(|e| DaqError::Instrument(format!("{}: {:#}", DEVICE, e)))?;
        Ok(Self::new(Box::new(line), config))
    }

    async fn send(&mut self, query: Query) -> AppResult<Reply> {
        let query = query.with_attempts(self.config.max_attempts);
        exchange(self.transport.as_mut(), DEVICE, &query).await
    }

    fn ensure_initialized(&self) -> AppResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(DaqError::NotInitialized(DEVICE.to_string()))
        }
    }

    /// Self-test: the identity must equal the configured model and switching the output
    /// on must be echoed. Any failure leaves the session uninitialized.
    pub async fn initialize(&mut self) -> AppResult<()> {
        self.initialized = false;
        match self.self_test().await {
            Ok(identity) => {
                info!(device = DEVICE, port = %self.transport.describe(), "initialized: {}", identity);
                self.identity = Some(identity);
                self.initialized = true;
                Ok(())
            }
            Err(e) => {
                error!(device = DEVICE, "Initialization error: {}", e);
                Err(e)
            }
        }
    }

    async fn self_test(&mut self) -> AppResult<String> {
        let identity = self.id().await?;
        if identity != self.config.model {
            return Err(DaqError::Instrument(format!(
                "{} identifies as '{}', expected '{}'",
                DEVICE, identity, self.config.model
            )));
        }
        if !self.set_active(true).await? {
            return Err(DaqError::Instrument(format!(
                "{} did not switch its output on",
                DEVICE
            )));
        }
        Ok(identity)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn config(&self) -> &ModulatorConfig {
        &self.config
    }

    /// Switch the modulation output, returning the echoed state.
    pub async fn set_active(&mut self, active: bool) -> AppResult<bool> {
        let value = i64::from(active);
        let reply = self
            .send(Query::set_int(format!(":SYS:PEMO {}", value), "PEMOUT", value))
            .await?;
        Ok(reply.as_i64()? == 1)
    }

    pub async fn set_idle(&mut self, idle: bool) -> AppResult<bool> {
        let value = i64::from(idle);
        let reply = self
            .send(Query::set_int(format!(":SYS:IDLE {}", value), "PIDLE", value))
            .await?;
        Ok(reply.as_i64()? == 1)
    }

    pub async fn id(&mut self) -> AppResult<String> {
        Ok(self.send(Query::get("*IDN?", "IDN")).await?.value)
    }

    pub async fn stable(&mut self) -> AppResult<bool> {
        let reply = self.send(Query::get(":MOD:STABLE?", "STABLE")).await?;
        Ok(reply.as_i64()? == 1)
    }

    /// Modulation frequency in Hz
    pub async fn frequency(&mut self) -> AppResult<f64> {
        self.send(Query::get(":MOD:FREQ?", "FREQUENCY"))
            .await?
            .as_f64()
    }

    pub async fn amplitude(&mut self) -> AppResult<f64> {
        self.send(Query::get(":MOD:AMP?", "AMP")).await?.as_f64()
    }

    pub async fn set_amplitude(&mut self, amplitude: f64) -> AppResult<f64> {
        let query = Query::set_float(
            format!(":MOD:AMP {:.2}", amplitude),
            "AMP",
            amplitude,
            self.config.float_tolerance,
        );
        self.send(query).await?.as_f64()
    }

    /// Lower and upper amplitude limit
    pub async fn amplitude_range(&mut self) -> AppResult<(f64, f64)> {
        self.send(Query::get(":MOD:AMPR?", "AMPR"))
            .await?
            .as_pair()
    }

    pub async fn drive(&mut self) -> AppResult<f64> {
        self.send(Query::get(":MOD:DRV?", "DRIVE")).await?.as_f64()
    }

    pub async fn set_drive(&mut self, drive: f64) -> AppResult<f64> {
        let query = Query::set_float(
            format!(":MOD:DRV {:.2}", drive),
            "DRIVE",
            drive,
            self.config.float_tolerance,
        );
        self.send(query).await?.as_f64()
    }

    /// Current and phase error
    pub async fn cp_error(&mut self) -> AppResult<(f64, f64)> {
        self.send(Query::get(":SYS:CPE?", "CPE")).await?.as_pair()
    }

    pub async fn voltage_info(&mut self) -> AppResult<String> {
        Ok(self.send(Query::get(":SYS:VC?", "VC")).await?.value)
    }

    /// Tune the retardation to `nm`; returns the wavelength the controller confirmed.
    pub async fn set_nm(&mut self, nm: f64) -> AppResult<f64> {
        self.ensure_initialized()?;
        let amplitude = self.set_amplitude(nm * self.config.retardation).await?;
        Ok(amplitude / self.config.retardation)
    }

    pub async fn wavelength(&mut self) -> AppResult<f64> {
        self.ensure_initialized()?;
        Ok(self.amplitude().await? / self.config.retardation)
    }

    pub fn bessel_correction(&self) -> BesselCorrection {
        BesselCorrection::from_retardation(self.config.retardation)
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.initialized = false;
        self.transport
            .close()
            .await
            .map_err(|e| DaqError::Instrument(format!("{} close: {:#}", DEVICE, e)))
    }
}
