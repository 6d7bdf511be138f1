//! Monochromator session.
//!
//! The grating drive acknowledges a command with a reply that contains `ok`; it has no
//! group tags. Moves are `{nm} GOTO`, the position query is `?NM`.

use crate::config::MonochromatorConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::LineTransport;
use crate::hardware::protocol::ok_exchange;
use tracing::{debug, error, info};

pub const DEVICE: &str = "MON";

pub struct Monochromator {
    transport: Box<dyn LineTransport>,
    config: MonochromatorConfig,
    initialized: bool,
}

impl Monochromator {
    pub fn new(transport: Box<dyn LineTransport>, config: MonochromatorConfig) -> Self {
        Self {
            transport,
            config,
            initialized: false,
        }
    }

    #[cfg(feature = "instrument_serial")]
    pub fn open_serial(config: MonochromatorConfig) -> AppResult<Self> {
        use crate::hardware::serial::SerialLineBuilder;

        let line = SerialLineBuilder::new(&config.port, config.baud_rate)
            .with_timeout(std::time::Duration::from_millis(config.timeout_ms))
            .with_write_terminator(config.write_terminator.clone())
            .with_read_terminator(config.read_terminator.clone())
            .open()
            .map_err(|e| DaqError::Instrument(format!("{}: {:#}", DEVICE, e)))?;
        Ok(Self::new(Box::new(line), config))
    }

    /// Single unverified exchange
    async fn raw(&mut self, command: &str) -> AppResult<String> {
        debug!(device = DEVICE, "<< {}", command);
        match self.transport.query(command).await {
            Ok(reply) => {
                debug!(device = DEVICE, ">> {}", reply);
                Ok(reply)
            }
            Err(e) => Err(DaqError::Communication {
                device: DEVICE.to_string(),
                query: command.to_string(),
                attempts: 1,
                reason: format!("{:#}", e),
            }),
        }
    }

    async fn goto(&mut self, nm: f64, command: String) -> AppResult<f64> {
        ok_exchange(
            self.transport.as_mut(),
            DEVICE,
            &command,
            &self.config.ok_marker,
            self.config.max_attempts,
        )
        .await?;
        Ok(nm)
    }

    /// Self-test: both identity queries asked twice must agree and match the configured
    /// model and serial, then a full round trip far and back near.
    pub async fn initialize(&mut self) -> AppResult<()> {
        self.initialized = false;
        match self.self_test().await {
            Ok(()) => {
                info!(device = DEVICE, port = %self.transport.describe(), "initialized");
                self.initialized = true;
                Ok(())
            }
            Err(e) => {
                error!(device = DEVICE, "Initialization error: {}", e);
                Err(e)
            }
        }
    }

    async fn self_test(&mut self) -> AppResult<()> {
        let model = self.raw("MODEL").await?;
        let serial = self.raw("SERIAL").await?;
        let model_again = self.raw("MODEL").await?;
        let serial_again = self.raw("SERIAL").await?;

        if model != model_again || serial != serial_again {
            return Err(DaqError::Instrument(format!(
                "{} identity is unstable: '{}'/'{}' vs '{}'/'{}'",
                DEVICE, model, serial, model_again, serial_again
            )));
        }
        if !model.contains(&self.config.model) || !serial.contains(&self.config.serial) {
            return Err(DaqError::Instrument(format!(
                "{} identifies as '{}' / '{}'",
                DEVICE, model, serial
            )));
        }

        let far = self.config.self_test_far_nm;
        let near = self.config.self_test_near_nm;
        self.goto(far, format!("{} GOTO", far)).await?;
        self.goto(near, format!("{} GOTO", near)).await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &MonochromatorConfig {
        &self.config
    }

    pub async fn model(&mut self) -> AppResult<String> {
        self.raw("MODEL").await
    }

    pub async fn serial(&mut self) -> AppResult<String> {
        self.raw("SERIAL").await
    }

    /// Move the grating and wait for the acknowledgement.
    pub async fn set_nm(&mut self, nm: f64) -> AppResult<f64> {
        if !self.initialized {
            return Err(DaqError::NotInitialized(DEVICE.to_string()));
        }
        self.goto(nm, format!("{:.2} GOTO", nm)).await
    }

    /// Current position, the first number of the `?NM` reply
    pub async fn wavelength(&mut self) -> AppResult<f64> {
        let reply = ok_exchange(
            self.transport.as_mut(),
            DEVICE,
            "?NM",
            &self.config.ok_marker,
            self.config.max_attempts,
        )
        .await?;
        reply
            .split_whitespace()
            .find_map(|token| token.parse::<f64>().ok())
            .ok_or_else(|| DaqError::Instrument(format!("no wavelength in reply '{}'", reply)))
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.initialized = false;
        self.transport
            .close()
            .await
            .map_err(|e| DaqError::Instrument(format!("{} close: {:#}", DEVICE, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMonochromator;

    fn session(mock: &MockMonochromator) -> Monochromator {
        Monochromator::new(Box::new(mock.clone()), MonochromatorConfig::default())
    }

    #[tokio::test]
    async fn self_test_round_trip() {
        let mock = MockMonochromator::new();
        let mut mono = session(&mock);
        mono.initialize().await.unwrap();
        assert!(mono.is_initialized());

        let sent = mock.commands().await;
        assert_eq!(
            sent,
            vec!["MODEL", "SERIAL", "MODEL", "SERIAL", "1000 GOTO", "0 GOTO"]
        );
        assert_eq!(mock.position().await, 0.0);
    }

    #[tokio::test]
    async fn goto_and_read_back() {
        let mock = MockMonochromator::new();
        let mut mono = session(&mock);
        mono.initialize().await.unwrap();
        mono.set_nm(632.8).await.unwrap();
        assert!((mono.wavelength().await.unwrap() - 632.8).abs() < 1e-9);
        assert!(mock.commands().await.contains(&"632.80 GOTO".to_string()));
    }

    #[tokio::test]
    async fn wrong_serial_fails_closed() {
        let mock = MockMonochromator::with_identity("SP-2-150i", "00000000");
        let mut mono = session(&mock);
        assert!(mono.initialize().await.is_err());
        assert!(!mono.is_initialized());
        assert!(matches!(
            mono.set_nm(500.0).await,
            Err(DaqError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn missing_ok_marker_is_retried() {
        let mock = MockMonochromator::new();
        let mut mono = session(&mock);
        mono.initialize().await.unwrap();
        mock.garble_next(2).await;
        assert!(mono.set_nm(450.0).await.is_ok());

        mock.fail_next(3).await;
        assert!(matches!(
            mono.set_nm(460.0).await,
            Err(DaqError::Communication { .. })
        ));
    }
}
