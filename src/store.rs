//! Persistence boundary.
//!
//! The scan controller hands finished spectra, corrected copies and averages to a
//! [`SpectrumStore`] under their output names, together with a [`ParameterRecord`] that
//! documents how they were measured. The same record type stores the last-used settings
//! that pre-populate the next session.
//!
//! File formats are outside this crate; [`MemoryStore`] keeps everything in memory for
//! tests and the demo binary.

use crate::correction::CorrectionTable;
use crate::error::{AppResult, DaqError};
use crate::processing::Spectrum;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Name of the record holding the last-used parameters.
pub const LAST_PARAMETERS: &str = "last";

/// Settings and instrument state of a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub timestamp: DateTime<Local>,
    pub start_nm: f64,
    pub end_nm: f64,
    pub step_nm: f64,
    pub dwell_time_s: f64,
    pub repetitions: u32,
    pub name: String,
    pub ac_blank: String,
    pub dc_blank: String,
    pub detector_correction: String,
    pub modulation_off: bool,
    pub comment: String,
    pub pmt_volt: f64,
    pub pmt_gain: f64,
    pub input_range_v: f64,
    pub phase_offset_deg: f64,
}

impl Default for ParameterRecord {
    fn default() -> Self {
        Self {
            timestamp: Local::now(),
            start_nm: 0.0,
            end_nm: 0.0,
            step_nm: 1.0,
            dwell_time_s: 0.5,
            repetitions: 1,
            name: String::new(),
            ac_blank: String::new(),
            dc_blank: String::new(),
            detector_correction: String::new(),
            modulation_off: false,
            comment: String::new(),
            pmt_volt: 0.0,
            pmt_gain: 0.0,
            input_range_v: 0.0,
            phase_offset_deg: 0.0,
        }
    }
}

impl ParameterRecord {
    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DaqError::InvalidState(format!("parameter record: {}", e)))
    }

    pub fn from_json(text: &str) -> AppResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| DaqError::InvalidState(format!("parameter record: {}", e)))
    }
}

#[async_trait]
pub trait SpectrumStore: Send + Sync {
    /// Whether an output with this name exists. An empty name counts as existing.
    async fn exists(&self, name: &str) -> AppResult<bool>;

    /// Whether a correction dataset with this name can be loaded.
    async fn correction_exists(&self, name: &str) -> AppResult<bool>;

    async fn save_spectrum(
        &self,
        name: &str,
        spectrum: &Spectrum,
        record: &ParameterRecord,
    ) -> AppResult<()>;

    async fn save_parameters(&self, name: &str, record: &ParameterRecord) -> AppResult<()>;

    async fn load_parameters(&self, name: &str) -> AppResult<Option<ParameterRecord>>;

    async fn load_correction(&self, name: &str) -> AppResult<CorrectionTable>;
}

/// A saved spectrum with its record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSpectrum {
    pub spectrum: Spectrum,
    pub record: ParameterRecord,
}

#[derive(Debug, Default)]
struct MemoryInner {
    spectra: HashMap<String, StoredSpectrum>,
    order: Vec<String>,
    parameters: HashMap<String, ParameterRecord>,
    corrections: HashMap<String, CorrectionTable>,
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_correction(&self, name: impl Into<String>, table: CorrectionTable) {
        self.inner
            .write()
            .await
            .corrections
            .insert(name.into(), table);
    }

    pub async fn spectrum(&self, name: &str) -> Option<StoredSpectrum> {
        self.inner.read().await.spectra.get(name).cloned()
    }

    /// Names in the order they were saved
    pub async fn saved_names(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }
}

#[async_trait]
impl SpectrumStore for MemoryStore {
    async fn exists(&self, name: &str) -> AppResult<bool> {
        Ok(name.is_empty() || self.inner.read().await.spectra.contains_key(name))
    }

    async fn correction_exists(&self, name: &str) -> AppResult<bool> {
        Ok(self.inner.read().await.corrections.contains_key(name))
    }

    async fn save_spectrum(
        &self,
        name: &str,
        spectrum: &Spectrum,
        record: &ParameterRecord,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let stored = StoredSpectrum {
            spectrum: spectrum.clone(),
            record: record.clone(),
        };
        if inner.spectra.insert(name.to_string(), stored).is_none() {
            inner.order.push(name.to_string());
        }
        tracing::info!("Saved spectrum '{}' ({} points)", name, spectrum.len());
        Ok(())
    }

    async fn save_parameters(&self, name: &str, record: &ParameterRecord) -> AppResult<()> {
        self.inner
            .write()
            .await
            .parameters
            .insert(name.to_string(), record.clone());
        Ok(())
    }

    async fn load_parameters(&self, name: &str) -> AppResult<Option<ParameterRecord>> {
        Ok(self.inner.read().await.parameters.get(name).cloned())
    }

    async fn load_correction(&self, name: &str) -> AppResult<CorrectionTable> {
        self.inner
            .read()
            .await
            .corrections
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::Precondition(format!("correction '{}' does not exist", name)))
    }
}
