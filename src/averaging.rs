//! Averaging across repetitions.
//!
//! Two views exist. [`RunningAverage`] is updated point by point while a repeated scan
//! runs and only tracks DC, AC and the glum derived from them, for live display.
//! [`average_spectra`] builds the final averaged spectrum once all repetitions are done,
//! with Gaussian propagation `σ_avg = sqrt(Σ (σ_i / n)²)`.

use crate::error::{AppResult, DaqError};
use crate::processing::{DataPoint, Spectrum, WAVELENGTH_EPSILON};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One wavelength of the running average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AverageEntry {
    pub wavelength: f64,
    pub dc: f64,
    pub ac: f64,
    /// Always `2 · ac / dc` of the averaged values
    pub glum: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningAverage {
    entries: Vec<AverageEntry>,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Fold an accepted point of repetition `repetition` (0-based) into the mean.
    ///
    /// Repetition 0 appends. Later repetitions update the entry with the same wavelength
    /// as `(old · rep + new) / (rep + 1)`; a wavelength unseen in repetition 0 is ignored.
    pub fn update(&mut self, point: &DataPoint, repetition: usize) -> Option<AverageEntry> {
        if repetition == 0 {
            let entry = AverageEntry {
                wavelength: point.wavelength,
                dc: point.dc,
                ac: point.ac,
                glum: 2.0 * point.ac / point.dc,
            };
            self.entries.push(entry);
            return Some(entry);
        }

        let entry = self
            .entries
            .iter_mut()
            .find(|e| (e.wavelength - point.wavelength).abs() < WAVELENGTH_EPSILON)?;
        let n = repetition as f64;
        entry.dc = (entry.dc * n + point.dc) / (n + 1.0);
        entry.ac = (entry.ac * n + point.ac) / (n + 1.0);
        entry.glum = 2.0 * entry.ac / entry.dc;
        Some(*entry)
    }

    pub fn entries(&self) -> &[AverageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pointwise average of complete repetitions.
///
/// Only wavelengths present in every spectrum are averaged. DC, AC and the three LP
/// quantities are averaged with propagated uncertainties; I_L, I_R and glum are
/// re-derived from the averaged DC and AC.
pub fn average_spectra(spectra: &[Spectrum]) -> AppResult<Spectrum> {
    let first = spectra
        .first()
        .ok_or_else(|| DaqError::EmptyDataset("no spectra to average".into()))?;
    info!("Averaging {} spectra...", spectra.len());
    let n = spectra.len() as f64;

    let mut averaged = Spectrum::new();
    for reference in first.iter() {
        let matching: Option<Vec<&DataPoint>> =
            spectra.iter().map(|s| s.find(reference.wavelength)).collect();
        let Some(points) = matching else {
            continue;
        };

        let mean = |f: fn(&DataPoint) -> f64| points.iter().map(|p| f(p) / n).sum::<f64>();
        let propagated =
            |f: fn(&DataPoint) -> f64| points.iter().map(|p| (f(p) / n).powi(2)).sum::<f64>().sqrt();

        let mut avg = DataPoint {
            wavelength: reference.wavelength,
            dc: mean(|p| p.dc),
            dc_std: propagated(|p| p.dc_std),
            ac: mean(|p| p.ac),
            ac_std: propagated(|p| p.ac_std),
            lp_r: mean(|p| p.lp_r),
            lp_r_std: propagated(|p| p.lp_r_std),
            lp_theta: mean(|p| p.lp_theta),
            lp_theta_std: propagated(|p| p.lp_theta_std),
            lp: mean(|p| p.lp),
            lp_std: propagated(|p| p.lp_std),
            ..DataPoint::default()
        };
        avg.recalc_cpl();
        averaged.push(avg);
    }

    if averaged.is_empty() {
        return Err(DaqError::EmptyDataset(
            "repetitions share no wavelength".into(),
        ));
    }
    Ok(averaged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(wavelength: f64, dc: f64, ac: f64) -> DataPoint {
        let mut p = DataPoint {
            wavelength,
            dc,
            ac,
            ..DataPoint::default()
        };
        p.recalc_cpl();
        p
    }

    #[test]
    fn running_average_is_idempotent_for_constant_input() {
        let mut avg = RunningAverage::new();
        for rep in 0..7 {
            avg.update(&point(500.0, 1.25, 0.0625), rep);
            avg.update(&point(501.0, 1.25, 0.0625), rep);
        }
        assert_eq!(avg.len(), 2);
        for e in avg.entries() {
            assert_eq!(e.dc, 1.25);
            assert_eq!(e.ac, 0.0625);
            assert_eq!(e.glum, 2.0 * 0.0625 / 1.25);
        }
    }

    #[test]
    fn running_average_incremental_mean() {
        let mut avg = RunningAverage::new();
        avg.update(&point(500.0, 1.0, 0.1), 0);
        avg.update(&point(500.0, 2.0, 0.2), 1);
        let e = avg.update(&point(500.0, 3.0, 0.3), 2).unwrap();
        assert!((e.dc - 2.0).abs() < 1e-12);
        assert!((e.ac - 0.2).abs() < 1e-12);
        assert!((e.glum - 0.2).abs() < 1e-12);

        assert!(avg.update(&point(499.0, 1.0, 0.1), 1).is_none());
        avg.reset();
        assert!(avg.is_empty());
    }

    #[test]
    fn two_repetitions_average() {
        let a = Spectrum::from_points(vec![point(500.0, 1.0, 0.0)]);
        let b = Spectrum::from_points(vec![point(500.0, 3.0, 0.0)]);
        let avg = average_spectra(&[a, b]).unwrap();
        let p = avg.points()[0];
        assert_eq!(p.dc, 2.0);
        assert_eq!(p.dc_std, 0.0);
        assert_eq!(p.glum, 0.0);
    }

    #[test]
    fn uncertainty_propagation() {
        let mut a = point(500.0, 1.0, 0.1);
        a.dc_std = 0.2;
        let mut b = point(500.0, 1.0, 0.1);
        b.dc_std = 0.2;
        let avg = average_spectra(&[Spectrum::from_points(vec![a]), Spectrum::from_points(vec![b])])
            .unwrap();
        // sqrt(2 · 0.1²)
        assert!((avg.points()[0].dc_std - 0.02f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn only_common_wavelengths_are_averaged() {
        let a = Spectrum::from_points(vec![point(500.0, 1.0, 0.1), point(501.0, 1.0, 0.1)]);
        let b = Spectrum::from_points(vec![point(500.0, 1.0, 0.1)]);
        let avg = average_spectra(&[a, b]).unwrap();
        assert_eq!(avg.wavelengths(), vec![500.0]);
        assert!(average_spectra(&[]).is_err());
    }
}
