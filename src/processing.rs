//! Signal Processor
//!
//! Converts an [`AlignedFrame`] of raw demodulator samples into one [`DataPoint`].
//!
//! Per sample and channel the amplitude `R = sqrt(x² + y²)` and phase `θ = atan2(y, x)`
//! are computed. The lock-in phase is calibrated so that signals sit at ±90°, hence the
//! sign of `θ` carries the sign of the physical quantity:
//!
//! | channel | signed value |
//! |---|---|
//! | AC (1f) | `R · sgn(θ) · √2 · fundamental` |
//! | DC (0 Hz) | `R · sgn(θ) / √2` |
//! | LP (2f) | `R · sgn(θ) · √2 · second_harmonic` |
//!
//! `√2` converts RMS to peak; the Bessel factors undo the demodulation efficiency of the
//! photoelastic modulator. Derived per sample: `glum = 2·AC/DC`, `I_L = AC + DC`,
//! `I_R = DC − AC`. The point stores mean and population standard deviation of each.

use crate::acquisition::{AlignedFrame, ChannelSample};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};

/// Two wavelengths closer than this are the same spectral key.
pub const WAVELENGTH_EPSILON: f64 = 1e-6;

// =============================================================================
// Bessel corrections
// =============================================================================

/// Bessel function of the first kind `J_n(x)` by its power series.
///
/// Accurate to double precision for the small arguments of a modulator
/// (`2π · retardation`, around 1.6).
pub fn bessel_j(order: u32, x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    for k in 1..=order {
        term *= half / k as f64;
    }

    let mut sum = term;
    let n = order as f64;
    let q = -half * half;
    for k in 1..100 {
        let k = k as f64;
        term *= q / (k * (k + n));
        sum += term;
        if term.abs() <= f64::EPSILON * sum.abs() {
            break;
        }
    }
    sum
}

/// Demodulation efficiency corrections for a modulator with retardation `r` waves.
///
/// `fundamental = 1 / (2 J1(2πr))`, `second_harmonic = 1 / (2 J2(2πr))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BesselCorrection {
    pub fundamental: f64,
    pub second_harmonic: f64,
}

impl BesselCorrection {
    pub fn from_retardation(retardation: f64) -> Self {
        let amplitude = 2.0 * PI * retardation;
        Self {
            fundamental: 1.0 / (2.0 * bessel_j(1, amplitude)),
            second_harmonic: 1.0 / (2.0 * bessel_j(2, amplitude)),
        }
    }
}

// =============================================================================
// Data model
// =============================================================================

/// One spectral sample: wavelength plus 16 derived scalars.
///
/// Field names serialize to the column names of the spectrum tables.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(rename = "WL")]
    pub wavelength: f64,
    #[serde(rename = "DC")]
    pub dc: f64,
    #[serde(rename = "DC_std")]
    pub dc_std: f64,
    #[serde(rename = "AC")]
    pub ac: f64,
    #[serde(rename = "AC_std")]
    pub ac_std: f64,
    #[serde(rename = "I_L")]
    pub i_l: f64,
    #[serde(rename = "I_L_std")]
    pub i_l_std: f64,
    #[serde(rename = "I_R")]
    pub i_r: f64,
    #[serde(rename = "I_R_std")]
    pub i_r_std: f64,
    pub glum: f64,
    pub glum_std: f64,
    pub lp_r: f64,
    pub lp_r_std: f64,
    /// Mean LP phase in radians
    pub lp_theta: f64,
    pub lp_theta_std: f64,
    pub lp: f64,
    pub lp_std: f64,
}

impl DataPoint {
    /// Re-derive I_L, I_R, glum and their uncertainties from DC and AC.
    ///
    /// First-order Gaussian propagation:
    /// `σ_IL = σ_IR = sqrt(σ_AC² + σ_DC²)`,
    /// `σ_g = sqrt((2σ_AC/DC)² + (2·AC/DC² · σ_DC)²)`.
    pub fn recalc_cpl(&mut self) {
        self.i_l = self.ac + self.dc;
        self.i_r = self.dc - self.ac;
        self.glum = 2.0 * self.ac / self.dc;
        self.i_l_std = self.ac_std.hypot(self.dc_std);
        self.i_r_std = self.i_l_std;
        self.glum_std = (2.0 * self.ac_std / self.dc)
            .hypot(2.0 * self.ac / (self.dc * self.dc) * self.dc_std);
    }

    /// Whether any of the 17 columns is NaN
    pub fn has_nan(&self) -> bool {
        [
            self.wavelength,
            self.dc,
            self.dc_std,
            self.ac,
            self.ac_std,
            self.i_l,
            self.i_l_std,
            self.i_r,
            self.i_r_std,
            self.glum,
            self.glum_std,
            self.lp_r,
            self.lp_r_std,
            self.lp_theta,
            self.lp_theta_std,
            self.lp,
            self.lp_std,
        ]
        .iter()
        .any(|v| v.is_nan())
    }
}

/// Ordered sequence of data points, unique wavelengths within one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    points: Vec<DataPoint>,
}

impl Spectrum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: Vec<DataPoint>) -> Self {
        Self { points }
    }

    pub fn push(&mut self, point: DataPoint) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut [DataPoint] {
        &mut self.points
    }

    pub fn into_points(self) -> Vec<DataPoint> {
        self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataPoint> {
        self.points.iter()
    }

    pub fn wavelengths(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.wavelength).collect()
    }

    /// Point at `wavelength` (within [`WAVELENGTH_EPSILON`])
    pub fn find(&self, wavelength: f64) -> Option<&DataPoint> {
        self.points
            .iter()
            .find(|p| (p.wavelength - wavelength).abs() < WAVELENGTH_EPSILON)
    }

    /// `(min, max)` of the measured wavelengths
    pub fn span(&self) -> Option<(f64, f64)> {
        let first = self.points.first()?.wavelength;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (lo.min(p.wavelength), hi.max(p.wavelength))
        }))
    }

    /// Drop points with NaN in any column, returning how many were removed.
    pub fn drop_nan(&mut self) -> usize {
        let before = self.points.len();
        self.points.retain(|p| !p.has_nan());
        before - self.points.len()
    }
}

// =============================================================================
// Processing
// =============================================================================

/// Sign of a phase, 0 for NaN and for exactly zero.
pub fn sgn(theta: f64) -> f64 {
    if theta.is_nan() || theta == 0.0 {
        0.0
    } else {
        theta.signum()
    }
}

fn polar(sample: &ChannelSample) -> (f64, f64) {
    (sample.x.hypot(sample.y), sample.y.atan2(sample.x))
}

/// Mean and population standard deviation; NaN for an empty slice.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Turn one aligned frame into a data point at `wavelength`.
///
/// Sample indices where any channel is NaN are dropped first. If nothing survives the
/// result is [`DaqError::EmptyDataset`], which the scan controller retries.
pub fn process_frame(
    frame: &AlignedFrame,
    bessel: &BesselCorrection,
    wavelength: f64,
) -> AppResult<DataPoint> {
    let clean = frame.without_nan();
    if clean.is_empty() {
        return Err(DaqError::EmptyDataset(if frame.is_empty() {
            format!("no aligned samples at {:.2} nm", wavelength)
        } else {
            format!("all samples NaN at {:.2} nm", wavelength)
        }));
    }

    let n = clean.len();
    let mut dc = Vec::with_capacity(n);
    let mut ac = Vec::with_capacity(n);
    let mut i_l = Vec::with_capacity(n);
    let mut i_r = Vec::with_capacity(n);
    let mut glum = Vec::with_capacity(n);
    let mut lp_r = Vec::with_capacity(n);
    let mut lp_theta = Vec::with_capacity(n);
    let mut lp = Vec::with_capacity(n);

    for ((ac_s, dc_s), lp_s) in clean.ac().iter().zip(clean.dc()).zip(clean.lp()) {
        let (ac_raw, ac_t) = polar(ac_s);
        let (dc_raw, dc_t) = polar(dc_s);
        let (lp_raw, lp_t) = polar(lp_s);

        let ac_v = ac_raw * sgn(ac_t) * SQRT_2 * bessel.fundamental;
        let dc_v = dc_raw * sgn(dc_t) / SQRT_2;

        ac.push(ac_v);
        dc.push(dc_v);
        glum.push(2.0 * ac_v / dc_v);
        i_l.push(ac_v + dc_v);
        i_r.push(dc_v - ac_v);
        lp.push(lp_raw * sgn(lp_t) * SQRT_2 * bessel.second_harmonic);
        lp_r.push(lp_raw * SQRT_2 * bessel.second_harmonic);
        lp_theta.push(lp_t);
    }

    let (dc, dc_std) = mean_std(&dc);
    let (ac, ac_std) = mean_std(&ac);
    let (i_l, i_l_std) = mean_std(&i_l);
    let (i_r, i_r_std) = mean_std(&i_r);
    let (glum, glum_std) = mean_std(&glum);
    let (lp_r, lp_r_std) = mean_std(&lp_r);
    let (lp_theta, lp_theta_std) = mean_std(&lp_theta);
    let (lp, lp_std) = mean_std(&lp);

    Ok(DataPoint {
        wavelength,
        dc,
        dc_std,
        ac,
        ac_std,
        i_l,
        i_l_std,
        i_r,
        i_r_std,
        glum,
        glum_std,
        lp_r,
        lp_r_std,
        lp_theta,
        lp_theta_std,
        lp,
        lp_std,
    })
}
