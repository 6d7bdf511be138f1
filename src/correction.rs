//! Correction Pipeline
//!
//! Applies up to three optional corrections to a finished spectrum, in this order:
//!
//! 1. **Detector sensitivity**: the first value column of the curve, linearly
//!    interpolated onto the measured wavelengths. DC, AC and their deviations are divided
//!    by it.
//! 2. **AC blank**: `AC - AC_blank`, `σ = sqrt((σ_AC/2)² + (σ_blank/2)²)`.
//! 3. **DC blank**: same for DC.
//!
//! Every dataset must span the measured wavelength range; otherwise that correction is
//! skipped with a warning and the rest of the pipeline still runs. Blanks are matched by
//! exact wavelength key. A measured wavelength without a blank row becomes undefined and
//! is dropped from the output. I_L, I_R and glum are re-derived at the end.

use crate::error::{AppResult, DaqError};
use crate::processing::{DataPoint, Spectrum, WAVELENGTH_EPSILON};
use std::path::Path;
use tracing::{info, warn};

/// Wavelength-keyed table of named value columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionTable {
    wavelengths: Vec<f64>,
    columns: Vec<(String, Vec<f64>)>,
}

impl CorrectionTable {
    /// Build a table, rows sorted by wavelength.
    pub fn new(wavelengths: Vec<f64>, columns: Vec<(String, Vec<f64>)>) -> AppResult<Self> {
        if wavelengths.is_empty() {
            return Err(DaqError::EmptyDataset("correction table has no rows".into()));
        }
        if let Some((name, _)) = columns.iter().find(|(_, v)| v.len() != wavelengths.len()) {
            return Err(DaqError::InvalidState(format!(
                "column '{}' does not match the {} wavelength rows",
                name,
                wavelengths.len()
            )));
        }

        let mut order: Vec<usize> = (0..wavelengths.len()).collect();
        order.sort_by(|&a, &b| wavelengths[a].total_cmp(&wavelengths[b]));
        let reorder = |v: &[f64]| order.iter().map(|&i| v[i]).collect::<Vec<_>>();

        Ok(Self {
            wavelengths: reorder(&wavelengths),
            columns: columns
                .iter()
                .map(|(name, values)| (name.clone(), reorder(values)))
                .collect(),
        })
    }

    /// DC, DC_std, AC and AC_std of a measured spectrum, to be used as a blank.
    pub fn from_spectrum(spectrum: &Spectrum) -> AppResult<Self> {
        let column = |name: &str, f: fn(&DataPoint) -> f64| {
            (name.to_string(), spectrum.iter().map(f).collect::<Vec<_>>())
        };
        Self::new(
            spectrum.wavelengths(),
            vec![
                column("DC", |p| p.dc),
                column("DC_std", |p| p.dc_std),
                column("AC", |p| p.ac),
                column("AC_std", |p| p.ac_std),
            ],
        )
    }

    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn first_column(&self) -> Option<(&str, &[f64])> {
        self.columns
            .first()
            .map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn span(&self) -> (f64, f64) {
        // Non-empty and sorted by construction
        (self.wavelengths[0], self.wavelengths[self.wavelengths.len() - 1])
    }

    /// Row index of exactly `wavelength`
    pub fn row(&self, wavelength: f64) -> Option<usize> {
        self.wavelengths
            .iter()
            .position(|w| (w - wavelength).abs() < WAVELENGTH_EPSILON)
    }
}

/// The corrections configured for a scan; `None` entries are skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionSet {
    pub detector: Option<CorrectionTable>,
    pub ac_blank: Option<CorrectionTable>,
    pub dc_blank: Option<CorrectionTable>,
}

impl CorrectionSet {
    pub fn is_empty(&self) -> bool {
        self.detector.is_none() && self.ac_blank.is_none() && self.dc_blank.is_none()
    }
}

/// What the pipeline did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub dropped_rows: usize,
}

/// Err([`DaqError::Coverage`]) unless `table` spans `measured`.
pub fn check_coverage(name: &str, table: &CorrectionTable, measured: (f64, f64)) -> AppResult<()> {
    let (lo, hi) = table.span();
    if measured.0 >= lo - WAVELENGTH_EPSILON && measured.1 <= hi + WAVELENGTH_EPSILON {
        Ok(())
    } else {
        Err(DaqError::Coverage(format!(
            "{} covers {}-{} nm, measured {}-{} nm",
            name, lo, hi, measured.0, measured.1
        )))
    }
}

/// Linear interpolation on ascending `xs`, `x` within `[xs[0], xs[n-1]]`.
pub fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let upper = xs.partition_point(|v| *v < x);
    if upper == 0 {
        return ys[0];
    }
    if upper >= xs.len() {
        return ys[xs.len() - 1];
    }
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    if (x1 - x0).abs() < f64::EPSILON {
        return y1;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

fn apply_detector(points: &mut [DataPoint], table: &CorrectionTable) -> AppResult<()> {
    let (_, sensitivity) = table
        .first_column()
        .ok_or_else(|| DaqError::Coverage("detector curve has no value column".into()))?;
    for p in points.iter_mut() {
        let s = interpolate(table.wavelengths(), sensitivity, p.wavelength);
        p.dc /= s;
        p.dc_std /= s;
        p.ac /= s;
        p.ac_std /= s;
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum BlankChannel {
    Ac,
    Dc,
}

impl BlankChannel {
    fn columns(self) -> (&'static str, &'static str) {
        match self {
            BlankChannel::Ac => ("AC", "AC_std"),
            BlankChannel::Dc => ("DC", "DC_std"),
        }
    }

    fn fields(self, p: &mut DataPoint) -> (&mut f64, &mut f64) {
        match self {
            BlankChannel::Ac => (&mut p.ac, &mut p.ac_std),
            BlankChannel::Dc => (&mut p.dc, &mut p.dc_std),
        }
    }
}

fn apply_blank(
    points: &mut [DataPoint],
    table: &CorrectionTable,
    channel: BlankChannel,
) -> AppResult<()> {
    let (value_name, std_name) = channel.columns();
    let missing = |c: &str| DaqError::Coverage(format!("blank has no '{}' column", c));
    let values = table.column(value_name).ok_or_else(|| missing(value_name))?;
    let stds = table.column(std_name).ok_or_else(|| missing(std_name))?;

    for p in points.iter_mut() {
        let row = table.row(p.wavelength);
        let (value, std) = channel.fields(p);
        match row {
            Some(i) => {
                *value -= values[i];
                *std = (*std / 2.0).hypot(stds[i] / 2.0);
            }
            None => {
                *value = f64::NAN;
                *std = f64::NAN;
            }
        }
    }
    Ok(())
}

/// Run the pipeline over `spectrum`, returning the corrected copy.
pub fn apply_corrections(
    spectrum: &Spectrum,
    corrections: &CorrectionSet,
) -> (Spectrum, CorrectionReport) {
    let mut report = CorrectionReport::default();
    let mut points = spectrum.points().to_vec();
    let Some(measured) = spectrum.span() else {
        return (Spectrum::new(), report);
    };
    info!("Baseline correction...");

    let steps: [(&str, Option<&CorrectionTable>); 3] = [
        ("detector", corrections.detector.as_ref()),
        ("AC blank", corrections.ac_blank.as_ref()),
        ("DC blank", corrections.dc_blank.as_ref()),
    ];
    for (name, table) in steps {
        let Some(table) = table else {
            continue;
        };
        let result = check_coverage(name, table, measured).and_then(|()| match name {
            "detector" => apply_detector(&mut points, table),
            "AC blank" => apply_blank(&mut points, table, BlankChannel::Ac),
            _ => apply_blank(&mut points, table, BlankChannel::Dc),
        });
        match result {
            Ok(()) => {
                info!("{} correction applied", name);
                report.applied.push(name.to_string());
            }
            Err(e) => {
                warn!("Error: {} correction skipped: {}", name, e);
                report.skipped.push(name.to_string());
            }
        }
    }

    for p in points.iter_mut() {
        p.recalc_cpl();
    }
    let mut corrected = Spectrum::from_points(points);
    report.dropped_rows = corrected.drop_nan();
    if report.dropped_rows > 0 {
        warn!(
            "{} rows without blank values dropped from the corrected spectrum",
            report.dropped_rows
        );
    }
    (corrected, report)
}

/// Read a correction table: header row, wavelength in the first column.
#[cfg(feature = "storage_csv")]
pub fn read_table_csv(path: &Path) -> AppResult<CorrectionTable> {
    let invalid = |e: csv::Error| {
        DaqError::Instrument(format!("correction file '{}': {}", path.display(), e))
    };
    let mut reader = csv::Reader::from_path(path).map_err(invalid)?;
    let headers = reader.headers().map_err(invalid)?.clone();
    if headers.len() < 2 {
        return Err(DaqError::Coverage(format!(
            "correction file '{}' needs a wavelength and at least one value column",
            path.display()
        )));
    }

    let mut wavelengths = Vec::new();
    let mut columns: Vec<(String, Vec<f64>)> = headers
        .iter()
        .skip(1)
        .map(|h| (h.trim().to_string(), Vec::new()))
        .collect();

    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(invalid)?;
        let parse = |i: usize| -> AppResult<f64> {
            let field = record.get(i).unwrap_or("").trim();
            field.parse::<f64>().map_err(|_| {
                DaqError::Instrument(format!(
                    "correction file '{}' row {}: '{}' is not a number",
                    path.display(),
                    line + 2,
                    field
                ))
            })
        };
        wavelengths.push(parse(0)?);
        for (i, (_, values)) in columns.iter_mut().enumerate() {
            values.push(parse(i + 1)?);
        }
    }
    CorrectionTable::new(wavelengths, std::mem::take(&mut columns))
}

#[cfg(not(feature = "storage_csv"))]
pub fn read_table_csv(_path: &Path) -> AppResult<CorrectionTable> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}
