//! End-to-end scans against the simulated instruments.

use cpl_daq::config::CplConfig;
use cpl_daq::correction::CorrectionTable;
use cpl_daq::hardware::mock::MockRig;
use cpl_daq::instruments::Instruments;
use cpl_daq::processing::Spectrum;
use cpl_daq::scan::{ScanController, ScanEvent, ScanParameters, ScanState};
use cpl_daq::store::{MemoryStore, ParameterRecord, SpectrumStore};
use cpl_daq::DaqError;
use std::sync::Arc;
use std::time::Duration;

struct Setup {
    rig: MockRig,
    instruments: Arc<Instruments>,
    store: Arc<MemoryStore>,
    scan: Arc<ScanController>,
}

async fn setup() -> Setup {
    let rig = MockRig::new();
    let instruments = Arc::new(rig.instruments(Arc::new(CplConfig::default())));
    instruments.initialize().await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let scan = Arc::new(ScanController::new(instruments.clone(), store.clone()));
    Setup {
        rig,
        instruments,
        store,
        scan,
    }
}

fn flat_detector(from: f64, to: f64) -> CorrectionTable {
    CorrectionTable::new(
        vec![from, to],
        vec![("sensitivity".to_string(), vec![1.0, 1.0])],
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn two_point_descending_scan() {
    let s = setup().await;
    let mut events = s.scan.subscribe();

    let params = ScanParameters::new(800.0, 799.0, 1.0, 0.1, "sample");
    let outcome = s.scan.run(params).await.unwrap();

    assert!(!outcome.aborted);
    assert_eq!(outcome.spectra.len(), 1);
    let spectrum = &outcome.spectra[0];
    assert_eq!(spectrum.wavelengths(), vec![800.0, 799.0]);
    for p in spectrum.iter() {
        assert!(p.dc > 0.0);
        assert!(p.glum.is_finite());
    }
    assert!(outcome.average.is_none());

    assert_eq!(s.store.saved_names().await, vec!["sample"]);
    let saved = s.store.spectrum("sample").await.unwrap();
    assert_eq!(saved.record.start_nm, 800.0);
    assert!((saved.record.phase_offset_deg - 158.056).abs() < 1e-9);

    // Back at the start wavelength with modulation on
    assert_eq!(s.rig.monochromator.position().await, 800.0);
    assert!(s.rig.modulator.is_active().await);
    assert_eq!(s.scan.state(), ScanState::Idle);

    let mut points = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ScanEvent::Point { point, .. } = event {
            points.push(point.wavelength);
        }
    }
    assert_eq!(points, vec![800.0, 799.0]);
}

#[tokio::test(start_paused = true)]
async fn persistent_point_failure_aborts_and_safes_the_pmt() {
    let s = setup().await;
    s.instruments.set_pmt_voltage(0.8, false).await.unwrap();
    s.rig.lockin.fail_acquisitions_from(2).await;

    let params = ScanParameters::new(800.0, 799.0, 1.0, 0.1, "failing");
    let outcome = s.scan.run(params).await.unwrap();

    assert!(outcome.aborted);
    assert!(outcome.abort_reason.is_some());
    assert_eq!(outcome.spectra[0].len(), 1);
    assert_eq!(outcome.spectra[0].wavelengths(), vec![800.0]);
    assert_eq!(s.rig.lockin.setting("auxouts/0/offset").await, Some(0.0));
    assert_eq!(s.rig.monochromator.position().await, 800.0);

    // The partial spectrum is still handed to the store
    assert_eq!(s.store.spectrum("failing").await.unwrap().spectrum.len(), 1);
    assert_eq!(s.scan.state(), ScanState::Idle);
    assert!(!s.scan.abort_signal().is_requested());
}

#[tokio::test(start_paused = true)]
async fn preconditions_reject_before_touching_instruments() {
    let s = setup().await;
    s.store
        .save_spectrum("taken", &Spectrum::new(), &ParameterRecord::default())
        .await
        .unwrap();
    s.store
        .save_spectrum("series_1", &Spectrum::new(), &ParameterRecord::default())
        .await
        .unwrap();
    s.rig.monochromator.clear_commands().await;

    let illegal = ScanParameters::new(500.0, 490.0, 1.0, 0.1, "bad:name");
    let existing = ScanParameters::new(500.0, 490.0, 1.0, 0.1, "taken");
    let existing_series = ScanParameters::new(500.0, 490.0, 1.0, 0.1, "series").with_repetitions(2);
    let empty = ScanParameters::new(500.0, 490.0, 1.0, 0.1, "");
    let mut missing_blank = ScanParameters::new(500.0, 490.0, 1.0, 0.1, "fresh");
    missing_blank.ac_blank = "no_such_blank".to_string();

    for params in [illegal, existing, existing_series, empty, missing_blank] {
        let result = s.scan.start(params).await;
        assert!(
            matches!(result, Err(DaqError::Precondition(_))),
            "unexpected {result:?}"
        );
        assert_eq!(s.scan.state(), ScanState::Idle);
    }
    assert!(s.rig.monochromator.commands().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_start_while_running_is_rejected() {
    let s = setup().await;
    s.scan
        .start(ScanParameters::new(500.0, 490.0, 1.0, 0.1, "first"))
        .await
        .unwrap();
    assert!(matches!(
        s.scan
            .start(ScanParameters::new(500.0, 490.0, 1.0, 0.1, "second"))
            .await,
        Err(DaqError::InvalidState(_))
    ));
    let outcome = s.scan.wait().await.unwrap();
    assert_eq!(outcome.spectra[0].len(), 11);
}

#[tokio::test(start_paused = true)]
async fn repetitions_are_saved_and_averaged() {
    let s = setup().await;
    s.store
        .insert_correction("detector", flat_detector(400.0, 900.0))
        .await;
    let mut average_rx = s.scan.average_watch();

    let mut params = ScanParameters::new(500.0, 498.0, 1.0, 0.1, "rep").with_repetitions(2);
    params.detector_correction = "detector".to_string();
    let outcome = s.scan.run(params).await.unwrap();

    assert!(!outcome.aborted);
    assert_eq!(outcome.spectra.len(), 2);
    assert_eq!(outcome.corrected.len(), 2);
    let average = outcome.average.unwrap();
    assert_eq!(average.wavelengths(), vec![500.0, 499.0, 498.0]);
    assert!(outcome.average_corrected.is_some());

    assert_eq!(
        s.store.saved_names().await,
        vec![
            "rep_1",
            "rep_1_corr",
            "rep_2",
            "rep_2_corr",
            "rep_avg",
            "rep_avg_corr"
        ]
    );

    // The live average covers every wavelength, glum from the averaged values
    let live = average_rx.borrow_and_update().clone();
    assert_eq!(live.len(), 3);
    for entry in &live {
        assert!((entry.glum - 2.0 * entry.ac / entry.dc).abs() < 1e-12);
    }
}

#[tokio::test(start_paused = true)]
async fn modulation_off_scan_leaves_the_modulator_alone() {
    let s = setup().await;
    let mut params = ScanParameters::new(500.0, 499.0, 1.0, 0.1, "background");
    params.modulation_off = true;
    let outcome = s.scan.run(params).await.unwrap();

    assert_eq!(outcome.spectra[0].len(), 2);
    let commands = s.rig.modulator.commands().await;
    assert!(commands.iter().any(|c| c == ":SYS:PEMO 0"));
    assert!(!commands.iter().any(|c| c == ":MOD:AMP 124.75"));

    // Modulation restored and the modulator sent back to the start wavelength
    assert!(s.rig.modulator.is_active().await);
    assert!((s.rig.modulator.amplitude().await - 125.0).abs() < 1e-9);
    assert_eq!(s.rig.lockin.setting("extrefs/0/enable").await, Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn user_abort_stops_early_and_returns_to_start() {
    let s = setup().await;
    s.scan
        .start(ScanParameters::new(500.0, 400.0, 1.0, 0.1, "long"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    s.scan.abort("user request");

    let outcome = s.scan.wait().await.unwrap();
    assert!(outcome.aborted);
    assert_eq!(outcome.abort_reason.as_deref(), Some("user request"));
    let points = outcome.spectra[0].len();
    assert!(points > 0 && points < 101, "{points} points");
    assert_eq!(s.rig.monochromator.position().await, 500.0);
    assert_eq!(s.rig.lockin.setting("auxouts/0/offset").await, Some(0.0));
    assert_eq!(s.scan.state(), ScanState::Idle);
}

#[tokio::test(start_paused = true)]
async fn progress_reaches_the_end_of_the_last_run() {
    let s = setup().await;
    let progress = s.scan.progress_watch();
    s.scan
        .run(ScanParameters::new(600.0, 604.0, 2.0, 0.1, "progress").with_repetitions(2))
        .await
        .unwrap();
    let last = *progress.borrow();
    assert_eq!(last.run, 2);
    assert_eq!(last.runs, 2);
    assert!((last.percent - 100.0).abs() < 1e-9);
    assert_eq!(last.remaining_s, 0.0);
}

#[tokio::test(start_paused = true)]
async fn stale_abort_does_not_stop_the_next_scan() {
    let s = setup().await;
    s.scan.abort("pressed while idle");
    // The shared signal may also be left set by another owner
    s.scan.abort_signal().request("left over");

    let outcome = s
        .scan
        .run(ScanParameters::new(800.0, 799.0, 1.0, 0.1, "after_abort"))
        .await
        .unwrap();
    assert!(!outcome.aborted);
    assert_eq!(outcome.abort_reason, None);
    assert_eq!(outcome.spectra[0].wavelengths(), vec![800.0, 799.0]);
}

#[tokio::test(start_paused = true)]
async fn failed_pmt_zeroing_is_reported() {
    let s = setup().await;
    s.instruments.set_pmt_voltage(0.8, false).await.unwrap();
    let mut events = s.scan.subscribe();
    s.scan
        .start(ScanParameters::new(500.0, 400.0, 1.0, 0.1, "stuck_hv"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    s.rig.lockin.fail_settings(true).await;
    s.scan.abort("user request");

    let outcome = s.scan.wait().await.unwrap();
    assert!(outcome.aborted);
    assert!(outcome.pmt_zero_error.is_some());
    assert_eq!(s.rig.lockin.setting("auxouts/0/offset").await, Some(0.8));

    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ScanEvent::PmtNotZeroed { .. }) {
            reported = true;
        }
    }
    assert!(reported);
    assert_eq!(s.scan.state(), ScanState::Idle);
}

#[tokio::test(start_paused = true)]
async fn successful_abort_leaves_no_pmt_error() {
    let s = setup().await;
    s.instruments.set_pmt_voltage(0.8, false).await.unwrap();
    s.rig.lockin.fail_acquisitions_from(2).await;

    let outcome = s
        .scan
        .run(ScanParameters::new(800.0, 799.0, 1.0, 0.1, "safe_hv"))
        .await
        .unwrap();
    assert!(outcome.aborted);
    assert_eq!(outcome.pmt_zero_error, None);
}
