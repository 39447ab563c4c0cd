use kid_readout::acquire::{sweep_offsets, HeaterSweepAndStream};
use kid_readout::analysis::analyze_directory;
use kid_readout::config::Settings;
use kid_readout::instrument::SimulatedDcSource;
use kid_readout::measurement::{Node, State};
use kid_readout::readout::{Readout, SimulatedReadout};
use kid_readout::storage::{write_records_csv, StoredDirectory, TemperatureLog};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

fn procedure(settings: &Settings, data_dir: &Path) -> HeaterSweepAndStream {
    HeaterSweepAndStream {
        initial_f0s_mhz: vec![100.0, 110.0],
        tones_at_once: 2,
        lo_mhz: None,
        fft_gain: 6,
        num_tone_samples: 1 << 16,
        offsets_mhz: sweep_offsets(-0.1, 0.1, 512.0 / (1 << 17) as f64).unwrap(),
        heater_voltages: vec![0.0],
        dac_attenuations: vec![10.0],
        settle: Duration::from_secs(0),
        stream_seconds: 2.5,
        max_f0_shift_hz: settings.analysis.max_f0_shift_hz,
        min_tone_spacing_mhz: settings.analysis.min_tone_spacing_mhz,
        data_dir: data_dir.to_path_buf(),
        cryostat: settings.cryostat.name.clone(),
    }
}

fn write_temperature_log(dir: &Path, around: f64) {
    let mut file = std::fs::File::create(dir.join("thermometry.csv")).unwrap();
    writeln!(file, "epoch,package,still").unwrap();
    writeln!(file, "{},0.100,0.80", around - 3600.0).unwrap();
    writeln!(file, "{},0.100,0.80", around + 3600.0).unwrap();
}

#[tokio::test]
async fn test_sweep_stream_then_analyze() {
    let settings = Settings::default();
    let data = tempfile::tempdir().unwrap();
    let mut readout = SimulatedReadout::new(&settings.readout);
    let mut heater = SimulatedDcSource::default();

    let paths = procedure(&settings, data.path())
        .run(&mut readout, &mut heater, &State::new().with("cryostat", "test"))
        .await
        .unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(heater.volts, 0.0);

    let stored = StoredDirectory::open(&paths[0]).unwrap();
    let nodes = stored.read_all().unwrap();
    assert_eq!(nodes.len(), 1);
    let Node::SweepStreamArray(array) = &nodes[0] else {
        panic!("expected a sweep stream array, got {}", nodes[0].kind());
    };
    let epoch = array.stream_array.epoch;

    let thermometry = tempfile::tempdir().unwrap();
    write_temperature_log(thermometry.path(), epoch);
    let temperatures = TemperatureLog::load_dir(thermometry.path()).unwrap();
    assert_eq!(temperatures.thermometers().collect::<Vec<_>>(), vec!["package", "still"]);

    let analysis = analyze_directory(&paths[0], &settings, Some(&temperatures)).unwrap();
    assert!(!analysis.summaries.is_empty());
    let first = &analysis.summaries[0];
    assert_eq!(first.channel, Some(0));
    assert!((first.f_0 - 100e6).abs() < 50e3, "fitted {}", first.f_0);
    assert!((first.stream_temperatures["package"] - 0.1).abs() < 1e-9);
    assert_eq!(first.power_dbm, settings.cryostat.dac_chain_gain_db - 10.0);

    let out = tempfile::tempdir().unwrap();
    let summary_csv = out.path().join("summary.csv");
    write_records_csv(&summary_csv, &analysis.summary_table()).unwrap();
    let text = std::fs::read_to_string(&summary_csv).unwrap();
    let header = text.lines().next().unwrap();
    assert!(header.split(',').any(|column| column == "f_0"));
    assert_eq!(text.lines().count(), analysis.summaries.len() + 1);
}

#[tokio::test]
async fn test_measurement_epochs_advance_across_calls() {
    let settings = Settings::default();
    let mut readout = SimulatedReadout::new(&settings.readout);
    readout
        .set_tone_frequencies(&[vec![100.0, 110.0]], 1 << 16)
        .await
        .unwrap();
    readout.select_fft_bins(&[0, 1]).await.unwrap();
    let first = readout.get_measurement_blocks(2, true).await.unwrap();
    let second = readout.get_measurement_blocks(1, true).await.unwrap();
    assert!(second.epoch > first.epoch);
    assert_eq!(first.sequence_start_number, Some(0));
    assert_eq!(second.sequence_start_number, Some(2));
}
