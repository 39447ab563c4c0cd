use kid_readout::adapters::MockAdapter;
use kid_readout::instrument::{load_curve, save_curve, Sim900, SimThermometer};

fn mainframe_with_stored_curve() -> MockAdapter {
    let mock = MockAdapter::new();
    mock.on("CINI? 2", &["0,RX102A,3"]);
    mock.on("CAPT? 2, 1", &["1050.0,40.0"]);
    mock.on("CAPT? 2, 2", &["2200.0,1.2"]);
    mock.on("CAPT? 2, 3", &["31000.0,0.05"]);
    mock
}

#[test]
fn test_curve_read_save_and_validate_through_mainframe() {
    let mock = mainframe_with_stored_curve();
    let dir = tempfile::tempdir().unwrap();
    let mut sim900 = Sim900::new(mock.clone());

    let path = tokio_test::block_on(async {
        let curve = sim900.sim921('2').read_curve(2).await.unwrap();
        assert_eq!(curve.identification, "RX102A");
        assert_eq!(curve.sensor, vec![1050.0, 2200.0, 31000.0]);
        save_curve(dir.path(), &curve).unwrap()
    });
    assert_eq!(path.file_name().unwrap(), "RX102A.txt");

    let saved = load_curve(&path, "0").unwrap();
    let matches = tokio_test::block_on(sim900.sim921('2').validate_curve(2, &saved)).unwrap();
    assert!(matches);

    // Every exchange goes through its own port connection.
    let log = mock.call_log();
    assert_eq!(&log[..3], &["CONN 2,\"ESCAPE\"", "CINI? 2", "ESCAPE"]);
    assert_eq!(sim900.connected(), None);
}

#[test]
fn test_validate_reports_mismatch() {
    let mock = mainframe_with_stored_curve();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("other.txt");
    std::fs::write(&file, "1050.0\t40.0\r\n2200.0\t1.3\r\n31000.0\t0.05\r\n").unwrap();
    let other = load_curve(&file, "0").unwrap();

    let mut sim900 = Sim900::new(mock);
    let matches = tokio_test::block_on(sim900.sim921('2').validate_curve(2, &other)).unwrap();
    assert!(!matches);
}
