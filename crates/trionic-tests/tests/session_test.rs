//! T7 logging sessions end to end over the mock adapter
//!
//! Run with: cargo test -p trionic-tests --test session_test

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serial_test::serial;
use tokio::time::timeout;
use trionic_can::kwp2000::{verify_key, KwpClient, INIT_MSG_ID, INIT_RESP_ID, REQ_MSG_ID};
use trionic_can::mock::{MockCanAdapter, Script};
use trionic_can::CanClient;
use trionic_core::{EcuKind, ErrorKind, Symbol};
use trionic_logger::{Aggregator, Controller, DataLogger, LogFile, LoggerConfig, LoggerError};
use trionic_tests::fixtures::{mock, script_t7_record, script_t7_session, T7_RESPONSE_ID, T7_SEED};

const WAIT: Duration = Duration::from_secs(3);

fn t7_logger(dir: &tempfile::TempDir) -> DataLogger {
    let config = LoggerConfig {
        ecu: EcuKind::T7,
        log_dir: dir.path().to_path_buf(),
        broadcast_window_ms: 20,
        ..Default::default()
    };
    DataLogger::new(config, Controller::with_aggregators(Aggregator::defaults()))
}

fn client(mock: &Arc<MockCanAdapter>) -> Arc<CanClient> {
    Arc::new(CanClient::new(mock.clone()))
}

fn only_log(dir: &tempfile::TempDir) -> PathBuf {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1, "{:?}", entries);
    entries.remove(0)
}

// =============================================================================
// Session bring-up and security access
// =============================================================================

#[tokio::test]
async fn test_start_session_takes_reply_id_from_ecu() {
    let mock = mock(false);
    mock.script(
        Script::on(INIT_MSG_ID, [0x3F, 0x81, 0x00, 0x11, 0x02, 0x42])
            .reply(INIT_RESP_ID, vec![0x40, 0xBF, 0x21, 0xC1, 0x8F, 0xEF, 0x02, 0x58]),
    );
    let kwp = KwpClient::new(client(&mock));

    assert_eq!(kwp.start_session().await.unwrap(), 0x258);
    assert_eq!(kwp.response_id(), 0x258);

    // security access goes to the new reply identifier
    script_t7_session(&mock);
    kwp.request_security_access(false).await.unwrap();
    assert!(kwp.security_granted());
    let seed_request = &mock.sent_to(REQ_MSG_ID)[0];
    assert_eq!(&seed_request.data[..5], &[0x40, 0xA1, 0x02, 0x27, 0x05]);
}

#[tokio::test]
async fn test_security_access_falls_through_to_method_one() {
    let mock = mock(false);
    let [hi, lo] = T7_SEED.to_be_bytes();
    mock.script(
        Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x27, 0x05])
            .reply(T7_RESPONSE_ID, vec![0xC0, 0xBF, 0x04, 0x67, 0x05, hi, lo, 0x00]),
    );
    // 0xA1B2 << 2 = 0x86C8; ^ 0x4081 = 0xC649; - 0x1F6F = 0xA6DA
    mock.script(
        Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x04, 0x27, 0x06, 0xA6, 0xDA])
            .reply(T7_RESPONSE_ID, vec![0xC3, 0xEF, 0x03, 0x67, 0x34, 0x00, 0x00, 0x00]),
    );
    mock.script(
        Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x04, 0x27, 0x06])
            .reply(T7_RESPONSE_ID, vec![0xC0, 0xBF, 0x03, 0x7F, 0x27, 0x35, 0x00, 0x00]),
    );
    let kwp = KwpClient::new(client(&mock)).with_security_backoff(Duration::from_millis(10));

    kwp.request_security_access(false).await.unwrap();
    assert!(kwp.security_granted());

    let keys: Vec<Vec<u8>> = mock
        .sent_to(REQ_MSG_ID)
        .iter()
        .filter(|f| f.data.starts_with(&[0x40, 0xA1, 0x04, 0x27, 0x06]))
        .map(|f| f.data[5..7].to_vec())
        .collect();
    assert_eq!(keys, vec![vec![0xE4, 0x34], vec![0xA6, 0xDA]]);
    assert!(verify_key(T7_SEED, 0xA6DA, 1));

    // a second call reuses the grant
    let sent = mock.sent().len();
    kwp.request_security_access(false).await.unwrap();
    assert_eq!(mock.sent().len(), sent);
}

// =============================================================================
// Logging through the façade
// =============================================================================

#[tokio::test]
#[serial]
async fn test_composite_read_publishes_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mock = mock(false);
    script_t7_session(&mock);
    script_t7_record(&mock, &[0x01, 0x2C, 0x00, 0x00, 0x12, 0x34]);

    let logger = t7_logger(&dir);
    let mut pedal = logger.subscribe("Out.X_AccPedal");
    let mut two = logger.subscribe("Sym.Two");
    let symbols = vec![
        Symbol::new("Out.X_AccPedal", 1, 0xF0_0010, 2),
        Symbol::new("Sym.Two", 2, 0xF0_0020, 4),
    ];
    logger.start(client(&mock), symbols).unwrap();

    let pedal = timeout(WAIT, pedal.recv()).await.unwrap().unwrap();
    assert!((pedal - 30.0).abs() < 1e-9);
    assert_eq!(timeout(WAIT, two.recv()).await.unwrap().unwrap(), 4660.0);
    assert_eq!(logger.state().get("Sym.Two"), 4660.0);

    logger.close().await.unwrap();
    assert!(logger.counters().borrow().captures > 0);

    let path = only_log(&dir);
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("t7l"));
    let mut log = trionic_logger::open(&path).unwrap();
    let first = log.next().unwrap();
    assert_eq!(first.get("Out.X_AccPedal"), Some(30.0));
    assert_eq!(first.get("Sym.Two"), Some(4660.0));
}

#[tokio::test]
#[serial]
async fn test_air_mass_difference_is_derived() {
    let dir = tempfile::tempdir().unwrap();
    let mock = mock(false);
    script_t7_session(&mock);
    script_t7_record(&mock, &[0x01, 0x2C, 0x01, 0x90]);

    let logger = t7_logger(&dir);
    let mut diff = logger.subscribe("AirDIFF");
    let symbols = vec![
        Symbol::new("MAF.m_AirInlet", 1, 0xF0_0010, 2),
        Symbol::new("m_Request", 2, 0xF0_0020, 2),
    ];
    logger.start(client(&mock), symbols).unwrap();

    assert_eq!(timeout(WAIT, diff.recv()).await.unwrap().unwrap(), 100.0);
    logger.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_error_storm_ends_session() {
    let dir = tempfile::tempdir().unwrap();
    let mock = mock(false);
    script_t7_session(&mock);
    // the record read is never answered

    let logger = t7_logger(&dir);
    let mut messages = logger.messages();
    logger
        .start(client(&mock), vec![Symbol::new("Out.X_AccPedal", 1, 0xF0_0010, 2)])
        .unwrap();

    let result = timeout(Duration::from_secs(5), logger.wait()).await.unwrap();
    let err = result.unwrap_err();
    assert!(matches!(err, LoggerError::TooManyErrors));
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(!logger.is_running());

    let mut texts = Vec::new();
    while let Ok(m) = messages.try_recv() {
        texts.push(m.text);
    }
    assert!(texts.iter().any(|t| t == "too many errors per second"), "{:?}", texts);
    assert!(logger.counters().borrow().errors > 5);

    // StopCommunication was sent and the log holds no records
    assert!(mock.sent_to(REQ_MSG_ID).iter().any(|f| f.data.get(3) == Some(&0x82)));
    assert_eq!(std::fs::read_to_string(only_log(&dir)).unwrap(), "");
}

#[tokio::test]
async fn test_requests_need_a_running_session() {
    let dir = tempfile::tempdir().unwrap();
    let logger = t7_logger(&dir);
    assert!(matches!(logger.set_symbols(Vec::new()), Err(LoggerError::NotRunning)));
    assert!(matches!(logger.set_ram(0xF0_0000, vec![1]).await, Err(LoggerError::NotRunning)));
    logger.close().await.unwrap();
    logger.close().await.unwrap();
}
