use super::*;
use std::path::PathBuf;

use tempfile::TempDir;
use tokio::time::timeout;
use trionic_can::kwp2000::{INIT_MSG_ID, INIT_RESP_ID, REQ_CHUNK_CONF_ID, REQ_MSG_ID};
use trionic_can::mock::{MockCanAdapter, Script};
use trionic_can::{CanFrame, MockConfig, SYSTEM_MSG};

use crate::reader::{parse_pipe, LogFile};
use crate::writer::PipeWriter;

const WAIT: Duration = Duration::from_secs(3);
const T7_RESPONSE_ID: u32 = 0x258;

fn mock(bridge: bool) -> Arc<MockCanAdapter> {
    Arc::new(MockCanAdapter::new(&MockConfig {
        bridge,
        ..Default::default()
    }))
}

/// StartCommunication, seed/key and DDLI replies of a cooperative T7
fn script_t7_session(mock: &MockCanAdapter) {
    mock.script(
        Script::on(INIT_MSG_ID, [0x3F, 0x81])
            .reply(INIT_RESP_ID, vec![0x40, 0xBF, 0x21, 0xC1, 0x8F, 0xEF, 0x02, 0x58]),
    );
    mock.script(
        Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x27, 0x05])
            .reply(T7_RESPONSE_ID, vec![0xC0, 0xBF, 0x04, 0x67, 0x05, 0xA1, 0xB2, 0x00]),
    );
    mock.script(
        Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x04, 0x27, 0x06])
            .reply(T7_RESPONSE_ID, vec![0xC0, 0xBF, 0x03, 0x67, 0x06, 0x34, 0x00, 0x00]),
    );
    mock.script(
        Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x2C, 0x04])
            .reply(T7_RESPONSE_ID, vec![0xC0, 0xBF, 0x02, 0x6C, 0xF0, 0x00, 0x00, 0x00]),
    );
    mock.script(
        Script::on(REQ_MSG_ID, [0xC1, 0xA1])
            .reply(REQ_CHUNK_CONF_ID, vec![0x00, 0xBF, 0x00, 0x6C, 0x00, 0x00, 0x00, 0x00]),
    );
}

fn script_t7_record(mock: &MockCanAdapter, data: &[u8]) {
    let mut message = vec![0x61, 0xF0];
    message.extend_from_slice(data);
    mock.script_kwp_reply(Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x21, 0xF0]), T7_RESPONSE_ID, &message);
}

struct Harness {
    mock: Arc<MockCanAdapter>,
    counters: Arc<watch::Sender<Counters>>,
    messages: bcast::Receiver<EngineMessage>,
    shutdown: watch::Sender<bool>,
    reads: mpsc::Sender<RamRequest>,
    _symbols: mpsc::Sender<Vec<Symbol>>,
    _writes: mpsc::Sender<RamRequest>,
    log: PathBuf,
    _dir: TempDir,
}

impl Harness {
    fn launch(
        mock: Arc<MockCanAdapter>,
        ecu: EcuKind,
        symbols: Vec<Symbol>,
        bus: &Controller,
        window_ms: u64,
    ) -> (Self, JoinHandle<Result<()>>) {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(format!("test.{}", ecu.log_extension()));
        let writer = Box::new(PipeWriter::create(&log).unwrap());
        let config = LoggerConfig {
            ecu,
            broadcast_window_ms: window_ms,
            ..Default::default()
        };
        let can = Arc::new(CanClient::new(mock.clone()));
        let counters = Arc::new(watch::channel(Counters::default()).0);
        let (messages_tx, messages) = bcast::channel(64);
        let (symbols_tx, symbols_rx) = mpsc::channel(1);
        let (reads_tx, reads_rx) = mpsc::channel(1);
        let (writes_tx, writes_rx) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let engine = Engine::new(
            config,
            can,
            bus.clone(),
            Measurements::new(),
            symbols,
            writer,
            None,
            counters.clone(),
            messages_tx,
        );
        let task = tokio::spawn(engine.run(EngineInputs {
            symbols: symbols_rx,
            reads: reads_rx,
            writes: writes_rx,
            shutdown: shutdown_rx,
        }));
        let harness = Self {
            mock,
            counters,
            messages,
            shutdown,
            reads: reads_tx,
            _symbols: symbols_tx,
            _writes: writes_tx,
            log,
            _dir: dir,
        };
        (harness, task)
    }

    fn log_text(&self) -> String {
        std::fs::read_to_string(&self.log).unwrap()
    }

    /// Single-byte commands sent to the bridge, in order
    fn bridge_commands(&self) -> String {
        self.mock
            .sent_to(SYSTEM_MSG)
            .iter()
            .filter(|f| f.data.len() == 1)
            .map(|f| f.data[0] as char)
            .collect()
    }
}

async fn next_value(sub: &mut crate::eventbus::BusSubscription) -> f64 {
    timeout(WAIT, sub.recv()).await.unwrap().unwrap()
}

#[test]
fn test_expected_payload_skips_broadcast_and_adc() {
    let mut adopted = Symbol::new("ActualIn.n_Engine", 1, 0, 2);
    adopted.skip = true;
    let symbols = vec![
        Symbol::new("Out.X_AccPedal", 2, 0, 2),
        Symbol::new("Sym.Two", 3, 0, 4),
        adopted,
        Symbol::new("ADC0", -1000, 0, 2),
    ];
    assert_eq!(expected_payload(&symbols), 6);
    assert_eq!(expected_payload(&[]), 0);
}

#[tokio::test]
async fn test_t7_composite_read() {
    let mock = mock(false);
    script_t7_session(&mock);
    script_t7_record(&mock, &[0x01, 0x2C, 0x00, 0x00, 0x12, 0x34]);
    let bus = Controller::new();
    let mut pedal = bus.subscribe("Out.X_AccPedal");
    let mut two = bus.subscribe("Sym.Two");

    let symbols = vec![
        Symbol::new("Out.X_AccPedal", 1, 0xF0_0010, 2),
        Symbol::new("Sym.Two", 2, 0xF0_0020, 4),
    ];
    let (h, task) = Harness::launch(mock, EcuKind::T7, symbols, &bus, 20);

    assert!((next_value(&mut pedal).await - 30.0).abs() < 1e-9);
    assert_eq!(next_value(&mut two).await, 4660.0);

    h.shutdown.send(true).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    // method 0 key for seed 0xA1B2, accepted on the first try
    let keys: Vec<_> = h
        .mock
        .sent_to(REQ_MSG_ID)
        .into_iter()
        .filter(|f| f.data.starts_with(&[0x40, 0xA1, 0x04, 0x27, 0x06]))
        .collect();
    assert_eq!(keys.len(), 1);
    assert_eq!(&keys[0].data[5..7], &[0xE4, 0x34]);

    let text = h.log_text();
    let first = text.lines().next().unwrap();
    assert!(first.ends_with("|Out.X_AccPedal=30|Sym.Two=4660|IMPORTANTLINE=0|"), "{}", first);

    // StopCommunication on the way out
    assert!(h.mock.sent_to(REQ_MSG_ID).iter().any(|f| f.data.get(3) == Some(&0x82)));
}

#[tokio::test]
async fn test_error_storm_aborts_session() {
    let mock = mock(false);
    script_t7_session(&mock);
    // no reply to the record read: every tick times out
    let bus = Controller::new();
    let symbols = vec![Symbol::new("Out.X_AccPedal", 1, 0xF0_0010, 2)];
    let (mut h, task) = Harness::launch(mock, EcuKind::T7, symbols, &bus, 20);

    let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(matches!(result, Err(LoggerError::TooManyErrors)));

    let mut texts = Vec::new();
    while let Ok(m) = h.messages.try_recv() {
        texts.push(m.text);
    }
    assert!(texts.iter().any(|t| t == "too many errors per second"), "{:?}", texts);
    assert!(h.counters.borrow().errors > MAX_ERRORS_PER_SECOND as u64);
    assert!(h.mock.sent_to(REQ_MSG_ID).iter().any(|f| f.data.get(3) == Some(&0x82)));
    assert_eq!(h.log_text(), "");
}

#[tokio::test]
async fn test_broadcast_symbols_are_not_polled() {
    let mock = mock(false);
    script_t7_session(&mock);
    script_t7_record(&mock, &[0x00, 0x07]);
    let injector = {
        let mock = mock.clone();
        tokio::spawn(async move {
            for _ in 0..30 {
                mock.inject(CanFrame::new(0x1A0, vec![0x00, 0x0B, 0xB8, 0x00, 0x00, 0x2A, 0x00, 0x00]));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };
    let bus = Controller::new();
    let mut two = bus.subscribe("Sym.Two");

    let symbols = vec![
        Symbol::new("ActualIn.n_Engine", 1, 0xF0_0010, 2),
        Symbol::new("Sym.Two", 2, 0xF0_0020, 2),
    ];
    let (h, task) = Harness::launch(mock, EcuKind::T7, symbols, &bus, 150);

    assert_eq!(next_value(&mut two).await, 7.0);
    h.shutdown.send(true).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    injector.abort();

    // only Sym.Two went into the DDLI
    let defines = h
        .mock
        .sent_to(REQ_MSG_ID)
        .iter()
        .filter(|f| f.data.starts_with(&[0xC1, 0xA1, 0x08, 0x2C]))
        .count();
    assert_eq!(defines, 1);

    let text = h.log_text();
    let first = text.lines().next().unwrap();
    assert!(first.contains("|ActualIn.n_Engine=3000|Out.X_AccPedal=42|Sym.Two=7|"), "{}", first);
}

#[tokio::test]
async fn test_broadcast_values_published_once_per_frame() {
    let mock = mock(false);
    script_t7_session(&mock);
    script_t7_record(&mock, &[0x00, 0x07]);
    let injector = {
        let mock = mock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for _ in 0..3 {
                mock.inject(CanFrame::new(0x1A0, vec![0x00, 0x0B, 0xB8, 0x00, 0x00, 0x2A, 0x00, 0x00]));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };
    let bus = Controller::new();
    let mut engine_speed = bus.subscribe("ActualIn.n_Engine");
    let mut two = bus.subscribe("Sym.Two");

    let symbols = vec![
        Symbol::new("ActualIn.n_Engine", 1, 0xF0_0010, 2),
        Symbol::new("Sym.Two", 2, 0xF0_0020, 2),
    ];
    let (h, task) = Harness::launch(mock, EcuKind::T7, symbols, &bus, 150);

    assert_eq!(next_value(&mut two).await, 7.0);
    // several more ticks with no broadcast traffic
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.shutdown.send(true).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    injector.await.unwrap();

    bus.values().await.unwrap();
    let mut seen = Vec::new();
    while let Some(v) = engine_speed.try_recv() {
        seen.push(v);
    }
    assert_eq!(seen, vec![3000.0; 3]);
    assert!(h.log_text().lines().count() > 3);
}

#[tokio::test]
async fn test_bridge_push_mode() {
    let mock = mock(true);
    script_t7_session(&mock);
    let mut first = 1000u32.to_le_bytes().to_vec();
    first.extend([0x01, 0x2C]);
    let mut second = 1040u32.to_le_bytes().to_vec();
    second.extend([0x01, 0xF4]);
    mock.script(
        Script::on(SYSTEM_MSG, [b'r'])
            .reply(SYSTEM_MSG_DATA_RESPONSE, first)
            .reply(SYSTEM_MSG_DATA_RESPONSE, second)
            .once(),
    );
    mock.script(Script::on(SYSTEM_MSG, [b'R']).reply(trionic_can::SYSTEM_MSG_DATA_REQUEST, vec![1, 2, 3, 4]));

    let bus = Controller::new();
    let mut pedal = bus.subscribe("Out.X_AccPedal");
    let symbols = vec![Symbol::new("Out.X_AccPedal", 1, 0xF0_0010, 2)];
    let (h, task) = Harness::launch(mock, EcuKind::T7, symbols, &bus, 20);

    assert!((next_value(&mut pedal).await - 30.0).abs() < 1e-9);
    assert!((next_value(&mut pedal).await - 50.0).abs() < 1e-9);

    let (req, reply) = RamRequest::read(0xF0_1000, 4);
    h.reads.send(req).await.unwrap();
    assert_eq!(reply.wait().await.unwrap(), vec![1, 2, 3, 4]);

    h.shutdown.send(true).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    assert_eq!(h.bridge_commands(), "7rsrs");
    // no DDLI record reads in push mode
    assert!(!h.mock.sent_to(REQ_MSG_ID).iter().any(|f| f.data.get(3) == Some(&0x21)));

    let log = parse_pipe("push.t7l", &h.log_text()).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log.records()[0].delay_to_next_ms, 40);
}

#[tokio::test]
async fn test_t5_bridge_symbol_list() {
    let mock = mock(true);
    let mut frame = 7u32.to_le_bytes().to_vec();
    frame.extend([0x03, 0xE8]);
    mock.script(Script::on(SYSTEM_MSG, [b'r']).reply(SYSTEM_MSG_DATA_RESPONSE, frame).once());

    let bus = Controller::new();
    let mut pressure = bus.subscribe("P_medel");
    let mut sym = Symbol::new("P_medel", 1, 0x5000, 2);
    sym.sram_offset = 0x1234;
    let (h, task) = Harness::launch(mock, EcuKind::T5, vec![sym], &bus, 20);

    assert!((next_value(&mut pressure).await - 100.0).abs() < 1e-9);
    h.shutdown.send(true).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    let sent = h.mock.sent_to(SYSTEM_MSG);
    assert_eq!(sent[0].data.as_ref(), b"5");
    assert_eq!(
        sent[1].data.as_ref(),
        &[b'd', 6, 0x34, 0x12, 0x00, 0x00, 0x02, 0x00, 0x48]
    );
}

#[tokio::test]
async fn test_t8_ram_window() {
    let mock = mock(false);
    mock.script(Script::on(0x7E0, [0x02, 0x10, 0x02]).reply(0x7E8, vec![0x01, 0x50]));
    mock.script(Script::on(0x7E0, [0x02, 0x27, 0xFD]).reply(0x7E8, vec![0x04, 0x67, 0xFD, 0x00, 0x00]));
    mock.script(Script::on(0x7E0, [0x04, 0x3B, 0x17, 0xF0, 0x04]).reply(0x7E8, vec![0x02, 0x7B, 0x17]));
    mock.script(
        Script::on(0x7E0, [0x07, 0x23, 0x00, 0xF0, 0x00, 0x00, 0x00, 0x04])
            .reply(0x7E8, vec![0x10, 0x09, 0x63, 0x00, 0xF0, 0x00, 0x00, 0xDE])
            .reply(0x7E8, vec![0x21, 0xAD, 0xBE, 0xEF]),
    );
    mock.script(Script::on(0x7E0, [0x01, 0x20]).reply(0x7E8, vec![0x01, 0x60]));

    let bus = Controller::new();
    let (h, task) = Harness::launch(mock, EcuKind::T8, Vec::new(), &bus, 20);

    let (req, reply) = RamRequest::read(0xEF_FFF0, 4);
    h.reads.send(req).await.unwrap();
    assert!(matches!(
        reply.wait().await,
        Err(LoggerError::AddressOutOfRange { address: 0xEF_FFF0, length: 4 })
    ));

    let (req, reply) = RamRequest::read(0xF0_0000, 4);
    h.reads.send(req).await.unwrap();
    assert_eq!(reply.wait().await.unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);

    h.shutdown.send(true).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    // ReturnToNormalMode on the way out
    assert!(h.mock.sent_to(0x7E0).iter().any(|f| f.data.starts_with(&[0x01, 0x20])));
}
