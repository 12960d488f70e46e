//! The rumqttc-backed session against an in-process mutual TLS broker
//!
//! The broker is a TLS acceptor over a local TCP listener that speaks just
//! enough MQTT 3.1.1 to drive one device session: it reads CONNECT and
//! SUBSCRIBE, answers with raw CONNACK/SUBACK frames, publishes on the device
//! topics and records what the client sent.

use esp32cam_monitor::config::MonitorConfig;
use esp32cam_monitor::transport::mqtt::{ConnectionManager, ConnectionState, StateTransition};
use rumqttc::tokio_rustls::rustls::server::WebPkiClientVerifier;
use rumqttc::tokio_rustls::rustls::{RootCertStore, ServerConfig};
use rumqttc::tokio_rustls::server::TlsStream;
use rumqttc::tokio_rustls::TlsAcceptor;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};

const WAIT: Duration = Duration::from_secs(10);

const CONNECT: u8 = 0x10;
const SUBSCRIBE: u8 = 0x82;
const DISCONNECT: u8 = 0xE0;
const CLEAN_SESSION: u8 = 0x02;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/certs")
}

fn read_fixture(name: &str) -> Vec<u8> {
    fs::read(fixture_dir().join(name)).unwrap()
}

/// Broker TLS config: server.crt for localhost, clients must chain to rootCA.pem
fn broker_acceptor() -> TlsAcceptor {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut read_fixture("rootCA.pem").as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .unwrap();

    let chain = rustls_pemfile::certs(&mut read_fixture("server.crt").as_slice())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut read_fixture("server.key").as_slice())
        .unwrap()
        .unwrap();

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Fixture bundle whose endpoint file points at the local broker
fn bundle_for_port(port: u16) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for entry in fs::read_dir(fixture_dir()).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), dir.path().join(entry.file_name())).unwrap();
    }
    let endpoint = serde_json::json!({ "endpoint": "localhost", "port": port });
    fs::write(dir.path().join("aws_config.json"), endpoint.to_string()).unwrap();
    dir
}

type BrokerStream = TlsStream<TcpStream>;

/// Fixed header byte and body of the next packet; None on EOF
async fn read_packet(stream: &mut BrokerStream) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

async fn write_frame(stream: &mut BrokerStream, header: u8, body: &[u8]) {
    let mut frame = vec![header];
    let mut remaining = body.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        frame.push(byte);
        if remaining == 0 {
            break;
        }
    }
    frame.extend_from_slice(body);
    stream.write_all(&frame).await.unwrap();
    stream.flush().await.unwrap();
}

fn mqtt_string(body: &[u8], at: usize) -> (String, usize) {
    let len = usize::from(u16::from_be_bytes([body[at], body[at + 1]]));
    let start = at + 2;
    let text = String::from_utf8(body[start..start + len].to_vec()).unwrap();
    (text, start + len)
}

/// Connect flags and client id from a CONNECT body
fn parse_connect(body: &[u8]) -> (u8, String) {
    let (protocol, at) = mqtt_string(body, 0);
    assert_eq!(protocol, "MQTT");
    assert_eq!(body[at], 4, "protocol level 3.1.1");
    let flags = body[at + 1];
    // Skip level, flags and keep-alive
    let (client_id, _) = mqtt_string(body, at + 4);
    (flags, client_id)
}

/// Packet id and (topic, qos) pairs from a SUBSCRIBE body
fn parse_subscribe(body: &[u8]) -> ([u8; 2], Vec<(String, u8)>) {
    let packet_id = [body[0], body[1]];
    let mut filters = Vec::new();
    let mut at = 2;
    while at < body.len() {
        let (topic, next) = mqtt_string(body, at);
        filters.push((topic, body[next]));
        at = next + 1;
    }
    (packet_id, filters)
}

async fn connack(stream: &mut BrokerStream, session_present: bool) {
    write_frame(stream, 0x20, &[u8::from(session_present), 0x00]).await;
}

async fn publish(stream: &mut BrokerStream, topic: &str, payload: &str) {
    let mut body = (topic.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload.as_bytes());
    write_frame(stream, 0x30, &body).await;
}

async fn accept(listener: &TcpListener, acceptor: &TlsAcceptor) -> BrokerStream {
    let (tcp, _) = listener.accept().await.unwrap();
    acceptor.accept(tcp).await.unwrap()
}

/// What the client put on the wire
#[derive(Debug, Default)]
struct BrokerLog {
    connect_flags: Vec<u8>,
    client_ids: Vec<String>,
    subscriptions: Vec<(String, u8)>,
    final_packet: Option<u8>,
}

/// Serve one fresh session, drop it on `release`, then serve the resumed one
async fn run_broker(listener: TcpListener, release: oneshot::Receiver<()>) -> BrokerLog {
    let acceptor = broker_acceptor();
    let mut log = BrokerLog::default();

    let mut stream = accept(&listener, &acceptor).await;
    let (header, body) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header, CONNECT);
    let (flags, client_id) = parse_connect(&body);
    log.connect_flags.push(flags);
    log.client_ids.push(client_id);
    connack(&mut stream, false).await;

    let (header, body) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header, SUBSCRIBE);
    let (packet_id, filters) = parse_subscribe(&body);
    let granted: Vec<u8> = filters.iter().map(|(_, qos)| *qos).collect();
    log.subscriptions = filters;
    let mut suback = packet_id.to_vec();
    suback.extend_from_slice(&granted);
    write_frame(&mut stream, 0x90, &suback).await;

    publish(&mut stream, "esp32cam/status", "connected").await;
    publish(&mut stream, "esp32cam/processed", "\u{1}garbage").await;
    publish(
        &mut stream,
        "esp32cam/processed",
        r#"{"objects": [{"label": "person", "distance": 1.2, "risk_level": "high"}]}"#,
    )
    .await;

    release.await.unwrap();
    drop(stream);

    let mut stream = accept(&listener, &acceptor).await;
    let (header, body) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header, CONNECT);
    let (flags, client_id) = parse_connect(&body);
    log.connect_flags.push(flags);
    log.client_ids.push(client_id);
    connack(&mut stream, true).await;
    publish(&mut stream, "esp32cam/status", "connected").await;

    while let Some((header, _)) = read_packet(&mut stream).await {
        log.final_packet = Some(header);
        if header == DISCONNECT {
            break;
        }
    }
    log
}

async fn next_transition(rx: &mut broadcast::Receiver<StateTransition>) -> ConnectionState {
    let transition = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a state transition")
        .expect("transition channel closed");
    transition.to
}

#[tokio::test]
async fn test_real_session_over_mutual_tls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let bundle = bundle_for_port(port);
    let (release_tx, release_rx) = oneshot::channel();
    let broker = tokio::spawn(run_broker(listener, release_rx));

    let mut config = MonitorConfig::default().with_asset_dir(bundle.path());
    config.reconnect.backoff_pattern_ms = vec![20];
    config.reconnect.sustained_delay_ms = 20;
    let manager = ConnectionManager::new(&config);
    let mut transitions = manager.subscribe_transitions();
    let feed = manager.telemetry();
    let mut records = feed.observe();

    manager.connect().await.unwrap();
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Connecting);
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Connected);

    let record = tokio::time::timeout(WAIT, records.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.to_string(), "person 1.2 high");
    assert_eq!(feed.len(), 1, "garbage payload must not reach the log");

    release_tx.send(()).unwrap();
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Lost);
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Connecting);
    assert_eq!(next_transition(&mut transitions).await, ConnectionState::Connected);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let log = tokio::time::timeout(WAIT, broker).await.unwrap().unwrap();
    assert!(
        log.connect_flags.iter().all(|flags| flags & CLEAN_SESSION == 0),
        "sessions must be persistent, got flags {:?}",
        log.connect_flags
    );
    assert_eq!(log.client_ids.len(), 2);
    assert!(log.client_ids[0].starts_with("esp32cam-monitor_"));
    assert_eq!(log.client_ids[0], log.client_ids[1], "reconnect keeps the session");
    assert_eq!(
        log.subscriptions,
        vec![
            ("esp32cam/status".to_string(), 1),
            ("esp32cam/processed".to_string(), 1),
        ]
    );
    assert_eq!(log.final_packet, Some(DISCONNECT));
    assert_eq!(feed.len(), 1);
}
