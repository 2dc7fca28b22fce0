//! End-to-end tests: a real listener on 127.0.0.1 and real TCP clients.

use std::net::SocketAddr;
use std::time::Duration;

use pico_temp_server::sink::CSV_HEADER;
use pico_temp_server::{DualSink, Listener, Logger, ServerConfig};
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast;

struct TestServer {
    addr: SocketAddr,
    sink: DualSink,
    shutdown_tx: broadcast::Sender<()>,
    serve_task: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            log_path: dir.path().join("pico_temps.log"),
            csv_path: dir.path().join("pico_temps.csv"),
            ..ServerConfig::default()
        };

        let listener = Listener::bind(&config, Logger).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = DualSink::from_config(&config, Logger);
        let (shutdown_tx, _) = broadcast::channel(1);

        let serve_task = tokio::spawn(listener.serve(sink.clone(), shutdown_tx.clone()));

        Self {
            addr,
            sink,
            shutdown_tx,
            serve_task,
            _dir: dir,
        }
    }

    async fn connect(&self) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        (BufReader::new(reader), writer)
    }

    fn log(&self) -> String {
        std::fs::read_to_string(self.sink.log_path()).unwrap_or_default()
    }

    fn csv(&self) -> String {
        std::fs::read_to_string(self.sink.csv_path()).unwrap_or_default()
    }
}

async fn read_ack(reader: &mut BufReader<OwnedReadHalf>) -> Value {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for ack")
        .unwrap();
    assert!(line.ends_with('\n'), "ack not newline-terminated: {:?}", line);
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn temperature_reading_is_acked_logged_and_tabulated() {
    let server = TestServer::start().await;
    let (mut reader, mut writer) = server.connect().await;
    let peer = writer.local_addr().unwrap().to_string();

    writer
        .write_all(b"{\"celsius\": 21.5, \"fahrenheit\": 70.7}\n")
        .await
        .unwrap();

    let ack = read_ack(&mut reader).await;
    assert_eq!(ack["status"], "ok");
    let received = ack["received"].as_str().unwrap();
    assert!(received.ends_with('Z'));

    assert_eq!(
        server.log(),
        format!("{} - {} - {{\"celsius\":21.5,\"fahrenheit\":70.7}}\n", received, peer)
    );
    assert_eq!(
        server.csv(),
        format!("{}{},{},21.5,70.7\n", CSV_HEADER, received, peer)
    );
}

#[tokio::test]
async fn non_json_line_gets_invalid_json_ack() {
    let server = TestServer::start().await;
    let (mut reader, mut writer) = server.connect().await;
    let peer = writer.local_addr().unwrap().to_string();

    writer.write_all(b"not json\n").await.unwrap();

    let ack = read_ack(&mut reader).await;
    assert_eq!(ack, serde_json::json!({"status": "error", "reason": "invalid_json"}));

    let log = server.log();
    assert!(log.contains("not json"), "{}", log);
    let row = server.csv().lines().nth(1).unwrap().to_string();
    assert!(row.ends_with(&format!(",{},,", peer)), "{}", row);
}

#[tokio::test]
async fn two_records_in_one_write_are_handled_in_order() {
    let server = TestServer::start().await;
    let (mut reader, mut writer) = server.connect().await;

    writer
        .write_all(b"{\"celsius\":1}\n{\"celsius\":2}\n")
        .await
        .unwrap();

    let first = read_ack(&mut reader).await;
    let second = read_ack(&mut reader).await;
    assert_eq!(first["status"], "ok");
    assert_eq!(second["status"], "ok");

    let csv = server.csv();
    let celsius: Vec<&str> = csv
        .lines()
        .skip(1)
        .map(|row| row.split(',').nth(2).unwrap())
        .collect();
    assert_eq!(celsius, vec!["1", "2"]);
}

#[tokio::test]
async fn unterminated_fragment_is_dropped_at_close() {
    let server = TestServer::start().await;
    let (mut reader, mut writer) = server.connect().await;

    writer.write_all(b"{\"celsius\": 1}\n{\"celsius\": 2").await.unwrap();
    assert_eq!(read_ack(&mut reader).await["status"], "ok");
    writer.shutdown().await.unwrap();

    // Server closes without acking the fragment
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut rest))
        .await
        .expect("server did not close the connection")
        .unwrap();
    assert!(rest.is_empty(), "unexpected bytes {:?}", String::from_utf8_lossy(&rest));

    assert_eq!(server.log().lines().count(), 1);
    assert_eq!(server.csv().lines().count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_produce_well_formed_sinks() {
    const CLIENTS: usize = 10;
    const MESSAGES: usize = 20;

    let server = TestServer::start().await;

    let mut tasks = Vec::new();
    for client in 0..CLIENTS {
        let (mut reader, mut writer) = server.connect().await;
        tasks.push(tokio::spawn(async move {
            for i in 0..MESSAGES {
                let msg = format!(
                    "{{\"client\": {}, \"celsius\": {}, \"fahrenheit\": {}}}\n",
                    client,
                    i,
                    i * 9 / 5 + 32
                );
                writer.write_all(msg.as_bytes()).await.unwrap();
                assert_eq!(read_ack(&mut reader).await["status"], "ok");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let log = server.log();
    let log_lines: Vec<&str> = log.lines().collect();
    assert_eq!(log_lines.len(), CLIENTS * MESSAGES);
    for line in &log_lines {
        let json = line.splitn(3, " - ").nth(2).unwrap();
        let value: Value = serde_json::from_str(json).unwrap();
        assert!(value["celsius"].is_number());
    }

    let csv = server.csv();
    let mut rows = csv.lines();
    assert_eq!(rows.next(), Some(CSV_HEADER.trim_end()));
    let rows: Vec<&str> = rows.collect();
    assert_eq!(rows.len(), CLIENTS * MESSAGES);
    assert!(rows.iter().all(|r| r.split(',').count() == 4), "{:?}", rows);

    // Per-connection order survives concurrency
    for client in 0..CLIENTS {
        let seen: Vec<i64> = log_lines
            .iter()
            .filter_map(|line| {
                let value: Value = serde_json::from_str(line.splitn(3, " - ").nth(2)?).ok()?;
                (value["client"] == client as i64).then(|| value["celsius"].as_i64().unwrap())
            })
            .collect();
        assert_eq!(seen, (0..MESSAGES as i64).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn shutdown_stops_accepting_and_closes_clients() {
    let mut server = TestServer::start().await;
    let (mut reader, mut writer) = server.connect().await;

    writer.write_all(b"{\"celsius\": 1}\n").await.unwrap();
    assert_eq!(read_ack(&mut reader).await["status"], "ok");

    server.shutdown_tx.send(()).unwrap();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut rest))
        .await
        .expect("connection was not closed on shutdown")
        .unwrap();
    assert!(rest.is_empty());

    // serve returns once every connection has closed, and the listening
    // socket goes with it
    tokio::time::timeout(Duration::from_secs(5), &mut server.serve_task)
        .await
        .expect("serve did not return after shutdown")
        .unwrap();

    match TcpStream::connect(server.addr).await {
        Err(_) => {}
        Ok(stream) => {
            // Port was reused by someone else; at least nothing acks for us
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let _ = writer.write_all(b"{\"celsius\": 2}\n").await;
            let mut line = String::new();
            let read = tokio::time::timeout(Duration::from_millis(500), reader.read_line(&mut line)).await;
            assert!(!matches!(read, Ok(Ok(n)) if n > 0), "late client got {:?}", line);
        }
    }
    assert_eq!(server.log().lines().count(), 1);
}
