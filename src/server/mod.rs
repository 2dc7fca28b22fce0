// === IMPORTS ===

// Standard library type for holding an IP address and port together.
use std::net::SocketAddr;

// Shared active-connection counter.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// Tokio's non-blocking TCP listener, plus the socket builder for SO_REUSEADDR.
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};

// broadcast: one-to-many channel used for the shutdown signal.
use tokio::sync::broadcast;

// Handles of the per-connection tasks, drained on shutdown.
use tokio::task::JoinSet;

// Sleep after a failed accept.
use tokio::time;


// === MODULES ===

pub mod connection;
pub mod decoder;
pub mod framer;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::logger::Logger;
use crate::sink::DualSink;
use connection::ConnectionHandler;

/// Pending-connection queue length handed to `listen()`.
const LISTEN_BACKLOG: u32 = 1024;


// === LISTENER ===

/// A bound TCP listener that hands every accepted connection to its own task.
pub struct Listener {
    inner: TcpListener,
    config: ServerConfig,
    logger: Logger,
}

impl Listener {
    /// Bind `config.host:config.port` with `SO_REUSEADDR` so a restarted
    /// server can reclaim the port right away. Any failure here is fatal.
    pub async fn bind(config: &ServerConfig, logger: Logger) -> Result<Self, ServerError> {
        let addr = config.bind_addr();
        let bind_err = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };

        // Resolve "host:port" (host may be a name, e.g. "localhost")
        let socket_addr = lookup_host(&addr)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "host resolved to no addresses",
                ))
            })?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(socket_addr).map_err(bind_err)?;
        let inner = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

        Ok(Self {
            inner,
            config: config.clone(),
            logger,
        })
    }

    /// Address actually bound (useful when the port was 0)
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept connections until `shutdown_tx` fires. Each connection gets its
    /// own task and its own shutdown receiver, so no single client can hold
    /// up the accept loop.
    ///
    /// Returns only after every connection task has reached `Closed`, so a
    /// record caught mid-append on shutdown still lands in both sinks.
    pub async fn serve(self, sink: DualSink, shutdown_tx: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let connection_count = Arc::new(AtomicUsize::new(0));
        let mut connections = JoinSet::new();

        if let Ok(addr) = self.inner.local_addr() {
            self.logger.info(&format!("🚀 Listening on {} (TCP)", addr));
        }

        loop {
            tokio::select! {
                accept_result = self.inner.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.spawn_connection(
                                stream,
                                addr,
                                &sink,
                                &shutdown_tx,
                                connection_count.clone(),
                                &mut connections,
                            );
                        }
                        // e.g. too many open files: warn and pause briefly
                        Err(e) => {
                            self.logger.warn(&format!("⚠️ Failed to accept connection: {}", e));
                            time::sleep(self.config.accept_error_backoff()).await;
                        }
                    }
                }

                // Reap finished connection tasks as they go
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join_error(&self.logger, joined);
                }

                _ = shutdown_rx.recv() => {
                    self.logger.info("🧹 Server received shutdown signal.");
                    break;
                }
            }
        }

        // Stop accepting before waiting on the stragglers
        drop(self.inner);

        if !connections.is_empty() {
            self.logger.info(&format!(
                "Waiting for {} connection(s) to close",
                connections.len()
            ));
        }
        while let Some(joined) = connections.join_next().await {
            log_join_error(&self.logger, joined);
        }
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        sink: &DualSink,
        shutdown_tx: &broadcast::Sender<()>,
        connection_count: Arc<AtomicUsize>,
        connections: &mut JoinSet<()>,
    ) {
        // Acks are tiny; send them immediately
        if let Err(e) = stream.set_nodelay(true) {
            self.logger.warn(&format!("⚠️ Failed to set TCP_NODELAY for {}: {}", addr, e));
        }

        let handler = ConnectionHandler::new(
            stream,
            addr.to_string(),
            sink.clone(),
            self.logger.clone(),
            self.config.read_chunk_size,
        );
        let mut shutdown_rx = shutdown_tx.subscribe();
        let logger = self.logger.clone();

        let current = connection_count.fetch_add(1, Ordering::SeqCst) + 1;
        logger.debug(&format!("Active connections: {}", current));

        connections.spawn(async move {
            handler.run(&mut shutdown_rx).await;

            let remaining = connection_count.fetch_sub(1, Ordering::SeqCst) - 1;
            logger.debug(&format!("Active connections: {}", remaining));
        });
    }
}


/// A connection task that panicked or was aborted
fn log_join_error(logger: &Logger, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        logger.error(&format!("❌ Connection task failed: {}", e));
    }
}


// === RUN_SERVER ===

/// Bind, build the shared sink, install the Ctrl+C handler and serve until
/// shutdown. Only a bind failure makes this return an error.
pub async fn run_server(config: ServerConfig, logger: Logger) -> Result<(), ServerError> {
    let listener = Listener::bind(&config, logger.clone()).await?;

    let sink = DualSink::from_config(&config, logger.clone());
    logger.info(&format!(
        "Recording to {} and {}",
        sink.log_path().display(),
        sink.csv_path().display()
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_handle = spawn_shutdown_listener(shutdown_tx.clone(), logger.clone());

    listener.serve(sink, shutdown_tx).await;

    shutdown_handle.abort();
    Ok(())
}

/// Wait for Ctrl+C (SIGINT), then broadcast the shutdown signal.
fn spawn_shutdown_listener(
    shutdown_tx: broadcast::Sender<()>,
    logger: Logger,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            logger.error(&format!("Failed to listen for ctrl_c: {}", e));
            return;
        }
        logger.warn("🛑 Ctrl+C received, shutting down.");
        let _ = shutdown_tx.send(());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn shutdown_waits_for_record_stuck_in_sink() {
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
        let serve = tokio::spawn(listener.serve(sink.clone(), shutdown_tx.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let stall = sink.stall_writes().await;
        client.write_all(b"{\"celsius\": 21.5}\n").await.unwrap();

        // Let the handler reach the sink and block on the lock
        time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(()).unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert!(!serve.is_finished(), "serve returned with a record mid-append");

        drop(stall);
        time::timeout(Duration::from_secs(5), serve)
            .await
            .expect("serve never returned")
            .unwrap();

        let log = std::fs::read_to_string(sink.log_path()).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.ends_with(" - {\"celsius\":21.5}\n"), "{}", log);
        let csv = std::fs::read_to_string(sink.csv_path()).unwrap();
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.lines().nth(1).unwrap().ends_with(",21.5,"));

        // The ack still went out before the connection closed
        let mut reply = String::new();
        BufReader::new(client).read_line(&mut reply).await.unwrap();
        assert!(reply.starts_with("{\"status\":\"ok\""), "{:?}", reply);
    }

    #[tokio::test]
    async fn second_bind_on_same_port_fails() {
        let mut config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let first = Listener::bind(&config, Logger).await.unwrap();
        config.port = first.local_addr().unwrap().port();

        // SO_REUSEADDR does not allow two live listeners on one port
        let err = Listener::bind(&config, Logger).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_bind_error() {
        let config = ServerConfig {
            host: "definitely-not-a-host.invalid".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let err = Listener::bind(&config, Logger).await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
