// Read/write traits so any byte stream (TCP, in-memory duplex) can be driven
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Server-wide shutdown signal
use tokio::sync::broadcast;

// ISO-8601 timestamps for sinks and acks
use chrono::{SecondsFormat, Utc};

use crate::logger::Logger;
use crate::server::decoder::{self, Ack, DecodedMessage};
use crate::server::framer::Framer;
use crate::sink::DualSink;

/// Where a connection is in its receive/decide/respond cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for more bytes from the peer
    Receiving,
    /// Decoding and recording one record
    Deciding,
    /// Writing the acknowledgement back
    Responding,
    /// Done; nothing more is read or written
    Closed,
}

/// Why a connection reached [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side
    PeerClosed,
    /// Reading from the socket failed
    ReadError,
    /// The server is shutting down
    Shutdown,
}

/// Owns one accepted connection from first byte to close.
pub struct ConnectionHandler<S> {
    stream: S,
    peer: String,
    framer: Framer,
    sink: DualSink,
    logger: Logger,
    state: ConnectionState,
    read_chunk_size: usize,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: String, sink: DualSink, logger: Logger, read_chunk_size: usize) -> Self {
        Self {
            stream,
            peer,
            framer: Framer::new(),
            sink,
            logger,
            state: ConnectionState::Receiving,
            read_chunk_size: read_chunk_size.max(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        self.logger
            .debug(&format!("{}: {:?} -> {:?}", self.peer, self.state, next));
        self.state = next;
    }

    /// Run the session until the peer goes away, a read fails, or shutdown
    /// is broadcast. Shutdown is only observed while waiting for bytes, so a
    /// record that has started processing always reaches both sinks.
    pub async fn run(mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> CloseReason {
        self.logger.info(&format!("🔌 Accepted connection from {}", self.peer));

        let mut chunk = vec![0u8; self.read_chunk_size];

        let reason = loop {
            let read = tokio::select! {
                read = self.stream.read(&mut chunk) => read,
                _ = shutdown_rx.recv() => {
                    self.logger.warn(&format!("🛑 {} disconnected due to shutdown.", self.peer));
                    break CloseReason::Shutdown;
                }
            };

            match read {
                Ok(0) => break CloseReason::PeerClosed,
                Ok(n) => {
                    for record in self.framer.feed(&chunk[..n]) {
                        self.process_record(&record).await;
                    }
                }
                Err(e) => {
                    self.logger.warn(&format!("❌ Error reading from {}: {}", self.peer, e));
                    break CloseReason::ReadError;
                }
            }
        };

        self.close(reason).await;
        reason
    }

    /// Decode, record and acknowledge one record.
    async fn process_record(&mut self, record: &str) {
        self.transition(ConnectionState::Deciding);

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let message = decoder::decode(record);

        match &message {
            DecodedMessage::Valid(value) => {
                self.logger.info(&format!("📨 {} - {}", self.peer, value));
            }
            DecodedMessage::Invalid(text) => {
                self.logger.warn(&format!("⚠️ Non-JSON from {}: {}", self.peer, text));
            }
        }

        self.sink.record(&self.peer, &now, &message).await;

        self.transition(ConnectionState::Responding);
        self.send_ack(&Ack::for_message(&message, &now)).await;

        self.transition(ConnectionState::Receiving);
    }

    /// Best effort: a failed ack is logged and the next read decides the
    /// connection's fate.
    async fn send_ack(&mut self, ack: &Ack) {
        let frame = match ack.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.logger.error(&format!("❌ Could not encode ack for {}: {}", self.peer, e));
                return;
            }
        };

        if let Err(e) = self.stream.write_all(&frame).await {
            self.logger.warn(&format!("❌ ACK send error to {}: {}", self.peer, e));
            return;
        }
        if let Err(e) = self.stream.flush().await {
            self.logger.warn(&format!("❌ ACK flush error to {}: {}", self.peer, e));
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        self.transition(ConnectionState::Closed);

        let leftover = self.framer.pending();
        if leftover > 0 {
            self.logger.debug(&format!(
                "Discarding {} unterminated bytes from {}",
                leftover, self.peer
            ));
        }

        // Peer may already be gone; nothing left to do either way
        if let Err(e) = self.stream.shutdown().await {
            self.logger
                .debug(&format!("Shutdown of {} failed: {}", self.peer, e));
        }
        self.logger
            .info(&format!("Connection ended: {} ({:?})", self.peer, reason));
    }
}
