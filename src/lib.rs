// Server settings: port, sink locations, runtime and logger options.
pub mod config;

// Errors that stop the server as a whole.
pub mod error;

// Operator-facing diagnostics (accepts, closes, write failures).
pub mod logger;

// TCP listener, per-connection protocol, framing and JSON decoding.
pub mod server;

// Append-only text log and CSV table for received telemetry.
pub mod sink;

// Pull in the items callers need most so they don't have to write full paths.
pub use config::{LoggerConfig, ServerConfig};
pub use error::ServerError;
pub use logger::{Logger, init_logger};
pub use server::decoder::{Ack, DecodedMessage, decode};
pub use server::framer::Framer;
pub use server::{Listener, run_server};
pub use sink::{DualSink, SinkError};

/// Name used to tag diagnostic log lines.
pub const LOGGER_NAME: &str = "pico_temp_server";

/// Build a multi-threaded Tokio runtime, set up logging and run the server
/// until Ctrl+C.
///
/// Returns an error only when the runtime cannot be built or the port
/// cannot be bound.
pub fn start_server(config: ServerConfig) -> Result<(), ServerError> {
    // Build a multi-threaded Tokio runtime based on the `worker_threads` value.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads) // how many threads to use
        .thread_name("pico-server-worker") // helpful for debugging
        .enable_all() // turn on I/O, timers, signals
        .build()
        .map_err(ServerError::Runtime)?;

    // Create or retrieve the logger per the config
    let logger = init_logger(LOGGER_NAME, &config.logger);

    rt.block_on(async {
        match run_server(config, logger.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                logger.error(&format!("Rust server error: {}", e));
                Err(e)
            }
        }
    })
}
