// Turn milliseconds into a Rust time value
use std::time::Duration;

// Where the two sink files live
use std::path::PathBuf;

/// Port the Pico clients dial by default.
pub const DEFAULT_PORT: u16 = 5005;

/// Default text log sink, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "pico_temps.log";

/// Default CSV sink, relative to the working directory.
pub const DEFAULT_CSV_FILE: &str = "pico_temps.csv";

//////////////////////
// LoggerConfig     //
//////////////////////

/// Settings for the operator-facing diagnostic logger (never the data sinks)
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Level name parsed into a `log::LevelFilter` ("info", "debug", ...)
    pub log_level: String,

    /// Print diagnostics to stdout
    pub enable_console_log: bool,

    /// Also write diagnostics to `<log_file_path>/<name>.log`
    pub enable_file_log: bool,

    /// Directory for the diagnostic log file (empty = working directory)
    pub log_file_path: String,

    /// chrono format string for diagnostic timestamps
    pub date_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_console_log: true,
            enable_file_log: false,
            log_file_path: String::new(),
            date_format: "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        }
    }
}

//////////////////////
// ServerConfig     //
//////////////////////

/// All the settings the server needs
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to listen on; `0.0.0.0` means every local interface
    pub host: String,

    /// TCP port to listen on
    pub port: u16,

    /// Append-only text log of every received message
    pub log_path: PathBuf,

    /// Append-only CSV table of every received message
    pub csv_path: PathBuf,

    /// Largest number of bytes pulled from a socket per read
    pub read_chunk_size: usize,

    /// Milliseconds to sleep after a failed accept
    pub accept_error_backoff_ms: u64,

    /// How many Tokio worker threads to spin up (defaults to cpu-1)
    pub worker_threads: usize,

    /// Diagnostic logger settings
    pub logger: LoggerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            log_path: PathBuf::from(DEFAULT_LOG_FILE),
            csv_path: PathBuf::from(DEFAULT_CSV_FILE),
            read_chunk_size: 4096,
            accept_error_backoff_ms: 100,
            // cpu-1 workers, but at least one
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            logger: LoggerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build a config from the process arguments (program name already skipped).
    ///
    /// The only recognised argument is an optional port. Anything that is not a
    /// valid `u16` is reported on stderr and replaced by [`DEFAULT_PORT`]; the
    /// logger is not up yet at this point.
    pub fn from_args<I>(mut args: I) -> Self
    where
        I: Iterator<Item = String>,
    {
        let mut config = Self::default();

        if let Some(raw) = args.next() {
            match raw.trim().parse::<u16>() {
                Ok(port) => config.port = port,
                Err(err) => {
                    eprintln!(
                        "Warning: invalid port '{}' ({}), using default {}",
                        raw, err, DEFAULT_PORT
                    );
                }
            }
        }

        config
    }

    /// "host:port" string handed to the socket layer
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backoff after a failed `accept()`
    pub fn accept_error_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_error_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn no_argument_uses_default_port() {
        let config = ServerConfig::from_args(args(&[]));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.bind_addr(), "0.0.0.0:5005");
    }

    #[test]
    fn valid_port_argument_is_used() {
        let config = ServerConfig::from_args(args(&["6006"]));
        assert_eq!(config.port, 6006);
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        for bad in ["abc", "70000", "-1", ""] {
            let config = ServerConfig::from_args(args(&[bad]));
            assert_eq!(config.port, DEFAULT_PORT, "argument {:?}", bad);
        }
    }

    #[test]
    fn defaults_point_at_pico_files() {
        let config = ServerConfig::default();
        assert_eq!(config.log_path, PathBuf::from("pico_temps.log"));
        assert_eq!(config.csv_path, PathBuf::from("pico_temps.csv"));
        assert!(config.worker_threads >= 1);
        assert_eq!(config.accept_error_backoff(), Duration::from_millis(100));
    }
}
