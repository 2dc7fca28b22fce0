// Import local time formatting tools from chrono
use chrono::Local;

// Set the global log level (e.g., Debug, Info, Warn, Error)
use log::LevelFilter;

// Set up the dispatch builder for combining logger outputs
use fern::Dispatch;

// Per-level terminal colors
use fern::colors::{Color, ColoredLevelConfig};

// Standard I/O and filesystem operations (stdout, file creation)
use std::{fs, io};

// Used to initialize a static value only once in a thread-safe way
use std::sync::OnceLock;

use crate::config::LoggerConfig;

/// A simple Logger struct that wraps logging functions.
/// Clonable to allow use across multiple threads/tasks.
///
/// This is the operator-facing diagnostic channel. Received telemetry goes to
/// the data sinks in [`crate::sink`], never through here.
#[derive(Clone, Debug, Default)]
pub struct Logger;

impl Logger {
    /// Logs a message at DEBUG level
    pub fn debug(&self, msg: &str) {
        log::debug!("{}", msg);
    }

    /// Logs a message at INFO level
    pub fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }

    /// Logs a message at WARN level
    pub fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
    }

    /// Logs a message at ERROR level
    pub fn error(&self, msg: &str) {
        log::error!("{}", msg);
    }
}

/// Static global LOGGER instance, initialized once
static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Turn the configured level name into a filter; unknown names mean Debug.
fn parse_level(raw: &str) -> LevelFilter {
    raw.parse::<LevelFilter>().unwrap_or(LevelFilter::Debug)
}

/// Where the diagnostic file for `name` goes: "<log_file_path>/<name>.log"
fn log_file_name(name: &str, cfg: &LoggerConfig) -> String {
    let stem = name.replace('.', "_");
    if cfg.log_file_path.is_empty() {
        format!("{}.log", stem)
    } else {
        format!("{}/{}.log", cfg.log_file_path, stem)
    }
}

/// Initialize the global logger exactly once, according to the provided settings.
/// After this call, all calls to `log::debug!(), info!(), warn!(), error!()` (and your
/// `Logger` methods) will go through the configured fern dispatcher.
pub fn init_logger(name: &str, cfg: &LoggerConfig) -> Logger {
    LOGGER
        .get_or_init(|| {
            // ────────────────────────────────────────────────────────────────
            // 1) Global minimum level
            // ────────────────────────────────────────────────────────────────
            let mut base = Dispatch::new().level(parse_level(&cfg.log_level));

            // ────────────────────────────────────────────────────────────────
            // 2) Console branch: timestamp, name, colored level, message
            // ────────────────────────────────────────────────────────────────
            if cfg.enable_console_log {
                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let colors = ColoredLevelConfig::new()
                    .info(Color::Green)
                    .warn(Color::Yellow)
                    .error(Color::Red)
                    .debug(Color::Blue);

                base = base.chain(
                    Dispatch::new()
                        .format(move |out, message, record| {
                            out.finish(format_args!(
                                "\x1b[92m{}\x1b[0m - \x1b[94m{}\x1b[0m - {} - {}",
                                Local::now().format(&datefmt),
                                nm,
                                colors.color(record.level()),
                                message
                            ))
                        })
                        .chain(io::stdout()),
                );
            }

            // ────────────────────────────────────────────────────────────────
            // 3) File branch: plain text lines in "<log_file_path>/<name>.log"
            // ────────────────────────────────────────────────────────────────
            if cfg.enable_file_log {
                if !cfg.log_file_path.is_empty() {
                    let _ = fs::create_dir_all(&cfg.log_file_path);
                }

                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let filepath = log_file_name(name, cfg);

                // Don't panic on a bad path; fall back to a sink
                let file_output: Box<dyn io::Write + Send> = match fern::log_file(&filepath) {
                    Ok(fh) => Box::new(fh),
                    Err(err) => {
                        eprintln!("Warning: could not open log file {}: {}", filepath, err);
                        Box::new(io::sink())
                    }
                };

                base = base.chain(
                    Dispatch::new()
                        .format(move |out, message, record| {
                            out.finish(format_args!(
                                "{} - {} - {} - {}",
                                Local::now().format(&datefmt),
                                nm,
                                record.level(),
                                message
                            ))
                        })
                        .chain(file_output),
                );
            }

            // ────────────────────────────────────────────────────────────────
            // 4) Install globally. Someone else may already own the `log`
            //    facade (e.g. a test harness); keep going in that case.
            // ────────────────────────────────────────────────────────────────
            if let Err(err) = base.apply() {
                eprintln!("Warning: logger already installed: {}", err);
            }

            Logger
        })
        .clone()
}
