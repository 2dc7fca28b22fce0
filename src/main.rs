// Usage: pico_temp_server [port]
//
// Listens on 0.0.0.0:<port> (default 5005) for newline-delimited JSON from
// Pico W sensors, acks every line and appends it to pico_temps.log and
// pico_temps.csv in the working directory.

use std::process::ExitCode;

use pico_temp_server::{ServerConfig, start_server};

fn main() -> ExitCode {
    let config = ServerConfig::from_args(std::env::args().skip(1));

    match start_server(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Server execution failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
