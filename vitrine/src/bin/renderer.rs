//! The isolated renderer process.
//!
//! Launched by the host with its control port and shared secret in the
//! environment. Runs the control service's single-threaded event loop
//! until the host terminates it; the supervisor's SIGTERM grace period is
//! the shutdown contract.

use std::process::ExitCode;

use vitrine::config::ServiceConfig;
use vitrine::renderer::{pattern_factory, RendererService};

fn main() -> ExitCode {
    vitrine::init_tracing();

    let config = ServiceConfig::from_env();
    let mut service = match RendererService::bind(config, pattern_factory()) {
        Ok(service) => service,
        Err(error) => {
            eprintln!("vitrine-renderer: {error}");
            return ExitCode::FAILURE;
        }
    };

    match service.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("vitrine-renderer: {error}");
            ExitCode::FAILURE
        }
    }
}
