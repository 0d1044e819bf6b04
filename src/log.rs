//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: failures that stop a request from being handled at all
//! - WARN: rejected transitions, discarded results, worker panics
//! - INFO: request submitted / finished, startup and shutdown
//! - DEBUG: task transitions, dispatch decisions, retry scheduling
//! - TRACE: worker payloads and event fan-out
//!
//! Debug mode can be enabled with the `--debug` flag or `SWITCHBOARD_DEBUG=1`.
//! An explicit `RUST_LOG` always wins.

use tracing_subscriber::EnvFilter;

/// Environment switch for debug logging.
pub const DEBUG_ENV: &str = "SWITCHBOARD_DEBUG";

/// Initialize logging with explicit debug mode setting.
///
/// Logs go to stderr so that stdout stays reserved for responses.
/// Calling this twice is harmless.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "switchboard=debug,info"
    } else {
        "warn"
    }
}
