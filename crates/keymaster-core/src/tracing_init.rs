//! Logging setup for the Keymaster binaries.
//!
//! The agent and the server share their library crates, so the default
//! filter enables every Keymaster crate at the requested level. Dependencies
//! such as `sqlx`, `hyper` and `reqwest` stay at `warn` unless `RUST_LOG`
//! says otherwise.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose events follow `--log-level`.
const KEYMASTER_TARGETS: [&str; 4] = [
    "keymaster_core",
    "keymaster_crypto",
    "keymaster_gatekeeper",
    "keymaster_server",
];

/// Filter directives for `level`, e.g. `"warn,keymaster_core=debug,..."`.
pub fn default_filter(level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(KEYMASTER_TARGETS.iter().map(|t| format!("{t}={level}")));
    directives.join(",")
}

/// Install the global subscriber.
///
/// `RUST_LOG` replaces the default filter entirely when it is set and valid.
pub fn init_tracing(level: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(log_json.then(|| fmt::layer().json()))
        .with((!log_json).then(fmt::layer))
        .init();
}
