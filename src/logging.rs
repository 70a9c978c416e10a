//! tracing subscriber setup. Output goes to stderr: stdout carries the event protocol.
use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. `RUST_LOG` wins over `verbose`.
/// Returns false when a subscriber was already installed elsewhere.
pub fn init_logging(verbose: bool) -> bool {
    if INIT.get().is_some() {
        return false;
    }
    let default = if verbose { "debug" } else { "info" };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_string());
    let env_filter = tracing_subscriber::EnvFilter::new(filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);
    if registry.try_init().is_err() {
        eprintln!("corebridge: logging init skipped (global subscriber already set)");
        return false;
    }
    let _ = INIT.set(());
    true
}
