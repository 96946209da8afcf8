//! Tracing subscriber set-up.
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber.
///
/// The filter starts from `RUST_LOG` (or `info` when unset) and then applies
/// the comma separated `directives`, e.g. `"trade_engine::task=debug"`.
pub fn init_logging(directives: Option<&str>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(directives))
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Idempotent variant for tests; later calls are no-ops.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(None))
        .with_test_writer()
        .try_init();
}

fn build_filter(directives: Option<&str>) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(custom) = directives {
        for directive in custom.split(',').filter(|d| !d.trim().is_empty()) {
            match directive.trim().parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("ignoring invalid log directive '{directive}': {e}"),
            }
        }
    }
    filter
}
