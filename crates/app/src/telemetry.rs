use tracing_subscriber::{EnvFilter, fmt};

/// Install the global `fmt` subscriber. `RUST_LOG` wins over `--verbose`.
pub(crate) fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_writer(std::io::stderr)
        .try_init();
}
