use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Install the global subscriber
///
/// `RUST_LOG` directives apply on top of the default level, which is INFO, or
/// DEBUG when `verbose` is set.
pub(crate) fn init(verbose: bool) -> eyre::Result<()> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(true)
        .try_init()
        .map_err(|e| eyre::eyre!("failed to install logger: {e}"))
}
