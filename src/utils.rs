use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::EnvFilter;

/// Compact formatter, filtered by `RUST_LOG` and defaulting to `info`.
pub fn install_logger() -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}
