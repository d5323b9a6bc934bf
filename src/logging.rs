use anyhow::Result;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a global subscriber writing to `path`. Embedding applications that
/// already configure tracing should skip this.
pub fn init_logging(path: impl AsRef<Path>) -> Result<()> {
    let log_file = std::sync::Arc::new(std::fs::File::create(path.as_ref())?);
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(log_file)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    info!("logging initialized");
    Ok(())
}
