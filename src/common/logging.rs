use anyhow::Context;
use tracing_subscriber::FmtSubscriber;

use crate::settings::LoggingSettings;

/// Installs the global tracing subscriber and redirects `log` records to it.
///
/// # Errors
/// Fails if a global subscriber or logger has already been installed.
pub fn configure(settings: LoggingSettings) -> anyhow::Result<()> {
    let fmt_subscriber = FmtSubscriber::builder()
        .with_ansi(true)
        .with_env_filter(settings.filter)
        .finish();
    tracing::subscriber::set_global_default(fmt_subscriber)
        .context("failed to setup tracing")?;
    tracing_log::LogTracer::init().context("failed to redirect log records")?;
    Ok(())
}
