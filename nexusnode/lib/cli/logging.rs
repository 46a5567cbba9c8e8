use std::path::Path;

use nexusutils::{RotatingLog, LOG_SUFFIX};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{config::DAEMON_LOG_PREFIX, NexusResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Installs the global tracing subscriber.
///
/// Events go to stderr and, when `log_dir` is given, to a rotating daemon log in it. `RUST_LOG`
/// overrides the default filter. Keep the returned guard alive until exit so buffered lines
/// reach the file.
pub async fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> NexusResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "info,nexusnode=debug,nexusutils=debug"
        } else {
            "info,sqlx=warn"
        })
    });

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    };

    tokio::fs::create_dir_all(log_dir).await?;
    let log_path = log_dir.join(format!("{}.{}", DAEMON_LOG_PREFIX, LOG_SUFFIX));
    let daemon_log = RotatingLog::new(&log_path).await?;
    let (writer, guard) = tracing_appender::non_blocking(daemon_log.get_sync_writer());
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    tracing::debug!(path = %log_path.display(), "daemon log opened");
    Ok(Some(guard))
}
