use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;
use crate::error::{ConfigError, Result};

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// level. Keep the returned guard alive for as long as logs should flush.
pub fn init(settings: &LoggingSettings, debug: bool) -> Result<Option<WorkerGuard>> {
    let level = if debug { "debug" } else { settings.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("egress={level}")));

    let (writer, guard) = match &settings.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| ConfigError::Validation("logging.file has no file name".into()))?;
            fs::create_dir_all(dir)?;
            let (nb, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            (BoxMakeWriter::new(nb), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(settings.file.is_none());
    let installed = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ConfigError::Validation(format!("logging already initialized: {e}")))?;

    Ok(guard)
}
