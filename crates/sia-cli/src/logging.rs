use std::path::{Path, PathBuf};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber: human-readable events on stderr plus an
/// optional JSON stream appended to `json_log`.
///
/// Stdout is reserved for report output, so no log layer writes there.
/// The returned guard must outlive the run or the tail of the JSON stream
/// is lost.
pub fn init(json_log: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(true).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    let appender = json_log.and_then(|path| {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path.file_name()?.to_os_string();
        std::fs::create_dir_all(&dir).ok()?;
        Some(tracing_appender::rolling::never(dir, name))
    });

    match appender {
        Some(file_appender) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            let file = fmt::layer().with_ansi(false).json().with_writer(writer);
            let _ = registry.with(file).try_init();
            tracing::info!(file = ?json_log, "json log stream attached");
            Some(guard)
        }
        None => {
            let _ = registry.try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_does_not_panic() {
        let first = init(None);
        let second = init(None);
        assert!(first.is_none());
        assert!(second.is_none());
    }
}
