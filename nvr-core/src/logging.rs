use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level. JSON output is meant for
/// production, pretty output for development; either can go to a file.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let file = config.file_path.as_deref().map(open_log_file).transpose()?;

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_line_number(true);

        match file {
            Some(file) => registry.with(json_layer.with_writer(Arc::new(file))).try_init()?,
            None => registry.with(json_layer).try_init()?,
        }
    } else {
        let pretty_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(false);

        match file {
            Some(file) => registry
                .with(pretty_layer.with_ansi(false).with_writer(Arc::new(file)))
                .try_init()?,
            None => registry.with(pretty_layer).try_init()?,
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

/// Per-packet RTSP and HTTP client chatter stays at `warn` unless the
/// configured level is more verbose than `debug`.
fn default_directives(level: Level) -> String {
    if level == Level::TRACE {
        return level.to_string();
    }
    let dependency = if level < Level::WARN { level } else { Level::WARN };
    format!("{level},retina={dependency},hyper={dependency},reqwest={dependency}")
}

/// Parse log level string to tracing Level
pub fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("error").unwrap(), Level::ERROR);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_default_directives_quiet_dependencies() {
        assert_eq!(
            default_directives(Level::INFO),
            "INFO,retina=WARN,hyper=WARN,reqwest=WARN"
        );
        assert_eq!(
            default_directives(Level::ERROR),
            "ERROR,retina=ERROR,hyper=ERROR,reqwest=ERROR"
        );
        assert_eq!(default_directives(Level::TRACE), "TRACE");
    }

    #[test]
    fn test_open_log_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/nested/nvr.log");
        let file = open_log_file(path.to_str().unwrap());
        assert!(file.is_ok());
        assert!(path.exists());
    }
}
