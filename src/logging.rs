//! Log subscriber setup for binaries.

use tracing_subscriber::filter::EnvFilter;

/// How log lines are rendered on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Returns false when a subscriber was already installed, which happens when tests share a
/// process.
pub fn init(default_filter: &str, format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => builder.compact().try_init().is_ok(),
        LogFormat::Pretty => builder.with_target(false).try_init().is_ok(),
    }
}
