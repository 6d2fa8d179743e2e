//! Process-wide structured logging.
//!
//! Both entry points install a global subscriber whose level can be changed
//! at run time through the returned handle.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Handle used to change the log filter after initialization.
pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(level.into())
}

/// JSON logs to hourly rolling files under `dir`.
pub fn init(dir: &str, level: Level) -> Result<ReloadHandle> {
    let file_appender = RollingFileAppender::new(Rotation::HOURLY, dir, "seqam.log");
    let (filter, handle) = reload::Layer::new(filter_for(level));
    let fmt_layer = fmt::layer()
        .with_writer(file_appender)
        .json()
        .with_current_span(false)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(handle)
}

/// Human-readable logs to stderr, for command-line use.
pub fn init_stdout(level: Level) -> Result<ReloadHandle> {
    let (filter, handle) = reload::Layer::new(filter_for(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;
    Ok(handle)
}

/// Change the level of an installed subscriber.
pub fn set_level(handle: &ReloadHandle, level: Level) -> Result<()> {
    handle.reload(filter_for(level))?;
    tracing::info!(%level, "log level changed");
    Ok(())
}

/// Parse a level name such as `info` or `DEBUG`.
pub fn parse_level(name: &str) -> Result<Level> {
    name.trim()
        .parse::<Level>()
        .map_err(|_| anyhow!("unknown log level \"{name}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level(" WARN ").unwrap(), Level::WARN);
        assert!(parse_level("loud").is_err());
    }
}
