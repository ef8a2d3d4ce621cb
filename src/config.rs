use std::{env, path::PathBuf, str::FromStr};

#[derive(Debug, Clone)]
pub struct Config {
    pub logger: LoggerConfig,
    /// Default retry budget applied to outputs that do not configure their
    /// own reconnect settings.
    pub reconnect_retry_max: u32,
    pub reconnect_retry_sec: u32,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// `tracing_subscriber::EnvFilter` directive for stdout.
    pub stdio_level: String,
    pub format: LoggerFormat,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerFormat {
    Pretty,
    Json,
    Compact,
}

impl FromStr for LoggerFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(LoggerFormat::Pretty),
            "json" => Ok(LoggerFormat::Json),
            "compact" => Ok(LoggerFormat::Compact),
            _ => Err("Invalid logger format."),
        }
    }
}

/// Reads configuration from `CASTER_*` environment variables, falling back
/// to defaults for anything unset or unparsable.
pub fn read_config() -> Config {
    try_read_config().expect("Failed to read the config from environment variables")
}

fn try_read_config() -> Result<Config, String> {
    let stdio_level = env::var("CASTER_LOGGER_LEVEL").unwrap_or_else(|_| "info".to_string());

    let format = match env::var("CASTER_LOGGER_FORMAT") {
        Ok(format) => format
            .parse::<LoggerFormat>()
            .map_err(|err| format!("CASTER_LOGGER_FORMAT: {err}"))?,
        Err(_) => LoggerFormat::Compact,
    };

    let log_file = env::var("CASTER_LOG_FILE").ok().map(PathBuf::from);

    let reconnect_retry_max = read_env_number("CASTER_RECONNECT_RETRY_MAX")?.unwrap_or(20);
    let reconnect_retry_sec = read_env_number("CASTER_RECONNECT_RETRY_SEC")?.unwrap_or(2);

    Ok(Config {
        logger: LoggerConfig {
            stdio_level,
            format,
            log_file,
        },
        reconnect_retry_max,
        reconnect_retry_sec,
    })
}

fn read_env_number(name: &str) -> Result<Option<u32>, String> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u32>()
            .map(Some)
            .map_err(|err| format!("{name}: {err}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_format_from_str() {
        assert_eq!("pretty".parse::<LoggerFormat>(), Ok(LoggerFormat::Pretty));
        assert_eq!("json".parse::<LoggerFormat>(), Ok(LoggerFormat::Json));
        assert_eq!("compact".parse::<LoggerFormat>(), Ok(LoggerFormat::Compact));
        assert!("verbose".parse::<LoggerFormat>().is_err());
    }
}
