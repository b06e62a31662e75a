use simplelog::*;
use std::fs::OpenOptions;
use std::path::PathBuf;

const RELAY_LOG_LEVEL_ENV: &str = "RELAY_LOG";
const RELAY_LOG_DIR_ENV: &str = "RELAY_LOG_DIR";
const DEFAULT_LOG_DIR: &str = "logs";

pub fn get_relay_log_dir() -> PathBuf {
    match std::env::var(RELAY_LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => PathBuf::from(DEFAULT_LOG_DIR),
    }
}

/// Installs the process-wide logger.
///
/// Terminal output follows `RELAY_LOG` (default `info`). Services also append
/// to `<log dir>/<service_name>.log` at info level.
pub fn init_logging(service_name: &str, is_service: bool) -> std::io::Result<()> {
    let log_level = std::env::var(RELAY_LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    let log_level = log_level.parse().unwrap_or(LevelFilter::Info);

    let config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        log_level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if is_service {
        let log_dir = get_relay_log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(format!("{}.log", service_name)))?;
        loggers.push(WriteLogger::new(LevelFilter::Info, config, log_file));
    }

    CombinedLogger::init(loggers).map_err(|err| std::io::Error::other(err.to_string()))
}
