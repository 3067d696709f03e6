use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for file logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub max_files: usize,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
    pub enable_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            max_files: 30, // Keep 30 days of logs
            enable_console: true,
            enable_file: true,
            log_level: Level::INFO,
            enable_json: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(log_dir: &str, log_level: &str, enable_json: bool) -> Self {
        Self {
            log_dir: log_dir.to_string(),
            log_level: Level::from_str(log_level).unwrap_or(Level::INFO),
            enable_json,
            ..Default::default()
        }
    }
}

/// Installs the global subscriber: console output plus daily-rolled
/// `error.log` and `storefront-sync.log` files. The returned guards flush the
/// file writers and must be held until the process exits.
pub fn init_logging(
    config: Option<LoggingConfig>,
) -> Result<Vec<WorkerGuard>, Box<dyn std::error::Error>> {
    let config = config.unwrap_or_default();
    let mut guards = Vec::new();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.log_level.to_string().to_lowercase();
        EnvFilter::new(format!(
            "storefront_sync={level},tower_http={level},sqlx=warn,redis=warn,reqwest=warn"
        ))
    });

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

    if config.enable_console {
        let console_layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(!config.enable_json);
        if config.enable_json {
            layers.push(Box::new(console_layer.json()));
        } else {
            layers.push(Box::new(console_layer));
        }
    }

    if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;
        if let Err(e) = cleanup_old_logs(&config.log_dir, config.max_files) {
            eprintln!("Failed to clean up old logs in {}: {}", config.log_dir, e);
        }

        let error_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "error.log");
        let (error_writer, error_guard) = tracing_appender::non_blocking(error_appender);
        guards.push(error_guard);

        let all_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "storefront-sync.log");
        let (all_writer, all_guard) = tracing_appender::non_blocking(all_appender);
        guards.push(all_guard);

        let error_layer = fmt::layer()
            .with_writer(error_writer)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(tracing_subscriber::filter::LevelFilter::ERROR);
        layers.push(Box::new(error_layer));

        let all_layer = fmt::layer()
            .with_writer(all_writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false);
        if config.enable_json {
            layers.push(Box::new(all_layer.json()));
        } else {
            layers.push(Box::new(all_layer));
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    Ok(guards)
}

/// Removes the oldest `.log` files beyond `max_files`. Returns how many were
/// deleted.
pub fn cleanup_old_logs(log_dir: &str, max_files: usize) -> std::io::Result<usize> {
    let log_path = Path::new(log_dir);
    if !log_path.exists() {
        return Ok(0);
    }

    let mut log_files: Vec<_> = fs::read_dir(log_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.contains(".log"))
                .unwrap_or(false)
        })
        .collect();

    if log_files.len() <= max_files {
        return Ok(0);
    }

    // Oldest first
    log_files.sort_by_key(|entry| {
        entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });

    let excess = log_files.len() - max_files;
    let mut removed = 0;
    for entry in log_files.iter().take(excess) {
        if fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
