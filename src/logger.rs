use chrono::Local;
use log::{Metadata, Record};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Logs to stderr through `env_logger` and, optionally, mirrors every
/// record into a run log file.
pub struct DualLogger {
    env_logger: env_logger::Logger,
    file: Option<Mutex<File>>,
}

impl DualLogger {
    pub fn new(env_logger: env_logger::Logger, file: Option<File>) -> Self {
        Self {
            env_logger,
            file: file.map(Mutex::new),
        }
    }

    /// Install the global logger. `RUST_LOG` wins over the default filter;
    /// `debug` lowers the default to debug level.
    pub fn init(debug: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
        let default_filter = if debug { "panostitch=debug" } else { "panostitch=info" };
        let env_logger = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(default_filter),
        )
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Seconds))
        .build();

        let file = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Some(
                    std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?,
                )
            }
            None => None,
        };

        let max_level = env_logger.filter();
        log::set_boxed_logger(Box::new(DualLogger::new(env_logger, file)))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

fn format_line(record: &Record) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!(
        "[{}] {:5} {} - {}",
        timestamp,
        record.level(),
        record.target(),
        record.args()
    )
}

impl log::Log for DualLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.env_logger.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.env_logger.log(record);

            if let Some(ref file) = self.file {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{}", format_line(record));
                }
            }
        }
    }

    fn flush(&self) {
        self.env_logger.flush();
        if let Some(ref file) = self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}
