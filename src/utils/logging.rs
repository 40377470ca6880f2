use chrono::{Local, Utc};
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::SystemTime;

static INIT: Once = Once::new();

/// Number of log files kept in the log directory
const MAX_LOG_FILES: usize = 10;

/// Initialize the logging system at `level` (`error` .. `trace`, or `off`).
///
/// Only the first call has any effect.
pub fn init_logger(level: &str) {
    INIT.call_once(|| {
        // Create log directory if it doesn't exist
        let log_dir = get_log_dir();
        if let Err(e) = fs::create_dir_all(&log_dir) {
            eprintln!("Failed to create log directory: {}", e);
        }

        let log_file = get_log_file_path(&log_dir);
        let filter = level_filter(level);

        let mut builder = Builder::new();
        builder.filter_level(filter).format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });

        match OpenOptions::new().create(true).append(true).open(&log_file) {
            Ok(file) => {
                builder
                    .target(env_logger::Target::Pipe(Box::new(FileAndStdout { file })))
                    .init();

                info!("Logging initialized: {}", log_file.display());
                debug!("Log level: {}", filter);
                info!(
                    "Biometric sentinel starting at {}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S")
                );
            }
            Err(e) => {
                // Fall back to stdout only
                builder.init();
                error!("Failed to open log file, logging to stdout only: {}", e);
            }
        }

        if let Err(e) = clean_old_logs(&log_dir, MAX_LOG_FILES) {
            error!("Failed to clean old logs: {}", e);
        }
    });
}

fn get_log_dir() -> PathBuf {
    env::var("LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

/// Log file path for the current session
fn get_log_file_path(log_dir: &Path) -> PathBuf {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    log_dir.join(format!("sentinel_{}.log", timestamp))
}

/// Parse a configured level name, falling back to `info`
fn level_filter(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or_else(|_| {
        eprintln!("Unknown log level {:?}, using info", level);
        LevelFilter::Info
    })
}

/// Remove all but the `keep` most recently modified `.log` files
fn clean_old_logs(log_dir: &Path, keep: usize) -> std::io::Result<()> {
    let mut log_files: Vec<(SystemTime, PathBuf)> = Vec::new();

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "log") {
            let modified = fs::metadata(&path)?.modified()?;
            log_files.push((modified, path));
        }
    }

    // Newest first; name breaks ties so files written in the same instant keep a stable order
    log_files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    for (_, file) in log_files.iter().skip(keep) {
        debug!("Removing old log file: {}", file.display());
        fs::remove_file(file)?;
    }

    Ok(())
}

/// Custom writer that writes to both a file and stdout
struct FileAndStdout {
    file: File,
}

impl Write for FileAndStdout {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()?;
        self.file.flush()
    }
}
