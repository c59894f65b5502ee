use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "libfolderfetch=info,folderfetch=info";
const LOG_DIRECTORY_NAME: &str = "logs";

/// Log destinations of one crawl: the console and a timestamped file under
/// `<base>/logs`. Events are only flushed to the file while this is alive.
pub struct RunLog {
    pub dispatch: Dispatch,
    pub file: PathBuf,
    _guard: WorkerGuard,
}

pub fn log_file_name(ref_id: &str, time: DateTime<Local>) -> String {
    format!("download_ref{}_{}.log", ref_id, time.format("%Y%m%d_%H%M%S"))
}

pub fn run_log(base_dir: &Path, ref_id: &str) -> std::io::Result<RunLog> {
    let log_dir = base_dir.join(LOG_DIRECTORY_NAME);
    std::fs::create_dir_all(&log_dir)?;
    let file_name = log_file_name(ref_id, Local::now());
    let f_appender = tracing_appender::rolling::never(&log_dir, &file_name);
    let (non_blk, guard) = tracing_appender::non_blocking(f_appender);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(non_blk));
    Ok(RunLog {
        dispatch: Dispatch::new(subscriber),
        file: log_dir.join(file_name),
        _guard: guard,
    })
}
