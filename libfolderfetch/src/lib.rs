use crate::crawl::{crawl_folder, CrawlContext};
use chrono::Local;
use lazy_static::lazy_static;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc::Sender;
use tracing::instrument;
use url::Url;

pub use crate::crawl::CrawlReport;
pub use crate::download::{download_file, DownloadOutcome, DownloadTask, SkipReason};
pub use crate::errors::{FailureCategory, FetchError};
pub use crate::filename::{
    extension_for_mime, filename_from_content_disposition, is_video, resolve_filename,
    sanitize_filename,
};
pub use crate::link::{get_item_links, Link, LinkClassifier, LinkKind, PortalLayout};
pub use crate::session::{load_cookies, Cookie, Session};
pub use crate::video::VideoNormalizer;

mod crawl;
mod download;
mod errors;
mod filename;
mod link;
mod session;
#[cfg(test)]
mod test_support;
mod video;

pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_MAX_DEPTH: usize = 32;
const UNKNOWN_REF_ID: &str = "unknown";

lazy_static! {
    static ref ILIAS_LAYOUT: Arc<dyn LinkClassifier> = Arc::new(PortalLayout::ilias());
}

/// What happens to downloaded videos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoMode {
    /// Re-encode to the normalizer's frame rate
    #[default]
    Reencode,
    Keep,
    /// Delete videos once they are identified
    Skip,
}

impl VideoMode {
    pub fn process_videos(&self) -> bool {
        matches!(self, VideoMode::Reencode)
    }

    pub fn skip_videos(&self) -> bool {
        matches!(self, VideoMode::Skip)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRule {
    /// Maximum declared size of a file to download, in bytes
    pub max_size_bytes: Option<u64>,
    pub overwrite: bool,
    /// Parallel downloads per folder
    pub max_workers: usize,
    pub video_mode: VideoMode,
    pub normalizer: VideoNormalizer,
    /// Requests made per file before a transport failure is final
    pub retries: u32,
    pub retry_delay: Duration,
    /// Folders nested deeper than this below the start page are not crawled
    pub max_depth: usize,
    /// Recreate the folder hierarchy instead of collecting all files in one directory
    pub mirror_folders: bool,
    pub connect_timeout: Option<Duration>,
    /// Progress update interval in millisecond
    pub progress_update_interval: u64,
    pub layout: Arc<dyn LinkClassifier>,
}

impl Default for DownloadRule {
    fn default() -> Self {
        DownloadRule {
            max_size_bytes: None,
            overwrite: false,
            max_workers: DEFAULT_MAX_WORKERS,
            video_mode: VideoMode::default(),
            normalizer: VideoNormalizer::default(),
            retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_millis(500),
            max_depth: DEFAULT_MAX_DEPTH,
            mirror_folders: false,
            connect_timeout: None,
            progress_update_interval: 1000,
            layout: ILIAS_LAYOUT.clone(),
        }
    }
}

#[derive(Debug)]
pub enum Update {
    MessageUpdate(Message),
    ProgressUpdate(Progress),
}

#[derive(Debug)]
pub struct Message {
    pub run_id: String,
    pub content: String,
    pub resource_name: String,
    pub is_error: bool,
}

#[derive(Debug)]
pub struct Progress {
    pub bytes_written: u64,
    /// Declared size, or the final size once the download completed
    pub file_size: Option<u64>,
    pub resource_name: String,
    pub run_id: String,
}

/// The `ref_id` query parameter of a module url, `"unknown"` if there is none.
pub fn ref_id_from_url(url: &Url) -> String {
    url.query_pairs()
        .find(|(key, _)| key == "ref_id")
        .map(|(_, value)| sanitize_filename(value.trim()))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN_REF_ID.to_string())
}

/// Directory a crawl of `url` writes its files to.
pub fn run_directory(base_dir: &Path, url: &Url) -> std::path::PathBuf {
    base_dir.join(format!("ref_{}", ref_id_from_url(url)))
}

/// Crawls the folder tree below `link` into `<dest_dir>/ref_<id>`.
#[instrument(skip(cookies, rule, update_tx))]
pub async fn run_crawl(
    link: &str,
    cookies: &[Cookie],
    dest_dir: &Path,
    rule: DownloadRule,
    update_tx: Sender<Update>,
) -> Result<CrawlReport, FetchError> {
    let initial_url = match Url::parse(link) {
        Ok(u) => u,
        Err(_) => return Err(FetchError::InvalidUrl(link.to_string())),
    };
    let session = Session::new(cookies, &initial_url, rule.connect_timeout)?;
    run_crawl_with_session(Arc::new(session), &initial_url, dest_dir, rule, update_tx).await
}

/// Same as [`run_crawl`] with a session built by the caller.
pub async fn run_crawl_with_session(
    session: Arc<Session>,
    initial_url: &Url,
    dest_dir: &Path,
    rule: DownloadRule,
    update_tx: Sender<Update>,
) -> Result<CrawlReport, FetchError> {
    let run_dir = run_directory(dest_dir, initial_url);
    if let Err(e) = fs::create_dir_all(&run_dir).await {
        tracing::error!("Failed to create destination directory\nError : {}", e);
        return Err(FetchError::ErrorCreatingDestinationDirectory(format!(
            "{} : {}",
            run_dir.display(),
            e
        )));
    };

    let start_time = Local::now();
    tracing::info!("Starting download from {}", initial_url);
    tracing::info!("Files will be saved to: {}", run_dir.display());

    let ctx = CrawlContext {
        session,
        rule: Arc::new(rule),
        run_id: format!("ref_{}", ref_id_from_url(initial_url)),
        update_tx,
    };
    let mut report = crawl_folder(&ctx, initial_url.clone(), run_dir, 0).await;

    let duration = Local::now() - start_time;
    report.elapsed = duration.to_std().unwrap_or_default();
    tracing::info!(
        "Download completed in {}",
        format_elapsed(report.elapsed)
    );
    tracing::info!(
        "{} downloaded, {} already present, {} too large, {} videos skipped, {} failed",
        report.files_downloaded,
        report.files_skipped_existing,
        report.files_skipped_size,
        report.files_skipped_video,
        report.files_failed
    );
    Ok(report)
}

/// Formats a duration as `H:MM:SS.mmm`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        elapsed.subsec_millis()
    )
}
