use crate::download::{download_file, DownloadOutcome, DownloadTask, SkipReason};
use crate::errors::{FailureCategory, FetchError};
use crate::filename::sanitize_filename;
use crate::link::{get_item_links, LinkKind};
use crate::session::Session;
use crate::{DownloadRule, Update};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc::Sender;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::spawn;
use tracing::instrument::WithSubscriber;
use url::Url;

const UNTITLED_FOLDER_NAME: &str = "folder";

/// Aggregated result of a crawl or of one subtree of it.
#[derive(Debug, Default, Clone)]
pub struct CrawlReport {
    pub files_downloaded: usize,
    pub files_skipped_existing: usize,
    pub files_skipped_size: usize,
    pub files_skipped_video: usize,
    pub files_failed: usize,
    /// Files that were downloaded but whose video normalization failed
    pub transcode_failures: usize,
    pub folders_visited: usize,
    pub folders_failed: usize,
    pub bytes_written: u64,
    pub elapsed: Duration,
    pub outcomes: Vec<DownloadOutcome>,
}

impl CrawlReport {
    pub fn record(&mut self, outcome: DownloadOutcome) {
        match (&outcome.skipped_reason, &outcome.error) {
            (Some(SkipReason::AlreadyExists), _) => self.files_skipped_existing += 1,
            (Some(SkipReason::SizeExceeded { .. }), _) => self.files_skipped_size += 1,
            (Some(SkipReason::VideoSkipped), _) => self.files_skipped_video += 1,
            (None, Some(FetchError::TranscodeFailure { .. })) => {
                self.files_downloaded += 1;
                self.transcode_failures += 1;
            }
            (None, Some(_)) => self.files_failed += 1,
            (None, None) => self.files_downloaded += 1,
        }
        self.bytes_written += outcome.bytes_written;
        self.outcomes.push(outcome);
    }

    pub fn merge(&mut self, other: CrawlReport) {
        self.files_downloaded += other.files_downloaded;
        self.files_skipped_existing += other.files_skipped_existing;
        self.files_skipped_size += other.files_skipped_size;
        self.files_skipped_video += other.files_skipped_video;
        self.files_failed += other.files_failed;
        self.transcode_failures += other.transcode_failures;
        self.folders_visited += other.folders_visited;
        self.folders_failed += other.folders_failed;
        self.bytes_written += other.bytes_written;
        self.outcomes.extend(other.outcomes);
    }

    pub fn files_total(&self) -> usize {
        self.outcomes.len()
    }
}

/// Everything a crawl shares between folders and workers.
#[derive(Debug, Clone)]
pub struct CrawlContext {
    pub session: Arc<Session>,
    pub rule: Arc<DownloadRule>,
    pub run_id: String,
    pub update_tx: Sender<Update>,
}

/// Crawls one folder page: its files are handed to a worker pool bounded by
/// `max_workers`, its subfolders are crawled in document order while the
/// pool drains. Returns once every download of this folder has finished.
/// Fetch failures are logged and only cost the affected subtree.
pub fn crawl_folder(
    ctx: &CrawlContext,
    folder_url: Url,
    destination_dir: PathBuf,
    depth: usize,
) -> BoxFuture<'_, CrawlReport> {
    async move {
        let mut report = CrawlReport::default();
        if depth > ctx.rule.max_depth {
            tracing::warn!(
                "Not descending into {}: maximum folder depth {} reached",
                folder_url,
                ctx.rule.max_depth
            );
            return report;
        }
        if !ctx.session.claim_folder(&folder_url).await {
            tracing::debug!("Folder {} already crawled", folder_url);
            return report;
        }
        report.folders_visited += 1;

        let html = match fetch_folder_page(&ctx.session.client, &folder_url).await {
            Ok(h) => h,
            Err(e) => {
                log_folder_error(&folder_url, &e);
                report.folders_failed += 1;
                return report;
            }
        };
        let links = match get_item_links(&html, &folder_url, ctx.rule.layout.as_ref()) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("{}", e);
                Vec::new()
            }
        };

        let pool = Arc::new(Semaphore::new(ctx.rule.max_workers.max(1)));
        let mut dld_tasks: Vec<JoinHandle<DownloadOutcome>> = Vec::new();
        for link in links {
            match link.kind {
                LinkKind::File => {
                    if !ctx.session.claim_file(&link.url, &destination_dir).await {
                        tracing::debug!("File {} already handled", link.url);
                        continue;
                    }
                    tracing::info!("Found file: {}", link.url);
                    let task = DownloadTask {
                        session: ctx.session.clone(),
                        link: link.url,
                        destination_dir: destination_dir.clone(),
                        max_size_bytes: ctx.rule.max_size_bytes,
                        overwrite: ctx.rule.overwrite,
                        process_videos: ctx.rule.video_mode.process_videos(),
                        skip_videos: ctx.rule.video_mode.skip_videos(),
                    };
                    dld_tasks.push(spawn_download(ctx, pool.clone(), task));
                }
                LinkKind::Folder => {
                    tracing::info!("Processing folder: {}", link.url);
                    let sub_dir = if ctx.rule.mirror_folders {
                        let name = match sanitize_filename(&link.title).trim() {
                            "" | "." | ".." => UNTITLED_FOLDER_NAME.to_string(),
                            n => n.to_string(),
                        };
                        let sub_dir = destination_dir.join(name);
                        if let Err(e) = fs::create_dir_all(&sub_dir).await {
                            tracing::error!(
                                "Failed to create directory {}\nError : {}",
                                sub_dir.display(),
                                e
                            );
                            report.folders_failed += 1;
                            continue;
                        }
                        sub_dir
                    } else {
                        destination_dir.clone()
                    };
                    report.merge(crawl_folder(ctx, link.url, sub_dir, depth + 1).await);
                }
                LinkKind::Unrecognized => {
                    tracing::debug!("Ignoring {}", link.url);
                }
            }
        }

        for task in dld_tasks {
            match task.await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    tracing::error!("Download task panicked\nError : {}", e);
                    report.files_failed += 1;
                }
            }
        }
        report
    }
    .boxed()
}

fn spawn_download(
    ctx: &CrawlContext,
    pool: Arc<Semaphore>,
    task: DownloadTask,
) -> JoinHandle<DownloadOutcome> {
    let rule = ctx.rule.clone();
    let run_id = ctx.run_id.clone();
    let update_tx = ctx.update_tx.clone();
    spawn(
        async move {
            // The pool is never closed, so acquiring only waits for a free slot.
            let _permit = pool.acquire_owned().await.ok();
            download_file(&task, &rule, &run_id, &update_tx).await
        }
        .with_current_subscriber(),
    )
}

async fn fetch_folder_page(client: &Client, folder_url: &Url) -> Result<String, FetchError> {
    let response = client
        .get(folder_url.clone())
        .send()
        .await
        .map_err(|e| FetchError::network(folder_url.as_str(), &e))?;
    if !response.status().is_success() {
        return Err(FetchError::HttpError {
            status: response.status().as_u16(),
            url: folder_url.to_string(),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::network(folder_url.as_str(), &e))?;
    match String::from_utf8(bytes.to_vec()) {
        Ok(html) => Ok(html),
        // An unreadable page contributes no links, it does not fail the folder.
        Err(e) => {
            let err = FetchError::ParseFailure {
                url: folder_url.to_string(),
                message: e.to_string(),
            };
            tracing::warn!("{}, treating the page as empty", err);
            Ok(String::new())
        }
    }
}

fn log_folder_error(folder_url: &Url, err: &FetchError) {
    match err {
        FetchError::NetworkFailure {
            category: FailureCategory::Dns,
            message,
            ..
        } => {
            tracing::error!("Connection error while accessing {}: {}", folder_url, message);
            tracing::error!("DNS resolution failed. Please check your internet connection and the URL.");
        }
        FetchError::NetworkFailure {
            category: FailureCategory::Timeout,
            ..
        } => {
            tracing::error!("Timeout while accessing {}. Server is not responding.", folder_url);
        }
        FetchError::NetworkFailure {
            category: FailureCategory::Connection,
            message,
            ..
        } => {
            tracing::error!("Connection error while accessing {}: {}", folder_url, message);
        }
        FetchError::HttpError { status, .. } => {
            tracing::error!("HTTP error occurred while accessing {}: {}", folder_url, status);
        }
        other => {
            tracing::error!("Error accessing {}: {}", folder_url, other);
        }
    }
}
