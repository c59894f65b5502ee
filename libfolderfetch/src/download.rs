use crate::errors::FetchError;
use crate::filename::{is_video, resolve_filename};
use crate::session::Session;
use crate::Update::{MessageUpdate, ProgressUpdate};
use crate::{DownloadRule, Message, Progress, Update};
use reqwest::{header, Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use tokio::time::{sleep, Instant};
use url::Url;

/// Size of the slices the response body is written to disk in.
pub const CHUNK_SIZE: usize = 1024;
const PART_FILE_SUFFIX: &str = ".part";

/// A fully specified unit of work for a download worker.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub session: Arc<Session>,
    pub link: Url,
    pub destination_dir: PathBuf,
    pub max_size_bytes: Option<u64>,
    pub overwrite: bool,
    pub process_videos: bool,
    pub skip_videos: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyExists,
    /// Declared content length and the configured limit, in bytes
    SizeExceeded { size: u64, limit: u64 },
    VideoSkipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    pub link: Url,
    pub success: bool,
    pub bytes_written: u64,
    /// Where the file is (or would have been) stored
    pub file_path: Option<PathBuf>,
    pub skipped_reason: Option<SkipReason>,
    pub error: Option<FetchError>,
}

impl DownloadOutcome {
    fn completed(link: Url, file_path: PathBuf, bytes_written: u64) -> Self {
        DownloadOutcome {
            link,
            success: true,
            bytes_written,
            file_path: Some(file_path),
            skipped_reason: None,
            error: None,
        }
    }

    fn skipped(link: Url, file_path: PathBuf, reason: SkipReason) -> Self {
        DownloadOutcome {
            link,
            // An oversized file was not fetched, every other skip leaves the file accounted for.
            success: !matches!(reason, SkipReason::SizeExceeded { .. }),
            bytes_written: 0,
            file_path: Some(file_path),
            skipped_reason: Some(reason),
            error: None,
        }
    }

    fn failed(link: Url, error: FetchError) -> Self {
        DownloadOutcome {
            link,
            success: false,
            bytes_written: 0,
            file_path: None,
            skipped_reason: None,
            error: Some(error),
        }
    }
}

/// Downloads one file. Every failure is contained in the returned outcome.
#[tracing::instrument(skip_all, fields(url = %task.link))]
pub async fn download_file(
    task: &DownloadTask,
    rule: &DownloadRule,
    run_id: &str,
    update_tx: &Sender<Update>,
) -> DownloadOutcome {
    let link = task.link.clone();
    if !task.destination_dir.exists() {
        tracing::error!("Destination directory does not exist. Aborting...");
        return DownloadOutcome::failed(
            link,
            FetchError::DestinationDirectoryDoesNotExist(
                task.destination_dir.to_string_lossy().to_string(),
            ),
        );
    }

    let mut response =
        match send_with_retry(&task.session.client, &link, rule.retries, rule.retry_delay).await {
            Ok(r) => r,
            Err(e) => {
                send_message(update_tx, run_id, link.as_str(), "Network error", true);
                return DownloadOutcome::failed(link, e);
            }
        };

    if response.status() != StatusCode::OK {
        tracing::error!(
            "Failed to download: {} (Status code: {})",
            link,
            response.status()
        );
        send_message(
            update_tx,
            run_id,
            link.as_str(),
            &format!("Error status code : {}", response.status()),
            true,
        );
        return DownloadOutcome::failed(
            link.clone(),
            FetchError::HttpError {
                status: response.status().as_u16(),
                url: link.to_string(),
            },
        );
    }

    let headers = response.headers();
    let content_disposition = header_value(headers, header::CONTENT_DISPOSITION);
    let content_type = header_value(headers, header::CONTENT_TYPE);
    let f_size = header_value(headers, header::CONTENT_LENGTH).and_then(|s| s.parse::<u64>().ok());

    let f_name = match resolve_filename(content_disposition.as_deref(), &link, content_type.as_deref())
    {
        Some(n) => n,
        None => {
            tracing::warn!("File name can't be determined for {}", link);
            return DownloadOutcome::failed(
                link.clone(),
                FetchError::UnresolvableFileName(link.to_string()),
            );
        }
    };
    let dest_path = task.destination_dir.join(&f_name);

    if !task.overwrite && dest_path.exists() {
        tracing::info!("Skipping existing file: {}", f_name);
        return DownloadOutcome::skipped(link, dest_path, SkipReason::AlreadyExists);
    }

    if let (Some(size), Some(limit)) = (f_size, task.max_size_bytes) {
        if size > limit {
            tracing::warn!(
                "Skipping {}: Size {:.1}MB exceeds limit of {:.1}MB",
                f_name,
                size as f64 / (1024.0 * 1024.0),
                limit as f64 / (1024.0 * 1024.0)
            );
            send_message(update_tx, run_id, &f_name, "File too large, skipped", false);
            return DownloadOutcome::skipped(
                link,
                dest_path,
                SkipReason::SizeExceeded { size, limit },
            );
        }
    }

    if !task.session.claim_path(&dest_path).await {
        tracing::info!("Skipping {}: already downloaded during this crawl", f_name);
        return DownloadOutcome::skipped(link, dest_path, SkipReason::AlreadyExists);
    }

    let part_path = match part_file(&task.destination_dir, &f_name) {
        Ok(p) => p,
        Err(e) => return DownloadOutcome::failed(link, e),
    };
    let bytes_written = match write_body(
        &mut response,
        &part_path,
        &f_name,
        f_size,
        rule.progress_update_interval,
        run_id,
        update_tx,
    )
    .await
    {
        Ok(n) => n,
        Err(e) => {
            remove_partial(part_path);
            send_message(update_tx, run_id, &f_name, "Error downloading file", true);
            return DownloadOutcome::failed(link, e);
        }
    };

    if let Err(e) = part_path.persist(&dest_path) {
        tracing::error!(
            "Error moving {} into place\nError : {} | {}",
            e.path.display(),
            e.error,
            e.error.kind()
        );
        let err = FetchError::file_operation(dest_path.to_string_lossy(), &e.error);
        remove_partial(e.path);
        return DownloadOutcome::failed(link, err);
    }
    tracing::debug!(
        "Download completed for {}, file @ {}",
        &link,
        dest_path.display()
    );

    let mut outcome = DownloadOutcome::completed(link, dest_path.clone(), bytes_written);
    if is_video(&f_name) {
        tracing::info!("Detected video file: {}", f_name);
        if task.skip_videos {
            if let Err(e) = fs::remove_file(&dest_path).await {
                tracing::error!("Error removing video {}\nError : {}", dest_path.display(), e);
                outcome.error = Some(FetchError::file_operation(dest_path.to_string_lossy(), &e));
                return outcome;
            }
            tracing::info!("Skipping video file: {}", f_name);
            outcome.skipped_reason = Some(SkipReason::VideoSkipped);
        } else if task.process_videos {
            if let Err(e) = rule.normalizer.normalize(&dest_path).await {
                tracing::error!("Error processing video {}: {}", dest_path.display(), e);
                send_message(update_tx, run_id, &f_name, "Error processing video", true);
                outcome.error = Some(e);
            }
        }
    }
    outcome
}

/// Sends the request, retrying transport failures until `attempts` requests
/// have been made. Responses with error statuses are returned as they are.
async fn send_with_retry(
    client: &Client,
    link: &Url,
    attempts: u32,
    retry_delay: Duration,
) -> Result<Response, FetchError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match client.get(link.clone()).send().await {
            Ok(r) => return Ok(r),
            Err(e) => {
                if attempt >= attempts {
                    tracing::error!(
                        "Failed to download {} after {} attempts: {}",
                        link,
                        attempts,
                        e
                    );
                    return Err(FetchError::network(link.as_str(), &e));
                }
                tracing::warn!("Attempt {} failed, retrying... ({})", attempt, e);
                if !retry_delay.is_zero() {
                    sleep(retry_delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_body(
    response: &mut Response,
    part_path: &Path,
    f_name: &str,
    f_size: Option<u64>,
    progress_update_interval: u64,
    run_id: &str,
    update_tx: &Sender<Update>,
) -> Result<u64, FetchError> {
    let mut dest_file = match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(part_path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("Error opening/creating file {}", part_path.display());
            tracing::error!("{} | {}", e, e.kind());
            return Err(FetchError::file_operation(part_path.to_string_lossy(), &e));
        }
    };

    let progress_update_interval = Duration::from_millis(progress_update_interval);
    let mut last_update_time = Instant::now() - progress_update_interval;
    let mut bytes_written: u64 = 0;

    loop {
        let bytes = match response.chunk().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Error downloading resource from {}", response.url());
                tracing::error!("{}", e);
                return Err(FetchError::network(response.url().as_str(), &e));
            }
        };
        for piece in bytes.chunks(CHUNK_SIZE) {
            if let Err(e) = dest_file.write_all(piece).await {
                tracing::error!("Error writing to destination file {}", part_path.display());
                tracing::error!("{} | {}", e, e.kind());
                return Err(FetchError::file_operation(part_path.to_string_lossy(), &e));
            }
            bytes_written += piece.len() as u64;
            if Instant::now().duration_since(last_update_time) > progress_update_interval {
                let _ = update_tx.try_send(ProgressUpdate(Progress {
                    bytes_written,
                    file_size: f_size,
                    resource_name: f_name.to_owned(),
                    run_id: run_id.to_owned(),
                }));
                last_update_time = Instant::now();
            }
        }
    }

    if let Err(e) = dest_file.flush().await {
        return Err(FetchError::file_operation(part_path.to_string_lossy(), &e));
    }
    let _ = update_tx.try_send(ProgressUpdate(Progress {
        bytes_written,
        file_size: Some(f_size.unwrap_or(bytes_written)),
        resource_name: f_name.to_owned(),
        run_id: run_id.to_owned(),
    }));
    Ok(bytes_written)
}

fn header_value(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Updates are best effort, a full or closed channel never stalls a worker.
fn send_message(update_tx: &Sender<Update>, run_id: &str, resource: &str, content: &str, is_error: bool) {
    let _ = update_tx.try_send(MessageUpdate(Message {
        run_id: run_id.to_string(),
        content: content.to_string(),
        resource_name: resource.to_string(),
        is_error,
    }));
}

/// Creates an empty, uniquely named `.part` file next to the destination.
/// Concurrent downloads never share one.
fn part_file(dir: &Path, f_name: &str) -> Result<TempPath, FetchError> {
    let prefix = format!(".{f_name}.");
    let temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(PART_FILE_SUFFIX)
        .tempfile_in(dir);
    match temp {
        Ok(f) => Ok(NamedTempFile::into_temp_path(f)),
        Err(e) => {
            tracing::error!("Error creating partial file for {} in {}", f_name, dir.display());
            tracing::error!("{} | {}", e, e.kind());
            Err(FetchError::file_operation(dir.join(f_name).to_string_lossy(), &e))
        }
    }
}

fn remove_partial(part_path: TempPath) {
    let part_display = part_path.display().to_string();
    if let Err(e) = part_path.close() {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove partial file {}\nError : {}", part_display, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, test_rule, test_session};
    use axum::body::Body;
    use axum::http::{header as axum_header, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::channel;

    fn task(session: Arc<Session>, link: Url, dir: &Path) -> DownloadTask {
        DownloadTask {
            session,
            link,
            destination_dir: dir.to_path_buf(),
            max_size_bytes: None,
            overwrite: false,
            process_videos: false,
            skip_videos: false,
        }
    }

    fn file_router(hits: Arc<AtomicUsize>) -> Router {
        let missing_hits = hits.clone();
        Router::new()
            .route(
                "/goto.php",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        (
                            [
                                (axum_header::CONTENT_DISPOSITION, r#"attachment; filename="Week 1: Intro.pdf""#),
                                (axum_header::CONTENT_TYPE, "application/pdf"),
                            ],
                            vec![7u8; 5000],
                        )
                    }
                }),
            )
            .route(
                "/lecture",
                get(|| async {
                    (
                        [(axum_header::CONTENT_TYPE, "video/mp4")],
                        "original video",
                    )
                }),
            )
            .route(
                "/broken",
                get(|| async {
                    let chunks = futures::stream::iter([
                        Ok(vec![1u8; 3000]),
                        Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            "connection lost",
                        )),
                    ])
                    .then(|chunk| async move {
                        if chunk.is_err() {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        chunk
                    });
                    (
                        [(axum_header::CONTENT_DISPOSITION, r#"attachment; filename="broken.bin""#)],
                        Body::from_stream(chunks),
                    )
                }),
            )
            .route(
                "/missing",
                get(move || {
                    let hits = missing_hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        AxumStatus::NOT_FOUND.into_response()
                    }
                }),
            )
    }

    async fn setup() -> (Url, Arc<Session>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = serve(file_router(hits.clone())).await;
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        (base.clone(), test_session(&base), hits)
    }

    #[tokio::test]
    async fn test_download_writes_file() {
        let dir = TempDir::new().unwrap();
        let (base, session, _) = setup().await;
        let (tx, _rx) = channel(100);
        let link = base.join("goto.php?target=file_1_download").unwrap();

        let outcome = download_file(&task(session, link, dir.path()), &test_rule(), "ref_1", &tx).await;

        assert!(outcome.success);
        assert_eq!(outcome.bytes_written, 5000);
        let path = dir.path().join("Week 1_ Intro.pdf");
        assert_eq!(outcome.file_path.as_deref(), Some(path.as_path()));
        assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 5000]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped_unless_overwrite() {
        let dir = TempDir::new().unwrap();
        let (base, session, _) = setup().await;
        let (tx, _rx) = channel(100);
        let link = base.join("goto.php?target=file_1_download").unwrap();
        let path = dir.path().join("Week 1_ Intro.pdf");
        std::fs::write(&path, "old").unwrap();

        let mut t = task(session, link, dir.path());
        let outcome = download_file(&t, &test_rule(), "ref_1", &tx).await;
        assert!(outcome.success);
        assert_eq!(outcome.skipped_reason, Some(SkipReason::AlreadyExists));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");

        t.overwrite = true;
        t.session = test_session(&base);
        let outcome = download_file(&t, &test_rule(), "ref_1", &tx).await;
        assert!(outcome.success);
        assert_eq!(outcome.skipped_reason, None);
        assert_eq!(std::fs::read(&path).unwrap().len(), 5000);
    }

    #[tokio::test]
    async fn test_size_limit_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let (base, session, _) = setup().await;
        let (tx, _rx) = channel(100);
        let link = base.join("goto.php?target=file_1_download").unwrap();

        let mut t = task(session, link, dir.path());
        t.max_size_bytes = Some(4999);
        let outcome = download_file(&t, &test_rule(), "ref_1", &tx).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error, None);
        assert_eq!(
            outcome.skipped_reason,
            Some(SkipReason::SizeExceeded {
                size: 5000,
                limit: 4999
            })
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_same_destination_is_written_once_per_session() {
        let dir = TempDir::new().unwrap();
        let (base, session, hits) = setup().await;
        let (tx, _rx) = channel(100);
        let first = base.join("goto.php?target=file_1_download").unwrap();
        let second = base.join("goto.php?target=file_2_download").unwrap();
        let mut t = task(session, first, dir.path());
        t.overwrite = true;

        let outcome = download_file(&t, &test_rule(), "ref_1", &tx).await;
        assert_eq!(outcome.skipped_reason, None);

        t.link = second;
        let outcome = download_file(&t, &test_rule(), "ref_1", &tx).await;
        assert!(outcome.success);
        assert_eq!(outcome.skipped_reason, Some(SkipReason::AlreadyExists));
        assert_eq!(outcome.bytes_written, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broken_body_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let (base, session, _) = setup().await;
        let (tx, _rx) = channel(100);
        let link = base.join("broken").unwrap();

        let outcome = download_file(&task(session, link, dir.path()), &test_rule(), "ref_1", &tx).await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(FetchError::NetworkFailure { .. })));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_http_error_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let (base, session, hits) = setup().await;
        let (tx, _rx) = channel(100);
        let link = base.join("missing").unwrap();

        let outcome = download_file(&task(session, link.clone(), dir.path()), &test_rule(), "ref_1", &tx).await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.error,
            Some(FetchError::HttpError {
                status: 404,
                url: link.to_string()
            })
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_retries_then_gives_up() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            // Accept and hang up without answering.
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        let (tx, _rx) = channel(100);
        let link = base.join("goto.php?target=file_1_download").unwrap();

        let outcome = download_file(&task(test_session(&base), link, dir.path()), &test_rule(), "ref_1", &tx).await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(FetchError::NetworkFailure { .. })));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_skip_videos_removes_file() {
        let dir = TempDir::new().unwrap();
        let (base, session, _) = setup().await;
        let (tx, _rx) = channel(100);
        let link = base.join("lecture").unwrap();

        let mut t = task(session, link, dir.path());
        t.skip_videos = true;
        let outcome = download_file(&t, &test_rule(), "ref_1", &tx).await;

        assert!(outcome.success);
        assert_eq!(outcome.skipped_reason, Some(SkipReason::VideoSkipped));
        assert!(!dir.path().join("lecture.mp4").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_video_is_normalized_once() {
        use crate::video::tests::{fake_transcoder, transcoder_calls};

        let dir = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let (base, session, _) = setup().await;
        let (tx, _rx) = channel(100);
        let mut rule = test_rule();
        rule.normalizer.program = fake_transcoder(tools.path(), 0);

        let mut t = task(session, base.join("lecture").unwrap(), dir.path());
        t.process_videos = true;
        let outcome = download_file(&t, &rule, "ref_1", &tx).await;

        assert!(outcome.success);
        assert_eq!(outcome.error, None);
        assert_eq!(transcoder_calls(tools.path()).len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lecture.mp4")).unwrap(),
            "transcoded"
        );
        assert!(!dir.path().join("temp_lecture.mp4").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_normalization_keeps_download() {
        use crate::video::tests::{fake_transcoder, transcoder_calls};

        let dir = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let (base, session, _) = setup().await;
        let (tx, _rx) = channel(100);
        let mut rule = test_rule();
        rule.normalizer.program = fake_transcoder(tools.path(), 1);

        let mut t = task(session, base.join("lecture").unwrap(), dir.path());
        t.process_videos = true;
        let outcome = download_file(&t, &rule, "ref_1", &tx).await;

        assert!(outcome.success);
        assert!(matches!(outcome.error, Some(FetchError::TranscodeFailure { .. })));
        assert_eq!(transcoder_calls(tools.path()).len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lecture.mp4")).unwrap(),
            "original video"
        );
        assert!(!dir.path().join("temp_lecture.mp4").exists());
    }
}
