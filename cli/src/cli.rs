use crate::logging::run_log;
use clap::{Parser, ValueEnum};
use libfolderfetch::{
    format_elapsed, load_cookies, ref_id_from_url, run_crawl, CrawlReport, DownloadRule,
    Cookie, FailureCategory, FetchError, Update, VideoMode, VideoNormalizer,
};
use owo_colors::{OwoColorize, Stream::Stdout};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::channel;
use tracing::instrument::WithSubscriber;
use url::Url;

const PROGRESS_UPDATE_INTERVAL: u64 = 1000;
const MAX_BUFFER_SIZE: usize = 100;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VideoModeArg {
    /// Re-encode videos to the target frame rate
    Reencode,
    /// Keep videos as downloaded
    Keep,
    /// Do not keep videos at all
    Skip,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Download files from ILIAS platform",
    long_about = "Recursively downloads every file of an ILIAS course or folder, \
    authenticated with the cookies of a logged in browser session."
)]
pub struct Cli {
    #[arg(help = "ILIAS module URL")]
    url: Url,
    #[arg(short, long, default_value = "downloads", help = "Download directory")]
    directory: PathBuf,
    #[arg(
        short,
        long,
        default_value = "cookies.json",
        help = "Path to JSON file containing cookies"
    )]
    cookies: PathBuf,
    #[arg(
        short,
        long,
        value_parser = parse_size_mb,
        help = "Maximum file size in MB (e.g., 100.5)"
    )]
    max_size: Option<f64>,
    #[arg(short, long, help = "Overwrite existing files (default: skip existing)")]
    overwrite: bool,
    #[arg(
        short,
        long,
        default_value_t = 3,
        value_parser = clap::value_parser!(u16).range(1..),
        help = "Number of parallel downloads per folder"
    )]
    workers: u16,
    #[arg(long, value_enum, default_value_t = VideoModeArg::Reencode)]
    video_mode: VideoModeArg,
    #[arg(
        long,
        conflicts_with = "video_mode",
        help = "Keep original video FPS (same as --video-mode keep)"
    )]
    keep_video_fps: bool,
    #[arg(long, default_value_t = 3, help = "Attempts per file on network errors")]
    retries: u32,
    #[arg(long, default_value = "ffmpeg", help = "Transcoder used to re-encode videos")]
    ffmpeg: PathBuf,
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Frame rate videos are re-encoded to"
    )]
    target_fps: u32,
    #[arg(long, default_value_t = 32, help = "Maximum folder nesting to descend into")]
    max_depth: usize,
    #[arg(long, help = "Recreate the folder structure instead of one flat directory")]
    mirror_folders: bool,
    #[arg(long, help = "Connect timeout in seconds")]
    connect_timeout: Option<u64>,
}

impl Cli {
    fn video_mode(&self) -> VideoMode {
        if self.keep_video_fps {
            return VideoMode::Keep;
        }
        match self.video_mode {
            VideoModeArg::Reencode => VideoMode::Reencode,
            VideoModeArg::Keep => VideoMode::Keep,
            VideoModeArg::Skip => VideoMode::Skip,
        }
    }

    pub fn rule(&self) -> DownloadRule {
        DownloadRule {
            max_size_bytes: self.max_size.map(mb_to_bytes),
            overwrite: self.overwrite,
            max_workers: self.workers as usize,
            video_mode: self.video_mode(),
            normalizer: VideoNormalizer {
                program: self.ffmpeg.clone(),
                target_fps: self.target_fps,
            },
            retries: self.retries,
            max_depth: self.max_depth,
            mirror_folders: self.mirror_folders,
            connect_timeout: self.connect_timeout.map(Duration::from_secs),
            progress_update_interval: PROGRESS_UPDATE_INTERVAL,
            ..Default::default()
        }
    }
}

fn parse_size_mb(value: &str) -> Result<f64, String> {
    let size: f64 = value
        .parse()
        .map_err(|_| format!("{value} is not a number"))?;
    if !size.is_finite() || size <= 0.0 {
        return Err("max size must be a positive number of megabytes".to_string());
    }
    Ok(size)
}

fn mb_to_bytes(size_mb: f64) -> u64 {
    (size_mb * BYTES_PER_MB) as u64
}

pub async fn download(cli: Cli) {
    let ref_id = ref_id_from_url(&cli.url);
    let log = match run_log(&cli.directory, &ref_id) {
        Ok(l) => l,
        Err(e) => {
            eprintln!(
                "{} {}",
                "Failed to set up logging:".if_supports_color(Stdout, |t| t.red()),
                e
            );
            return;
        }
    };
    println!("Initializing download.... (log: {})", log.file.display());

    async {
        let cookies = match read_cookies(&cli.cookies).await {
            Some(c) => c,
            None => return,
        };

        let (tx, mut rx) = channel::<Update>(MAX_BUFFER_SIZE);
        let rule = cli.rule();
        let link = cli.url.to_string();
        let dest_dir = cli.directory.clone();
        let crawl = tokio::spawn(
            async move { run_crawl(&link, &cookies, &dest_dir, rule, tx).await }
                .with_current_subscriber(),
        );
        while let Some(update) = rx.recv().await {
            print_update(update);
        }
        match crawl.await {
            Ok(Ok(report)) => {
                tracing::info!("Download completed successfully!");
                print_summary(&report);
            }
            Ok(Err(e)) => {
                for line in fatal_diagnostics(&e) {
                    tracing::error!("{}", line);
                }
                println!(
                    "{}",
                    "Download wasn't able to complete".if_supports_color(Stdout, |t| t.red())
                );
            }
            Err(e) => {
                tracing::error!("An unexpected error occurred: {}", e);
                tracing::error!("If this persists, please report this issue with the error details.");
            }
        }
    }
    .with_subscriber(log.dispatch.clone())
    .await;
}

/// Cookies for the crawl, `None` if there are none to authenticate with.
async fn read_cookies(path: &Path) -> Option<Vec<Cookie>> {
    // Load failures are logged by the loader.
    let cookies = load_cookies(path).await.ok()?;
    if cookies.is_empty() {
        tracing::error!("No cookies found in {}", path.display());
        return None;
    }
    tracing::info!("Loaded {} cookie(s) from {}", cookies.len(), path.display());
    Some(cookies)
}

fn print_update(update: Update) {
    match update {
        Update::MessageUpdate(msg) => {
            if msg.is_error {
                println!(
                    "{} | {}",
                    msg.content.if_supports_color(Stdout, |t| t.red()),
                    msg.resource_name
                );
            } else {
                println!(
                    "{} | {}",
                    msg.content.if_supports_color(Stdout, |t| t.yellow()),
                    msg.resource_name
                );
            }
        }
        Update::ProgressUpdate(progress) => {
            if let Some(size) = progress.file_size {
                if progress.bytes_written >= size {
                    println!(
                        "{} {} {} bytes",
                        "[Downloaded]".if_supports_color(Stdout, |t| t.green()),
                        progress.resource_name,
                        size
                    );
                }
            }
        }
    };
}

fn print_summary(report: &CrawlReport) {
    println!(
        "{} in {}",
        "Download completed".if_supports_color(Stdout, |t| t.green()),
        format_elapsed(report.elapsed)
    );
    println!(
        "  {} downloaded ({} bytes), {} already present, {} too large, {} videos skipped",
        report.files_downloaded,
        report.bytes_written,
        report.files_skipped_existing,
        report.files_skipped_size,
        report.files_skipped_video
    );
    println!(
        "  {} folders crawled, {} folders failed",
        report.folders_visited, report.folders_failed
    );
    if report.files_failed > 0 || report.transcode_failures > 0 {
        println!(
            "  {}",
            format!(
                "{} downloads failed, {} videos could not be processed",
                report.files_failed, report.transcode_failures
            )
            .if_supports_color(Stdout, |t| t.red())
        );
    }
}

/// Log lines explaining an error that stopped the whole crawl.
fn fatal_diagnostics(err: &FetchError) -> Vec<String> {
    match err.category() {
        Some(FailureCategory::Dns) => vec![
            format!("Connection error: {err}"),
            "DNS resolution failed. Please check:".to_string(),
            "1. Your internet connection".to_string(),
            "2. VPN connection if required".to_string(),
            "3. The URL is correct".to_string(),
        ],
        Some(FailureCategory::Connection) => vec![
            format!("Connection error: {err}"),
            FailureCategory::Connection.hint().to_string(),
        ],
        Some(FailureCategory::Timeout) => vec![
            "The request timed out. The server is not responding.".to_string(),
            "Try again later or with fewer parallel downloads (-w option)".to_string(),
        ],
        Some(FailureCategory::RedirectLoop) => {
            vec![FailureCategory::RedirectLoop.hint().to_string()]
        }
        Some(category) => vec![
            format!("Network error occurred: {err}"),
            category.hint().to_string(),
        ],
        None => vec![
            format!("An unexpected error occurred: {err}"),
            "If this persists, please report this issue with the error details.".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://ilias.example.com/ilias.php?baseClass=ilrepositorygui&ref_id=5";

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["folderfetch", URL]).unwrap();
        assert_eq!(cli.directory, PathBuf::from("downloads"));
        assert_eq!(cli.cookies, PathBuf::from("cookies.json"));
        let rule = cli.rule();
        assert_eq!(rule.max_size_bytes, None);
        assert!(!rule.overwrite);
        assert_eq!(rule.max_workers, 3);
        assert_eq!(rule.video_mode, VideoMode::Reencode);
        assert_eq!(rule.normalizer, VideoNormalizer::default());
        assert_eq!(rule.retries, 3);
    }

    #[test]
    fn test_options() {
        let cli = Cli::try_parse_from([
            "folderfetch",
            URL,
            "-d",
            "out",
            "-m",
            "1.5",
            "-o",
            "-w",
            "5",
            "--video-mode",
            "skip",
            "--mirror-folders",
        ])
        .unwrap();
        let rule = cli.rule();
        assert_eq!(rule.max_size_bytes, Some(1_572_864));
        assert!(rule.overwrite);
        assert_eq!(rule.max_workers, 5);
        assert_eq!(rule.video_mode, VideoMode::Skip);
        assert!(rule.mirror_folders);
    }

    #[test]
    fn test_keep_video_fps_flag() {
        let cli = Cli::try_parse_from(["folderfetch", URL, "--keep-video-fps"]).unwrap();
        assert_eq!(cli.rule().video_mode, VideoMode::Keep);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Cli::try_parse_from(["folderfetch", URL, "-w", "0"]).is_err());
        assert!(Cli::try_parse_from(["folderfetch", URL, "-m", "-3"]).is_err());
        assert!(Cli::try_parse_from(["folderfetch", URL, "-m", "lots"]).is_err());
        assert!(Cli::try_parse_from(["folderfetch", "not a url"]).is_err());
    }

    #[tokio::test]
    async fn test_read_cookies_rejects_empty_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cookies.json");

        std::fs::write(&path, "[]").unwrap();
        assert_eq!(read_cookies(&path).await, None);

        std::fs::write(&path, r#"[{"name": "PHPSESSID", "value": "abc"}]"#).unwrap();
        let cookies = read_cookies(&path).await.unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "PHPSESSID");

        assert_eq!(read_cookies(&dir.path().join("missing.json")).await, None);
    }

    #[test]
    fn test_fatal_diagnostics() {
        let err = FetchError::NetworkFailure {
            url: URL.to_string(),
            category: FailureCategory::RedirectLoop,
            message: "too many redirects".to_string(),
        };
        assert!(fatal_diagnostics(&err)[0].contains("cookies may have expired"));

        let err = FetchError::NetworkFailure {
            url: URL.to_string(),
            category: FailureCategory::Dns,
            message: "dns error".to_string(),
        };
        let lines = fatal_diagnostics(&err);
        assert_eq!(lines.len(), 5);
        assert!(lines[2].contains("internet connection"));

        let lines = fatal_diagnostics(&FetchError::ErrorCreatingDestinationDirectory("x".into()));
        assert!(lines[0].starts_with("An unexpected error occurred"));
    }
}
