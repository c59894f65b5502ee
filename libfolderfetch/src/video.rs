use crate::errors::FetchError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;

pub const DEFAULT_TRANSCODER: &str = "ffmpeg";
pub const DEFAULT_TARGET_FPS: u32 = 1;

/// Re-encodes downloaded videos to a fixed frame rate with an external
/// transcoder. Lecture recordings are mostly slides, one frame per second
/// keeps them readable at a fraction of the size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoNormalizer {
    /// Transcoder executable, looked up on `PATH` when not absolute
    pub program: PathBuf,
    pub target_fps: u32,
}

impl Default for VideoNormalizer {
    fn default() -> Self {
        VideoNormalizer {
            program: PathBuf::from(DEFAULT_TRANSCODER),
            target_fps: DEFAULT_TARGET_FPS,
        }
    }
}

impl VideoNormalizer {
    /// The sibling file the transcoder writes to, `temp_<stem><suffix>`.
    pub fn temp_output_path(file_path: &Path) -> PathBuf {
        let stem = file_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let suffix = file_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        file_path.with_file_name(format!("temp_{stem}{suffix}"))
    }

    pub fn args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        vec![
            "-i".into(),
            input.as_os_str().to_owned(),
            "-filter:v".into(),
            format!("fps={}", self.target_fps).into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "fast".into(),
            "-c:a".into(),
            "copy".into(),
            "-y".into(),
            output.as_os_str().to_owned(),
        ]
    }

    /// Replaces `file_path` with its re-encoded version. On failure the
    /// original is left untouched and no temporary output remains.
    #[tracing::instrument(skip(self), fields(program = %self.program.display()))]
    pub async fn normalize(&self, file_path: &Path) -> Result<(), FetchError> {
        let temp_path = Self::temp_output_path(file_path);
        tracing::info!("Processing video: {}", file_path.display());
        tracing::info!("Converting to {} FPS...", self.target_fps);

        let output = match Command::new(&self.program)
            .args(self.args(file_path, &temp_path))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                remove_temp_output(&temp_path).await;
                let message = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("transcoder {} not found", self.program.display())
                } else {
                    format!("failed to start transcoder. {} | {}", e, e.kind())
                };
                tracing::error!("Error processing video {}: {}", file_path.display(), message);
                return Err(FetchError::TranscodeFailure {
                    file_name: file_path.to_string_lossy().to_string(),
                    message,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("Error processing video: {}", stderr.trim());
            remove_temp_output(&temp_path).await;
            return Err(FetchError::TranscodeFailure {
                file_name: file_path.to_string_lossy().to_string(),
                message: match output.status.code() {
                    Some(code) => format!("transcoder failed with return code {code}"),
                    None => "transcoder was terminated by a signal".to_string(),
                },
            });
        }

        if let Err(e) = fs::rename(&temp_path, file_path).await {
            tracing::error!(
                "Error replacing {} with transcoded output\nError : {}",
                file_path.display(),
                e
            );
            remove_temp_output(&temp_path).await;
            return Err(FetchError::file_operation(
                file_path.to_string_lossy(),
                &e,
            ));
        }
        tracing::info!("Video processing completed successfully");
        Ok(())
    }
}

async fn remove_temp_output(temp_path: &Path) {
    match fs::remove_file(temp_path).await {
        Ok(_) => tracing::debug!("Removed partial output {}", temp_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            "Failed to remove partial output {}\nError : {}",
            temp_path.display(),
            e
        ),
    }
}
