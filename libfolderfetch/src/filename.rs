use phf::phf_map;
use std::path::Path;
use url::Url;

/// Characters that are not allowed in file names on at least one common filesystem.
const FORBIDDEN_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Derives the local file name for a download. The content disposition header
/// wins over the url's last path segment; a missing extension is inferred
/// from the content type. Returns `None` when neither source yields a name.
#[tracing::instrument]
pub fn resolve_filename(
    content_disposition: Option<&str>,
    source_url: &Url,
    content_type: Option<&str>,
) -> Option<String> {
    let mut file_name = filename_from_content_disposition(content_disposition)
        .or_else(|| last_path_segment(source_url))?;

    if Path::new(&file_name).extension().is_none() {
        match content_type.and_then(extension_for_mime) {
            Some(ext) => file_name.push_str(ext),
            None => {
                tracing::warn!(
                    "File extension can not be determined for {}",
                    source_url.to_string()
                );
            }
        }
    }

    let file_name = sanitize_filename(&file_name);
    if file_name == "." || file_name == ".." {
        return None;
    }
    tracing::debug!("File name for {} is {}", source_url, &file_name);
    Some(file_name)
}

/// Extracts the file name from a content disposition header value.
///
/// `filename=` takes precedence over the RFC 5987 `filename*=` form. For the
/// latter, the charset and language prefix is dropped and the value kept as is.
pub fn filename_from_content_disposition(content_disposition: Option<&str>) -> Option<String> {
    let cd = content_disposition?;
    if let Some(idx) = cd.rfind("filename=") {
        return parameter_value(&cd[idx + "filename=".len()..]);
    }
    if let Some(idx) = cd.rfind("filename*=") {
        let val = &cd[idx + "filename*=".len()..];
        let val = match val.rfind("''") {
            Some(quote_idx) => &val[quote_idx + 2..],
            None => val,
        };
        return parameter_value(val);
    }
    None
}

fn parameter_value(raw: &str) -> Option<String> {
    let raw = raw.trim_start();
    let val = if let Some(quoted) = raw.strip_prefix('"') {
        match quoted.find('"') {
            Some(end) => &quoted[..end],
            None => quoted,
        }
    } else {
        raw.split(';').next().unwrap_or("")
    };
    let val = val.trim().trim_matches('"').trim();
    if val.is_empty() {
        None
    } else {
        Some(val.to_string())
    }
}

fn last_path_segment(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Replaces every character that is invalid in a file name with `_`.
pub fn sanitize_filename(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| if FORBIDDEN_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Maps a content type (parameters like charset are ignored) to a file extension.
pub fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    MIME_TYPES.get(mime.as_str()).copied()
}

/// Guesses the media type of a file from its extension.
pub fn guess_mime_type(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_lowercase();
    EXTENSION_MIME_TYPES.get(ext.as_str()).copied()
}

pub fn is_video(file_name: &str) -> bool {
    guess_mime_type(file_name).map_or(false, |mime| mime.starts_with("video/"))
}

static MIME_TYPES: phf::Map<&'static str, &str> = phf_map! {
    "text/html" => ".html",
    "text/plain" => ".txt",
    "text/csv" => ".csv",
    "text/css" => ".css",
    "text/javascript" => ".js",
    "application/javascript" => ".js",
    "application/json" => ".json",
    "application/xml" => ".xml",
    "application/xhtml+xml" => ".xhtml",
    "application/pdf" => ".pdf",
    "application/zip" => ".zip",
    "application/x-zip-compressed" => ".zip",
    "application/x-tar" => ".tar",
    "application/gzip" => ".gz",
    "application/x-7z-compressed" => ".7z",
    "application/msword" => ".doc",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
    "application/vnd.ms-excel" => ".xls",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => ".xlsx",
    "application/vnd.ms-powerpoint" => ".ppt",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation" => ".pptx",
    "application/vnd.oasis.opendocument.text" => ".odt",
    "image/jpeg" => ".jpg",
    "image/png" => ".png",
    "image/gif" => ".gif",
    "image/svg+xml" => ".svg",
    "image/webp" => ".webp",
    "audio/mpeg" => ".mp3",
    "audio/ogg" => ".oga",
    "audio/wav" => ".wav",
    "video/mp4" => ".mp4",
    "video/mpeg" => ".mpeg",
    "video/ogg" => ".ogv",
    "video/webm" => ".webm",
    "video/quicktime" => ".mov",
    "video/x-msvideo" => ".avi",
    "video/x-matroska" => ".mkv",
    "font/otf" => ".otf",
};

static EXTENSION_MIME_TYPES: phf::Map<&'static str, &str> = phf_map! {
    "html" => "text/html",
    "htm" => "text/html",
    "txt" => "text/plain",
    "csv" => "text/csv",
    "pdf" => "application/pdf",
    "zip" => "application/zip",
    "doc" => "application/msword",
    "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "ppt" => "application/vnd.ms-powerpoint",
    "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "xls" => "application/vnd.ms-excel",
    "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "jpg" => "image/jpeg",
    "jpeg" => "image/jpeg",
    "png" => "image/png",
    "gif" => "image/gif",
    "mp3" => "audio/mpeg",
    "wav" => "audio/wav",
    "mp4" => "video/mp4",
    "m4v" => "video/mp4",
    "mpeg" => "video/mpeg",
    "mpg" => "video/mpeg",
    "ogv" => "video/ogg",
    "webm" => "video/webm",
    "mov" => "video/quicktime",
    "avi" => "video/x-msvideo",
    "mkv" => "video/x-matroska",
    "wmv" => "video/x-ms-wmv",
    "flv" => "video/x-flv",
};
