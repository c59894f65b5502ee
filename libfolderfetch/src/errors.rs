use std::fmt::Formatter;

/// Coarse classification of a failed request, used to pick the log message
/// and the remediation hint shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// The host name could not be resolved.
    Dns,
    /// Connection refused, reset or otherwise not established.
    Connection,
    Timeout,
    /// Too many redirects. Usually a login redirect loop caused by expired cookies.
    RedirectLoop,
    Status(u16),
    /// The connection broke while the response body was being read.
    Body,
    Generic,
}

impl FailureCategory {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_redirect() {
            Self::RedirectLoop
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_connect() {
            if is_dns_error(err) {
                Self::Dns
            } else {
                Self::Connection
            }
        } else if err.is_body() || err.is_decode() {
            Self::Body
        } else {
            Self::Generic
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            Self::Dns => "DNS resolution failed. Check your internet connection, VPN and the URL.",
            Self::Connection => "Could not connect to the server. Check your internet connection.",
            Self::Timeout => "The server is not responding. Try again later or with fewer workers.",
            Self::RedirectLoop => {
                "Too many redirects. The URL might be incorrect or your cookies may have expired."
            }
            Self::Status(401) | Self::Status(403) => {
                "Access denied. Your cookies may have expired, export them again."
            }
            Self::Status(_) => "The server returned an error response.",
            Self::Body => "The connection broke while receiving data.",
            Self::Generic => "Network error. Check your internet connection and try again.",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dns => write!(f, "dns resolution failure"),
            Self::Connection => write!(f, "connection error"),
            Self::Timeout => write!(f, "timeout"),
            Self::RedirectLoop => write!(f, "redirect loop"),
            Self::Status(code) => write!(f, "http status {code}"),
            Self::Body => write!(f, "body read error"),
            Self::Generic => write!(f, "request error"),
        }
    }
}

/// Walks the source chain looking for the resolver's error message. reqwest
/// reports DNS failures as plain connect errors.
fn is_dns_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let msg = e.to_string().to_lowercase();
        if msg.contains("dns error")
            || msg.contains("failed to lookup")
            || msg.contains("failed to resolve")
            || msg.contains("name or service not known")
            || msg.contains("no such host")
        {
            return true;
        }
        current = e.source();
    }
    false
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    InvalidUrl(String),
    ErrorCreatingDestinationDirectory(String),
    /// Parameter is path to directory
    DestinationDirectoryDoesNotExist(String),
    /// parameters are file path, additional error message
    FileOperationError {
        file_name: String,
        message: String,
    },
    NetworkFailure {
        url: String,
        category: FailureCategory,
        message: String,
    },
    HttpError {
        status: u16,
        url: String,
    },
    ParseFailure {
        url: String,
        message: String,
    },
    /// Neither the response headers nor the url carried a usable file name.
    UnresolvableFileName(String),
    TranscodeFailure {
        file_name: String,
        message: String,
    },
    ClientBuild(String),
    CookieFileNotFound(String),
    InvalidCookieFile {
        path: String,
        message: String,
    },
}

impl FetchError {
    pub(crate) fn network(url: &str, err: &reqwest::Error) -> Self {
        FetchError::NetworkFailure {
            url: url.to_string(),
            category: FailureCategory::from_reqwest(err),
            message: err.to_string(),
        }
    }

    pub(crate) fn file_operation(file_name: impl Into<String>, err: &std::io::Error) -> Self {
        FetchError::FileOperationError {
            file_name: file_name.into(),
            message: format!("{} | {}", err, err.kind()),
        }
    }

    /// The failure category for network related errors.
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            FetchError::NetworkFailure { category, .. } => Some(*category),
            FetchError::HttpError { status, .. } => Some(FailureCategory::Status(*status)),
            _ => None,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            FetchError::InvalidUrl(url) => format!("Invalid url received : {url}"),
            FetchError::ErrorCreatingDestinationDirectory(err) => {
                format!("error creating destination directory. {err}")
            }
            FetchError::DestinationDirectoryDoesNotExist(dir) => {
                format!("the provided destination directory {dir}, does not exist.")
            }
            FetchError::FileOperationError { file_name, message } => {
                format!("{message} : {file_name}")
            }
            FetchError::NetworkFailure {
                url,
                category,
                message,
            } => format!("{category} while requesting {url}. {message}"),
            FetchError::HttpError { status, url } => {
                format!("server returned an error response. {url} => {status}")
            }
            FetchError::ParseFailure { url, message } => {
                format!("error processing page content from {url}. {message}")
            }
            FetchError::UnresolvableFileName(url) => {
                format!("file name can't be determined for {url}")
            }
            FetchError::TranscodeFailure { file_name, message } => {
                format!("error processing video {file_name}. {message}")
            }
            FetchError::ClientBuild(err) => format!("error building http client. {err}"),
            FetchError::CookieFileNotFound(path) => format!("Cookie file not found: {path}"),
            FetchError::InvalidCookieFile { path, message } => {
                format!("Error loading cookies from {path}: {message}")
            }
        };
        write!(f, "{str}")
    }
}

impl std::error::Error for FetchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapper(Box<dyn std::error::Error + 'static>);

    impl std::fmt::Display for Wrapper {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            write!(f, "error trying to connect")
        }
    }

    impl std::error::Error for Wrapper {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(self.0.as_ref())
        }
    }

    #[test]
    fn test_dns_error_found_in_source_chain() {
        let inner: Box<dyn std::error::Error> =
            "dns error: failed to lookup address information".into();
        let err = Wrapper(inner);
        assert!(is_dns_error(&err));

        let inner: Box<dyn std::error::Error> = "connection refused".into();
        assert!(!is_dns_error(&Wrapper(inner)));
    }

    #[test]
    fn test_category_of_http_error() {
        let err = FetchError::HttpError {
            status: 403,
            url: "https://example.com".into(),
        };
        assert_eq!(err.category(), Some(FailureCategory::Status(403)));
        assert!(err.category().unwrap().hint().contains("cookies"));
        assert_eq!(FetchError::InvalidUrl("x".into()).category(), None);
    }
}
