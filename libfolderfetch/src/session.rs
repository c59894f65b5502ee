use crate::errors::FetchError;
use reqwest::cookie::Jar;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use url::Url;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Reads a JSON array of `{"name": .., "value": ..}` objects, the format
/// browser cookie export extensions produce.
pub async fn load_cookies(path: &Path) -> Result<Vec<Cookie>, FetchError> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::error!("Cookie file not found: {}", path.display());
            return Err(FetchError::CookieFileNotFound(
                path.to_string_lossy().to_string(),
            ));
        }
        Err(e) => {
            tracing::error!("Error loading cookies from {}: {}", path.display(), e);
            return Err(FetchError::InvalidCookieFile {
                path: path.to_string_lossy().to_string(),
                message: format!("{} | {}", e, e.kind()),
            });
        }
    };
    serde_json::from_str::<Vec<Cookie>>(&content).map_err(|e| {
        tracing::error!("Error loading cookies from {}: {}", path.display(), e);
        FetchError::InvalidCookieFile {
            path: path.to_string_lossy().to_string(),
            message: e.to_string(),
        }
    })
}

/// An authenticated client shared by every worker of a crawl, along with the
/// bookkeeping that keeps a crawl from processing the same file or folder twice.
#[derive(Debug)]
pub struct Session {
    pub client: Client,
    /// Url whose host the cookies are scoped to.
    pub scope: Url,
    cookies: Vec<Cookie>,
    /// Url string and destination directory of every file handed to a worker
    processed_files: RwLock<HashSet<(String, PathBuf)>>,
    /// Url strings of all folders crawled so far
    visited_folders: RwLock<HashSet<String>>,
    /// Destination files a worker has started writing
    claimed_paths: RwLock<HashSet<PathBuf>>,
}

impl Session {
    pub fn new(
        cookies: &[Cookie],
        scope: &Url,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, FetchError> {
        let mut builder = Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Self::from_builder(builder, cookies, scope)
    }

    /// Registers every cookie on `scope`'s host and finishes `builder`.
    pub fn from_builder(
        builder: ClientBuilder,
        cookies: &[Cookie],
        scope: &Url,
    ) -> Result<Self, FetchError> {
        let jar = Jar::default();
        for cookie in cookies {
            jar.add_cookie_str(&format!("{}={}; Path=/", cookie.name, cookie.value), scope);
        }
        let client = builder
            .user_agent(USER_AGENT)
            .cookie_provider(Arc::new(jar))
            .build()
            .map_err(|e| {
                tracing::error!("Failed to build http client\nError : {}", e);
                FetchError::ClientBuild(e.to_string())
            })?;
        tracing::debug!("Session created with {} cookie(s) for {}", cookies.len(), scope);
        Ok(Session {
            client,
            scope: scope.clone(),
            cookies: cookies.to_vec(),
            processed_files: Default::default(),
            visited_folders: Default::default(),
            claimed_paths: Default::default(),
        })
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Returns false if the pair was already handed out during this crawl.
    pub async fn claim_file(&self, link: &Url, destination_dir: &Path) -> bool {
        self.processed_files
            .write()
            .await
            .insert((link.to_string(), destination_dir.to_path_buf()))
    }

    /// Returns false if the folder was already crawled.
    pub async fn claim_folder(&self, link: &Url) -> bool {
        self.visited_folders.write().await.insert(link.to_string())
    }

    /// Returns false if another download of this crawl already writes to
    /// `dest_path`. Different links can resolve to the same file name.
    pub async fn claim_path(&self, dest_path: &Path) -> bool {
        self.claimed_paths
            .write()
            .await
            .insert(dest_path.to_path_buf())
    }
}
