use crate::errors::FetchError;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::fmt::Debug;
use tracing::{event, instrument, Level};
use url::{ParseError, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    File,
    Folder,
    Unrecognized,
}

/// An item anchor found on a folder page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: Url,
    /// Text content of the anchor, used to name mirrored folders
    pub title: String,
    pub kind: LinkKind,
}

/// Knows how a portal marks up its folder listings. Everything specific to a
/// portal's routing scheme lives behind this trait.
pub trait LinkClassifier: Debug + Send + Sync {
    /// CSS selector matching the item anchors of a folder page.
    fn item_selector(&self) -> &str;
    fn classify(&self, url: &Url) -> LinkKind;
}

/// Classifies links by marker substrings in their absolute url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalLayout {
    pub item_selector: String,
    pub file_marker: String,
    pub folder_marker: String,
}

impl PortalLayout {
    /// ILIAS repository pages. Item titles carry `il_ContainerItemTitle`,
    /// files are reached through `goto.php` and folders through the repository gui.
    pub fn ilias() -> Self {
        PortalLayout {
            item_selector: "a.il_ContainerItemTitle[href]".to_string(),
            file_marker: "goto.php?target=file_".to_string(),
            folder_marker: "ilias.php?baseClass=ilrepositorygui".to_string(),
        }
    }
}

impl Default for PortalLayout {
    fn default() -> Self {
        Self::ilias()
    }
}

impl LinkClassifier for PortalLayout {
    fn item_selector(&self) -> &str {
        &self.item_selector
    }

    fn classify(&self, url: &Url) -> LinkKind {
        let link = url.as_str();
        if link.contains(&self.file_marker) {
            LinkKind::File
        } else if link.contains(&self.folder_marker) {
            LinkKind::Folder
        } else {
            LinkKind::Unrecognized
        }
    }
}

#[instrument]
/// Get the full link to a sub-page or file, given a page's full url.
fn get_full_link(link: &str, page_url: &Url) -> Option<Url> {
    if link.is_empty() {
        return None;
    }
    match Url::parse(link) {
        Ok(url) => Some(url),
        Err(e)
            if e == ParseError::EmptyHost
                || e == ParseError::RelativeUrlWithoutBase
                || e == ParseError::RelativeUrlWithCannotBeABaseBase =>
        {
            match page_url.join(link) {
                Ok(url) => Some(url),
                Err(e) => {
                    event!(Level::ERROR, "Failed to join {} onto {}: {}", link, page_url, e);
                    None
                }
            }
        }
        Err(e) => {
            event!(Level::ERROR, "Failed to get full link for {}", link);
            event!(Level::ERROR, "{}", e);
            None
        }
    }
}

/// Gets all item anchors of a folder page, resolved against the page's url and
/// classified. Links are returned in document order, each url once.
pub fn get_item_links(
    html_string: &str,
    page_url: &Url,
    classifier: &dyn LinkClassifier,
) -> Result<Vec<Link>, FetchError> {
    let selector = Selector::parse(classifier.item_selector()).map_err(|e| {
        FetchError::ParseFailure {
            url: page_url.to_string(),
            message: format!(
                "invalid item selector {} : {:?}",
                classifier.item_selector(),
                e
            ),
        }
    })?;
    let html_document = Html::parse_document(html_string);
    let mut seen: HashSet<Url> = HashSet::new();
    let mut links = Vec::new();
    for element in html_document.select(&selector) {
        let href = element.value().attr("href").unwrap_or("").trim();
        let Some(url) = get_full_link(href, page_url) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }
        let kind = classifier.classify(&url);
        tracing::debug!("Full link for {} => {} ({:?})", href, &url, kind);
        links.push(Link {
            title: element.text().collect::<String>().trim().to_string(),
            url,
            kind,
        });
    }
    Ok(links)
}
