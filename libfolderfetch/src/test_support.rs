//! Helpers shared by the unit tests: an in-process portal server and a rule
//! tuned for fast, proxy-free local requests.

use crate::link::PortalLayout;
use crate::session::Session;
use crate::DownloadRule;
use axum::Router;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

pub(crate) async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub(crate) fn test_session(scope: &Url) -> Arc<Session> {
    Arc::new(Session::from_builder(Client::builder().no_proxy(), &[], scope).unwrap())
}

pub(crate) fn test_layout() -> PortalLayout {
    PortalLayout {
        item_selector: "a.item[href]".to_string(),
        file_marker: "/files/".to_string(),
        folder_marker: "/folders/".to_string(),
    }
}

pub(crate) fn test_rule() -> DownloadRule {
    DownloadRule {
        retry_delay: Duration::ZERO,
        layout: Arc::new(test_layout()),
        ..Default::default()
    }
}

/// A folder page listing `(href, title)` items for [`test_layout`].
pub(crate) fn item_page(items: &[(&str, &str)]) -> String {
    let anchors: String = items
        .iter()
        .map(|(href, title)| format!(r#"<div><a class="item" href="{href}">{title}</a></div>"#))
        .collect();
    format!("<html><body><h1>Folder</h1>{anchors}<a href=\"/files/not-an-item.txt\">x</a></body></html>")
}
