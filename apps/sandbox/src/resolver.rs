//! Turns a CI run page into a verified, directly downloadable metrics archive.
//!
//! The crawl walks run page → storage gateway listing → `artifacts/` →
//! `*e2e*/` → (`gather-extra/artifacts/`), then appends the archive filename
//! and rewrites the gateway prefix to the public object-storage prefix.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{StatusCode, Url, header::HeaderMap};
use serde::Deserialize;
use thiserror::Error;

use crate::registry::EventSink;

pub const GATEWAY_PREFIX: &str = "https://gcsweb-ci.apps.ci.l2s4.p1.openshiftapps.com";
pub const STORAGE_PREFIX: &str = "https://storage.googleapis.com";
pub const GATEWAY_LINK_TOKEN: &str = "gcsweb";
pub const ARCHIVE_FILE: &str = "metrics/prometheus.tar";
pub const ALTERNATE_ARCHIVE_FILE: &str = "metrics/prometheus-k8s-1.tar";
const ARTIFACTS_SEGMENT: &str = "artifacts";
const GSUTIL_SEGMENT: &str = "gsutil";
const GATHER_EXTRA_SEGMENT: &str = "gather-extra";
const E2E_TOKEN: &str = "e2e";
const ALTERNATE_SNAPSHOT_QUERY: &str = "altsnap";

/// Location and time bounds of one run's metrics snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub archive_url: String,
}

#[derive(Clone, Debug)]
pub struct ResolverSettings {
    /// Public prefix of the storage gateway; listing links are paths under it.
    pub gateway_prefix: String,
    pub storage_prefix: String,
    /// Substring identifying the storage gateway link on a run page.
    pub gateway_link_token: String,
    pub archive_file: String,
    pub alternate_archive_file: String,
    pub timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            gateway_prefix: GATEWAY_PREFIX.to_string(),
            storage_prefix: STORAGE_PREFIX.to_string(),
            gateway_link_token: GATEWAY_LINK_TOKEN.to_string(),
            archive_file: ARCHIVE_FILE.to_string(),
            alternate_archive_file: ALTERNATE_ARCHIVE_FILE.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ResolverSettings {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    fn rewrite_to_storage(&self, url: &str) -> String {
        let internal = format!("{}/gcs", self.gateway_prefix.trim_end_matches('/'));
        url.replace(internal.as_str(), self.storage_prefix.trim_end_matches('/'))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("failed to fetch {url}: {message}")]
    Transport { url: String, message: String },
    #[error("failed to check archive at {url}: returned {status}")]
    Status { url: String, status: u16 },
    #[error("failed to check archive at {url}: no content length returned")]
    MissingLength { url: String },
    #[error("failed to check archive at {url}: invalid content-length {value:?}")]
    InvalidLength { url: String, value: String },
    #[error("failed to check archive at {url}: archive is empty")]
    EmptyArchive { url: String },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid run url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("failed to fetch url {url}: {message}")]
    Unreachable { url: String, message: String },
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("no links found at {url}")]
    NoLinks { url: String },
    #[error("failed to find storage link in {url}")]
    NoStorageLink { url: String },
    #[error("failed to read run timestamp from {url}: {message}")]
    Timestamp { url: String, message: String },
    #[error("failed to find artifacts link in {url}")]
    MissingArtifacts { url: String },
    #[error("failed to find e2e link in {url}")]
    MissingE2e { url: String },
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Unreachable { .. } => "run_unreachable",
            Self::Fetch { .. } => "fetch_failed",
            Self::NoLinks { .. } => "no_links",
            Self::NoStorageLink { .. } => "no_storage_link",
            Self::Timestamp { .. } => "invalid_timestamp",
            Self::MissingArtifacts { .. } => "missing_artifacts",
            Self::MissingE2e { .. } => "missing_e2e",
            Self::Verify(_) => "archive_unverified",
        }
    }
}

/// Finds a verified archive for a run reference.
#[async_trait]
pub trait ArchiveLocator: Send + Sync {
    async fn locate(&self, run_url: &str, sink: &EventSink) -> Result<ArchiveInfo, ResolveError>;
}

#[derive(Deserialize)]
struct RunMarker {
    timestamp: i64,
}

#[derive(Clone, Debug)]
pub struct ArchiveResolver {
    client: reqwest::Client,
    settings: ResolverSettings,
}

impl ArchiveResolver {
    pub fn new(settings: ResolverSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Resolves `run_url` to an archive URL and run bounds without verifying
    /// that the archive itself can be downloaded.
    pub async fn resolve(&self, run_url: &str, sink: &EventSink) -> Result<ArchiveInfo, ResolveError> {
        let base = Url::parse(run_url.trim()).map_err(|error| ResolveError::InvalidUrl {
            url: run_url.to_string(),
            message: error.to_string(),
        })?;

        if self.is_direct_link(&base) {
            let now = Utc::now();
            return Ok(ArchiveInfo {
                started: now,
                finished: now,
                archive_url: self.settings.rewrite_to_storage(base.as_str()),
            });
        }

        self.ensure_reachable(&base).await?;

        let run_links = self.fetch_links(&base, sink).await?;
        let storage_link = run_links
            .iter()
            .find(|link| link.contains(self.settings.gateway_link_token.as_str()))
            .ok_or_else(|| ResolveError::NoStorageLink {
                url: base.to_string(),
            })?;
        let storage = self.absolutize(&base, storage_link)?;
        sink.status(format!("Found gcs link at {storage}"));

        let storage_root = storage.as_str().trim_end_matches('/').to_string();
        let started = self
            .fetch_timestamp(format!("{storage_root}/started.json").as_str())
            .await?;
        let finished = self
            .fetch_timestamp(format!("{storage_root}/finished.json").as_str())
            .await?;
        sink.status(format!("Found start/stop markers at {storage}"));

        let storage_links = self.fetch_links(&storage, sink).await?;
        let artifacts_link = storage_links
            .iter()
            .find(|link| link.ends_with("artifacts/"))
            .ok_or_else(|| ResolveError::MissingArtifacts {
                url: storage.to_string(),
            })?;
        let artifacts = self.absolutize(&storage, artifacts_link)?;

        let artifact_links = self.fetch_links(&artifacts, sink).await?;
        let e2e_link = artifact_links
            .iter()
            .find(|link| last_segment(link).is_some_and(|segment| segment.contains(E2E_TOKEN)))
            .ok_or_else(|| ResolveError::MissingE2e {
                url: artifacts.to_string(),
            })?;
        let mut archive_dir = self.absolutize(&artifacts, e2e_link)?;

        let step_links = self.fetch_links(&archive_dir, sink).await?;
        let candidates = step_links
            .iter()
            .filter(|link| {
                !matches!(last_segment(link), Some(ARTIFACTS_SEGMENT | GSUTIL_SEGMENT))
            })
            .map(String::as_str)
            .collect::<Vec<_>>();
        if let Some(step_link) = select_step(&candidates) {
            let step = self.absolutize(&archive_dir, step_link)?;
            let nested = self.fetch_links(&step, sink).await?;
            archive_dir = match nested
                .iter()
                .find(|link| last_segment(link) == Some(ARTIFACTS_SEGMENT))
            {
                Some(link) => self.absolutize(&step, link)?,
                None => step,
            };
        }

        let file = if base
            .query_pairs()
            .any(|(key, _)| key == ALTERNATE_SNAPSHOT_QUERY)
        {
            self.settings.alternate_archive_file.as_str()
        } else {
            self.settings.archive_file.as_str()
        };
        let directory = archive_dir.as_str().trim_end_matches('/');
        let archive_url = self
            .settings
            .rewrite_to_storage(format!("{directory}/{file}").as_str());

        Ok(ArchiveInfo {
            started,
            finished,
            archive_url,
        })
    }

    /// HEADs the archive and requires a 200 with a non-zero numeric length.
    pub async fn verify(&self, archive_url: &str) -> Result<u64, VerifyError> {
        let response = self
            .client
            .head(archive_url)
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|error| VerifyError::Transport {
                url: archive_url.to_string(),
                message: error.to_string(),
            })?;
        check_archive_headers(archive_url, response.status(), response.headers())
    }

    fn is_direct_link(&self, url: &Url) -> bool {
        let path = url.path();
        path.ends_with(self.settings.archive_file.as_str())
            || path.ends_with(self.settings.alternate_archive_file.as_str())
    }

    async fn ensure_reachable(&self, url: &Url) -> Result<(), ResolveError> {
        let response = self
            .client
            .head(url.as_str())
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|error| ResolveError::Unreachable {
                url: url.to_string(),
                message: error.to_string(),
            })?;
        if response.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(ResolveError::Unreachable {
                url: url.to_string(),
                message: format!("code {}", response.status().as_u16()),
            })
        }
    }

    /// Listing links are gateway-absolute paths; anything else resolves
    /// against the page it was found on.
    fn absolutize(&self, page: &Url, link: &str) -> Result<Url, ResolveError> {
        let parsed = if link.starts_with('/') && !link.starts_with("//") {
            Url::parse(format!("{}{link}", self.settings.gateway_prefix.trim_end_matches('/')).as_str())
        } else {
            page.join(link)
        };
        parsed.map_err(|error| ResolveError::InvalidUrl {
            url: link.to_string(),
            message: error.to_string(),
        })
    }

    async fn fetch_links(&self, url: &Url, sink: &EventSink) -> Result<Vec<String>, ResolveError> {
        sink.progress(format!("Fetching {url}"));
        let body = self
            .client
            .get(url.as_str())
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|error| ResolveError::Fetch {
                url: url.to_string(),
                message: error.to_string(),
            })?
            .text()
            .await
            .map_err(|error| ResolveError::Fetch {
                url: url.to_string(),
                message: error.to_string(),
            })?;
        let links = extract_links(body.as_str());
        tracing::debug!(url = %url, links = links.len(), "fetched listing");
        sink.progress(format!("Fetched {url} ({} links)", links.len()));
        if links.is_empty() {
            return Err(ResolveError::NoLinks {
                url: url.to_string(),
            });
        }
        Ok(links)
    }

    async fn fetch_timestamp(&self, url: &str) -> Result<DateTime<Utc>, ResolveError> {
        let timestamp_error = |message: String| ResolveError::Timestamp {
            url: url.to_string(),
            message,
        };
        let body = self
            .client
            .get(url)
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|error| timestamp_error(error.to_string()))?
            .text()
            .await
            .map_err(|error| timestamp_error(error.to_string()))?;
        let marker = serde_json::from_str::<RunMarker>(body.as_str())
            .map_err(|error| timestamp_error(format!("{error}: {body}")))?;
        DateTime::from_timestamp(marker.timestamp, 0)
            .ok_or_else(|| timestamp_error(format!("timestamp {} out of range", marker.timestamp)))
    }
}

#[async_trait]
impl ArchiveLocator for ArchiveResolver {
    async fn locate(&self, run_url: &str, sink: &EventSink) -> Result<ArchiveInfo, ResolveError> {
        sink.status(format!("Fetching {run_url}"));
        let info = self.resolve(run_url, sink).await?;
        sink.status(format!("Found prometheus archive at {}", info.archive_url));
        sink.status("Checking if prometheus archive can be fetched");
        let length = self.verify(info.archive_url.as_str()).await?;
        tracing::info!(archive_url = %info.archive_url, bytes = length, "archive verified");
        Ok(info)
    }
}

/// Single remaining step wins; otherwise the exact `gather-extra` step;
/// otherwise the first listed.
fn select_step<'a>(candidates: &[&'a str]) -> Option<&'a str> {
    match candidates {
        [] => None,
        [only] => Some(*only),
        [first, ..] => candidates
            .iter()
            .find(|link| last_segment(link) == Some(GATHER_EXTRA_SEGMENT))
            .or(Some(first))
            .copied(),
    }
}

fn last_segment(link: &str) -> Option<&str> {
    link.split(['?', '#'])
        .next()
        .unwrap_or_default()
        .split('/')
        .rev()
        .find(|segment| !segment.is_empty())
}

pub fn check_archive_headers(url: &str, status: StatusCode, headers: &HeaderMap) -> Result<u64, VerifyError> {
    if status != StatusCode::OK {
        return Err(VerifyError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let raw = headers
        .get(reqwest::header::CONTENT_LENGTH)
        .ok_or_else(|| VerifyError::MissingLength {
            url: url.to_string(),
        })?;
    let text = raw.to_str().unwrap_or_default().trim();
    if text.is_empty() {
        return Err(VerifyError::MissingLength {
            url: url.to_string(),
        });
    }
    let length = text.parse::<u64>().map_err(|_| VerifyError::InvalidLength {
        url: url.to_string(),
        value: text.to_string(),
    })?;
    if length == 0 {
        return Err(VerifyError::EmptyArchive {
            url: url.to_string(),
        });
    }
    Ok(length)
}

fn anchor_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#).ok()
        })
        .as_ref()
}

/// Every anchor `href` in document order.
pub fn extract_links(html: &str) -> Vec<String> {
    let Some(pattern) = anchor_pattern() else {
        return Vec::new();
    };
    pattern
        .captures_iter(html)
        .filter_map(|captures| captures.get(1).or_else(|| captures.get(2)).or_else(|| captures.get(3)))
        .map(|value| value.as_str().replace("&amp;", "&"))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use axum::{
        Router,
        extract::State,
        http::{StatusCode, Uri, header},
        response::{IntoResponse, Response},
    };
    use chrono::Utc;
    use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::{
        ArchiveLocator, ArchiveResolver, GATEWAY_PREFIX, ResolveError, ResolverSettings, VerifyError,
        check_archive_headers, extract_links, select_step,
    };
    use crate::registry::EventSink;

    async fn spawn_http_server(app: Router) -> Result<(SocketAddr, oneshot::Sender<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Ok((addr, shutdown_tx))
    }

    async fn serve_page(State(pages): State<Arc<HashMap<String, String>>>, uri: Uri) -> Response {
        match pages.get(uri.path()) {
            Some(body) => ([(header::CONTENT_TYPE, "text/html")], body.clone()).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    fn listing(links: &[&str]) -> String {
        links
            .iter()
            .map(|link| format!("<li><a class=\"dir\" href=\"{link}\">{link}</a></li>"))
            .collect::<String>()
    }

    fn settings_for(addr: SocketAddr) -> ResolverSettings {
        ResolverSettings {
            gateway_prefix: format!("http://{addr}"),
            gateway_link_token: "/gcs/".to_string(),
            timeout: Duration::from_secs(2),
            ..ResolverSettings::default()
        }
    }

    fn prow_pages(addr: SocketAddr) -> HashMap<String, String> {
        let run = "/gcs/bucket/logs/job/123";
        HashMap::from([
            (
                "/view/job/123".to_string(),
                format!(
                    "<html><a href=\"/job-history\">history</a><a href='http://{addr}{run}'>Artifacts</a></html>"
                ),
            ),
            (format!("{run}/started.json"), r#"{"timestamp": 1700000000}"#.to_string()),
            (format!("{run}/finished.json"), r#"{"timestamp": 1700003600}"#.to_string()),
            (
                run.to_string(),
                listing(&["/gcs/bucket/logs/job/", &format!("{run}/artifacts/"), &format!("{run}/build-log.txt")]),
            ),
            (
                format!("{run}/artifacts/"),
                listing(&[
                    &format!("{run}/"),
                    &format!("{run}/artifacts/build-resources/"),
                    &format!("{run}/artifacts/e2e-aws/"),
                ]),
            ),
            (
                format!("{run}/artifacts/e2e-aws/"),
                listing(&[
                    &format!("{run}/artifacts/"),
                    &format!("{run}/artifacts/e2e-aws/gsutil/"),
                    &format!("{run}/artifacts/e2e-aws/ipi-install/"),
                    &format!("{run}/artifacts/e2e-aws/gather-extra/"),
                ]),
            ),
            (
                format!("{run}/artifacts/e2e-aws/gather-extra/"),
                listing(&[
                    &format!("{run}/artifacts/e2e-aws/"),
                    &format!("{run}/artifacts/e2e-aws/gather-extra/artifacts/"),
                    &format!("{run}/artifacts/e2e-aws/gather-extra/build-log.txt"),
                ]),
            ),
        ])
    }

    async fn spawn_prow() -> Result<(SocketAddr, oneshot::Sender<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let pages = Arc::new(prow_pages(addr));
        let app = Router::new().fallback(serve_page).with_state(pages);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Ok((addr, shutdown_tx))
    }

    #[test]
    fn anchors_are_extracted_in_document_order() {
        let html = r#"<a href="/one">1</a> <A class='x' HREF='/two'>2</A> <a name=top>
            <a href=/three?x=1&amp;y=2>3</a> <link href="/not-an-anchor">"#;
        assert_eq!(extract_links(html), vec!["/one", "/two", "/three?x=1&y=2"]);
        assert!(extract_links("<p>no anchors</p>").is_empty());
    }

    #[test]
    fn absolute_and_single_quoted_hrefs_resolve_against_the_right_base() -> Result<()> {
        let html = r#"<a href='https://gcsweb.example/gcs/bucket/run/'>run</a>
            <a href="//cdn.example/x.js">cdn</a>
            <a href = 'artifacts/'>artifacts</a>
            <a
              href='/gcs/bucket/run/artifacts/e2e-aws/'>step</a>"#;
        let links = extract_links(html);
        assert_eq!(
            links,
            vec![
                "https://gcsweb.example/gcs/bucket/run/",
                "//cdn.example/x.js",
                "artifacts/",
                "/gcs/bucket/run/artifacts/e2e-aws/",
            ]
        );

        let resolver = ArchiveResolver::new(ResolverSettings::default());
        let page = reqwest::Url::parse("https://prow.example/view/job/1/")?;
        let resolved = links
            .iter()
            .map(|link| resolver.absolutize(&page, link).map(String::from))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(
            resolved,
            vec![
                "https://gcsweb.example/gcs/bucket/run/".to_string(),
                "https://cdn.example/x.js".to_string(),
                "https://prow.example/view/job/1/artifacts/".to_string(),
                format!("{GATEWAY_PREFIX}/gcs/bucket/run/artifacts/e2e-aws/"),
            ]
        );
        Ok(())
    }

    #[test]
    fn step_selection_prefers_single_then_gather_extra_then_first() {
        assert_eq!(select_step(&[]), None);
        assert_eq!(select_step(&["/a/ipi-install/"]), Some("/a/ipi-install/"));
        assert_eq!(
            select_step(&["/a/ipi-install/", "/a/gather-extra/"]),
            Some("/a/gather-extra/")
        );
        assert_eq!(
            select_step(&["/a/ipi-install/", "/a/gather-must-gather/"]),
            Some("/a/ipi-install/")
        );
    }

    #[tokio::test]
    async fn direct_archive_link_skips_crawling() -> Result<()> {
        // Port 9 on localhost is closed; any request would fail the resolve.
        let resolver = ArchiveResolver::new(ResolverSettings {
            gateway_prefix: "http://127.0.0.1:9".to_string(),
            ..ResolverSettings::default()
        });
        let (sink, mut events) = EventSink::channel();
        let before = Utc::now();
        let info = resolver
            .resolve(
                "http://127.0.0.1:9/gcs/bucket/logs/job/1/artifacts/metrics/prometheus.tar",
                &sink,
            )
            .await?;
        let after = Utc::now();

        assert_eq!(info.started, info.finished);
        assert!(info.started >= before && info.started <= after);
        assert_eq!(
            info.archive_url,
            "https://storage.googleapis.com/bucket/logs/job/1/artifacts/metrics/prometheus.tar"
        );
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn prow_chain_resolves_gather_extra_archive() -> Result<()> {
        let (addr, shutdown) = spawn_prow().await?;
        let resolver = ArchiveResolver::new(settings_for(addr));
        let (sink, mut events) = EventSink::channel();

        let info = resolver
            .resolve(format!("http://{addr}/view/job/123").as_str(), &sink)
            .await?;
        assert_eq!(
            info.archive_url,
            "https://storage.googleapis.com/bucket/logs/job/123/artifacts/e2e-aws/gather-extra/artifacts/metrics/prometheus.tar"
        );
        assert_eq!(info.started.timestamp(), 1_700_000_000);
        assert_eq!(info.finished.timestamp(), 1_700_003_600);

        let mut progress = 0usize;
        while let Ok(event) = events.try_recv() {
            if event.action == sandbox_protocol::Action::Progress {
                progress += 1;
            }
        }
        // Before and after each of the five listing fetches.
        assert_eq!(progress, 10);

        let alternate = resolver
            .resolve(format!("http://{addr}/view/job/123?altsnap=true").as_str(), &sink)
            .await?;
        assert!(alternate.archive_url.ends_with("/gather-extra/artifacts/metrics/prometheus-k8s-1.tar"));

        let _ = shutdown.send(());
        Ok(())
    }

    #[tokio::test]
    async fn crawl_failures_are_resolution_errors() -> Result<()> {
        let (addr, shutdown) = spawn_prow().await?;
        let resolver = ArchiveResolver::new(settings_for(addr));
        let (sink, _events) = EventSink::channel();

        let missing = resolver
            .resolve(format!("http://{addr}/view/job/404").as_str(), &sink)
            .await
            .expect_err("unreachable run page");
        assert_eq!(missing.code(), "run_unreachable");

        let no_gateway = ArchiveResolver::new(ResolverSettings {
            gateway_link_token: "gcsweb".to_string(),
            ..settings_for(addr)
        })
        .resolve(format!("http://{addr}/view/job/123").as_str(), &sink)
        .await
        .expect_err("no gateway link");
        assert!(matches!(no_gateway, ResolveError::NoStorageLink { .. }));

        let _ = shutdown.send(());
        Ok(())
    }

    #[test]
    fn archive_header_checks() {
        let url = "https://storage.example/metrics/prometheus.tar";
        let with_length = |value: &'static str| {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_LENGTH, HeaderValue::from_static(value));
            headers
        };

        assert_eq!(
            check_archive_headers(url, StatusCode::NOT_FOUND, &with_length("10")),
            Err(VerifyError::Status { url: url.to_string(), status: 404 })
        );
        assert_eq!(
            check_archive_headers(url, StatusCode::OK, &HeaderMap::new()),
            Err(VerifyError::MissingLength { url: url.to_string() })
        );
        assert_eq!(
            check_archive_headers(url, StatusCode::OK, &with_length("0")),
            Err(VerifyError::EmptyArchive { url: url.to_string() })
        );
        assert!(matches!(
            check_archive_headers(url, StatusCode::OK, &with_length("lots")),
            Err(VerifyError::InvalidLength { .. })
        ));
        assert_eq!(check_archive_headers(url, StatusCode::OK, &with_length("2048")), Ok(2048));
    }

    #[tokio::test]
    async fn locate_verifies_archive_over_http() -> Result<()> {
        let app = Router::new()
            .route(
                "/bucket/ok/metrics/prometheus.tar",
                axum::routing::head(|| async { (StatusCode::OK, [(header::CONTENT_LENGTH, "4096")]) }),
            )
            .route(
                "/bucket/missing/metrics/prometheus.tar",
                axum::routing::head(|| async { StatusCode::NOT_FOUND }),
            );
        let (addr, shutdown) = spawn_http_server(app).await?;
        let resolver = ArchiveResolver::new(ResolverSettings {
            storage_prefix: format!("http://{addr}"),
            ..ResolverSettings::default()
        });
        let (sink, _events) = EventSink::channel();

        let info = resolver
            .locate(
                "https://gcsweb-ci.apps.ci.l2s4.p1.openshiftapps.com/gcs/bucket/ok/metrics/prometheus.tar",
                &sink,
            )
            .await?;
        assert_eq!(info.archive_url, format!("http://{addr}/bucket/ok/metrics/prometheus.tar"));

        let error = resolver
            .locate(
                "https://gcsweb-ci.apps.ci.l2s4.p1.openshiftapps.com/gcs/bucket/missing/metrics/prometheus.tar",
                &sink,
            )
            .await
            .expect_err("archive missing");
        assert!(matches!(error, ResolveError::Verify(VerifyError::Status { status: 404, .. })));

        let _ = shutdown.send(());
        Ok(())
    }
}
