//! REST adapter for the cluster API.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream::BoxStream};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use super::{ClusterApi, ClusterError, ListParams, LogStream, ResourceKind, WatchEvent, WatchStream};

#[derive(Clone, Debug)]
enum TokenSource {
    Static(String),
    /// Projected service-account tokens rotate, so the file is re-read per call.
    File(PathBuf),
    Anonymous,
}

#[derive(Clone, Debug)]
pub struct KubeHttpClient {
    client: HttpClient,
    base_url: String,
    namespace: String,
    token: TokenSource,
}

impl KubeHttpClient {
    pub fn new(
        base_url: &str,
        namespace: &str,
        token: Option<String>,
        token_path: &Path,
        ca_path: &Path,
    ) -> Result<Self, ClusterError> {
        let mut builder = HttpClient::builder();
        match std::fs::read(ca_path) {
            Ok(pem) => {
                let certificate = reqwest::Certificate::from_pem(pem.as_slice())
                    .map_err(|error| ClusterError::Config(format!("invalid CA bundle: {error}")))?;
                builder = builder.add_root_certificate(certificate);
            }
            Err(error) => {
                tracing::debug!(
                    path = %ca_path.display(),
                    reason = %error,
                    "cluster CA bundle unavailable, using default roots"
                );
            }
        }
        let client = builder
            .build()
            .map_err(|error| ClusterError::Config(format!("cluster http client init failed: {error}")))?;

        let token = match token.map(|value| value.trim().to_string()) {
            Some(value) if !value.is_empty() => TokenSource::Static(value),
            _ if token_path.exists() => TokenSource::File(token_path.to_path_buf()),
            _ => TokenSource::Anonymous,
        };

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token,
        })
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!(
            "{}{}/namespaces/{}/{}",
            self.base_url,
            kind.api_prefix(),
            self.namespace,
            kind.plural()
        )
    }

    fn object_url(&self, kind: ResourceKind, name: &str) -> String {
        format!("{}/{}", self.collection_url(kind), name)
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, ClusterError> {
        match &self.token {
            TokenSource::Static(token) => Ok(request.bearer_auth(token)),
            TokenSource::File(path) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|error| {
                    ClusterError::Config(format!("failed to read token {}: {error}", path.display()))
                })?;
                Ok(request.bearer_auth(token.trim()))
            }
            TokenSource::Anonymous => Ok(request),
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Response, ClusterError> {
        let response = self
            .authorize(request.header("accept", "application/json"))
            .await?
            .send()
            .await
            .map_err(|error| ClusterError::Transport(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body.as_str(), kind, name))
    }

    fn list_query(params: &ListParams) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(selector) = params.label_selector.as_ref() {
            query.push(("labelSelector", selector.clone()));
        }
        if let Some(selector) = params.field_selector.as_ref() {
            query.push(("fieldSelector", selector.clone()));
        }
        query
    }
}

fn status_error(status: StatusCode, body: &str, kind: ResourceKind, name: &str) -> ClusterError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("message").and_then(Value::as_str).map(ToString::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound {
            kind: kind.as_str(),
            name: name.to_string(),
        },
        StatusCode::CONFLICT => ClusterError::AlreadyExists {
            kind: kind.as_str(),
            name: name.to_string(),
        },
        _ => ClusterError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

fn decode_watch_line(line: &str) -> Option<Result<WatchEvent, ClusterError>> {
    if line.trim().is_empty() {
        return None;
    }
    let frame = match serde_json::from_str::<Value>(line) {
        Ok(frame) => frame,
        Err(error) => return Some(Err(ClusterError::Decode(error.to_string()))),
    };
    let object = frame.get("object").cloned().unwrap_or(Value::Null);
    let event = match frame.get("type").and_then(Value::as_str) {
        Some("ADDED") => Ok(WatchEvent::Added(object)),
        Some("MODIFIED") => Ok(WatchEvent::Modified(object)),
        Some("DELETED") => Ok(WatchEvent::Deleted(object)),
        Some("BOOKMARK") => Ok(WatchEvent::Bookmark),
        Some("ERROR") => Err(ClusterError::Watch(
            object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("watch returned an error status")
                .to_string(),
        )),
        other => Err(ClusterError::Decode(format!("unknown watch event type {other:?}"))),
    };
    Some(event)
}

/// Longest line a watch or log stream may carry. Watch events for the
/// resources this service manages stay far below it.
pub const MAX_STREAM_LINE_BYTES: usize = 1024 * 1024;

fn body_lines(response: Response) -> BoxStream<'static, Result<String, ClusterError>> {
    split_lines(response.bytes_stream(), MAX_STREAM_LINE_BYTES)
}

/// Splits a chunked body into newline-terminated text lines. A pending line
/// longer than `limit` ends the stream with `LineTooLong`.
fn split_lines<S, B, E>(chunks: S, limit: usize) -> BoxStream<'static, Result<String, ClusterError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + 'static,
    E: std::fmt::Display + 'static,
{
    let state = (chunks.boxed(), Vec::<u8>::new(), false);
    futures::stream::unfold(state, move |(mut chunks, mut buffer, mut finished)| async move {
        loop {
            if let Some(position) = buffer.iter().position(|byte| *byte == b'\n') {
                let line = buffer.drain(..=position).collect::<Vec<_>>();
                let text = String::from_utf8_lossy(&line[..position])
                    .trim_end_matches('\r')
                    .to_string();
                return Some((Ok(text), (chunks, buffer, finished)));
            }
            if finished {
                if buffer.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(&buffer).to_string();
                buffer.clear();
                return Some((Ok(text), (chunks, buffer, finished)));
            }
            if buffer.len() > limit {
                buffer.clear();
                return Some((Err(ClusterError::LineTooLong { limit }), (chunks, buffer, true)));
            }
            match chunks.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(error)) => {
                    buffer.clear();
                    return Some((
                        Err(ClusterError::Transport(error.to_string())),
                        (chunks, buffer, true),
                    ));
                }
                None => finished = true,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ClusterApi for KubeHttpClient {
    fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    async fn create(&self, kind: ResourceKind, manifest: Value) -> Result<Value, ClusterError> {
        let name = manifest
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let request = self.client.post(self.collection_url(kind)).json(&manifest);
        self.send(request, kind, name.as_str())
            .await?
            .json::<Value>()
            .await
            .map_err(|error| ClusterError::Decode(error.to_string()))
    }

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Value, ClusterError> {
        let request = self.client.get(self.object_url(kind, name));
        self.send(request, kind, name)
            .await?
            .json::<Value>()
            .await
            .map_err(|error| ClusterError::Decode(error.to_string()))
    }

    async fn list(&self, kind: ResourceKind, params: &ListParams) -> Result<Vec<Value>, ClusterError> {
        let request = self
            .client
            .get(self.collection_url(kind))
            .query(&Self::list_query(params));
        let body = self
            .send(request, kind, "")
            .await?
            .json::<Value>()
            .await
            .map_err(|error| ClusterError::Decode(error.to_string()))?;
        match body.get("items") {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(ClusterError::Decode(format!("items is not a list: {other}"))),
        }
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        let request = self
            .client
            .delete(self.object_url(kind, name))
            .query(&[("propagationPolicy", "Background")]);
        self.send(request, kind, name).await.map(|_| ())
    }

    async fn watch(&self, kind: ResourceKind, params: &ListParams) -> Result<WatchStream, ClusterError> {
        let mut query = Self::list_query(params);
        query.push(("watch", "true".to_string()));
        query.push(("allowWatchBookmarks", "true".to_string()));
        let request = self.client.get(self.collection_url(kind)).query(&query);
        let response = self.send(request, kind, "").await?;
        Ok(body_lines(response)
            .filter_map(|line| async move {
                match line {
                    Ok(line) => decode_watch_line(line.as_str()),
                    Err(error) => Some(Err(error)),
                }
            })
            .boxed())
    }

    async fn logs(&self, pod: &str, container: &str, follow: bool) -> Result<LogStream, ClusterError> {
        let url = format!("{}/log", self.object_url(ResourceKind::Pod, pod));
        let request = self
            .client
            .get(url)
            .query(&[("container", container), ("follow", if follow { "true" } else { "false" })]);
        let response = self.send(request, ResourceKind::Pod, pod).await?;
        Ok(body_lines(response))
    }
}
