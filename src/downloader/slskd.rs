//! Default [`SearchAndFetch`] implementation speaking the slskd HTTP API.
//!
//! Every call carries an explicit deadline; on expiry the caller gets
//! [`PortError::Timeout`], which counts toward the circuit breaker.
//! External refs are `"{peer}::{transfer_id}"`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use super::{Hit, PortError, PortResult, SearchAndFetch, TransferState, TransferUpdate};

/// Deadline for search calls (covers submit + poll + collect).
const SEARCH_TIMEOUT_SECS: u64 = 10;
/// Deadline for enqueue calls.
const ENQUEUE_TIMEOUT_SECS: u64 = 10;
/// Deadline for status calls.
const STATUS_TIMEOUT_SECS: u64 = 5;
/// Deadline for cancel calls.
const CANCEL_TIMEOUT_SECS: u64 = 5;
/// Deadline for liveness probes.
const PING_TIMEOUT_SECS: u64 = 2;

/// How often to poll an in-flight search for completion.
const SEARCH_POLL_INTERVAL_MS: u64 = 500;

/// slskd API client.
#[derive(Debug, Clone)]
pub struct SlskdClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SearchJson {
    id: String,
    #[serde(default, rename = "isComplete")]
    is_complete: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponseJson {
    username: String,
    #[serde(default)]
    files: Vec<SearchFileJson>,
}

#[derive(Debug, Deserialize)]
struct SearchFileJson {
    filename: String,
    #[serde(default)]
    size: i64,
    #[serde(rename = "bitRate")]
    bit_rate: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TransferJson {
    id: String,
    filename: String,
    state: String,
    #[serde(default, rename = "bytesTransferred")]
    bytes_transferred: i64,
    #[serde(default)]
    size: i64,
    #[serde(rename = "localPath")]
    local_path: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserDownloadsJson {
    #[serde(default)]
    directories: Vec<DirectoryJson>,
}

#[derive(Debug, Deserialize)]
struct DirectoryJson {
    #[serde(default)]
    files: Vec<TransferJson>,
}

impl SlskdClient {
    /// Creates a client for the given slskd base URL and API key.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Unavailable`] if the base URL does not parse.
    pub fn new(base_url: &str, api_key: &str) -> PortResult<Self> {
        Url::parse(base_url).map_err(|e| PortError::Unavailable {
            reason: format!("invalid slskd base URL {base_url}: {e}"),
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-API-Key", &self.api_key)
    }

    async fn check(response: reqwest::Response) -> PortResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(PortError::NotFound)
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(PortError::RateLimited)
        } else if status.is_server_error() {
            Err(PortError::Unavailable {
                reason: format!("slskd returned HTTP {status}"),
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(PortError::Rejected {
                reason: format!("HTTP {status}: {body}"),
            })
        }
    }

    fn split_ref(external_ref: &str) -> PortResult<(&str, &str)> {
        external_ref.split_once("::").ok_or(PortError::NotFound)
    }
}

async fn with_deadline<T, F>(operation: &'static str, seconds: u64, call: F) -> PortResult<T>
where
    F: std::future::Future<Output = PortResult<T>>,
{
    match tokio::time::timeout(Duration::from_secs(seconds), call).await {
        Ok(result) => result,
        Err(_) => Err(PortError::Timeout { operation, seconds }),
    }
}

/// Maps a slskd transfer state string onto [`TransferState`].
///
/// slskd reports comma-joined flags such as `"Completed, Succeeded"` or
/// `"Queued, Remotely"`; terminal flags win over the `Completed` prefix.
fn parse_transfer_state(state: &str) -> TransferState {
    if state.contains("Cancelled") || state.contains("Aborted") {
        TransferState::Cancelled
    } else if state.contains("Errored") || state.contains("TimedOut") || state.contains("Rejected")
    {
        TransferState::Errored
    } else if state.contains("Completed") || state.contains("Succeeded") {
        TransferState::Completed
    } else if state.contains("InProgress") {
        TransferState::Transferring
    } else {
        TransferState::Queued
    }
}

fn transfer_update(entry: &TransferJson) -> TransferUpdate {
    TransferUpdate {
        state: parse_transfer_state(&entry.state),
        bytes_done: entry.bytes_transferred,
        bytes_total: (entry.size > 0).then_some(entry.size),
        local_path: entry.local_path.clone(),
        error: entry.error.clone(),
    }
}

#[async_trait]
impl SearchAndFetch for SlskdClient {
    #[instrument(skip(self), fields(query = %query))]
    async fn search(&self, query: &str) -> PortResult<Vec<Hit>> {
        with_deadline("search", SEARCH_TIMEOUT_SECS, async {
            let created: SearchJson = Self::check(
                self.request(reqwest::Method::POST, "/api/v0/searches")
                    .json(&json!({ "searchText": query }))
                    .send()
                    .await?,
            )
            .await?
            .json()
            .await?;

            loop {
                let state: SearchJson = Self::check(
                    self.request(
                        reqwest::Method::GET,
                        &format!("/api/v0/searches/{}", created.id),
                    )
                    .send()
                    .await?,
                )
                .await?
                .json()
                .await?;

                if state.is_complete {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(SEARCH_POLL_INTERVAL_MS)).await;
            }

            let responses: Vec<SearchResponseJson> = Self::check(
                self.request(
                    reqwest::Method::GET,
                    &format!("/api/v0/searches/{}/responses", created.id),
                )
                .send()
                .await?,
            )
            .await?
            .json()
            .await?;

            // Search results were collected; the server-side search record
            // is no longer needed.
            let _ = self
                .request(
                    reqwest::Method::DELETE,
                    &format!("/api/v0/searches/{}", created.id),
                )
                .send()
                .await;

            let hits: Vec<Hit> = responses
                .into_iter()
                .flat_map(|response| {
                    let peer = response.username;
                    response.files.into_iter().map(move |file| Hit {
                        peer: peer.clone(),
                        filename: file.filename,
                        size_bytes: file.size,
                        bitrate_kbps: file.bit_rate,
                        format: None,
                    })
                })
                .collect();

            debug!(hits = hits.len(), "search complete");
            Ok(hits)
        })
        .await
    }

    #[instrument(skip(self), fields(peer = %peer))]
    async fn enqueue(
        &self,
        peer: &str,
        filename: &str,
        size_bytes: i64,
        _priority: i64,
    ) -> PortResult<String> {
        with_deadline("enqueue", ENQUEUE_TIMEOUT_SECS, async {
            Self::check(
                self.request(
                    reqwest::Method::POST,
                    &format!("/api/v0/transfers/downloads/{peer}"),
                )
                .json(&json!([{ "filename": filename, "size": size_bytes }]))
                .send()
                .await?,
            )
            .await?;

            // slskd's enqueue reply carries no transfer id; look it up.
            let downloads: UserDownloadsJson = Self::check(
                self.request(
                    reqwest::Method::GET,
                    &format!("/api/v0/transfers/downloads/{peer}"),
                )
                .send()
                .await?,
            )
            .await?
            .json()
            .await?;

            let entry = downloads
                .directories
                .iter()
                .flat_map(|d| &d.files)
                .find(|f| f.filename == filename)
                .ok_or(PortError::NotFound)?;

            Ok(format!("{peer}::{}", entry.id))
        })
        .await
    }

    #[instrument(skip(self), fields(external_ref = %external_ref))]
    async fn status(&self, external_ref: &str) -> PortResult<TransferUpdate> {
        let (peer, id) = Self::split_ref(external_ref)?;
        with_deadline("status", STATUS_TIMEOUT_SECS, async {
            let entry: TransferJson = Self::check(
                self.request(
                    reqwest::Method::GET,
                    &format!("/api/v0/transfers/downloads/{peer}/{id}"),
                )
                .send()
                .await?,
            )
            .await?
            .json()
            .await?;

            Ok(transfer_update(&entry))
        })
        .await
    }

    #[instrument(skip(self), fields(external_ref = %external_ref))]
    async fn cancel(&self, external_ref: &str) -> PortResult<()> {
        let (peer, id) = Self::split_ref(external_ref)?;
        with_deadline("cancel", CANCEL_TIMEOUT_SECS, async {
            Self::check(
                self.request(
                    reqwest::Method::DELETE,
                    &format!("/api/v0/transfers/downloads/{peer}/{id}"),
                )
                .send()
                .await?,
            )
            .await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> PortResult<()> {
        with_deadline("ping", PING_TIMEOUT_SECS, async {
            Self::check(
                self.request(reqwest::Method::GET, "/api/v0/application")
                    .send()
                    .await?,
            )
            .await?;
            Ok(())
        })
        .await
    }
}
