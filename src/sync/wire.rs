//! `HttpSyncClient`: a bearer-token-authenticated REST client for the
//! remote coordinator, grounded on the same request/response shape the
//! teacher's LLM provider clients use (see `llm_providers/gemini.rs`).

use super::{ConsensusResponse, EventQueue, FlushResult, RequestMergeResponse, SyncClient};
use crate::error::{GitSwarmError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

const PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_COUNT: usize = 3;

pub struct HttpSyncClient {
    base_url: String,
    token: String,
    client: Client,
}

impl HttpSyncClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// Sends a single retried POST (three retries at 1s/2s/4s on
    /// *transport* failure, a 10s per-attempt timeout) and hands back the
    /// raw response so callers that care about the HTTP status (the batch
    /// endpoint's 404-means-unsupported convention) can inspect it before
    /// the body is consumed.
    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(500)
            .map(jitter)
            .take(RETRY_COUNT);

        let url = self.url(path);
        Retry::spawn(strategy, || async {
            self.client
                .post(&url)
                .bearer_auth(&self.token)
                .timeout(PER_ATTEMPT_TIMEOUT)
                .json(&body)
                .send()
                .await
        })
        .await
        .map_err(|e| GitSwarmError::Io(std::io::Error::other(e.to_string())))
    }

    /// `post` plus the non-2xx-is-an-error convention every endpoint but
    /// the batch one wants.
    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let result = self.post(path, body).await?;
        if !result.status().is_success() {
            let status = result.status();
            let text = result.text().await.unwrap_or_default();
            return Err(GitSwarmError::Io(std::io::Error::other(format!(
                "coordinator returned {status}: {text}"
            ))));
        }

        result
            .json()
            .await
            .map_err(|e| GitSwarmError::Io(std::io::Error::other(e.to_string())))
    }
}

#[derive(serde::Deserialize)]
struct BatchEntryResult {
    seq: i64,
    status: String,
}

#[derive(serde::Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<BatchEntryResult>,
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn ping(&self) -> Result<bool> {
        match self.post_json("ping", json!({})).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn request_merge(&self, repo_id: &str, stream_id: &str) -> Result<RequestMergeResponse> {
        let body = self
            .post_json("requestMerge", json!({ "repoId": repo_id, "streamId": stream_id }))
            .await?;
        serde_json::from_value(body).map_err(|e| GitSwarmError::BadConfig(e.to_string()))
    }

    async fn check_consensus(&self, repo_id: &str, stream_id: &str) -> Result<ConsensusResponse> {
        let body = self
            .post_json("checkConsensus", json!({ "repoId": repo_id, "streamId": stream_id }))
            .await?;
        serde_json::from_value(body).map_err(|e| GitSwarmError::BadConfig(e.to_string()))
    }

    /// `sync/batch`: replay the whole queue in one request. The response
    /// is `{results:[{seq,status}]}` with `status` one of `ok`, `duplicate`,
    /// or `error`; only `ok`/`duplicate` rows are deleted from the local
    /// queue, and a single `error` stops the walk there, so ordering
    /// against the remote is preserved and nothing after a rejected entry
    /// is ever treated as flushed. The batch endpoint not existing (404)
    /// is the only case that falls back to delivering events one at a
    /// time; any other failure (non-2xx, transport error) leaves the
    /// whole queue pending rather than guessing at partial delivery.
    async fn flush_queue(&self, queue: &EventQueue) -> Result<FlushResult> {
        let pending = queue.pending()?;
        let mut result = FlushResult::default();

        if pending.is_empty() {
            return Ok(result);
        }

        let batch = json!({
            "events": pending
                .iter()
                .map(|e| json!({ "seq": e.seq, "type": e.event_type, "data": e.payload }))
                .collect::<Vec<_>>(),
        });

        let response = match self.post("sync/batch", batch).await {
            Ok(response) => response,
            Err(_) => {
                // Transport failure, not a 404: the spec only falls back
                // to individual dispatch when the batch endpoint itself is
                // missing, so leave every entry pending rather than guess.
                for entry in &pending {
                    result.failed_types.push(entry.event_type.clone());
                }
                return Ok(result);
            }
        };
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            for entry in &pending {
                let single = json!({ "type": entry.event_type, "data": entry.payload });
                match self.post_json(&format!("sync/{}", entry.event_type), single).await {
                    Ok(_) => {
                        queue.mark_delivered(entry.seq)?;
                        result.flushed.push(entry.event_type.clone());
                    }
                    Err(e) => {
                        queue.mark_failed(entry.seq, &e.to_string())?;
                        result.failed_types.push(entry.event_type.clone());
                        break;
                    }
                }
            }
            return Ok(result);
        }

        if !status.is_success() {
            for entry in &pending {
                result.failed_types.push(entry.event_type.clone());
            }
            return Ok(result);
        }

        let body: serde_json::Value = response.json().await.map_err(|e| GitSwarmError::Io(std::io::Error::other(e.to_string())))?;
        let parsed: BatchResponse = serde_json::from_value(body).map_err(|e| GitSwarmError::BadConfig(e.to_string()))?;
        let statuses: std::collections::HashMap<i64, String> = parsed.results.into_iter().map(|r| (r.seq, r.status)).collect();

        let mut stopped = false;
        for entry in &pending {
            if stopped {
                result.failed_types.push(entry.event_type.clone());
                continue;
            }
            match statuses.get(&entry.seq).map(String::as_str) {
                Some("ok" | "duplicate") => {
                    queue.mark_delivered(entry.seq)?;
                    result.flushed.push(entry.event_type.clone());
                }
                other => {
                    let reason = other.unwrap_or("missing from coordinator response");
                    queue.mark_failed(entry.seq, reason)?;
                    result.failed_types.push(entry.event_type.clone());
                    stopped = true;
                }
            }
        }

        Ok(result)
    }

    async fn poll_updates(&self, repo_id: &str, since: Option<&str>) -> Result<Vec<serde_json::Value>> {
        let body = self
            .post_json("pollUpdates", json!({ "repoId": repo_id, "since": since }))
            .await?;
        Ok(body.get("updates").and_then(|u| u.as_array()).cloned().unwrap_or_default())
    }
}
