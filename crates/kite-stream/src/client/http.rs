use std::time::Duration;

use async_trait::async_trait;
use kite_model::{HeaderTimeBatch, JobFinish, JobStateResponse, LogChunk};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, trace};

use super::ControlPlane;
use crate::error::ApiError;

const MAX_ERROR_BODY: usize = 512;
const AGENT_NAME_HEADER: &str = "X-Agent-Name";

/// [`ControlPlane`] over HTTP/JSON.
#[derive(Clone, Debug)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    agent_name: String,
}

impl HttpControlPlane {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(kite_core::user_agent())
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_client(client, endpoint, token))
    }

    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            client,
            endpoint,
            token: token.into(),
            agent_name: kite_core::agent_name().to_string(),
        }
    }

    /// Name reported in the `X-Agent-Name` header; defaults to the host name.
    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(&self, method: Method, job_id: &str, suffix: &str) -> RequestBuilder {
        let url = format!("{}/jobs/{job_id}{suffix}", self.endpoint);
        trace!(target: "kite.stream.http", %method, %url, "request");
        self.client
            .request(method, url)
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(AGENT_NAME_HEADER, &self.agent_name)
    }

    async fn send(req: RequestBuilder) -> Result<Response, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let mut message = resp.text().await.unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        debug!(target: "kite.stream.http", status = status.as_u16(), %message, "request rejected");
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn start_job(&self, job_id: &str, started_at: OffsetDateTime) -> Result<(), ApiError> {
        let started_at = started_at
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        let req = self
            .request(Method::PUT, job_id, "/start")
            .json(&json!({ "started_at": started_at }));
        Self::send(req).await.map(drop)
    }

    async fn job_state(&self, job_id: &str) -> Result<JobStateResponse, ApiError> {
        let resp = Self::send(self.request(Method::GET, job_id, "")).await?;
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            ApiError::InvalidResponse(format!("failed to parse job state: {e}, body: {body}"))
        })
    }

    async fn save_header_times(
        &self,
        job_id: &str,
        batch: &HeaderTimeBatch,
    ) -> Result<(), ApiError> {
        let req = self
            .request(Method::POST, job_id, "/header_times")
            .json(&json!({ "header_times": batch.header_times }));
        Self::send(req).await.map(drop)
    }

    async fn upload_chunk(&self, job_id: &str, chunk: &LogChunk) -> Result<(), ApiError> {
        let req = self
            .request(Method::POST, job_id, "/chunks")
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("X-Chunk-Sequence", chunk.sequence)
            .header("X-Chunk-Offset", chunk.offset)
            .header("X-Chunk-Size", chunk.size)
            .body(chunk.data.clone());
        Self::send(req).await.map(drop)
    }

    async fn finish_job(&self, job_id: &str, finish: &JobFinish) -> Result<(), ApiError> {
        let req = self.request(Method::PUT, job_id, "/finish").json(finish);
        Self::send(req).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post, put};
    use kite_model::JobState;
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct Seen {
        auth: Vec<String>,
        user_agents: Vec<String>,
        agent_names: Vec<String>,
        started: Vec<Value>,
        headers: Vec<Value>,
        chunks: Vec<(String, String, String, Vec<u8>)>,
    }

    type Shared = Arc<Mutex<Seen>>;

    fn record(seen: &Shared, headers: &HeaderMap) {
        let mut s = seen.lock().unwrap();
        if let Some(v) = headers.get("authorization") {
            s.auth.push(v.to_str().unwrap().to_string());
        }
        if let Some(v) = headers.get("user-agent") {
            s.user_agents.push(v.to_str().unwrap().to_string());
        }
        if let Some(v) = headers.get("x-agent-name") {
            s.agent_names.push(v.to_str().unwrap().to_string());
        }
    }

    async fn serve(seen: Shared) -> String {
        let app = Router::new()
            .route(
                "/v3/jobs/{id}",
                get(|Path(id): Path<String>, State(seen): State<Shared>, headers: HeaderMap| async move {
                    record(&seen, &headers);
                    if id == "missing" {
                        return Err(StatusCode::NOT_FOUND);
                    }
                    Ok(Json(json!({ "state": "canceling", "extra": true })))
                }),
            )
            .route(
                "/v3/jobs/{id}/start",
                put(|State(seen): State<Shared>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    record(&seen, &headers);
                    seen.lock().unwrap().started.push(body);
                    StatusCode::OK
                }),
            )
            .route(
                "/v3/jobs/{id}/header_times",
                post(|State(seen): State<Shared>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    record(&seen, &headers);
                    seen.lock().unwrap().headers.push(body);
                    StatusCode::CREATED
                }),
            )
            .route(
                "/v3/jobs/{id}/chunks",
                post(|State(seen): State<Shared>, headers: HeaderMap, body: Bytes| async move {
                    record(&seen, &headers);
                    let h = |name: &str| headers.get(name).unwrap().to_str().unwrap().to_string();
                    seen.lock().unwrap().chunks.push((
                        h("x-chunk-sequence"),
                        h("x-chunk-offset"),
                        h("x-chunk-size"),
                        body.to_vec(),
                    ));
                    StatusCode::OK
                }),
            )
            .with_state(seen);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v3/")
    }

    #[tokio::test]
    async fn speaks_the_wire_format() {
        let seen: Shared = Arc::default();
        let endpoint = serve(Arc::clone(&seen)).await;
        let api = HttpControlPlane::new(endpoint, "secret").unwrap();
        assert!(!api.endpoint().ends_with('/'));

        api.start_job("job-1", OffsetDateTime::UNIX_EPOCH).await.unwrap();

        let state = api.job_state("job-1").await.unwrap();
        assert_eq!(state.state, JobState::Canceling);

        let batch = HeaderTimeBatch::new(2, vec!["2024-01-01T00:00:00.5Z".into()]);
        api.save_header_times("job-1", &batch).await.unwrap();

        let chunk = LogChunk::new(4, 4096, b"hello".to_vec());
        api.upload_chunk("job-1", &chunk).await.unwrap();

        let s = seen.lock().unwrap();
        assert_eq!(s.started[0]["started_at"], "1970-01-01T00:00:00Z");
        assert_eq!(s.headers[0]["header_times"]["2"], "2024-01-01T00:00:00.5Z");
        assert_eq!(
            s.chunks[0],
            ("4".to_string(), "4096".to_string(), "5".to_string(), b"hello".to_vec())
        );
        assert_eq!(s.auth.len(), 4);
        assert!(s.auth.iter().all(|a| a == "Token secret"));
        assert!(s.user_agents.iter().all(|ua| ua.starts_with("kite-agent/")));
        assert_eq!(s.agent_names.len(), 4);
        assert!(s.agent_names.iter().all(|n| n == kite_core::agent_name()));
    }

    #[tokio::test]
    async fn agent_name_can_be_overridden() {
        let seen: Shared = Arc::default();
        let endpoint = serve(Arc::clone(&seen)).await;
        let api = HttpControlPlane::new(endpoint, "secret")
            .unwrap()
            .with_agent_name("builder-7");
        assert_eq!(api.agent_name(), "builder-7");

        api.job_state("job-1").await.unwrap();

        assert_eq!(seen.lock().unwrap().agent_names, ["builder-7"]);
    }

    #[tokio::test]
    async fn non_success_maps_to_status_error() {
        let endpoint = serve(Arc::default()).await;
        let api = HttpControlPlane::new(endpoint, "secret").unwrap();

        let err = api.job_state("missing").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(err.is_terminal());
    }
}
