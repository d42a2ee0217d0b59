use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::core::error::TrackerError;
use crate::core::model::{CreateScanRequest, CreatedScan, FullResults, TaskView};
use crate::transport::registry::{ClientContext, SessionProvider, SnapshotSource};

/// Request/response side of the scan API.
#[derive(Clone)]
pub struct ScanClient {
    client: reqwest::Client,
    base: Url,
    ctx: ClientContext,
    session: Arc<dyn SessionProvider>,
}

impl ScanClient {
    pub fn new(ctx: ClientContext, session: Arc<dyn SessionProvider>) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let base = base_url(&ctx.base_url)?;
        Ok(Self { client, base, ctx, session })
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    fn build_headers(&self) -> Result<HeaderMap, TrackerError> {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.ctx.user_agent).map_err(|e| TrackerError::InvalidRequest(e.to_string()))?,
        );
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = self.session.access_token() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TrackerError::InvalidRequest(e.to_string()))?;
            h.insert(AUTHORIZATION, value);
        }
        Ok(h)
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, TrackerError> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    fn task_path(task_id: &str, suffix: &str) -> String {
        let mut p = format!("api/scans/{}", encode_segment(task_id));
        if !suffix.is_empty() {
            p.push('/');
            p.push_str(suffix);
        }
        p
    }

    /// The push endpoint takes the token as a query parameter because the
    /// event-stream transport cannot carry an `Authorization` header.
    pub fn stream_url(&self, task_id: &str) -> Result<Url, TrackerError> {
        let mut url = self.endpoint(&Self::task_path(task_id, "stream"))?;
        if let Some(token) = self.session.access_token() {
            url.query_pairs_mut().append_pair("token", &token);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, task_id: &str, results: bool) -> Result<T, TrackerError> {
        let resp = self
            .client
            .get(url)
            .headers(self.build_headers()?)
            .timeout(Duration::from_secs(self.ctx.timeout_secs))
            .send()
            .await?;

        if let Some(err) = TrackerError::from_status(resp.status(), task_id, results) {
            tracing::debug!(task_id, status = resp.status().as_u16(), "snapshot request rejected");
            return Err(err);
        }
        decode_body(resp).await
    }

    /// Not retried here: creating a scan is not idempotent.
    pub async fn create_scan(&self, req: &CreateScanRequest) -> Result<CreatedScan, TrackerError> {
        let resp = self
            .client
            .post(self.endpoint("api/scans")?)
            .headers(self.build_headers()?)
            .timeout(Duration::from_secs(self.ctx.timeout_secs))
            .json(req)
            .send()
            .await?;

        if let Some(err) = TrackerError::from_status(resp.status(), "<new>", false) {
            return Err(err);
        }
        let created: CreatedScan = decode_body(resp).await?;
        tracing::info!(task_id = %created.id, url = %req.url, "scan created");
        Ok(created)
    }
}

#[async_trait]
impl SnapshotSource for ScanClient {
    async fn fetch_status(&self, task_id: &str) -> Result<TaskView, TrackerError> {
        let url = self.endpoint(&Self::task_path(task_id, ""))?;
        let mut view: TaskView = self.get_json(url, task_id, false).await?;
        if view.id.is_empty() {
            view.id = task_id.to_string();
        }
        Ok(view)
    }

    async fn fetch_results(&self, task_id: &str) -> Result<FullResults, TrackerError> {
        let url = self.endpoint(&Self::task_path(task_id, "results"))?;
        let mut results: FullResults = self.get_json(url, task_id, true).await?;
        if results.task_id.is_empty() {
            results.task_id = task_id.to_string();
        }
        Ok(results)
    }
}

async fn decode_body<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, TrackerError> {
    let text = resp.text().await?;
    serde_json::from_str(&text).map_err(|e| TrackerError::Protocol(format!("invalid response body: {e}")))
}

fn base_url(raw: &str) -> Result<Url, TrackerError> {
    let mut s = raw.trim().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    Ok(Url::parse(&s)?)
}

fn encode_segment(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
