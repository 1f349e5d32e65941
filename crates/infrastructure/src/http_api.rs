//! REST 接口客户端
//!
//! 覆盖同步层依赖的四个接口：会话消息加载、标记已读、完整仪表盘快照、实时指标。
//! 超时映射为 `FetchError::Timeout`，429 映射为 `RateLimited`（带 `Retry-After`）。

use std::time::Duration;

use application::{ConversationApi, FetchError, FetchedSnapshot, MetricsApi};
use async_trait::async_trait;
use config::SyncConfig;
use domain::{ConversationId, Message, SnapshotDelta, Timestamp};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

/// 消息列表既可能是裸数组，也可能包在 `messages` / `data` 字段里
#[derive(Deserialize)]
#[serde(untagged)]
enum MessagesBody {
    List(Vec<Message>),
    Messages { messages: Vec<Message> },
    Data { data: Vec<Message> },
}

impl From<MessagesBody> for Vec<Message> {
    fn from(body: MessagesBody) -> Self {
        match body {
            MessagesBody::List(messages)
            | MessagesBody::Messages { messages }
            | MessagesBody::Data { data: messages } => messages,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ReadReceipt {
    #[serde(default)]
    read_at: Option<Timestamp>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token: None,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, FetchError> {
        Self::new(config.api.base_url.clone(), config.request_timeout())
    }

    /// 以 Bearer 令牌访问
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, FetchError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(map_reqwest_error)?;
        check_status(response)
    }

    async fn fetch_snapshot(&self, path: &str) -> Result<FetchedSnapshot, FetchError> {
        let url = self.url(path);
        let body: Value = self
            .send(self.http.get(&url))
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)?;

        let (delta, generated_at) = SnapshotDelta::from_json(body)
            .map_err(|err| FetchError::Decode(err.to_string()))?;
        debug!(url = %url, "快照拉取完成");
        Ok(FetchedSnapshot {
            delta,
            generated_at,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

fn check_status(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    warn!(url = %response.url(), status = status.as_u16(), "REST 请求失败");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse().ok());
            Err(FetchError::RateLimited { retry_after_secs })
        }
        other => Err(FetchError::Status(other.as_u16())),
    }
}

#[async_trait]
impl MetricsApi for RestClient {
    async fn fetch_dashboard(&self) -> Result<FetchedSnapshot, FetchError> {
        self.fetch_snapshot("admin/dashboard").await
    }

    async fn fetch_live_metrics(&self) -> Result<FetchedSnapshot, FetchError> {
        self.fetch_snapshot("admin/metrics/live").await
    }
}

#[async_trait]
impl ConversationApi for RestClient {
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, FetchError> {
        let url = self.url(&format!("conversations/{conversation_id}/messages"));
        let body: MessagesBody = self
            .send(self.http.get(&url))
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)?;
        Ok(body.into())
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Timestamp>, FetchError> {
        let url = self.url(&format!("conversations/{conversation_id}/read"));
        let response = self.send(self.http.post(&url)).await?;

        // 空响应体或无法解析时不带服务端时间
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        let receipt: ReadReceipt = serde_json::from_slice(&bytes).unwrap_or_default();
        Ok(receipt.read_at)
    }
}
