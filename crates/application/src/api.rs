//! REST 协作方接口
//!
//! - `GET /conversations/{id}/messages`：会话初始加载
//! - `POST /conversations/{id}/read`：标记已读，随后在本地应用已读截止
//! - `GET /admin/dashboard`：完整指标快照
//! - `GET /admin/metrics/live`：部分快照，轮询兜底使用

use async_trait::async_trait;
use domain::{ConversationId, Message, SnapshotDelta, Timestamp};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("unauthorized")]
    Unauthorized,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// 拉取到的快照及服务端生成时间（若有）
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSnapshot {
    pub delta: SnapshotDelta,
    pub generated_at: Option<Timestamp>,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MetricsApi: Send + Sync {
    /// `GET /admin/dashboard`
    async fn fetch_dashboard(&self) -> Result<FetchedSnapshot, FetchError>;

    /// `GET /admin/metrics/live`
    async fn fetch_live_metrics(&self) -> Result<FetchedSnapshot, FetchError>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// `GET /conversations/{id}/messages`
    async fn fetch_messages(&self, conversation_id: &ConversationId)
        -> Result<Vec<Message>, FetchError>;

    /// `POST /conversations/{id}/read`，返回服务端记录的已读时间（若有）
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Timestamp>, FetchError>;
}
