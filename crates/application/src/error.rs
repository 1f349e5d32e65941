use domain::{DomainError, MessageId};
use thiserror::Error;

use crate::api::FetchError;
use crate::transport::TransportError;

/// 同步层错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 缺少或无效的凭证：立即失败，不重试
    #[error("unauthenticated: missing or invalid credential")]
    Unauthenticated,
    /// 握手或网络失败（连接管理器内部重试）
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("fetch timed out")]
    FetchTimeout,
    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// 本地排期校验失败，不会产生网络请求
    #[error("invalid time range: {0}")]
    InvalidTimeRange(DomainError),
    /// 异步结果属于已拆除的会话纪元，被丢弃
    #[error("stale result discarded (epoch {result_epoch}, live epoch {live_epoch})")]
    StaleResultDiscarded { result_epoch: u64, live_epoch: u64 },
    #[error("push channel is not connected")]
    NotConnected,
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),
    #[error("message {message_id} does not belong to conversation {expected}")]
    ConversationMismatch { message_id: MessageId, expected: String },
    #[error("domain error: {0}")]
    Domain(DomainError),
}

impl SyncError {
    /// 陈旧结果错误
    pub fn stale(result_epoch: u64, live_epoch: u64) -> Self {
        SyncError::StaleResultDiscarded {
            result_epoch,
            live_epoch,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, SyncError::StaleResultDiscarded { .. })
    }
}

impl From<DomainError> for SyncError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTimeRange { .. } => SyncError::InvalidTimeRange(value),
            other => SyncError::Domain(other),
        }
    }
}

impl From<FetchError> for SyncError {
    fn from(value: FetchError) -> Self {
        match value {
            FetchError::Timeout => SyncError::FetchTimeout,
            FetchError::RateLimited { retry_after_secs } => {
                SyncError::RateLimited { retry_after_secs }
            }
            FetchError::Unauthorized => SyncError::Unauthenticated,
            other => SyncError::Fetch(other.to_string()),
        }
    }
}
