//! 领域模型错误定义

use thiserror::Error;

use crate::value_objects::Timestamp;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 时间区间无效（结束时间不晚于开始时间）
    #[error("时间区间无效: {start} -> {end}")]
    InvalidTimeRange { start: Timestamp, end: Timestamp },

    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },

    /// 非法的状态转换
    #[error("非法的会话状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// 无法解析的载荷
    #[error("载荷格式错误: {message}")]
    MalformedPayload { message: String },
}

impl DomainError {
    /// 创建时间区间错误
    pub fn invalid_time_range(start: Timestamp, end: Timestamp) -> Self {
        Self::InvalidTimeRange { start, end }
    }

    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建载荷格式错误
    pub fn malformed_payload(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }
}

/// 领域操作结果类型
pub type DomainResult<T> = Result<T, DomainError>;
