//! 推送会话实体
//!
//! 状态机：`idle → connecting → connected`；`connected → disconnected → connecting`（重试）
//! 或 `disconnected → polling`（重试耗尽）；任意状态在显式断开时回到 `idle`。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};

/// 会话连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Polling,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self == next {
            return false;
        }
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Connecting)
                | (Disconnected, Polling)
                | (Polling, Connecting)
                | (_, Idle)
        )
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }

    /// 推送通道不可用、需要轮询兜底的状态
    pub fn needs_poll_fallback(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Polling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Polling => "polling",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个已认证客户端的推送会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// 传输层分配的连接ID，仅在 connected 期间存在
    pub connection_id: Option<String>,
    pub state: SessionState,
    /// 连续失败次数，连接稳定后（收到事件或存活足够久）才清零
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    /// 每次显式拆除时递增，用于识别过期的异步结果
    pub epoch: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            connection_id: None,
            state: SessionState::Idle,
            reconnect_attempts: 0,
            last_error: None,
            epoch: 0,
        }
    }

    /// 执行状态转换，返回之前的状态
    pub fn transition(&mut self, next: SessionState) -> DomainResult<SessionState> {
        let prev = self.state;
        if !prev.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: prev.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        if next != SessionState::Connected {
            self.connection_id = None;
        }
        Ok(prev)
    }

    /// 标记握手成功；重连计数保留到连接稳定为止
    pub fn mark_connected(&mut self, connection_id: impl Into<String>) -> DomainResult<SessionState> {
        let prev = self.transition(SessionState::Connected)?;
        self.connection_id = Some(connection_id.into());
        self.last_error = None;
        Ok(prev)
    }

    /// 连接已稳定，结束本轮失败计数；不在 connected 状态时返回 false
    pub fn mark_stable(&mut self) -> bool {
        if !self.state.is_connected() {
            return false;
        }
        self.reconnect_attempts = 0;
        true
    }

    /// 记录一次失败；`counted` 为 false 时不计入重连次数
    pub fn record_failure(&mut self, error: impl Into<String>, counted: bool) -> u32 {
        if counted {
            self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        }
        self.last_error = Some(error.into());
        self.reconnect_attempts
    }

    /// 显式拆除：进入新纪元并回到 idle
    pub fn teardown(&mut self) -> SessionState {
        let prev = self.state;
        self.epoch = self.epoch.wrapping_add(1);
        self.state = SessionState::Idle;
        self.connection_id = None;
        self.reconnect_attempts = 0;
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut session = Session::new();
        assert_eq!(session.transition(SessionState::Connecting), Ok(SessionState::Idle));
        session.mark_connected("conn-1").unwrap();
        assert_eq!(session.connection_id.as_deref(), Some("conn-1"));

        session.transition(SessionState::Disconnected).unwrap();
        assert!(session.connection_id.is_none());
        session.transition(SessionState::Polling).unwrap();
        session.transition(SessionState::Connecting).unwrap();
    }

    #[test]
    fn test_rejects_skipping_states() {
        let mut session = Session::new();
        assert!(session.transition(SessionState::Connected).is_err());
        assert!(session.transition(SessionState::Polling).is_err());
        assert!(session.transition(SessionState::Idle).is_err());
        assert_eq!(session.state, SessionState::Idle);
    }

    #[test]
    fn test_failures_and_teardown() {
        let mut session = Session::new();
        session.transition(SessionState::Connecting).unwrap();
        assert_eq!(session.record_failure("refused", true), 1);
        assert_eq!(session.record_failure("server closed", false), 1);
        assert_eq!(session.last_error.as_deref(), Some("server closed"));

        session.mark_connected("conn-2").unwrap();
        assert_eq!(session.reconnect_attempts, 1);
        assert!(session.mark_stable());
        assert_eq!(session.reconnect_attempts, 0);

        session.transition(SessionState::Disconnected).unwrap();
        session.record_failure("reset", true);
        assert!(!session.mark_stable());
        assert_eq!(session.reconnect_attempts, 1);

        let prev = session.teardown();
        assert_eq!(prev, SessionState::Disconnected);
        assert_eq!(session.epoch, 1);
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.reconnect_attempts, 0);
    }

    #[test]
    fn test_poll_fallback_states() {
        assert!(SessionState::Polling.needs_poll_fallback());
        assert!(SessionState::Disconnected.needs_poll_fallback());
        assert!(!SessionState::Connecting.needs_poll_fallback());
        assert!(!SessionState::Connected.needs_poll_fallback());
    }
}
