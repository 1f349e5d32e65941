//! 消息实体定义
//!
//! 消息的投递状态只能单调前进：sent < delivered < read。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

/// 消息投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// 已发送
    Sent,
    /// 已送达
    Delivered,
    /// 已读
    Read,
}

impl DeliveryStatus {
    /// 状态等级，用于单调推进判断
    pub fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        Self::Sent
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub status: DeliveryStatus,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<Timestamp>,
}

impl Message {
    /// 创建一条刚发送的消息
    pub fn new_sent(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            content: content.into(),
            status: DeliveryStatus::Sent,
            created_at,
            delivered_at: None,
            read_at: None,
        }
    }

    /// 推进投递状态。
    ///
    /// 仅当 `rank(kind) > rank(current)` 时生效，返回是否发生了变化。
    /// 直接跳到 read 时同时补齐 `delivered_at`。
    pub fn advance(&mut self, kind: DeliveryStatus, at: Timestamp) -> bool {
        if kind.rank() <= self.status.rank() {
            return false;
        }

        match kind {
            DeliveryStatus::Sent => {}
            DeliveryStatus::Delivered => {
                self.delivered_at = Some(at);
            }
            DeliveryStatus::Read => {
                if self.delivered_at.is_none() {
                    self.delivered_at = Some(at);
                }
                self.read_at = Some(at);
            }
        }
        self.status = kind;
        true
    }

    /// 是否由指定用户发出
    pub fn is_authored_by(&self, user_id: &UserId) -> bool {
        &self.sender_id == user_id
    }
}
