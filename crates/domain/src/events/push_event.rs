use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{Message, MetricsUpdate, PresenceUpdate};
use crate::value_objects::{ConversationId, MessageId, RoomId, Timestamp, UserId};

/// 服务端推送的事件（消费的主题）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum PushEvent {
    /// 新消息
    #[serde(rename = "new_message")]
    NewMessage(Message),
    /// 消息已送达
    #[serde(rename = "message_delivered")]
    MessageDelivered { message_id: MessageId, at: Timestamp },
    /// 对端已读一批消息
    #[serde(rename = "messages_read")]
    MessagesRead {
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        message_ids: Vec<MessageId>,
        at: Timestamp,
    },
    /// 对端开始输入
    #[serde(rename = "user_typing")]
    UserTyping {
        user_id: UserId,
        conversation_id: ConversationId,
    },
    /// 对端停止输入
    #[serde(rename = "user_stopped_typing")]
    UserStoppedTyping {
        user_id: UserId,
        conversation_id: ConversationId,
    },
    /// 在线状态变化
    #[serde(rename = "presence:update")]
    PresenceUpdate(PresenceUpdate),
    /// 指标增量（部分分组）
    #[serde(rename = "metrics:update")]
    MetricsUpdate(MetricsUpdate),
    /// 活动流
    #[serde(rename = "activity:feed")]
    ActivityFeed {
        items: Value,
        #[serde(default)]
        timestamp: Option<Timestamp>,
    },
}

impl PushEvent {
    pub fn topic(&self) -> Topic {
        match self {
            PushEvent::NewMessage(_) => Topic::NewMessage,
            PushEvent::MessageDelivered { .. } => Topic::MessageDelivered,
            PushEvent::MessagesRead { .. } => Topic::MessagesRead,
            PushEvent::UserTyping { .. } => Topic::UserTyping,
            PushEvent::UserStoppedTyping { .. } => Topic::UserStoppedTyping,
            PushEvent::PresenceUpdate(_) => Topic::PresenceUpdate,
            PushEvent::MetricsUpdate(_) => Topic::MetricsUpdate,
            PushEvent::ActivityFeed { .. } => Topic::ActivityFeed,
        }
    }
}

/// 推送事件主题，供事件总线按主题订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    NewMessage,
    MessageDelivered,
    MessagesRead,
    UserTyping,
    UserStoppedTyping,
    PresenceUpdate,
    MetricsUpdate,
    ActivityFeed,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::NewMessage => "new_message",
            Topic::MessageDelivered => "message_delivered",
            Topic::MessagesRead => "messages_read",
            Topic::UserTyping => "user_typing",
            Topic::UserStoppedTyping => "user_stopped_typing",
            Topic::PresenceUpdate => "presence:update",
            Topic::MetricsUpdate => "metrics:update",
            Topic::ActivityFeed => "activity:feed",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 客户端发出的事件（发出的主题）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// 加入房间
    #[serde(rename = "join_conversation")]
    JoinConversation { room: RoomId },
    /// 离开房间
    #[serde(rename = "leave_conversation")]
    LeaveConversation { room: RoomId },
    /// 发送消息
    #[serde(rename = "send_message")]
    SendMessage {
        conversation_id: ConversationId,
        content: String,
    },
    /// 开始输入
    #[serde(rename = "typing_start")]
    TypingStart { conversation_id: ConversationId },
    /// 停止输入
    #[serde(rename = "typing_stop")]
    TypingStop { conversation_id: ConversationId },
    /// 当前用户已读会话
    #[serde(rename = "conversation_read")]
    ConversationRead {
        conversation_id: ConversationId,
        at: Timestamp,
    },
    /// 请求一次完整指标推送
    #[serde(rename = "metrics:request")]
    MetricsRequest,
    /// 请求活动流推送
    #[serde(rename = "activity:request")]
    ActivityRequest,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinConversation { .. } => "join_conversation",
            ClientEvent::LeaveConversation { .. } => "leave_conversation",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::TypingStart { .. } => "typing_start",
            ClientEvent::TypingStop { .. } => "typing_stop",
            ClientEvent::ConversationRead { .. } => "conversation_read",
            ClientEvent::MetricsRequest => "metrics:request",
            ClientEvent::ActivityRequest => "activity:request",
        }
    }
}
