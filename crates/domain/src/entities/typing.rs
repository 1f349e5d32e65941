use serde::{Deserialize, Serialize};

use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 输入状态的唯一键：每个 (peer, conversation) 最多一条活跃记录
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypingKey {
    pub peer_id: UserId,
    pub conversation_id: ConversationId,
}

impl TypingKey {
    pub fn new(peer_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            peer_id,
            conversation_id,
        }
    }
}

/// 对端正在输入的临时状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub peer_id: UserId,
    pub conversation_id: ConversationId,
    pub expires_at: Timestamp,
}

impl TypingState {
    pub fn key(&self) -> TypingKey {
        TypingKey::new(self.peer_id.clone(), self.conversation_id.clone())
    }
}
