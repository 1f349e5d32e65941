//! 消息投递状态机
//!
//! 每条消息的状态只会前进（sent < delivered < read），重复或更低等级的事件是空操作，
//! 因此无论事件以什么顺序到达，最终状态都等于见过的最高等级。
//!
//! 已读只来自两种显式信号：按 id 的已读批次，以及按时间截止的已读（仅对端发送的消息）。
//! 不会因为“发送者不是我”就推断已读。
//!
//! 消息尚未加载时到达的状态事件会被暂存（同一消息只保留最高等级），消息加载后再应用。

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use domain::{ConversationId, DeliveryStatus, Message, MessageId, Timestamp, UserId};
use tracing::{debug, warn};

use crate::error::SyncError;

/// 暂存事件的上限，超出时丢弃最早的
pub const DEFAULT_MAX_PARKED: usize = 1000;

/// 单条投递状态事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    pub message_id: MessageId,
    pub kind: DeliveryStatus,
    pub at: Timestamp,
}

impl DeliveryEvent {
    pub fn new(message_id: MessageId, kind: DeliveryStatus, at: Timestamp) -> Self {
        Self {
            message_id,
            kind,
            at,
        }
    }
}

/// 按 id 的已读批次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    /// 批次所属会话；给出时会校验每条消息的归属
    pub conversation_id: Option<ConversationId>,
    pub message_ids: Vec<MessageId>,
    pub at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Advanced,
    /// 重复或更低等级，状态未变
    Unchanged,
    /// 消息尚未加载，已暂存
    Parked,
}

/// 已读批次的逐条处理结果
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub advanced: Vec<MessageId>,
    pub unchanged: Vec<MessageId>,
    pub parked: Vec<MessageId>,
    pub failed: Vec<(MessageId, SyncError)>,
}

impl BatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct ParkedEvent {
    kind: DeliveryStatus,
    at: Timestamp,
}

#[derive(Default)]
struct Store {
    messages: HashMap<MessageId, Message>,
    by_conversation: HashMap<ConversationId, Vec<MessageId>>,
    parked: HashMap<MessageId, ParkedEvent>,
    parked_order: VecDeque<MessageId>,
}

impl Store {
    fn park(&mut self, event: &DeliveryEvent, capacity: usize) {
        match self.parked.get_mut(&event.message_id) {
            Some(existing) => {
                if event.kind.rank() > existing.kind.rank() {
                    *existing = ParkedEvent {
                        kind: event.kind,
                        at: event.at,
                    };
                }
            }
            None => {
                if self.parked_order.len() >= capacity {
                    if let Some(evicted) = self.parked_order.pop_front() {
                        self.parked.remove(&evicted);
                        warn!(message_id = %evicted, "暂存事件过多，丢弃最早的一条");
                    }
                }
                self.parked.insert(
                    event.message_id.clone(),
                    ParkedEvent {
                        kind: event.kind,
                        at: event.at,
                    },
                );
                self.parked_order.push_back(event.message_id.clone());
            }
        }
    }

    fn take_parked(&mut self, id: &MessageId) -> Option<ParkedEvent> {
        let parked = self.parked.remove(id)?;
        self.parked_order.retain(|parked_id| parked_id != id);
        Some(parked)
    }
}

pub struct DeliveryStateMachine {
    current_user: UserId,
    max_parked: usize,
    store: RwLock<Store>,
}

impl DeliveryStateMachine {
    pub fn new(current_user: UserId) -> Self {
        Self::with_capacity(current_user, DEFAULT_MAX_PARKED)
    }

    pub fn with_capacity(current_user: UserId, max_parked: usize) -> Self {
        Self {
            current_user,
            max_parked: max_parked.max(1),
            store: RwLock::new(Store::default()),
        }
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 插入或合并一条消息，返回合并后的状态。
    ///
    /// 已存在时只接受更高等级的状态，并应用该消息的暂存事件。
    pub fn upsert(&self, message: Message) -> DeliveryStatus {
        let mut guard = self.write();
        let store = &mut *guard;
        let id = message.id.clone();
        let parked = store.take_parked(&id);

        match store.messages.get_mut(&id) {
            Some(existing) => {
                if message.status.rank() > existing.status.rank() {
                    existing.status = message.status;
                    existing.delivered_at = message.delivered_at.or(existing.delivered_at);
                    existing.read_at = message.read_at.or(existing.read_at);
                }
                if let Some(parked) = parked {
                    existing.advance(parked.kind, parked.at);
                }
                existing.status
            }
            None => {
                let mut message = message;
                if let Some(parked) = parked {
                    message.advance(parked.kind, parked.at);
                }
                let status = message.status;
                store
                    .by_conversation
                    .entry(message.conversation_id.clone())
                    .or_default()
                    .push(id.clone());
                store.messages.insert(id, message);
                status
            }
        }
    }

    /// 批量加载某个会话的消息，归属不符的消息被跳过
    pub fn hydrate(&self, conversation_id: &ConversationId, messages: Vec<Message>) -> usize {
        let mut loaded = 0;
        for message in messages {
            if &message.conversation_id != conversation_id {
                warn!(
                    message_id = %message.id,
                    conversation = %conversation_id,
                    "加载的消息不属于该会话，已跳过"
                );
                continue;
            }
            self.upsert(message);
            loaded += 1;
        }
        debug!(conversation = %conversation_id, loaded, "会话消息已加载");
        loaded
    }

    /// 应用单条状态事件
    pub fn apply_event(&self, event: &DeliveryEvent) -> Applied {
        let mut store = self.write();
        self.apply_locked(&mut store, event)
    }

    fn apply_locked(&self, store: &mut Store, event: &DeliveryEvent) -> Applied {
        let Some(message) = store.messages.get_mut(&event.message_id) else {
            debug!(message_id = %event.message_id, kind = %event.kind, "消息未加载，暂存状态事件");
            store.park(event, self.max_parked);
            return Applied::Parked;
        };

        if message.advance(event.kind, event.at) {
            debug!(message_id = %event.message_id, status = %message.status, "消息状态前进");
            Applied::Advanced
        } else {
            debug!(
                message_id = %event.message_id,
                current = %message.status,
                incoming = %event.kind,
                "忽略重复或回退的状态事件"
            );
            Applied::Unchanged
        }
    }

    /// 逐条应用已读批次，单条失败不影响其他消息
    pub fn apply_read_batch(&self, batch: &ReadBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut store = self.write();

        for id in &batch.message_ids {
            if let (Some(expected), Some(message)) =
                (batch.conversation_id.as_ref(), store.messages.get(id))
            {
                if &message.conversation_id != expected {
                    warn!(message_id = %id, conversation = %expected, "已读批次中的消息不属于该会话");
                    outcome.failed.push((
                        id.clone(),
                        SyncError::ConversationMismatch {
                            message_id: id.clone(),
                            expected: expected.to_string(),
                        },
                    ));
                    continue;
                }
            }

            let event = DeliveryEvent::new(id.clone(), DeliveryStatus::Read, batch.at);
            match self.apply_locked(&mut store, &event) {
                Applied::Advanced => outcome.advanced.push(id.clone()),
                Applied::Unchanged => outcome.unchanged.push(id.clone()),
                Applied::Parked => outcome.parked.push(id.clone()),
            }
        }

        outcome
    }

    /// 把会话中对端在 `at` 及之前发送的消息标记为已读，返回状态前进的消息
    pub fn apply_read_cutoff(&self, conversation_id: &ConversationId, at: Timestamp) -> Vec<MessageId> {
        let mut guard = self.write();
        let store = &mut *guard;
        let ids = store
            .by_conversation
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();

        let mut advanced = Vec::new();
        for id in ids {
            let Some(message) = store.messages.get_mut(&id) else {
                continue;
            };
            if message.is_authored_by(&self.current_user) || message.created_at > at {
                continue;
            }
            if message.advance(DeliveryStatus::Read, at) {
                advanced.push(id);
            }
        }

        debug!(conversation = %conversation_id, count = advanced.len(), "按时间截止标记已读");
        advanced
    }

    pub fn status(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        self.read().messages.get(message_id).map(|message| message.status)
    }

    pub fn message(&self, message_id: &MessageId) -> Result<Message, SyncError> {
        self.read()
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))
    }

    /// 会话中的消息，按创建时间排序
    pub fn messages_in(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let store = self.read();
        let mut messages: Vec<Message> = store
            .by_conversation
            .get(conversation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| store.messages.get(id).cloned())
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        messages
    }

    pub fn parked_count(&self) -> usize {
        self.read().parked.len()
    }

    pub fn clear(&self) {
        *self.write() = Store::default();
    }
}
