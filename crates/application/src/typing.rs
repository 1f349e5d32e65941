//! 对端输入状态跟踪
//!
//! 每个 (peer, conversation) 只有一条记录和一个计时器：重复的开始事件会取消旧计时器并重新计时，
//! 停止事件删除记录并取消计时器。计时器任务只在代数（generation）匹配时才删除记录，
//! 被取代的旧计时器即使已经触发也不会误删新记录。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use domain::{ConversationId, TypingKey, TypingState, UserId};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::Clock;

/// 输入状态默认超时
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

struct Entry {
    state: TypingState,
    generation: u64,
    deadline: Instant,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    next_generation: u64,
    entries: HashMap<TypingKey, Entry>,
}

pub struct TypingTracker {
    timeout: Duration,
    clock: Arc<dyn Clock>,
    table: Arc<Mutex<Table>>,
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TypingTracker {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            timeout,
            clock,
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 对端开始输入：（重新）计时
    pub fn on_typing_start(&self, peer: &UserId, conversation: &ConversationId) -> TypingState {
        let key = TypingKey::new(peer.clone(), conversation.clone());
        let expires_at = self.clock.now()
            + ChronoDuration::from_std(self.timeout).unwrap_or_else(|_| ChronoDuration::zero());
        let state = TypingState {
            peer_id: peer.clone(),
            conversation_id: conversation.clone(),
            expires_at,
        };

        let mut table = lock(&self.table);
        let generation = table.next_generation;
        table.next_generation += 1;

        let deadline = Instant::now() + self.timeout;
        let timer = tokio::spawn(expire(
            Arc::downgrade(&self.table),
            key.clone(),
            generation,
            deadline,
        ));

        let previous = table.entries.insert(
            key,
            Entry {
                state: state.clone(),
                generation,
                deadline,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }

        debug!(peer = %peer, conversation = %conversation, "对端开始输入");
        state
    }

    /// 对端停止输入：删除记录并取消计时器
    pub fn on_typing_stop(&self, peer: &UserId, conversation: &ConversationId) -> bool {
        let key = TypingKey::new(peer.clone(), conversation.clone());
        match lock(&self.table).entries.remove(&key) {
            Some(entry) => {
                entry.timer.abort();
                debug!(peer = %peer, conversation = %conversation, "对端停止输入");
                true
            }
            None => false,
        }
    }

    pub fn is_typing(&self, peer: &UserId, conversation: &ConversationId) -> bool {
        let key = TypingKey::new(peer.clone(), conversation.clone());
        lock(&self.table)
            .entries
            .get(&key)
            .is_some_and(|entry| Instant::now() < entry.deadline)
    }

    /// 某个会话中正在输入的对端
    pub fn typing_in(&self, conversation: &ConversationId) -> Vec<UserId> {
        let now = Instant::now();
        let mut peers: Vec<UserId> = lock(&self.table)
            .entries
            .values()
            .filter(|entry| entry.state.conversation_id == *conversation && now < entry.deadline)
            .map(|entry| entry.state.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn active_count(&self) -> usize {
        lock(&self.table).entries.len()
    }

    /// 清空所有记录并同步取消全部计时器
    pub fn clear(&self) {
        let drained: Vec<Entry> = lock(&self.table).entries.drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.timer.abort();
        }
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        self.clear();
    }
}

async fn expire(table: Weak<Mutex<Table>>, key: TypingKey, generation: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let Some(table) = table.upgrade() else {
        return;
    };

    let mut table = lock(&table);
    if table
        .entries
        .get(&key)
        .is_some_and(|entry| entry.generation == generation)
    {
        table.entries.remove(&key);
        debug!(peer = %key.peer_id, conversation = %key.conversation_id, "输入状态超时清除");
    }
}
