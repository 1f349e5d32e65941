//! 对端在线状态投影（后写覆盖）

use std::sync::{PoisonError, RwLock};

use domain::{PresenceBook, PresenceEntry, PresenceUpdate, Timestamp, UserId};
use tracing::trace;

#[derive(Default)]
pub struct PresenceProjection {
    book: RwLock<PresenceBook>,
}

impl PresenceProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, update: &PresenceUpdate) -> bool {
        let applied = self
            .book
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(update);
        if !applied {
            trace!(user = %update.user_id, "忽略过期的在线状态观测");
        }
        applied
    }

    /// 对端有活动（例如开始输入），刷新最近活跃时间
    pub fn touch(&self, user_id: &UserId, at: Timestamp) -> bool {
        self.apply(&PresenceUpdate {
            user_id: user_id.clone(),
            online: true,
            last_active: Some(at),
            at,
        })
    }

    pub fn get(&self, user_id: &UserId) -> Option<PresenceEntry> {
        self.book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.get(user_id).is_some_and(|entry| entry.online)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users = self
            .book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .online_users();
        users.sort();
        users
    }

    pub fn clear(&self) {
        self.book
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
