//! 对端在线状态投影
//!
//! 不是状态机：按观测时间做后写覆盖（last-write-wins）。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value_objects::{Timestamp, UserId};

/// 一次在线状态观测（心跳、成员变更或 `presence:update` 推送）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<Timestamp>,
    pub at: Timestamp,
}

/// 投影中的在线状态记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub online: bool,
    pub last_active: Timestamp,
    pub observed_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceBook {
    entries: HashMap<UserId, PresenceEntry>,
}

impl PresenceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用一次观测；比现有记录旧的观测被忽略，返回是否生效
    pub fn apply(&mut self, update: &PresenceUpdate) -> bool {
        if let Some(existing) = self.entries.get(&update.user_id) {
            if update.at < existing.observed_at {
                return false;
            }
        }

        let last_active = update.last_active.unwrap_or(update.at);
        self.entries.insert(
            update.user_id.clone(),
            PresenceEntry {
                online: update.online,
                last_active,
                observed_at: update.at,
            },
        );
        true
    }

    pub fn get(&self, user_id: &UserId) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.online)
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_last_write_wins_by_observation_time() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let user = UserId::from("peer");
        let mut book = PresenceBook::new();

        assert!(book.apply(&PresenceUpdate {
            user_id: user.clone(),
            online: false,
            last_active: Some(base),
            at: base + Duration::seconds(10),
        }));
        assert!(!book.apply(&PresenceUpdate {
            user_id: user.clone(),
            online: true,
            last_active: None,
            at: base + Duration::seconds(5),
        }));

        let entry = book.get(&user).unwrap();
        assert!(!entry.online);
        assert_eq!(entry.last_active, base);
        assert!(book.online_users().is_empty());
    }
}
