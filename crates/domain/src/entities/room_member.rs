use serde::{Deserialize, Serialize};

use crate::value_objects::{RoomId, Timestamp};

/// 房间成员关系
///
/// 只在推送通道处于 connected 时存在；离开 connected 即被清空，重连后需由调用方显式重新加入。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembership {
    pub room_id: RoomId,
    pub joined_at: Timestamp,
}

impl RoomMembership {
    pub fn new(room_id: RoomId, joined_at: Timestamp) -> Self {
        Self { room_id, joined_at }
    }
}
