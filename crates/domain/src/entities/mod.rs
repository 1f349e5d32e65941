//! 领域实体定义
//!
//! 包含同步层的核心实体：会话、消息、输入状态、房间成员关系、指标快照、在线状态。

pub mod message;
pub mod metrics;
pub mod presence;
pub mod room_member;
pub mod session;
pub mod typing;

pub use message::{DeliveryStatus, Message};
pub use metrics::{
    merge, GroupEntry, MergeReport, MetricsSnapshot, MetricsUpdate, SnapshotDelta, ACTIVITY_FEED_GROUP,
};
pub use presence::{PresenceBook, PresenceEntry, PresenceUpdate};
pub use room_member::RoomMembership;
pub use session::{Session, SessionState};
pub use typing::{TypingKey, TypingState};
