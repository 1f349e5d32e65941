//! 客户端实时同步层的应用层实现。
//!
//! 有状态组件都在这里：推送连接管理、房间多路复用、输入与在线状态、消息投递状态机、
//! 指标快照协调，以及把它们组装到一起的 [`SyncClient`]。推送传输和 REST 接口以 trait
//! 形式出现，具体实现在基础设施层。

pub mod api;
pub mod backoff;
pub mod bus;
pub mod client;
pub mod clock;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod presence;
pub mod rooms;
pub mod snapshot;
pub mod transport;
pub mod typing;

pub use api::{ConversationApi, FetchError, FetchedSnapshot, MetricsApi};
pub use backoff::Backoff;
pub use bus::{EventBus, HandlerRegistry, Subscription};
pub use client::{Collaborators, SyncClient, SyncSettings};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionError, ConnectionErrorKind, ConnectionManager, ConnectionSettings};
pub use delivery::{Applied, BatchOutcome, DeliveryEvent, DeliveryStateMachine, ReadBatch};
pub use error::SyncError;
pub use presence::PresenceProjection;
pub use rooms::{JoinOutcome, RoomMultiplexer};
pub use snapshot::{FetchOutcome, SnapshotReconciler};
pub use transport::{CloseReason, Credentials, Inbound, PushLink, PushTransport, TransportError};
pub use typing::TypingTracker;
