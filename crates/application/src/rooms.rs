//! 房间（逻辑主题）成员管理
//!
//! 只有在连接处于 `connected` 时才真正发出加入请求；其他状态下的加入请求排队，
//! 每个房间最多一条，连接建立后按入队顺序重放。连接离开 `connected` 时清空全部成员关系，
//! 重连后不会自动恢复，调用方需要重新加入。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use domain::{ClientEvent, RoomId, RoomMembership, SessionState};
use tracing::{debug, info, warn};

use crate::bus::Subscription;
use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::error::SyncError;

/// `join_room` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
    /// 当前未连接，已排队等待重放
    Queued,
}

#[derive(Default)]
struct Rooms {
    joined: HashMap<RoomId, RoomMembership>,
    pending: Vec<RoomId>,
}

pub struct RoomMultiplexer {
    connection: Arc<ConnectionManager>,
    clock: Arc<dyn Clock>,
    rooms: Mutex<Rooms>,
    listener: Mutex<Option<Subscription>>,
}

impl RoomMultiplexer {
    /// 创建并挂接到连接状态变化上
    pub fn attach(connection: Arc<ConnectionManager>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let multiplexer = Arc::new(Self {
            connection: connection.clone(),
            clock,
            rooms: Mutex::new(Rooms::default()),
            listener: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&multiplexer);
        let subscription = connection.on_state_change(move |state| {
            if let Some(multiplexer) = weak.upgrade() {
                multiplexer.on_state(*state);
            }
        });
        *multiplexer
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        multiplexer
    }

    fn lock(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 加入房间（幂等）
    pub fn join_room(&self, room: RoomId) -> JoinOutcome {
        let mut rooms = self.lock();
        if rooms.joined.contains_key(&room) {
            return JoinOutcome::AlreadyJoined;
        }

        if self.connection.state().is_connected() && self.send_join(&mut rooms, room.clone()) {
            return JoinOutcome::Joined;
        }

        if !rooms.pending.contains(&room) {
            debug!(room = %room, "未连接，加入请求排队");
            rooms.pending.push(room);
        }
        JoinOutcome::Queued
    }

    /// 离开房间（幂等）；同时撤销尚未重放的加入请求
    pub fn leave_room(&self, room: &RoomId) -> bool {
        let mut rooms = self.lock();
        rooms.pending.retain(|pending| pending != room);
        if rooms.joined.remove(room).is_none() {
            return false;
        }

        match self.connection.emit(ClientEvent::LeaveConversation { room: room.clone() }) {
            Ok(()) => debug!(room = %room, "已离开房间"),
            Err(err) => debug!(room = %room, error = %err, "离开房间时连接不可用"),
        }
        true
    }

    pub fn is_joined(&self, room: &RoomId) -> bool {
        self.lock().joined.contains_key(room)
    }

    pub fn is_pending(&self, room: &RoomId) -> bool {
        self.lock().pending.contains(room)
    }

    pub fn joined_rooms(&self) -> Vec<RoomMembership> {
        let mut rooms: Vec<RoomMembership> = self.lock().joined.values().cloned().collect();
        rooms.sort_by(|a, b| a.room_id.as_str().cmp(b.room_id.as_str()));
        rooms
    }

    pub fn pending_rooms(&self) -> Vec<RoomId> {
        self.lock().pending.clone()
    }

    /// 拆除会话时清空成员关系和排队请求
    pub fn reset(&self) {
        let mut rooms = self.lock();
        rooms.joined.clear();
        rooms.pending.clear();
    }

    fn send_join(&self, rooms: &mut Rooms, room: RoomId) -> bool {
        match self.connection.emit(ClientEvent::JoinConversation { room: room.clone() }) {
            Ok(()) => {
                info!(room = %room, "已加入房间");
                let membership = RoomMembership::new(room.clone(), self.clock.now());
                rooms.joined.insert(room, membership);
                true
            }
            Err(SyncError::NotConnected) => false,
            Err(err) => {
                warn!(room = %room, error = %err, "发送加入请求失败");
                false
            }
        }
    }

    fn on_state(&self, state: SessionState) {
        let mut rooms = self.lock();
        if state.is_connected() {
            let pending = std::mem::take(&mut rooms.pending);
            for room in pending {
                if rooms.joined.contains_key(&room) {
                    continue;
                }
                if !self.send_join(&mut rooms, room.clone()) {
                    rooms.pending.push(room);
                }
            }
        } else if !rooms.joined.is_empty() {
            info!(count = rooms.joined.len(), state = %state, "连接离开 connected，清空房间成员关系");
            rooms.joined.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::clock::SystemClock;
    use crate::connection::ConnectionSettings;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{CloseReason, Credentials, TransportError};
    use domain::ConversationId;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct Fixture {
        transport: Arc<MemoryTransport>,
        connection: Arc<ConnectionManager>,
        rooms: Arc<RoomMultiplexer>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        let connection = ConnectionManager::new(
            transport.clone(),
            Arc::new(EventBus::new()),
            ConnectionSettings::default(),
        );
        let rooms = RoomMultiplexer::attach(connection.clone(), Arc::new(SystemClock));
        Fixture {
            transport,
            connection,
            rooms,
        }
    }

    async fn wait_connected(connection: &ConnectionManager) {
        let mut rx = connection.watch_state();
        timeout(Duration::from_secs(30), rx.wait_for(|state| state.is_connected()))
            .await
            .unwrap()
            .unwrap();
    }

    fn room(id: &str) -> RoomId {
        RoomId::conversation(&ConversationId::from(id))
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_while_idle_is_queued_once_and_replayed() {
        let f = fixture();

        assert_eq!(f.rooms.join_room(room("c-1")), JoinOutcome::Queued);
        assert_eq!(f.rooms.join_room(room("c-1")), JoinOutcome::Queued);
        assert_eq!(f.rooms.pending_rooms().len(), 1);

        f.connection.connect(Credentials::bearer("token")).unwrap();
        wait_connected(&f.connection).await;

        assert!(f.rooms.is_joined(&room("c-1")));
        assert!(f.rooms.pending_rooms().is_empty());
        let sent = f.transport.last_server().unwrap().drain_received();
        assert_eq!(sent, vec![ClientEvent::JoinConversation { room: room("c-1") }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_is_idempotent_when_connected() {
        let f = fixture();
        f.connection.connect(Credentials::bearer("token")).unwrap();
        wait_connected(&f.connection).await;

        assert_eq!(f.rooms.join_room(RoomId::admin()), JoinOutcome::Joined);
        assert_eq!(f.rooms.join_room(RoomId::admin()), JoinOutcome::AlreadyJoined);
        assert_eq!(f.transport.last_server().unwrap().drain_received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memberships_cleared_on_disconnect_and_not_recreated() {
        let f = fixture();
        f.connection.connect(Credentials::bearer("token")).unwrap();
        wait_connected(&f.connection).await;
        f.rooms.join_room(room("c-1"));
        assert_eq!(f.rooms.joined_rooms().len(), 1);

        f.transport
            .last_server()
            .unwrap()
            .close(CloseReason::Transport(TransportError::network("reset")));
        sleep(Duration::from_millis(10)).await;
        assert!(f.rooms.joined_rooms().is_empty());

        wait_connected(&f.connection).await;
        assert!(f.rooms.joined_rooms().is_empty());
        assert!(f.transport.last_server().unwrap().drain_received().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_cancels_pending_join() {
        let f = fixture();
        f.rooms.join_room(room("c-1"));
        assert!(!f.rooms.leave_room(&room("c-1")));
        assert!(!f.rooms.is_pending(&room("c-1")));

        f.connection.connect(Credentials::bearer("token")).unwrap();
        wait_connected(&f.connection).await;
        assert!(f.transport.last_server().unwrap().drain_received().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_joined_room_emits_leave() {
        let f = fixture();
        f.connection.connect(Credentials::bearer("token")).unwrap();
        wait_connected(&f.connection).await;
        f.rooms.join_room(room("c-1"));

        assert!(f.rooms.leave_room(&room("c-1")));
        assert!(!f.rooms.leave_room(&room("c-1")));
        let sent = f.transport.last_server().unwrap().drain_received();
        assert_eq!(sent.last(), Some(&ClientEvent::LeaveConversation { room: room("c-1") }));
    }
}
