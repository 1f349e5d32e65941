//! 同步客户端门面
//!
//! 一个已认证会话拥有一个 `SyncClient`：它持有连接管理器和各个状态组件，把推送主题路由给
//! 对应组件，并对上层只暴露只读投影和发送类操作。`shutdown()` 同步清理该会话的全部计时器、
//! 订阅和轮询任务，并推进纪元使进行中的异步结果作废。

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use config::SyncConfig;
use domain::{
    time_until, ClientEvent, ConversationId, DeliveryStatus, Message, MessageId, MetricsSnapshot,
    PresenceEntry, PushEvent, RoomId, ScheduleWindow, Session, SessionState, SlotRequest,
    SnapshotDelta, TimeUntil, Timestamp, Topic, UserId, ACTIVITY_FEED_GROUP,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::{ConversationApi, MetricsApi};
use crate::bus::{EventBus, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::connection::{ConnectionError, ConnectionManager, ConnectionSettings};
use crate::delivery::{DeliveryEvent, DeliveryStateMachine, ReadBatch};
use crate::error::SyncError;
use crate::presence::PresenceProjection;
use crate::rooms::{JoinOutcome, RoomMultiplexer};
use crate::snapshot::{FetchOutcome, SnapshotReconciler, DEFAULT_POLL_INTERVAL};
use crate::transport::{Credentials, PushTransport};
use crate::typing::{TypingTracker, DEFAULT_TYPING_TIMEOUT};

/// 默认的提前加入时间（分钟）
pub const DEFAULT_LEAD_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub connection: ConnectionSettings,
    pub typing_timeout: Duration,
    pub poll_interval: Duration,
    pub lead_minutes: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lead_minutes: DEFAULT_LEAD_MINUTES,
        }
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            connection: ConnectionSettings::from(config),
            typing_timeout: config.typing_timeout(),
            poll_interval: config.poll_interval(),
            lead_minutes: config.schedule.lead_minutes,
        }
    }
}

/// 外部协作方
pub struct Collaborators {
    pub transport: Arc<dyn PushTransport>,
    pub metrics: Arc<dyn MetricsApi>,
    pub conversations: Arc<dyn ConversationApi>,
}

/// 当前打开的视图，重连后据此重新加入房间
#[derive(Default)]
struct Views {
    conversations: BTreeSet<ConversationId>,
    admin: bool,
}

pub struct SyncClient {
    user_id: UserId,
    clock: Arc<dyn Clock>,
    lead_minutes: i64,
    bus: Arc<EventBus>,
    connection: Arc<ConnectionManager>,
    rooms: Arc<RoomMultiplexer>,
    typing: Arc<TypingTracker>,
    presence: Arc<PresenceProjection>,
    delivery: Arc<DeliveryStateMachine>,
    snapshot: Arc<SnapshotReconciler>,
    conversations: Arc<dyn ConversationApi>,
    views: Arc<Mutex<Views>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SyncClient {
    pub fn new(user_id: UserId, collaborators: Collaborators, settings: SyncSettings) -> Self {
        Self::with_clock(user_id, collaborators, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        user_id: UserId,
        collaborators: Collaborators,
        settings: SyncSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let Collaborators {
            transport,
            metrics,
            conversations,
        } = collaborators;

        let bus = Arc::new(EventBus::new());
        let connection = ConnectionManager::new(transport, bus.clone(), settings.connection.clone());
        // 监听器按注册顺序调用：先处理房间成员关系，再切换轮询，最后重新加入打开的视图
        let rooms = RoomMultiplexer::attach(connection.clone(), clock.clone());
        let snapshot = SnapshotReconciler::new(metrics, clock.clone(), settings.poll_interval);
        snapshot.attach(&connection);

        let client = Self {
            user_id: user_id.clone(),
            clock: clock.clone(),
            lead_minutes: settings.lead_minutes,
            bus,
            connection,
            rooms,
            typing: Arc::new(TypingTracker::new(settings.typing_timeout, clock)),
            presence: Arc::new(PresenceProjection::new()),
            delivery: Arc::new(DeliveryStateMachine::new(user_id)),
            snapshot,
            conversations,
            views: Arc::new(Mutex::new(Views::default())),
            subscriptions: Mutex::new(Vec::new()),
        };

        let mut subscriptions = client.route_push_events();
        subscriptions.push(client.rejoin_on_connect());
        *client.subscriptions() = subscriptions;
        client
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn views(&self) -> MutexGuard<'_, Views> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route_push_events(&self) -> Vec<Subscription> {
        let mut subscriptions = Vec::new();

        let delivery = self.delivery.clone();
        let typing = self.typing.clone();
        let me = self.user_id.clone();
        subscriptions.push(self.bus.subscribe(Topic::NewMessage, move |event| {
            if let PushEvent::NewMessage(message) = event {
                if !message.is_authored_by(&me) {
                    typing.on_typing_stop(&message.sender_id, &message.conversation_id);
                }
                delivery.upsert(message.clone());
            }
        }));

        let delivery = self.delivery.clone();
        subscriptions.push(self.bus.subscribe(Topic::MessageDelivered, move |event| {
            if let PushEvent::MessageDelivered { message_id, at } = event {
                delivery.apply_event(&DeliveryEvent::new(
                    message_id.clone(),
                    DeliveryStatus::Delivered,
                    *at,
                ));
            }
        }));

        let delivery = self.delivery.clone();
        subscriptions.push(self.bus.subscribe(Topic::MessagesRead, move |event| {
            if let PushEvent::MessagesRead {
                conversation_id,
                message_ids,
                at,
            } = event
            {
                let outcome = delivery.apply_read_batch(&ReadBatch {
                    conversation_id: conversation_id.clone(),
                    message_ids: message_ids.clone(),
                    at: *at,
                });
                for (message_id, err) in &outcome.failed {
                    warn!(message_id = %message_id, error = %err, "已读批次中的消息处理失败");
                }
            }
        }));

        let typing = self.typing.clone();
        let presence = self.presence.clone();
        let clock = self.clock.clone();
        let me = self.user_id.clone();
        subscriptions.push(self.bus.subscribe(Topic::UserTyping, move |event| {
            if let PushEvent::UserTyping {
                user_id,
                conversation_id,
            } = event
            {
                if *user_id == me {
                    return;
                }
                typing.on_typing_start(user_id, conversation_id);
                presence.touch(user_id, clock.now());
            }
        }));

        let typing = self.typing.clone();
        subscriptions.push(self.bus.subscribe(Topic::UserStoppedTyping, move |event| {
            if let PushEvent::UserStoppedTyping {
                user_id,
                conversation_id,
            } = event
            {
                typing.on_typing_stop(user_id, conversation_id);
            }
        }));

        let presence = self.presence.clone();
        subscriptions.push(self.bus.subscribe(Topic::PresenceUpdate, move |event| {
            if let PushEvent::PresenceUpdate(update) = event {
                presence.apply(update);
            }
        }));

        let snapshot = self.snapshot.clone();
        let clock = self.clock.clone();
        subscriptions.push(self.bus.subscribe(Topic::MetricsUpdate, move |event| {
            if let PushEvent::MetricsUpdate(update) = event {
                let at = update.timestamp.unwrap_or_else(|| clock.now());
                snapshot.merge_delta(&update.delta, at);
            }
        }));

        let snapshot = self.snapshot.clone();
        let clock = self.clock.clone();
        subscriptions.push(self.bus.subscribe(Topic::ActivityFeed, move |event| {
            if let PushEvent::ActivityFeed { items, timestamp } = event {
                let delta = SnapshotDelta::new().with_group(ACTIVITY_FEED_GROUP, items.clone());
                snapshot.merge_delta(&delta, timestamp.unwrap_or_else(|| clock.now()));
            }
        }));

        subscriptions
    }

    /// 重连后显式重新加入仍然打开的视图
    fn rejoin_on_connect(&self) -> Subscription {
        let rooms: Weak<RoomMultiplexer> = Arc::downgrade(&self.rooms);
        let connection: Weak<ConnectionManager> = Arc::downgrade(&self.connection);
        let views = Arc::downgrade(&self.views);

        self.connection.on_state_change(move |state| {
            if *state != SessionState::Connected {
                return;
            }
            let (Some(rooms), Some(connection), Some(views)) =
                (rooms.upgrade(), connection.upgrade(), views.upgrade())
            else {
                return;
            };

            let (conversations, admin) = {
                let views = views.lock().unwrap_or_else(PoisonError::into_inner);
                (views.conversations.clone(), views.admin)
            };
            for conversation in &conversations {
                rooms.join_room(RoomId::conversation(conversation));
            }
            if admin {
                rooms.join_room(RoomId::admin());
                request_dashboard_push(&connection);
            }
            debug!(conversations = conversations.len(), admin, "已重新加入打开的视图");
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn connect(&self, credentials: Credentials) -> Result<Session, SyncError> {
        self.connection.connect(credentials)
    }

    /// 断开推送通道但保留本地状态
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// 打开会话：加入房间并加载历史消息
    pub async fn open_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, SyncError> {
        self.views().conversations.insert(conversation_id.clone());
        self.rooms.join_room(RoomId::conversation(conversation_id));

        let epoch = self.connection.epoch();
        let messages = self.conversations.fetch_messages(conversation_id).await?;
        self.connection.ensure_current(epoch)?;

        self.delivery.hydrate(conversation_id, messages);
        Ok(self.delivery.messages_in(conversation_id))
    }

    pub fn close_conversation(&self, conversation_id: &ConversationId) {
        self.views().conversations.remove(conversation_id);
        self.rooms.leave_room(&RoomId::conversation(conversation_id));
    }

    /// 加入管理后台命名空间，请求推送并拉取一次完整快照
    pub async fn join_admin_dashboard(&self) -> Result<FetchOutcome, SyncError> {
        self.views().admin = true;
        if self.rooms.join_room(RoomId::admin()) == JoinOutcome::Joined {
            request_dashboard_push(&self.connection);
        }
        self.snapshot.fetch_if_not_in_flight().await
    }

    pub fn leave_admin_dashboard(&self) {
        self.views().admin = false;
        self.rooms.leave_room(&RoomId::admin());
    }

    pub fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: impl Into<String>,
    ) -> Result<(), SyncError> {
        self.connection.emit(ClientEvent::SendMessage {
            conversation_id: conversation_id.clone(),
            content: content.into(),
        })
    }

    pub fn start_typing(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        self.connection.emit(ClientEvent::TypingStart {
            conversation_id: conversation_id.clone(),
        })
    }

    pub fn stop_typing(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        self.connection.emit(ClientEvent::TypingStop {
            conversation_id: conversation_id.clone(),
        })
    }

    /// 标记会话已读：先请求服务端，成功后在本地应用已读截止并通知对端
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageId>, SyncError> {
        let epoch = self.connection.epoch();
        let issued_at = self.clock.now();
        let server_at = self.conversations.mark_read(conversation_id).await?;
        self.connection.ensure_current(epoch)?;

        let at = server_at.unwrap_or(issued_at);
        let advanced = self.delivery.apply_read_cutoff(conversation_id, at);
        if let Err(err) = self.connection.emit(ClientEvent::ConversationRead {
            conversation_id: conversation_id.clone(),
            at,
        }) {
            debug!(conversation = %conversation_id, error = %err, "未能推送已读通知");
        }
        Ok(advanced)
    }

    /// 主动拉取一次完整快照
    pub async fn refresh_snapshot(&self) -> Result<FetchOutcome, SyncError> {
        self.snapshot.fetch_if_not_in_flight().await
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn session(&self) -> Session {
        self.connection.session()
    }

    pub fn last_error(&self) -> Option<String> {
        self.connection.last_error()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.connection.watch_state()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ConnectionError> {
        self.connection.subscribe_errors()
    }

    /// 订阅原始推送事件
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(topic, handler)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.snapshot()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<MetricsSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.snapshot.is_polling()
    }

    pub fn message_status(&self, message_id: &MessageId) -> Option<DeliveryStatus> {
        self.delivery.status(message_id)
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.delivery.messages_in(conversation_id)
    }

    pub fn is_typing(&self, peer: &UserId, conversation_id: &ConversationId) -> bool {
        self.typing.is_typing(peer, conversation_id)
    }

    pub fn typing_in(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.typing.typing_in(conversation_id)
    }

    pub fn presence(&self, user_id: &UserId) -> Option<PresenceEntry> {
        self.presence.get(user_id)
    }

    pub fn is_joined(&self, room: &RoomId) -> bool {
        self.rooms.is_joined(room)
    }

    /// 现在能否加入 `[start, end]` 的排期（使用配置的提前时间）
    pub fn can_join(&self, start: Timestamp, end: Timestamp) -> Result<bool, SyncError> {
        let window = ScheduleWindow::new(start, end, self.lead_minutes)?;
        Ok(window.can_join(self.clock.now()))
    }

    pub fn time_until(&self, start: Timestamp) -> TimeUntil {
        time_until(start, self.clock.now())
    }

    /// 提交排期前的本地校验，不产生网络请求
    pub fn validate_slot(&self, request: &SlotRequest) -> Result<(), SyncError> {
        request.validate(self.clock.now())?;
        Ok(())
    }

    /// 拆除会话：断开连接、取消所有计时器和轮询、解除全部订阅
    pub fn shutdown(&self) {
        self.connection.disconnect();
        self.subscriptions().clear();
        self.bus.clear();
        self.typing.clear();
        self.snapshot.reset();
        self.rooms.reset();
        self.presence.clear();
        self.delivery.clear();
        *self.views() = Views::default();
        info!(user = %self.user_id, epoch = self.connection.epoch(), "同步会话已拆除");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.connection.disconnect();
        self.snapshot.reset();
    }
}

fn request_dashboard_push(connection: &ConnectionManager) {
    for event in [ClientEvent::MetricsRequest, ClientEvent::ActivityRequest] {
        if let Err(err) = connection.emit(event) {
            debug!(error = %err, "未能请求仪表盘推送");
        }
    }
}
