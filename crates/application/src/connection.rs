//! 推送连接管理器
//!
//! 每个已认证会话一个实例，负责推送通道的生命周期与重连策略：
//! - 凭证为空立即返回 `Unauthenticated`，不做任何连接尝试；
//! - 传输失败累加 `reconnect_attempts` 并按退避策略重试，达到上限后进入 `polling`
//!   且只发出一次 `connectionError`；
//! - 服务端主动断开时立即重连一次，不计入重连次数；同一轮失败中再次被服务端断开则走计数退避；
//! - 连接收到事件或存活满 `stable_after` 才算稳定，此时重连计数清零；
//! - `disconnect()` 终结当前纪元，旧纪元的异步结果到达时被丢弃。
//!
//! 所有状态提交与监听器通知都在同一把门锁内完成，监听器看到的状态顺序与提交顺序一致。
//! 监听器内部不能再调用 `connect`/`disconnect`。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use config::SyncConfig;
use domain::{ClientEvent, DomainResult, Session, SessionState};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::bus::{EventBus, HandlerRegistry, Subscription};
use crate::error::SyncError;
use crate::transport::{CloseReason, Credentials, Inbound, PushLink, PushTransport, TransportError};

/// 重连次数上限的默认值
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// 连接被视为稳定所需的默认存活时间
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(10);

/// 连接策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub max_reconnect_attempts: u32,
    pub backoff: Backoff,
    pub stable_after: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: Backoff::exponential(Duration::from_secs(1), Duration::from_secs(5)),
            stable_after: DEFAULT_STABLE_AFTER,
        }
    }
}

impl From<&SyncConfig> for ConnectionSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_reconnect_attempts: config.push.max_reconnect_attempts,
            backoff: Backoff::exponential(
                config.reconnect_base_delay(),
                config.reconnect_max_delay(),
            ),
            stable_after: config.stable_after(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// 重连次数耗尽，已降级为轮询
    Exhausted,
    /// 服务端拒绝凭证
    Rejected,
}

/// 聚合后的连接错误，每次降级只发出一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub epoch: u64,
    pub attempts: u32,
    pub message: String,
}

struct Inner {
    session: Session,
    outbound: Option<tokio::sync::mpsc::UnboundedSender<ClientEvent>>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

enum LinkEnd {
    /// 会话已被拆除或纪元已过期
    Cancelled,
    Closed { reason: CloseReason, stable: bool },
}

pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    settings: ConnectionSettings,
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
    gate: Mutex<()>,
    listeners: HandlerRegistry<(), SessionState>,
    state_tx: watch::Sender<SessionState>,
    errors_tx: broadcast::Sender<ConnectionError>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        bus: Arc<EventBus>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (errors_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            transport,
            settings,
            bus,
            inner: Mutex::new(Inner {
                session: Session::new(),
                outbound: None,
                cancel: CancellationToken::new(),
                driver: None,
            }),
            gate: Mutex::new(()),
            listeners: HandlerRegistry::new(),
            state_tx,
            errors_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 建立推送连接。已在连接流程中时直接返回当前会话。
    pub fn connect(self: &Arc<Self>, credentials: Credentials) -> Result<Session, SyncError> {
        if credentials.is_empty() {
            warn!("缺少凭证，拒绝建立推送连接");
            return Err(SyncError::Unauthenticated);
        }

        let _gate = self.gate();
        let (session, epoch, cancel) = {
            let mut inner = self.lock();
            match inner.session.state {
                SessionState::Connecting | SessionState::Connected | SessionState::Disconnected => {
                    debug!(state = %inner.session.state, "推送连接已在进行中");
                    return Ok(inner.session.clone());
                }
                SessionState::Idle | SessionState::Polling => {}
            }

            inner.session.transition(SessionState::Connecting)?;
            inner.session.reconnect_attempts = 0;
            inner.session.last_error = None;
            inner.cancel = CancellationToken::new();
            (
                inner.session.clone(),
                inner.session.epoch,
                inner.cancel.clone(),
            )
        };
        self.announce(SessionState::Connecting);

        info!(epoch, "开始建立推送连接");
        let driver = tokio::spawn(self.clone().drive(epoch, cancel, credentials));
        self.lock().driver = Some(driver);
        Ok(session)
    }

    /// 显式断开：终结当前纪元，同步取消退避计时器和事件泵。
    ///
    /// 正在进行的握手允许完成，但结果会因纪元不匹配被丢弃。
    pub fn disconnect(&self) {
        let _gate = self.gate();
        let (prev, epoch) = {
            let mut inner = self.lock();
            inner.cancel.cancel();
            inner.outbound = None;
            inner.driver = None;
            let prev = inner.session.teardown();
            (prev, inner.session.epoch)
        };

        info!(epoch, from = %prev, "推送连接已断开");
        if prev != SessionState::Idle {
            self.announce(SessionState::Idle);
        }
    }

    /// 发送客户端事件；未连接时返回 `NotConnected`
    pub fn emit(&self, event: ClientEvent) -> Result<(), SyncError> {
        let inner = self.lock();
        if !inner.session.state.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let Some(outbound) = inner.outbound.as_ref() else {
            return Err(SyncError::NotConnected);
        };

        let name = event.name();
        outbound.send(event).map_err(|_| {
            SyncError::Transport(TransportError::closed(format!(
                "outbound channel closed while sending {name}"
            )))
        })?;
        debug!(event = name, "已发送客户端事件");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.lock().session.state
    }

    pub fn session(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().session.last_error.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().session.epoch
    }

    /// 校验异步结果所属纪元是否仍然有效
    pub fn ensure_current(&self, epoch: u64) -> Result<(), SyncError> {
        let live_epoch = self.epoch();
        if live_epoch != epoch {
            return Err(SyncError::stale(epoch, live_epoch));
        }
        Ok(())
    }

    /// 异步观察者使用的状态接收端
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// 聚合连接错误（`connectionError`）
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ConnectionError> {
        self.errors_tx.subscribe()
    }

    /// 同步状态监听器，在状态提交后立即调用
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.listeners.subscribe((), handler)
    }

    fn announce(&self, state: SessionState) {
        self.state_tx.send_replace(state);
        self.listeners.publish(&(), &state);
    }

    /// 在门锁内提交一次状态变更；纪元不匹配或转换非法时放弃
    fn commit<F>(&self, epoch: u64, apply: F) -> bool
    where
        F: FnOnce(&mut Inner) -> DomainResult<SessionState>,
    {
        let _gate = self.gate();
        let next = {
            let mut inner = self.lock();
            if inner.session.epoch != epoch {
                debug!(
                    error = %SyncError::stale(epoch, inner.session.epoch),
                    "丢弃过期会话的状态变更"
                );
                return false;
            }
            match apply(&mut inner) {
                Ok(next) => next,
                Err(err) => {
                    warn!(error = %err, "忽略非法的会话状态转换");
                    return false;
                }
            }
        };

        debug!(epoch, state = %next, "会话状态变化");
        self.announce(next);
        true
    }

    fn enter(&self, epoch: u64, next: SessionState) -> bool {
        self.commit(epoch, |inner| inner.session.transition(next).map(|_| next))
    }

    async fn drive(self: Arc<Self>, epoch: u64, cancel: CancellationToken, credentials: Credentials) {
        let max_attempts = self.settings.max_reconnect_attempts;
        // 本轮失败中是否已用掉那次不计数的立即重连
        let mut retried_immediately = false;
        // 下一次失败是否属于立即重连（不计数）
        let mut immediate = false;

        loop {
            let attempt = self.transport.connect(&credentials).await;
            if let Err(stale) = self.ensure_current(epoch) {
                // 旧纪元的握手结果：丢弃即关闭连接
                debug!(error = %stale, "丢弃过期的握手结果");
                return;
            }

            let failure = match attempt {
                Ok(link) => {
                    // 握手成功，之后的失败照常计数
                    immediate = false;
                    match self.run_link(epoch, &cancel, link).await {
                        LinkEnd::Cancelled => return,
                        LinkEnd::Closed { reason, stable } => {
                            if stable {
                                retried_immediately = false;
                            }
                            match reason {
                                CloseReason::ClientInitiated => return,
                                CloseReason::ServerInitiated if !retried_immediately => {
                                    info!(epoch, "服务端主动断开，立即重连一次");
                                    if !self.reconnect_now(epoch) {
                                        return;
                                    }
                                    retried_immediately = true;
                                    immediate = true;
                                    continue;
                                }
                                CloseReason::ServerInitiated => {
                                    debug!(epoch, "连接未稳定前再次被服务端断开，按失败计数");
                                    TransportError::closed("server closed an unstable connection")
                                }
                                CloseReason::Transport(err) => err,
                            }
                        }
                    }
                }
                Err(err) => err,
            };

            if failure == TransportError::Unauthorized {
                self.reject(epoch, &failure);
                return;
            }

            // 立即重连那一次不计数
            let counted = !std::mem::take(&mut immediate);
            let message = failure.to_string();
            let mut attempts = 0;
            let entered = self.commit(epoch, |inner| {
                attempts = inner.session.record_failure(message.clone(), counted);
                inner.outbound = None;
                inner
                    .session
                    .transition(SessionState::Disconnected)
                    .map(|_| SessionState::Disconnected)
            });
            if !entered {
                return;
            }

            warn!(
                epoch,
                attempt = attempts,
                max_attempts,
                error = %failure,
                "推送连接失败"
            );

            if attempts >= max_attempts {
                if self.enter(epoch, SessionState::Polling) {
                    error!(epoch, attempts, "重连次数耗尽，降级为轮询模式");
                    self.raise(ConnectionError {
                        kind: ConnectionErrorKind::Exhausted,
                        epoch,
                        attempts,
                        message,
                    });
                }
                return;
            }

            let delay = self.settings.backoff.delay_at(attempts.max(1));
            debug!(epoch, delay_ms = delay.as_millis() as u64, "等待后重连");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.enter(epoch, SessionState::Connecting) {
                return;
            }
        }
    }

    /// 服务端断开后的立即重连：记录失败但不计数
    fn reconnect_now(&self, epoch: u64) -> bool {
        let entered = self.commit(epoch, |inner| {
            inner.outbound = None;
            inner
                .session
                .record_failure("server initiated disconnect", false);
            inner
                .session
                .transition(SessionState::Disconnected)
                .map(|_| SessionState::Disconnected)
        });
        entered && self.enter(epoch, SessionState::Connecting)
    }

    async fn run_link(&self, epoch: u64, cancel: &CancellationToken, link: PushLink) -> LinkEnd {
        let PushLink {
            connection_id,
            outbound,
            mut inbound,
        } = link;

        let id = connection_id.clone();
        let entered = self.commit(epoch, move |inner| {
            inner.session.mark_connected(id)?;
            inner.outbound = Some(outbound);
            Ok(SessionState::Connected)
        });
        if !entered {
            return LinkEnd::Cancelled;
        }
        info!(epoch, connection_id = %connection_id, "推送通道已连接");

        let mut stable = false;
        let mut settled = false;
        let settle = tokio::time::sleep(self.settings.stable_after);
        tokio::pin!(settle);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LinkEnd::Cancelled,
                next = inbound.recv() => match next {
                    Some(Inbound::Event(event)) => {
                        if self.ensure_current(epoch).is_err() {
                            return LinkEnd::Cancelled;
                        }
                        if !stable {
                            stable = self.mark_stable(epoch);
                        }
                        self.bus.publish(&event);
                    }
                    Some(Inbound::Closed(reason)) => {
                        debug!(epoch, reason = ?reason, stable, "推送通道关闭");
                        return LinkEnd::Closed { reason, stable };
                    }
                    None => {
                        let reason = CloseReason::Transport(TransportError::closed(
                            "inbound stream ended",
                        ));
                        return LinkEnd::Closed { reason, stable };
                    }
                },
                _ = &mut settle, if !stable && !settled => {
                    settled = true;
                    stable = self.mark_stable(epoch);
                }
            }
        }
    }

    /// 连接已稳定：结束本轮失败计数
    fn mark_stable(&self, epoch: u64) -> bool {
        let _gate = self.gate();
        let mut inner = self.lock();
        if inner.session.epoch != epoch {
            return false;
        }
        let stable = inner.session.mark_stable();
        if stable {
            debug!(epoch, "推送连接已稳定，重连计数清零");
        }
        stable
    }

    fn reject(&self, epoch: u64, failure: &TransportError) {
        let message = failure.to_string();
        let mut attempts = 0;
        let entered = self.commit(epoch, |inner| {
            attempts = inner.session.record_failure(message.clone(), false);
            inner.outbound = None;
            inner
                .session
                .transition(SessionState::Idle)
                .map(|_| SessionState::Idle)
        });
        if entered {
            error!(epoch, "服务端拒绝凭证，停止重连");
            self.raise(ConnectionError {
                kind: ConnectionErrorKind::Rejected,
                epoch,
                attempts,
                message,
            });
        }
    }

    fn raise(&self, err: ConnectionError) {
        // 没有订阅者时 send 返回错误，忽略即可
        let _ = self.errors_tx.send(err);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.lock().cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryTransport, Scripted};
    use domain::{ConversationId, PushEvent, Topic, UserId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout, Instant};

    fn manager(transport: Arc<MemoryTransport>) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            transport,
            Arc::new(EventBus::new()),
            ConnectionSettings {
                max_reconnect_attempts: 5,
                backoff: Backoff::exponential(Duration::from_millis(100), Duration::from_millis(400)),
                stable_after: Duration::from_secs(1),
            },
        )
    }

    async fn wait_for(manager: &ConnectionManager, state: SessionState) {
        let mut rx = manager.watch_state();
        timeout(Duration::from_secs(60), rx.wait_for(|current| *current == state))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    fn record_states(manager: &ConnectionManager) -> (Arc<Mutex<Vec<SessionState>>>, Subscription) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        let subscription = manager.on_state_change(move |state| sink.lock().unwrap().push(*state));
        (states, subscription)
    }

    fn network_error() -> Scripted {
        Scripted::Reject(TransportError::network("connection refused"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_credentials_fail_fast() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());

        let result = manager.connect(Credentials::bearer("  "));
        assert!(matches!(result, Err(SyncError::Unauthenticated)));
        assert_eq!(manager.state(), SessionState::Idle);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_routes_events_to_bus() {
        let transport = Arc::new(MemoryTransport::new());
        let bus = Arc::new(EventBus::new());
        let manager = ConnectionManager::new(transport.clone(), bus.clone(), ConnectionSettings::default());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _subscription = bus.subscribe(Topic::UserTyping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let session = manager.connect(Credentials::bearer("token")).unwrap();
        assert_eq!(session.state, SessionState::Connecting);
        wait_for(&manager, SessionState::Connected).await;
        assert_eq!(manager.session().connection_id.as_deref(), Some("mem-1"));

        let server = transport.last_server().unwrap();
        server.push(PushEvent::UserTyping {
            user_id: UserId::from("peer"),
            conversation_id: ConversationId::from("c-1"),
        });
        sleep(Duration::from_millis(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        manager
            .emit(ClientEvent::TypingStart {
                conversation_id: ConversationId::from("c-1"),
            })
            .unwrap();
        assert_eq!(server.drain_received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_degrade_to_polling_once() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script((0..5).map(|_| network_error()));
        let manager = manager(transport.clone());
        let mut errors = manager.subscribe_errors();
        let (states, _subscription) = record_states(&manager);

        manager.connect(Credentials::bearer("token")).unwrap();
        wait_for(&manager, SessionState::Polling).await;

        let session = manager.session();
        assert_eq!(session.reconnect_attempts, 5);
        assert_eq!(session.last_error.as_deref(), Some("network error: connection refused"));
        assert_eq!(transport.attempts(), 5);

        let err = errors.try_recv().unwrap();
        assert_eq!(err.kind, ConnectionErrorKind::Exhausted);
        assert_eq!(err.attempts, 5);
        assert!(errors.try_recv().is_err());

        // 不再自动重连
        sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.attempts(), 5);
        assert_eq!(manager.state(), SessionState::Polling);

        let states = states.lock().unwrap().clone();
        assert_eq!(states.first(), Some(&SessionState::Connecting));
        assert_eq!(states.last(), Some(&SessionState::Polling));
        assert_eq!(
            states.iter().filter(|s| **s == SessionState::Disconnected).count(),
            5
        );

        // 显式 connect 之后重新开始
        manager.connect(Credentials::bearer("token")).unwrap();
        wait_for(&manager, SessionState::Connected).await;
        assert_eq!(manager.session().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_uses_backoff_and_recovers() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script([network_error(), network_error()]);
        let manager = manager(transport.clone());

        let started = Instant::now();
        manager.connect(Credentials::bearer("token")).unwrap();
        wait_for(&manager, SessionState::Connected).await;

        // 100ms + 200ms
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(transport.attempts(), 3);
        assert!(manager.last_error().is_none());

        // 握手成功不清零，连接稳定后才清零
        assert_eq!(manager.session().reconnect_attempts, 2);
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(manager.session().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_disconnect_reconnects_immediately_without_counting() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());

        manager.connect(Credentials::bearer("token")).unwrap();
        wait_for(&manager, SessionState::Connected).await;

        let mut rx = manager.watch_state();
        rx.borrow_and_update();
        let before = Instant::now();
        transport
            .last_server()
            .unwrap()
            .close(CloseReason::ServerInitiated);

        rx.changed().await.unwrap();
        wait_for(&manager, SessionState::Connected).await;

        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(transport.accepted(), 2);
        assert_eq!(manager.session().reconnect_attempts, 0);

        // 收到事件说明连接已稳定，下一次服务端断开仍可立即重连
        let server = transport.last_server().unwrap();
        server.push(PushEvent::UserTyping {
            user_id: UserId::from("peer"),
            conversation_id: ConversationId::from("c-1"),
        });
        sleep(Duration::from_millis(1)).await;
        let before = Instant::now();
        server.close(CloseReason::ServerInitiated);
        wait_until_accepted(&transport, 3).await;
        wait_for(&manager, SessionState::Connected).await;

        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(manager.session().reconnect_attempts, 0);
    }

    async fn wait_until_accepted(transport: &MemoryTransport, count: usize) {
        timeout(Duration::from_secs(60), async {
            while transport.accepted() < count {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("timed out waiting for reconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_then_close_server_degrades_to_polling() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());
        let mut errors = manager.subscribe_errors();

        let started = Instant::now();
        manager.connect(Credentials::bearer("token")).unwrap();

        // 服务端每接受一次连接就立刻断开
        let mut closed = 0;
        for _ in 0..10_000 {
            if manager.state() == SessionState::Polling {
                break;
            }
            if transport.accepted() > closed && manager.state() == SessionState::Connected {
                transport
                    .last_server()
                    .unwrap()
                    .close(CloseReason::ServerInitiated);
                closed += 1;
            }
            sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(manager.state(), SessionState::Polling);
        // 一次立即重连 + 五次计数失败
        assert_eq!(transport.accepted(), 6);
        assert_eq!(manager.session().reconnect_attempts, 5);
        // 100 + 200 + 400 + 400 毫秒退避
        assert!(started.elapsed() >= Duration::from_millis(1100));

        let err = errors.try_recv().unwrap();
        assert_eq!(err.kind, ConnectionErrorKind::Exhausted);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_drop_counts_and_retries() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());
        let (states, _subscription) = record_states(&manager);

        manager.connect(Credentials::bearer("token")).unwrap();
        wait_for(&manager, SessionState::Connected).await;

        transport
            .last_server()
            .unwrap()
            .close(CloseReason::Transport(TransportError::network("reset by peer")));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert_eq!(manager.session().reconnect_attempts, 1);

        wait_for(&manager, SessionState::Connected).await;
        assert_eq!(
            states.lock().unwrap().clone(),
            vec![
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::Disconnected,
                SessionState::Connecting,
                SessionState::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credentials_stop_without_retry() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script([Scripted::Reject(TransportError::Unauthorized)]);
        let manager = manager(transport.clone());
        let mut errors = manager.subscribe_errors();

        manager.connect(Credentials::bearer("expired")).unwrap();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(transport.attempts(), 1);
        assert_eq!(errors.try_recv().unwrap().kind, ConnectionErrorKind::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_discards_in_flight_handshake() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script([Scripted::AcceptAfter(Duration::from_secs(5))]);
        let manager = manager(transport.clone());

        manager.connect(Credentials::bearer("token")).unwrap();
        sleep(Duration::from_secs(1)).await;
        manager.disconnect();
        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(manager.epoch(), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.accepted(), 1);
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(matches!(
            manager.ensure_current(0),
            Err(SyncError::StaleResultDiscarded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_backoff_timer() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script([network_error()]);
        let manager = manager(transport.clone());

        manager.connect(Credentials::bearer("token")).unwrap();
        wait_for(&manager, SessionState::Disconnected).await;
        manager.disconnect();

        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(manager.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_requires_connection() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport);
        assert!(matches!(
            manager.emit(ClientEvent::MetricsRequest),
            Err(SyncError::NotConnected)
        ));
    }
}
