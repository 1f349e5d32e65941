//! 推送通道抽象
//!
//! 具体传输（WebSocket 等）在基础设施层实现；连接建立后以一对通道的形式交给连接管理器：
//! `outbound` 发送客户端事件，`inbound` 接收服务端事件和关闭通知。

use std::fmt;

use async_trait::async_trait;
use domain::{ClientEvent, PushEvent};
use thiserror::Error;
use tokio::sync::mpsc;

/// 传输层错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// 服务端拒绝了凭证，不应重试
    #[error("credential rejected by server")]
    Unauthorized,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("channel closed: {0}")]
    Closed(String),
}

impl TransportError {
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed(message.into())
    }
}

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 服务端主动断开（例如服务端重启、踢下线）
    ServerInitiated,
    /// 客户端主动断开
    ClientInitiated,
    /// 网络故障
    Transport(TransportError),
}

/// 传输层上报给连接管理器的入站消息
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(PushEvent),
    Closed(CloseReason),
}

/// 已认证凭证
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_empty(&self) -> bool {
        self.token.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// 一条已建立的推送连接
#[derive(Debug)]
pub struct PushLink {
    pub connection_id: String,
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// 推送传输
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// 建立连接并完成握手。丢弃 `outbound` 发送端即表示客户端主动关闭。
    async fn connect(&self, credentials: &Credentials) -> Result<PushLink, TransportError>;
}

/// 内存实现的推送传输（用于测试）
pub mod memory {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// 服务端一侧的连接句柄，测试用它推送事件或断开连接
    #[derive(Debug)]
    pub struct ServerSide {
        pub connection_id: String,
        events: mpsc::UnboundedSender<Inbound>,
        received: Arc<Mutex<mpsc::UnboundedReceiver<ClientEvent>>>,
    }

    impl ServerSide {
        pub fn push(&self, event: PushEvent) -> bool {
            self.events.send(Inbound::Event(event)).is_ok()
        }

        pub fn close(&self, reason: CloseReason) -> bool {
            self.events.send(Inbound::Closed(reason)).is_ok()
        }

        /// 取出客户端已发送的全部事件
        pub fn drain_received(&self) -> Vec<ClientEvent> {
            let mut received = self.received.lock().unwrap_or_else(PoisonError::into_inner);
            let mut events = Vec::new();
            while let Ok(event) = received.try_recv() {
                events.push(event);
            }
            events
        }
    }

    /// 预设的一次连接结果
    #[derive(Debug, Clone)]
    pub enum Scripted {
        Accept,
        Reject(TransportError),
        /// 延迟一段时间后再接受（用于模拟慢握手）
        AcceptAfter(Duration),
    }

    #[derive(Default)]
    struct State {
        script: VecDeque<Scripted>,
        attempts: usize,
        servers: Vec<Arc<ServerSide>>,
    }

    /// 按脚本返回结果的内存传输；脚本耗尽后默认接受连接
    #[derive(Default)]
    pub struct MemoryTransport {
        state: Mutex<State>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, outcomes: impl IntoIterator<Item = Scripted>) {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.script.extend(outcomes);
        }

        /// 已尝试的连接次数
        pub fn attempts(&self) -> usize {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .attempts
        }

        /// 最近一次被接受的连接
        pub fn last_server(&self) -> Option<Arc<ServerSide>> {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .servers
                .last()
                .cloned()
        }

        pub fn accepted(&self) -> usize {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .servers
                .len()
        }

        fn accept(&self) -> PushLink {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let connection_id = format!("mem-{}", state.servers.len() + 1);
            state.servers.push(Arc::new(ServerSide {
                connection_id: connection_id.clone(),
                events: events_tx,
                received: Arc::new(Mutex::new(outbound_rx)),
            }));
            PushLink {
                connection_id,
                outbound: outbound_tx,
                inbound: events_rx,
            }
        }
    }

    #[async_trait]
    impl PushTransport for MemoryTransport {
        async fn connect(&self, credentials: &Credentials) -> Result<PushLink, TransportError> {
            let next = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.attempts += 1;
                state.script.pop_front().unwrap_or(Scripted::Accept)
            };

            if credentials.is_empty() {
                return Err(TransportError::Unauthorized);
            }

            match next {
                Scripted::Accept => Ok(self.accept()),
                Scripted::Reject(err) => Err(err),
                Scripted::AcceptAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(self.accept())
                }
            }
        }
    }
}
