//! WebSocket 推送通道
//!
//! 握手时通过查询参数携带令牌；握手成功后启动一个读写任务：
//! 服务端文本帧解析为 `PushEvent` 转交给连接管理器，客户端事件序列化后写回。
//! 无法识别的主题只记录日志并跳过。

use application::{CloseReason, Credentials, Inbound, PushLink, PushTransport, TransportError};
use async_trait::async_trait;
use config::SyncConfig;
use domain::{ClientEvent, PushEvent};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 服务端可以在握手响应中下发连接 id
const CONNECTION_ID_HEADER: &str = "x-connection-id";

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.push.url.clone())
    }

    fn endpoint(&self, credentials: &Credentials) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.url)
            .map_err(|err| TransportError::handshake(format!("invalid push url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("token", credentials.token());
        Ok(url)
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<PushLink, TransportError> {
        let endpoint = self.endpoint(credentials)?;
        debug!(url = %self.url, "建立 WebSocket 连接");

        let (stream, response) = connect_async(endpoint.as_str())
            .await
            .map_err(map_connect_error)?;

        let connection_id = response
            .headers()
            .get(CONNECTION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, outbound_rx, inbound_tx, connection_id.clone()));

        info!(connection_id = %connection_id, "WebSocket 握手完成");
        Ok(PushLink {
            connection_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn map_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized,
            status => TransportError::handshake(format!("unexpected status {status}")),
        },
        WsError::Io(err) => TransportError::network(err.to_string()),
        other => TransportError::handshake(other.to_string()),
    }
}

async fn pump(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
    inbound: mpsc::UnboundedSender<Inbound>,
    connection_id: String,
) {
    let reason = loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<PushEvent>(text.as_str()) {
                        Ok(event) => {
                            if inbound.send(Inbound::Event(event)).is_err() {
                                // 连接管理器已丢弃该连接
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                        Err(err) => {
                            debug!(connection_id = %connection_id, error = %err, "跳过无法识别的推送帧");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(connection_id = %connection_id, frame = ?frame, "服务端关闭推送通道");
                    break CloseReason::ServerInitiated;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(connection_id = %connection_id, error = %err, "推送通道读取失败");
                    break CloseReason::Transport(TransportError::network(err.to_string()));
                }
                None => {
                    break CloseReason::Transport(TransportError::closed("stream ended"));
                }
            },
            event = outbound.recv() => match event {
                Some(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(event = event.name(), error = %err, "序列化客户端事件失败");
                            continue;
                        }
                    };
                    if let Err(err) = ws.send(WsMessage::Text(json.into())).await {
                        warn!(connection_id = %connection_id, error = %err, "推送通道写入失败");
                        break CloseReason::Transport(TransportError::network(err.to_string()));
                    }
                }
                None => {
                    debug!(connection_id = %connection_id, "客户端关闭推送通道");
                    let _ = ws.close(None).await;
                    break CloseReason::ClientInitiated;
                }
            },
        }
    };

    let _ = inbound.send(Inbound::Closed(reason));
}
