//! 基础设施层实现。
//!
//! 提供推送通道（WebSocket）和 REST 接口（HTTP）的适配器，实现应用层定义的
//! `PushTransport`、`MetricsApi`、`ConversationApi` 接口。

pub mod http_api;
pub mod websocket;

pub use http_api::RestClient;
pub use websocket::WebSocketTransport;
