//! 推送通道事件定义
//!
//! 线上格式为 `{"event": "<topic>", "data": {...}}`。

pub mod push_event;

pub use push_event::{ClientEvent, PushEvent, Topic};
