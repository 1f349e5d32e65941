//! 实时同步层核心领域模型
//!
//! 包含会话、消息投递状态、输入状态、房间成员关系、指标快照等实体，
//! 以及推送通道上的事件定义和排期窗口计算等纯函数。这里没有任何 I/O。

pub mod entities;
pub mod errors;
pub mod events;
pub mod services;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use services::*;
pub use value_objects::*;
