//! 领域服务
//!
//! 只包含无状态的纯函数。

pub mod schedule_window;

pub use schedule_window::{
    can_join, is_future_slot, time_until, ScheduleWindow, SlotRequest, TimeUntil,
};
