//! 排期窗口计算
//!
//! 判断“即将开始的会议现在能否加入”之类的时间资格问题。
//! 所有函数都是 `{start, end, now, lead_minutes}` 的纯函数，不读取系统时钟。

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::Timestamp;

/// 距开始还有多久
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeUntil {
    /// 已经开始（`start <= now`）
    Now,
    /// 剩余时间，分钟向下取整
    Remaining { hours: i64, minutes: i64 },
}

/// 计算距 `start` 的剩余时间
pub fn time_until(start: Timestamp, now: Timestamp) -> TimeUntil {
    if start <= now {
        return TimeUntil::Now;
    }

    let total_minutes = (start - now).num_minutes();
    TimeUntil::Remaining {
        hours: total_minutes / 60,
        minutes: total_minutes % 60,
    }
}

/// `now ∈ [start - lead, end]`，两端都包含
pub fn can_join(
    start: Timestamp,
    end: Timestamp,
    now: Timestamp,
    lead_minutes: i64,
) -> DomainResult<bool> {
    let window = ScheduleWindow::new(start, end, lead_minutes)?;
    Ok(window.can_join(now))
}

/// 新的排期请求必须落在未来
pub fn is_future_slot(candidate_start: Timestamp, now: Timestamp) -> bool {
    candidate_start > now
}

/// 经过校验的排期窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleWindow {
    start: Timestamp,
    end: Timestamp,
    lead_minutes: i64,
}

impl ScheduleWindow {
    /// 时长为零或负数时返回 `InvalidTimeRange`
    pub fn new(start: Timestamp, end: Timestamp, lead_minutes: i64) -> DomainResult<Self> {
        if end <= start {
            return Err(DomainError::invalid_time_range(start, end));
        }
        if lead_minutes < 0 {
            return Err(DomainError::validation_error(
                "lead_minutes",
                "cannot be negative",
            ));
        }
        Ok(Self {
            start,
            end,
            lead_minutes,
        })
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// 最早可加入的时刻
    pub fn opens_at(&self) -> Timestamp {
        self.start - Duration::minutes(self.lead_minutes)
    }

    pub fn can_join(&self, now: Timestamp) -> bool {
        now >= self.opens_at() && now <= self.end
    }

    pub fn time_until_start(&self, now: Timestamp) -> TimeUntil {
        time_until(self.start, now)
    }

    pub fn has_ended(&self, now: Timestamp) -> bool {
        now > self.end
    }
}

/// 待提交的排期请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRequest {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl SlotRequest {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// 提交前的本地校验，失败时不应产生任何网络请求
    pub fn validate(&self, now: Timestamp) -> DomainResult<()> {
        if self.end <= self.start {
            return Err(DomainError::invalid_time_range(self.start, self.end));
        }
        if !is_future_slot(self.start, now) {
            return Err(DomainError::validation_error(
                "start",
                "时间段必须在未来",
            ));
        }
        Ok(())
    }
}
