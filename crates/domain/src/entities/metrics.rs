//! 仪表盘指标快照
//!
//! 快照由若干命名分组组成（如 `users`、`verification`、`jobs`、`activityFeed`），
//! 每个分组独立记录最后一次被采纳的时间戳。快照只能通过 [`merge`] 修改。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::Timestamp;

/// 活动流分组名
pub const ACTIVITY_FEED_GROUP: &str = "activityFeed";

/// 载荷中表示生成时间的保留字段，不作为分组处理
const RESERVED_TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "generatedAt", "updatedAt"];

/// 单个分组的值及其时间戳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEntry {
    pub value: Value,
    pub updated_at: Timestamp,
}

/// 指标快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    groups: BTreeMap<String, GroupEntry>,
}

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, name: &str) -> Option<&Value> {
        self.groups.get(name).map(|entry| &entry.value)
    }

    pub fn group_timestamp(&self, name: &str) -> Option<Timestamp> {
        self.groups.get(name).map(|entry| entry.updated_at)
    }

    pub fn activity_feed(&self) -> Option<&Value> {
        self.group(ACTIVITY_FEED_GROUP)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &GroupEntry)> {
        self.groups.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// 部分快照（推送增量或轮询结果）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotDelta {
    groups: BTreeMap<String, Value>,
}

impl SnapshotDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, name: impl Into<String>, value: Value) -> Self {
        self.groups.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.groups.insert(name.into(), value);
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.groups.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// 从服务端 JSON 对象解析：每个顶层键是一个分组，保留的时间字段单独返回
    pub fn from_json(value: Value) -> DomainResult<(Self, Option<Timestamp>)> {
        let Value::Object(object) = value else {
            return Err(DomainError::malformed_payload("snapshot must be a JSON object"));
        };

        let mut delta = SnapshotDelta::new();
        let mut generated_at = None;
        for (key, value) in object {
            if RESERVED_TIMESTAMP_KEYS.contains(&key.as_str()) {
                if generated_at.is_none() {
                    generated_at = parse_timestamp(&value);
                }
                continue;
            }
            delta.groups.insert(key, value);
        }
        Ok((delta, generated_at))
    }
}

/// 推送通道上的指标增量，与轮询结果同一形状：分组是顶层键，时间字段可选
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct MetricsUpdate {
    pub delta: SnapshotDelta,
    pub timestamp: Option<Timestamp>,
}

impl TryFrom<Value> for MetricsUpdate {
    type Error = DomainError;

    fn try_from(value: Value) -> DomainResult<Self> {
        let (delta, timestamp) = SnapshotDelta::from_json(value)?;
        Ok(Self { delta, timestamp })
    }
}

impl From<MetricsUpdate> for Value {
    fn from(update: MetricsUpdate) -> Self {
        let mut object: serde_json::Map<String, Value> = update.delta.groups.into_iter().collect();
        if let Some(timestamp) = update.timestamp {
            object.insert("timestamp".to_owned(), Value::String(timestamp.to_rfc3339()));
        }
        Value::Object(object)
    }
}

fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// 合并结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// 被采纳的分组
    pub applied: Vec<String>,
    /// 因时间戳不新于现有值而被拒绝的分组
    pub stale: Vec<String>,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// 将部分快照合并进现有快照。
///
/// 只触碰 `delta` 中出现的分组；某分组仅当 `at` 严格新于其现有时间戳时才被覆盖，
/// 因此任意交错顺序的推送增量与轮询结果得到相同的最终结果。
pub fn merge(existing: &mut MetricsSnapshot, delta: &SnapshotDelta, at: Timestamp) -> MergeReport {
    let mut report = MergeReport::default();

    for (name, value) in delta.groups() {
        let newer = existing
            .groups
            .get(name)
            .map_or(true, |entry| at > entry.updated_at);

        if newer {
            existing.groups.insert(
                name.to_owned(),
                GroupEntry {
                    value: value.clone(),
                    updated_at: at,
                },
            );
            report.applied.push(name.to_owned());
        } else {
            report.stale.push(name.to_owned());
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn t(seconds: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    #[test]
    fn test_merge_only_touches_present_groups() {
        let mut snapshot = MetricsSnapshot::new();
        let full = SnapshotDelta::new()
            .with_group("users", json!({"total": 10}))
            .with_group("jobs", json!({"open": 3}));
        merge(&mut snapshot, &full, t(1));

        let delta = SnapshotDelta::new().with_group("users", json!({"total": 11}));
        let report = merge(&mut snapshot, &delta, t(2));

        assert_eq!(report.applied, vec!["users".to_string()]);
        assert_eq!(snapshot.group("users"), Some(&json!({"total": 11})));
        assert_eq!(snapshot.group("jobs"), Some(&json!({"open": 3})));
        assert_eq!(snapshot.group_timestamp("jobs"), Some(t(1)));
    }

    #[test]
    fn test_older_poll_does_not_override_newer_push() {
        let mut snapshot = MetricsSnapshot::new();
        merge(
            &mut snapshot,
            &SnapshotDelta::new().with_group("users", json!({"total": 12})),
            t(2),
        );

        let report = merge(
            &mut snapshot,
            &SnapshotDelta::new().with_group("users", json!({"total": 10})),
            t(1),
        );

        assert!(report.is_noop());
        assert_eq!(report.stale, vec!["users".to_string()]);
        assert_eq!(snapshot.group("users"), Some(&json!({"total": 12})));
    }

    #[test]
    fn test_equal_timestamp_is_not_newer() {
        let mut snapshot = MetricsSnapshot::new();
        merge(&mut snapshot, &SnapshotDelta::new().with_group("jobs", json!(1)), t(5));
        merge(&mut snapshot, &SnapshotDelta::new().with_group("jobs", json!(2)), t(5));
        assert_eq!(snapshot.group("jobs"), Some(&json!(1)));
    }

    #[test]
    fn test_interleavings_converge() {
        let updates = [
            (SnapshotDelta::new().with_group("users", json!(1)).with_group("jobs", json!("a")), t(1)),
            (SnapshotDelta::new().with_group("users", json!(3)), t(3)),
            (SnapshotDelta::new().with_group("jobs", json!("b")), t(2)),
        ];

        let orders = [[0, 1, 2], [2, 1, 0], [1, 0, 2], [2, 0, 1]];
        let results: Vec<MetricsSnapshot> = orders
            .iter()
            .map(|order| {
                let mut snapshot = MetricsSnapshot::new();
                for index in order {
                    let (delta, at) = &updates[*index];
                    merge(&mut snapshot, delta, *at);
                }
                snapshot
            })
            .collect();

        for snapshot in &results {
            assert_eq!(snapshot, &results[0]);
        }
        assert_eq!(results[0].group("users"), Some(&json!(3)));
        assert_eq!(results[0].group("jobs"), Some(&json!("b")));
    }

    #[test]
    fn test_from_json_extracts_generated_at() {
        let payload = json!({
            "users": {"total": 4},
            "activityFeed": [],
            "generatedAt": "2024-05-01T12:00:07Z"
        });
        let (delta, generated_at) = SnapshotDelta::from_json(payload).unwrap();
        assert_eq!(generated_at, Some(t(7)));
        assert_eq!(delta.groups().count(), 2);

        assert!(SnapshotDelta::from_json(json!([1, 2])).is_err());
    }
}
