//! 集成测试共用的假协作方

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::transport::memory::MemoryTransport;
use application::{
    Collaborators, ConversationApi, FetchError, FetchedSnapshot, ManualClock, MetricsApi,
    SyncClient, SyncSettings,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use domain::{ConversationId, Message, MessageId, SnapshotDelta, Timestamp, UserId};
use serde_json::json;

pub fn t(seconds: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + ChronoDuration::seconds(seconds)
}

pub fn message(id: &str, conversation: &str, sender: &str, created: i64) -> Message {
    Message::new_sent(
        MessageId::from(id),
        ConversationId::from(conversation),
        UserId::from(sender),
        format!("message {id}"),
        t(created),
    )
}

pub struct FakeMetrics {
    pub delay: Duration,
    pub dashboard_calls: AtomicUsize,
    pub live_calls: AtomicUsize,
    pub dashboard: Mutex<FetchedSnapshot>,
}

impl FakeMetrics {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            dashboard_calls: AtomicUsize::new(0),
            live_calls: AtomicUsize::new(0),
            dashboard: Mutex::new(FetchedSnapshot {
                delta: SnapshotDelta::new()
                    .with_group("users", json!({ "total": 10 }))
                    .with_group("jobs", json!({ "open": 2 })),
                generated_at: Some(t(1)),
            }),
        }
    }

    pub fn live_calls(&self) -> usize {
        self.live_calls.load(Ordering::SeqCst)
    }

    pub fn dashboard_calls(&self) -> usize {
        self.dashboard_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsApi for FakeMetrics {
    async fn fetch_dashboard(&self) -> Result<FetchedSnapshot, FetchError> {
        self.dashboard_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.dashboard.lock().unwrap().clone())
    }

    async fn fetch_live_metrics(&self) -> Result<FetchedSnapshot, FetchError> {
        self.live_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(FetchedSnapshot {
            delta: SnapshotDelta::new().with_group("users", json!({ "total": 11 })),
            generated_at: None,
        })
    }
}

#[derive(Default)]
pub struct FakeConversations {
    pub delay: Duration,
    pub messages: Mutex<HashMap<ConversationId, Vec<Message>>>,
    pub read_at: Mutex<Option<Timestamp>>,
    pub read_calls: AtomicUsize,
}

impl FakeConversations {
    pub fn with_messages(conversation: &str, messages: Vec<Message>) -> Self {
        let fake = Self::default();
        fake.messages
            .lock()
            .unwrap()
            .insert(ConversationId::from(conversation), messages);
        fake
    }
}

#[async_trait]
impl ConversationApi for FakeConversations {
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, FetchError> {
        tokio::time::sleep(self.delay).await;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_read(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Option<Timestamp>, FetchError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(*self.read_at.lock().unwrap())
    }
}

pub struct Harness {
    pub transport: Arc<MemoryTransport>,
    pub metrics: Arc<FakeMetrics>,
    pub conversations: Arc<FakeConversations>,
    pub clock: Arc<ManualClock>,
    pub client: SyncClient,
}

pub fn harness(conversations: FakeConversations, settings: SyncSettings) -> Harness {
    let transport = Arc::new(MemoryTransport::new());
    let metrics = Arc::new(FakeMetrics::new(Duration::from_millis(50)));
    let conversations = Arc::new(conversations);
    let clock = Arc::new(ManualClock::new(t(0)));

    let client = SyncClient::with_clock(
        UserId::from("me"),
        Collaborators {
            transport: transport.clone(),
            metrics: metrics.clone(),
            conversations: conversations.clone(),
        },
        settings,
        clock.clone(),
    );

    Harness {
        transport,
        metrics,
        conversations,
        clock,
        client,
    }
}

pub async fn wait_for_state(client: &SyncClient, state: domain::SessionState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|current| *current == state))
        .await
        .expect("timed out waiting for session state")
        .expect("state channel closed");
}

/// 让已就绪的任务运行完
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// 轮询等待条件成立（暂停时间下自动推进）
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(120), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
