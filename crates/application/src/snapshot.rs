//! 指标快照协调器
//!
//! 推送增量和轮询结果合并进同一份缓存，分组级时间戳严格更新才覆盖，合并顺序无关。
//! 缓存放在 `watch` 通道里：消费者只读，变更只经由 `merge_delta` / `replace_snapshot`。
//!
//! 轮询由连接状态驱动：进入 `disconnected`/`polling` 时启动，回到 `connected` 或拆除时停止。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use domain::{merge, MergeReport, MetricsSnapshot, SessionState, SnapshotDelta, Timestamp};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{FetchError, FetchedSnapshot, MetricsApi};
use crate::bus::Subscription;
use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::error::SyncError;

/// 轮询默认间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied(MergeReport),
    /// 已有拉取在进行，本次被丢弃（不排队）
    Skipped,
    /// 拉取期间快照被重置，结果作废
    Discarded,
}

/// 单飞标记，离开作用域时释放
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Poller {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

pub struct SnapshotReconciler {
    api: Arc<dyn MetricsApi>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    cache: watch::Sender<MetricsSnapshot>,
    in_flight: AtomicBool,
    generation: AtomicU64,
    poller: Mutex<Option<Poller>>,
    listener: Mutex<Option<Subscription>>,
}

impl SnapshotReconciler {
    pub fn new(api: Arc<dyn MetricsApi>, clock: Arc<dyn Clock>, poll_interval: Duration) -> Arc<Self> {
        let (cache, _) = watch::channel(MetricsSnapshot::new());
        Arc::new(Self {
            api,
            clock,
            poll_interval,
            cache,
            in_flight: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            poller: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    fn poller(&self) -> MutexGuard<'_, Option<Poller>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 按连接状态启停轮询
    pub fn attach(self: &Arc<Self>, connection: &ConnectionManager) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let subscription = connection.on_state_change(move |state| {
            let Some(reconciler) = weak.upgrade() else {
                return;
            };
            match state {
                SessionState::Disconnected | SessionState::Polling => {
                    reconciler.start_polling();
                }
                SessionState::Connected | SessionState::Idle => {
                    reconciler.stop_polling();
                }
                SessionState::Connecting => {}
            }
        });
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);
    }

    /// 合并推送增量
    pub fn merge_delta(&self, delta: &SnapshotDelta, at: Timestamp) -> MergeReport {
        self.apply(delta, at, "push")
    }

    /// 应用完整（或轮询）快照，只覆盖结果中出现的分组
    pub fn replace_snapshot(&self, full: &SnapshotDelta, at: Timestamp) -> MergeReport {
        self.apply(full, at, "poll")
    }

    fn apply(&self, delta: &SnapshotDelta, at: Timestamp, source: &'static str) -> MergeReport {
        let mut report = MergeReport::default();
        self.cache.send_if_modified(|snapshot| {
            report = merge(snapshot, delta, at);
            !report.is_noop()
        });

        if !report.stale.is_empty() {
            debug!(source, stale = ?report.stale, "忽略不新于缓存的分组");
        }
        report
    }

    /// `GET /admin/dashboard`；已有拉取在进行时直接丢弃本次调用
    pub async fn fetch_if_not_in_flight(&self) -> Result<FetchOutcome, SyncError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("已有快照拉取在进行，丢弃本次请求");
            return Ok(FetchOutcome::Skipped);
        };

        let generation = self.generation.load(Ordering::Acquire);
        let issued_at = self.clock.now();
        let result = self.api.fetch_dashboard().await;
        self.finish(generation, issued_at, result, "dashboard")
    }

    /// 轮询一次 `GET /admin/metrics/live`，与完整拉取共用单飞标记
    pub async fn poll_once(&self) -> Result<FetchOutcome, SyncError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!("已有快照拉取在进行，跳过本轮轮询");
            return Ok(FetchOutcome::Skipped);
        };

        let generation = self.generation.load(Ordering::Acquire);
        let issued_at = self.clock.now();
        let result = self.api.fetch_live_metrics().await;
        self.finish(generation, issued_at, result, "live")
    }

    fn finish(
        &self,
        generation: u64,
        issued_at: Timestamp,
        result: Result<FetchedSnapshot, FetchError>,
        endpoint: &'static str,
    ) -> Result<FetchOutcome, SyncError> {
        let live = self.generation.load(Ordering::Acquire);
        if live != generation {
            debug!(error = %SyncError::stale(generation, live), endpoint, "丢弃过期的拉取结果");
            return Ok(FetchOutcome::Discarded);
        }

        match result {
            Ok(fetched) => {
                // 服务端未给出生成时间时，以请求发出时刻为准
                let at = fetched.generated_at.unwrap_or(issued_at);
                let report = self.replace_snapshot(&fetched.delta, at);
                debug!(endpoint, applied = ?report.applied, "快照拉取完成");
                Ok(FetchOutcome::Applied(report))
            }
            Err(err) => {
                warn!(endpoint, error = %err, "快照拉取失败，保留现有缓存");
                Err(err.into())
            }
        }
    }

    /// 启动轮询；已在轮询时返回 false
    pub fn start_polling(self: &Arc<Self>) -> bool {
        let mut poller = self.poller();
        if poller.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(self),
            cancel.clone(),
            self.poll_interval,
        ));
        *poller = Some(Poller {
            cancel,
            _handle: handle,
        });
        info!(interval_ms = self.poll_interval.as_millis() as u64, "启动快照轮询");
        true
    }

    pub fn stop_polling(&self) -> bool {
        match self.poller().take() {
            Some(poller) => {
                poller.cancel.cancel();
                info!("停止快照轮询");
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller().is_some()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.cache.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.cache.subscribe()
    }

    /// 会话拆除：停止轮询，作废进行中的拉取，清空缓存
    pub fn reset(&self) {
        self.stop_polling();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.send_replace(MetricsSnapshot::new());
    }
}

impl Drop for SnapshotReconciler {
    fn drop(&mut self) {
        if let Some(poller) = self.poller().take() {
            poller.cancel.cancel();
        }
    }
}

async fn poll_loop(reconciler: Weak<SnapshotReconciler>, cancel: CancellationToken, period: Duration) {
    // 首次拉取等满一个周期，短暂断线不触发请求
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(reconciler) = reconciler.upgrade() else {
            break;
        };
        if let Err(err) = reconciler.poll_once().await {
            debug!(error = %err, "本轮轮询失败");
        }
    }
}
