//! 主题事件总线
//!
//! `subscribe(topic, handler)` 返回一个 [`Subscription`]，调用 `unsubscribe()`
//! 或直接丢弃即可解除订阅，保证重连前后的注册和注销严格对称。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use domain::{PushEvent, Topic};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<K, E> {
    next_id: u64,
    handlers: HashMap<K, Vec<(u64, Handler<E>)>>,
}

/// 按键分发的处理器注册表
pub struct HandlerRegistry<K, E> {
    inner: Arc<Mutex<Registry<K, E>>>,
}

impl<K, E> Default for HandlerRegistry<K, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    E: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> HandlerRegistry<K, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    E: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<K, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, key: K, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .handlers
                .entry(key.clone())
                .or_default()
                .push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<K, E>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut registry = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = registry.handlers.get_mut(&key) {
                list.retain(|(handler_id, _)| *handler_id != id);
                if list.is_empty() {
                    registry.handlers.remove(&key);
                }
            }
        })
    }

    /// 依次调用该键下的处理器，返回调用数量。
    ///
    /// 调用前先复制处理器列表并释放锁，处理器内部可以安全地订阅或退订。
    pub fn publish(&self, key: &K, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = self
            .lock()
            .handlers
            .get(key)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// 移除全部处理器（会话拆除时调用）
    pub fn clear(&self) {
        self.lock().handlers.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.values().map(Vec::len).sum()
    }
}

/// 订阅句柄；丢弃时自动退订
#[must_use = "dropping a Subscription immediately unsubscribes the handler"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

/// 推送事件总线
#[derive(Default)]
pub struct EventBus {
    registry: HandlerRegistry<Topic, PushEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(topic, handler)
    }

    pub fn publish(&self, event: &PushEvent) -> usize {
        let delivered = self.registry.publish(&event.topic(), event);
        if delivered == 0 {
            tracing::trace!(topic = %event.topic(), "推送事件无订阅者");
        }
        delivered
    }

    pub fn clear(&self) {
        self.registry.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.registry.handler_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ConversationId, UserId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn typing_event() -> PushEvent {
        PushEvent::UserTyping {
            user_id: UserId::from("peer"),
            conversation_id: ConversationId::from("c-1"),
        }
    }

    #[test]
    fn test_subscribe_and_drop_unsubscribes() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let subscription = bus.subscribe(Topic::UserTyping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&typing_event()), 1);
        drop(subscription);
        assert_eq!(bus.publish(&typing_event()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _subscription = bus.subscribe(Topic::UserStoppedTyping, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&typing_event());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_detaches_everything_and_late_unsubscribe_is_harmless() {
        let bus = EventBus::new();
        let first = bus.subscribe(Topic::UserTyping, |_| {});
        let _second = bus.subscribe(Topic::NewMessage, |_| {});
        assert_eq!(bus.handler_count(), 2);

        bus.clear();
        assert_eq!(bus.handler_count(), 0);
        first.unsubscribe();
    }

    #[test]
    fn test_handler_may_unsubscribe_during_publish() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let inner_slot = slot.clone();
        let subscription = bus.subscribe(Topic::UserTyping, move |_| {
            if let Some(subscription) = inner_slot.lock().unwrap().take() {
                subscription.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(subscription);

        assert_eq!(bus.publish(&typing_event()), 1);
        assert_eq!(bus.publish(&typing_event()), 0);
    }
}
