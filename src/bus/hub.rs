//! 优先级消息总线
//!
//! 每个频道一个有界优先级队列。两条消费路径共享同一个队列：
//! - **订阅**：publish 入队后按订阅顺序把消息副本投递给每个订阅者的通道，不出队；
//!   每个订阅者由独立任务逐条处理。
//! - **拉取**：receive 按 (优先级降序, 时间升序) 出队，可带过滤条件与超时。
//!
//! request_response 用关联 id 把请求与响应配对，以短轮询 receive 消耗完整超时。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::queue::ChannelQueue;
use crate::bus::{channels, BusMessage, MessageKind, Priority, PublishOptions};
use crate::core::ConfigError;
use crate::monitor::PerformanceMonitor;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("queue for channel {channel} is full (capacity {capacity})")]
    QueueFull { channel: String, capacity: usize },

    #[error("message bus closed")]
    Closed,
}

/// 总线配置
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// 单频道队列容量
    pub max_queue_size: usize,
    /// request_response 单次轮询的最长等待
    pub poll_interval: Duration,
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::invalid("bus.max_queue_size must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("bus.poll_interval must be positive"));
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// 订阅处理器
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, message: BusMessage);
}

pub type SubscriptionId = u64;

/// 拉取时的过滤条件
pub type MessageFilter<'a> = &'a (dyn Fn(&BusMessage) -> bool + Send + Sync);

/// 总线计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub messages_rejected: u64,
    pub channels_created: u64,
    pub active_subscribers: u64,
}

/// 单频道状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub channel: String,
    pub queue_len: usize,
    pub capacity: usize,
    pub subscribers: usize,
}

struct ChannelData {
    queue: ChannelQueue,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<BusMessage>)>,
}

struct ChannelState {
    data: Mutex<ChannelData>,
    notify: Notify,
}

impl ChannelState {
    fn lock(&self) -> MutexGuard<'_, ChannelData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    processed: AtomicU64,
    rejected: AtomicU64,
    channels_created: AtomicU64,
}

struct BusInner {
    config: BusConfig,
    channels: Mutex<HashMap<String, Arc<ChannelState>>>,
    counters: Counters,
    next_subscription: AtomicU64,
    closed: AtomicBool,
}

/// 消息总线；克隆后共享同一组频道
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BusInner {
                config,
                channels: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                next_subscription: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    fn channels_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ChannelState>>> {
        self.inner.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channel(&self, name: &str) -> Arc<ChannelState> {
        let mut channels = self.channels_lock();
        if let Some(state) = channels.get(name) {
            return Arc::clone(state);
        }
        let state = Arc::new(ChannelState {
            data: Mutex::new(ChannelData {
                queue: ChannelQueue::new(self.inner.config.max_queue_size),
                subscribers: Vec::new(),
            }),
            notify: Notify::new(),
        });
        channels.insert(name.to_string(), Arc::clone(&state));
        self.inner.counters.channels_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(channel = %name, "channel created");
        state
    }

    /// 入队并通知当前所有订阅者；队列已满时立即失败
    pub fn publish(
        &self,
        channel: &str,
        kind: MessageKind,
        payload: Value,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let message = BusMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            kind,
            channel: channel.to_string(),
            payload,
            priority: options.priority,
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: options.source,
            target: options.target,
            correlation_id: options.correlation_id,
            metadata: options.metadata,
        };
        let id = message.message_id.clone();
        let priority = message.priority;

        let state = self.channel(channel);
        {
            let mut data = state.lock();
            let capacity = data.queue.capacity();
            if data.queue.push(message.clone()).is_err() {
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = %channel, capacity, "queue full, message rejected");
                return Err(BusError::QueueFull {
                    channel: channel.to_string(),
                    capacity,
                });
            }
            // 已退出的订阅者在这里被清理
            data.subscribers
                .retain(|(_, tx)| tx.send(message.clone()).is_ok());
        }
        state.notify.notify_waiters();
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            channel = %channel,
            message_id = %id,
            priority = priority.level(),
            "published"
        );
        Ok(id)
    }

    /// 注册处理器；每个订阅者一个任务，按发布顺序逐条处理
    pub fn subscribe(&self, channel: &str, handler: Arc<dyn Subscriber>) -> SubscriptionId {
        let (id, mut rx) = self.subscribe_channel(channel);
        let bus = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler.handle(message).await;
                bus.inner.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
        });
        id
    }

    /// 订阅并直接拿到消息接收端
    pub fn subscribe_channel(
        &self,
        channel: &str,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.channel(channel).lock().subscribers.push((id, tx));
        tracing::debug!(channel = %channel, subscription = id, "subscribed");
        (id, rx)
    }

    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let Some(state) = self.channels_lock().get(channel).cloned() else {
            return false;
        };
        let mut data = state.lock();
        let before = data.subscribers.len();
        data.subscribers.retain(|(sid, _)| *sid != id);
        before != data.subscribers.len()
    }

    /// 出队排序最靠前（且满足 filter）的消息
    ///
    /// timeout 为 None 时一直等待；到期仍没有可用消息返回 None。
    pub async fn receive(
        &self,
        channel: &str,
        timeout: Option<Duration>,
        filter: Option<MessageFilter<'_>>,
    ) -> Option<BusMessage> {
        let state = self.channel(channel);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = state.notify.notified();
            tokio::pin!(notified);
            // 先登记再查队列，避免错过查队列与等待之间的 publish
            notified.as_mut().enable();

            let taken = {
                let mut data = state.lock();
                match filter {
                    Some(f) => data.queue.take_first_matching(f),
                    None => data.queue.pop(),
                }
            };
            if let Some(message) = taken {
                self.inner.counters.received.fetch_add(1, Ordering::Relaxed);
                return Some(message);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }

            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// 发布请求并等待关联 id 相同的响应；超时返回 Ok(None)
    pub async fn request_response(
        &self,
        request_channel: &str,
        response_channel: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Option<BusMessage>, BusError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        self.publish(
            request_channel,
            MessageKind::AgentRequest,
            payload,
            PublishOptions::new()
                .correlation_id(correlation_id.clone())
                .target(response_channel),
        )?;

        let deadline = tokio::time::Instant::now() + timeout;
        let matches = |m: &BusMessage| m.correlation_id.as_deref() == Some(correlation_id.as_str());
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    request_channel = %request_channel,
                    correlation_id = %correlation_id,
                    "request timed out"
                );
                return Ok(None);
            }
            let poll = remaining.min(self.inner.config.poll_interval);
            let response = self
                .receive(response_channel, Some(poll), Some(&matches))
                .await;
            if response.is_some() {
                return Ok(response);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
        }
    }

    /// 对请求消息回复：沿用关联 id，发布到请求中的 target 频道（缺省为 agent.responses）
    pub fn respond(
        &self,
        request: &BusMessage,
        payload: Value,
        priority: Priority,
    ) -> Result<String, BusError> {
        let channel = request
            .target
            .clone()
            .unwrap_or_else(|| channels::AGENT_RESPONSES.to_string());
        let mut options = PublishOptions::new().priority(priority);
        if let Some(id) = &request.correlation_id {
            options = options.correlation_id(id.clone());
        }
        if let Some(source) = &request.source {
            options = options.target(source.clone());
        }
        self.publish(&channel, MessageKind::AgentResponse, payload, options)
    }

    /// 发布到所有已知频道（exclude 除外），返回成功的消息 id
    pub fn broadcast(
        &self,
        kind: MessageKind,
        payload: Value,
        exclude: &[&str],
        priority: Priority,
    ) -> Vec<String> {
        self.channels()
            .into_iter()
            .filter(|c| !exclude.contains(&c.as_str()))
            .filter_map(|c| {
                match self.publish(
                    &c,
                    kind,
                    payload.clone(),
                    PublishOptions::new().priority(priority),
                ) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        tracing::warn!(channel = %c, error = %e, "broadcast skipped channel");
                        None
                    }
                }
            })
            .collect()
    }

    /// 已创建的频道名（排序）
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels_lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn channel_info(&self, channel: &str) -> Option<ChannelInfo> {
        let state = self.channels_lock().get(channel).cloned()?;
        let data = state.lock();
        Some(ChannelInfo {
            channel: channel.to_string(),
            queue_len: data.queue.len(),
            capacity: data.queue.capacity(),
            subscribers: data.subscribers.len(),
        })
    }

    pub fn statistics(&self) -> BusStatistics {
        let active_subscribers = self
            .channels_lock()
            .values()
            .map(|s| s.lock().subscribers.len() as u64)
            .sum();
        let c = &self.inner.counters;
        BusStatistics {
            messages_sent: c.sent.load(Ordering::Relaxed),
            messages_received: c.received.load(Ordering::Relaxed),
            messages_processed: c.processed.load(Ordering::Relaxed),
            messages_rejected: c.rejected.load(Ordering::Relaxed),
            channels_created: c.channels_created.load(Ordering::Relaxed),
            active_subscribers,
        }
    }

    /// 关闭总线：拒绝新消息，断开所有订阅者，唤醒等待中的 receive
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for state in self.channels_lock().values() {
            state.lock().subscribers.clear();
            state.notify.notify_waiters();
        }
        tracing::info!("message bus closed");
    }

    /// 周期性把监控健康快照以 Low 优先级发布到 system.health，直到 token 取消
    pub fn spawn_health_reporter(
        &self,
        monitor: Arc<PerformanceMonitor>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let payload = serde_json::to_value(monitor.health()).unwrap_or(Value::Null);
                        let options = PublishOptions::new()
                            .priority(Priority::Low)
                            .source("monitor");
                        if let Err(e) = bus.publish(
                            channels::SYSTEM_HEALTH,
                            MessageKind::PerformanceMetric,
                            payload,
                            options,
                        ) {
                            tracing::warn!(error = %e, "health report not published");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bus() -> MessageBus {
        MessageBus::new(BusConfig {
            max_queue_size: 16,
            poll_interval: Duration::from_millis(10),
        })
        .unwrap()
    }

    struct Collect(tokio::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl Subscriber for Collect {
        async fn handle(&self, message: BusMessage) {
            self.0.lock().await.push(message.message_id);
        }
    }

    #[tokio::test]
    async fn test_drain_order_by_priority() {
        let bus = bus();
        for (tag, p) in [
            ("low", Priority::Low),
            ("critical", Priority::Critical),
            ("normal", Priority::Normal),
            ("high", Priority::High),
        ] {
            let options = PublishOptions::new().priority(p);
            bus.publish("c", MessageKind::SystemEvent, json!(tag), options)
                .unwrap();
        }
        let mut order = Vec::new();
        while let Some(m) = bus.receive("c", Some(Duration::ZERO), None).await {
            order.push(m.payload.as_str().unwrap().to_string());
        }
        assert_eq!(order, vec!["critical", "high", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        let bus = MessageBus::new(BusConfig {
            max_queue_size: 1,
            ..BusConfig::default()
        })
        .unwrap();
        bus.publish("c", MessageKind::SystemEvent, json!(1), PublishOptions::new())
            .unwrap();
        let err = bus
            .publish("c", MessageKind::SystemEvent, json!(2), PublishOptions::new())
            .unwrap_err();
        assert_eq!(
            err,
            BusError::QueueFull {
                channel: "c".into(),
                capacity: 1
            }
        );
        assert_eq!(bus.statistics().messages_rejected, 1);
    }

    #[tokio::test]
    async fn test_subscribers_do_not_consume_queue() {
        let bus = bus();
        let (_, mut rx) = bus.subscribe_channel("c");
        let id = bus
            .publish("c", MessageKind::SystemEvent, json!("x"), PublishOptions::new())
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().message_id, id);
        assert_eq!(bus.channel_info("c").unwrap().queue_len, 1);
        assert_eq!(bus.receive("c", None, None).await.unwrap().message_id, id);
    }

    #[tokio::test]
    async fn test_subscriber_handler_sees_publish_order() {
        let bus = bus();
        let sink = Arc::new(Collect(tokio::sync::Mutex::new(Vec::new())));
        let sub_id = bus.subscribe("c", sink.clone());
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(
                bus.publish("c", MessageKind::SystemEvent, json!(i), PublishOptions::new())
                    .unwrap(),
            );
        }
        for _ in 0..50 {
            if sink.0.lock().await.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*sink.0.lock().await, ids);
        assert!(bus.unsubscribe("c", sub_id));
        assert!(!bus.unsubscribe("c", sub_id));
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let bus = bus();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("late", MessageKind::SystemEvent, json!("hi"), PublishOptions::new())
                .unwrap();
        });
        let got = bus.receive("late", Some(Duration::from_secs(2)), None).await;
        assert_eq!(got.unwrap().payload, json!("hi"));
        assert!(bus.receive("late", Some(Duration::from_millis(10)), None).await.is_none());
    }

    #[tokio::test]
    async fn test_filtered_receive_leaves_others() {
        let bus = bus();
        for tag in ["a", "b", "c"] {
            bus.publish("c", MessageKind::SystemEvent, json!(tag), PublishOptions::new())
                .unwrap();
        }
        let only_b = |m: &BusMessage| m.payload == json!("b");
        let got = bus.receive("c", Some(Duration::ZERO), Some(&only_b)).await;
        assert_eq!(got.unwrap().payload, json!("b"));
        assert_eq!(bus.receive("c", None, None).await.unwrap().payload, json!("a"));
        assert_eq!(bus.receive("c", None, None).await.unwrap().payload, json!("c"));
    }

    #[tokio::test]
    async fn test_request_response_matches_correlation() {
        let bus = bus();
        let responder = bus.clone();
        tokio::spawn(async move {
            let request = responder
                .receive(channels::AGENT_REQUESTS, Some(Duration::from_secs(2)), None)
                .await
                .unwrap();
            // 无关响应先到，不应被当成结果
            responder
                .publish(
                    channels::AGENT_RESPONSES,
                    MessageKind::AgentResponse,
                    json!("noise"),
                    PublishOptions::new().correlation_id("other"),
                )
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            responder
                .respond(&request, json!({"answer": 42}), Priority::High)
                .unwrap();
        });

        let response = bus
            .request_response(
                channels::AGENT_REQUESTS,
                channels::AGENT_RESPONSES,
                json!({"q": "life"}),
                Duration::from_secs(2),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.payload["answer"], json!(42));
        assert_eq!(response.kind, MessageKind::AgentResponse);
        assert_eq!(bus.channel_info(channels::AGENT_RESPONSES).unwrap().queue_len, 1);
    }

    #[tokio::test]
    async fn test_request_response_times_out() {
        let bus = bus();
        let start = std::time::Instant::now();
        let response = bus
            .request_response("req", "resp", json!(null), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(response.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_broadcast_and_close() {
        let bus = bus();
        bus.publish("a", MessageKind::SystemEvent, json!(0), PublishOptions::new())
            .unwrap();
        bus.publish("b", MessageKind::SystemEvent, json!(0), PublishOptions::new())
            .unwrap();
        let ids = bus.broadcast(MessageKind::SystemEvent, json!("all"), &["b"], Priority::High);
        assert_eq!(ids.len(), 1);
        assert_eq!(bus.channels(), vec!["a", "b"]);
        assert_eq!(bus.channel_info("a").unwrap().queue_len, 2);

        bus.close();
        assert_eq!(
            bus.publish("a", MessageKind::SystemEvent, json!(1), PublishOptions::new()),
            Err(BusError::Closed)
        );
    }

    #[tokio::test]
    async fn test_health_reporter_publishes_low_priority() {
        let bus = bus();
        let token = CancellationToken::new();
        let handle = bus.spawn_health_reporter(
            Arc::new(PerformanceMonitor::default()),
            Duration::from_millis(10),
            token.clone(),
        );
        let msg = bus
            .receive(channels::SYSTEM_HEALTH, Some(Duration::from_secs(2)), None)
            .await
            .unwrap();
        assert_eq!(msg.priority, Priority::Low);
        assert_eq!(msg.payload["status"], json!("healthy"));
        token.cancel();
        handle.await.unwrap();
    }
}
