//! Buffered publish/subscribe hub for [`ExecutionEvent`]s.
//!
//! The bus keeps a bounded ring buffer of recent events per execution id and
//! fans every published event out to the active subscribers whose filter
//! matches (a `None` filter matches everything). A subscriber created after
//! events have already fired first receives the buffered events, in original
//! publish order, before any live event. This is what lets an SSE client
//! attach mid-execution and still see `execution_started`.
//!
//! Delivery never blocks a publisher: each subscriber owns a bounded queue,
//! and when it is full the oldest queued event is dropped (and counted)
//! rather than stalling the engine. For a fixed execution id, the events one
//! subscriber observes are always in publish order; across subscribers no
//! ordering is promised.
//!
//! A periodic cleanup task lazily evicts buffered events older than the
//! configured ceiling and forgets closed subscribers.

use crate::teamllm::event::ExecutionEvent;
use crate::teamllm::model::ExecutionStatus;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Tuning knobs for the bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Hard cap on concurrently active subscribers.
    pub max_subscribers: usize,
    /// Ring-buffer capacity per execution id.
    pub event_buffer_size: usize,
    /// Queue capacity per subscriber.
    pub subscriber_queue_size: usize,
    /// How often the cleanup task runs.
    pub cleanup_interval: std::time::Duration,
    /// Buffered events older than this are evicted by cleanup.
    pub max_event_age: chrono::Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_subscribers: 100,
            event_buffer_size: 1000,
            subscriber_queue_size: 100,
            cleanup_interval: std::time::Duration::from_secs(60),
            max_event_age: chrono::Duration::seconds(3600),
        }
    }
}

/// Errors raised by the bus.
#[derive(Debug, Clone)]
pub enum EventBusError {
    /// The subscriber cap was reached; no queuing of subscriptions happens.
    TooManySubscribers(usize),
}

impl fmt::Display for EventBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventBusError::TooManySubscribers(limit) => {
                write!(f, "Maximum number of subscribers reached ({})", limit)
            }
        }
    }
}

impl Error for EventBusError {}

/// State shared between a subscriber handle and the bus.
struct SubscriberShared {
    queue: Mutex<VecDeque<ExecutionEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
}

impl SubscriberShared {
    /// Enqueue, evicting the oldest queued event when full. Never blocks a
    /// publisher on a slow reader.
    async fn push(&self, event: ExecutionEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    // Also called from Drop, so this cannot await; the closed flag is what
    // readers check, and the queue clear is best-effort under contention.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut queue) = self.queue.try_lock() {
            queue.clear();
        }
        // Wake any reader parked in recv() so it can observe end-of-stream.
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// A live subscription to the bus.
///
/// Obtain one from [`EventBus::subscribe`]; read events with
/// [`recv`](EventSubscriber::recv). Dropping the subscriber without
/// unsubscribing leaves a closed handle the cleanup task will forget.
pub struct EventSubscriber {
    id: u64,
    execution_id: Option<String>,
    shared: Arc<SubscriberShared>,
}

impl EventSubscriber {
    /// The execution-id filter, `None` for a global subscription.
    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    /// Whether the subscription is still active.
    pub fn is_active(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// How many events were dropped from this subscriber's queue because it
    /// was full.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Await the next event. Returns `None` once the subscription is closed
    /// and the queue is drained; closing while a reader waits wakes it with
    /// this end-of-stream signal.
    pub async fn recv(&self) -> Option<ExecutionEvent> {
        loop {
            // Register for notification before checking the queue so a push
            // between the check and the await is never missed.
            let notified = self.shared.notify.notified();
            {
                let mut queue = self.shared.queue.lock().await;
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

impl Drop for EventSubscriber {
    /// A dropped subscriber closes itself so the cleanup task can forget it;
    /// an abandoned SSE connection does not hold a subscriber slot forever.
    fn drop(&mut self) {
        self.shared.close();
    }
}

struct SubscriberHandle {
    execution_id: Option<String>,
    shared: Arc<SubscriberShared>,
}

struct BusInner {
    subscribers: HashMap<u64, SubscriberHandle>,
    buffers: HashMap<String, VecDeque<ExecutionEvent>>,
    next_subscriber_id: u64,
    buffer_evictions: u64,
}

/// Point-in-time statistics (see [`EventBus::get_stats`]).
#[derive(Debug, Clone, Serialize)]
pub struct EventBusStats {
    /// Active subscribers right now.
    pub total_subscribers: usize,
    /// Buffered events summed over all executions.
    pub total_buffered_events: usize,
    /// Buffered events per execution id.
    pub buffer_by_execution: HashMap<String, usize>,
    /// Events evicted from ring buffers because they were full.
    pub buffer_evictions: u64,
}

/// The pub/sub hub. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    config: EventBusConfig,
    cleanup_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventBus {
    /// Create a bus with `config`. Call [`start_cleanup`](EventBus::start_cleanup)
    /// to launch the periodic buffer eviction task.
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subscribers: HashMap::new(),
                buffers: HashMap::new(),
                next_subscriber_id: 0,
                buffer_evictions: 0,
            })),
            config,
            cleanup_task: Arc::new(Mutex::new(None)),
        }
    }

    /// A bus with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(EventBusConfig::default())
    }

    /// The active configuration.
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Spawn the periodic cleanup task (idempotent). Evicts buffered events
    /// older than `max_event_age` and forgets closed subscribers.
    pub async fn start_cleanup(&self) {
        let mut slot = self.cleanup_task.lock().await;
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let interval = self.config.cleanup_interval;
        let max_age = self.config.max_event_age;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now() - max_age;
                let mut inner = inner.lock().await;
                for buffer in inner.buffers.values_mut() {
                    while buffer
                        .front()
                        .map(|event| event.timestamp < cutoff)
                        .unwrap_or(false)
                    {
                        buffer.pop_front();
                    }
                }
                inner.buffers.retain(|_, buffer| !buffer.is_empty());
                inner
                    .subscribers
                    .retain(|_, handle| !handle.shared.closed.load(Ordering::Acquire));
            }
        }));
    }

    /// Stop the cleanup task and close every subscriber.
    pub async fn close(&self) {
        if let Some(task) = self.cleanup_task.lock().await.take() {
            task.abort();
        }
        let mut inner = self.inner.lock().await;
        for handle in inner.subscribers.values() {
            handle.shared.close();
        }
        inner.subscribers.clear();
    }

    /// Publish one event: append it to the execution's ring buffer (evicting
    /// the oldest entry when full), then deliver a copy to every active
    /// subscriber whose filter matches. Never blocks on a slow subscriber.
    pub async fn publish(&self, event: ExecutionEvent) {
        let mut inner = self.inner.lock().await;

        let capacity = self.config.event_buffer_size;
        let mut evicted = false;
        {
            let buffer = inner
                .buffers
                .entry(event.execution_id.clone())
                .or_insert_with(VecDeque::new);
            if buffer.len() >= capacity {
                buffer.pop_front();
                evicted = true;
            }
            buffer.push_back(event.clone());
        }
        if evicted {
            inner.buffer_evictions += 1;
        }

        // Enqueue under the bus lock so delivery order matches buffer order.
        for handle in inner.subscribers.values() {
            let matches = match &handle.execution_id {
                Some(filter) => *filter == event.execution_id,
                None => true,
            };
            if matches {
                handle.shared.push(event.clone()).await;
            }
        }
    }

    /// Create a subscription. `execution_id = None` subscribes globally.
    ///
    /// The current buffered events matching the filter are replayed into the
    /// new subscriber's queue, in publish order, before any live event. Fails
    /// with [`EventBusError::TooManySubscribers`] at the configured cap.
    pub async fn subscribe(
        &self,
        execution_id: Option<&str>,
    ) -> Result<EventSubscriber, EventBusError> {
        let mut inner = self.inner.lock().await;
        let active = inner
            .subscribers
            .values()
            .filter(|handle| !handle.shared.closed.load(Ordering::Acquire))
            .count();
        if active >= self.config.max_subscribers {
            return Err(EventBusError::TooManySubscribers(self.config.max_subscribers));
        }

        let shared = Arc::new(SubscriberShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            capacity: self.config.subscriber_queue_size,
        });

        // Replay: execution-scoped subscribers get that execution's buffer;
        // global subscribers get every buffer merged by timestamp.
        match execution_id {
            Some(id) => {
                if let Some(buffer) = inner.buffers.get(id) {
                    for event in buffer.iter() {
                        shared.push(event.clone()).await;
                    }
                }
            }
            None => {
                let mut replay: Vec<ExecutionEvent> = inner
                    .buffers
                    .values()
                    .flat_map(|buffer| buffer.iter().cloned())
                    .collect();
                replay.sort_by_key(|event| event.timestamp);
                for event in replay {
                    shared.push(event).await;
                }
            }
        }

        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.insert(
            id,
            SubscriberHandle {
                execution_id: execution_id.map(|s| s.to_string()),
                shared: Arc::clone(&shared),
            },
        );

        Ok(EventSubscriber {
            id,
            execution_id: execution_id.map(|s| s.to_string()),
            shared,
        })
    }

    /// Tear down a subscription: mark it inactive, drain and close its queue,
    /// forget it. Idempotent.
    pub async fn unsubscribe(&self, subscriber: &EventSubscriber) {
        subscriber.shared.close();
        let mut inner = self.inner.lock().await;
        inner.subscribers.remove(&subscriber.id);
    }

    /// Buffered events for `execution_id`; with `limit`, the most recent
    /// `limit` of them. Order is publish order.
    pub async fn get_buffered_events(
        &self,
        execution_id: &str,
        limit: Option<usize>,
    ) -> Vec<ExecutionEvent> {
        let inner = self.inner.lock().await;
        let buffer = match inner.buffers.get(execution_id) {
            Some(buffer) => buffer,
            None => return Vec::new(),
        };
        match limit {
            Some(limit) if buffer.len() > limit => {
                buffer.iter().skip(buffer.len() - limit).cloned().collect()
            }
            _ => buffer.iter().cloned().collect(),
        }
    }

    /// Active subscriber count for a filter (`None` counts global
    /// subscribers).
    pub async fn subscriber_count(&self, execution_id: Option<&str>) -> usize {
        let inner = self.inner.lock().await;
        inner
            .subscribers
            .values()
            .filter(|handle| !handle.shared.closed.load(Ordering::Acquire))
            .filter(|handle| handle.execution_id.as_deref() == execution_id)
            .count()
    }

    /// Total active subscribers across all filters.
    pub async fn total_subscriber_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .subscribers
            .values()
            .filter(|handle| !handle.shared.closed.load(Ordering::Acquire))
            .count()
    }

    /// Point-in-time statistics.
    pub async fn get_stats(&self) -> EventBusStats {
        let inner = self.inner.lock().await;
        let buffer_by_execution: HashMap<String, usize> = inner
            .buffers
            .iter()
            .map(|(id, buffer)| (id.clone(), buffer.len()))
            .collect();
        EventBusStats {
            total_subscribers: inner
                .subscribers
                .values()
                .filter(|handle| !handle.shared.closed.load(Ordering::Acquire))
                .count(),
            total_buffered_events: buffer_by_execution.values().sum(),
            buffer_by_execution,
            buffer_evictions: inner.buffer_evictions,
        }
    }

    // ── Convenience emitters ────────────────────────────────────────────
    // Thin wrappers over publish() using the typed ExecutionEvent
    // constructors. Each returns the event it published so callers can also
    // persist it.

    /// Publish `execution_started` (system).
    pub async fn emit_execution_started(
        &self,
        execution_id: &str,
        team_id: &str,
    ) -> ExecutionEvent {
        let event = ExecutionEvent::execution_started(execution_id, team_id);
        self.publish(event.clone()).await;
        event
    }

    /// Publish `team_started` (system).
    pub async fn emit_team_started(
        &self,
        execution_id: &str,
        team_id: &str,
        team_name: &str,
    ) -> ExecutionEvent {
        let event = ExecutionEvent::team_started(execution_id, team_id, team_name);
        self.publish(event.clone()).await;
        event
    }

    /// Publish `team_completed` (system).
    pub async fn emit_team_completed(
        &self,
        execution_id: &str,
        team_id: &str,
        team_name: &str,
        status: &str,
    ) -> ExecutionEvent {
        let event = ExecutionEvent::team_completed(execution_id, team_id, team_name, status);
        self.publish(event.clone()).await;
        event
    }

    /// Publish `supervisor_routing` (supervisor).
    pub async fn emit_supervisor_routing(
        &self,
        execution_id: &str,
        supervisor_id: &str,
        supervisor_name: &str,
        team_id: &str,
        content: &str,
        selected_agent: Option<&str>,
    ) -> ExecutionEvent {
        let event = ExecutionEvent::supervisor_routing(
            execution_id,
            supervisor_id,
            supervisor_name,
            team_id,
            content,
            selected_agent,
        );
        self.publish(event.clone()).await;
        event
    }

    /// Publish `agent_started` (agent).
    pub async fn emit_agent_started(
        &self,
        execution_id: &str,
        team_id: &str,
        agent_id: &str,
        agent_name: &str,
        content: &str,
    ) -> ExecutionEvent {
        let event =
            ExecutionEvent::agent_started(execution_id, team_id, agent_id, agent_name, content);
        self.publish(event.clone()).await;
        event
    }

    /// Publish `agent_progress` (agent).
    pub async fn emit_agent_progress(
        &self,
        execution_id: &str,
        team_id: &str,
        agent_id: &str,
        agent_name: &str,
        content: &str,
        progress: u8,
    ) -> ExecutionEvent {
        let event = ExecutionEvent::agent_progress(
            execution_id,
            team_id,
            agent_id,
            agent_name,
            content,
            progress,
        );
        self.publish(event.clone()).await;
        event
    }

    /// Publish `agent_completed` (agent).
    pub async fn emit_agent_completed(
        &self,
        execution_id: &str,
        team_id: &str,
        agent_id: &str,
        agent_name: &str,
        result: &str,
    ) -> ExecutionEvent {
        let event =
            ExecutionEvent::agent_completed(execution_id, team_id, agent_id, agent_name, result);
        self.publish(event.clone()).await;
        event
    }

    /// Publish `agent_error` (agent).
    pub async fn emit_agent_error(
        &self,
        execution_id: &str,
        team_id: &str,
        agent_id: &str,
        agent_name: &str,
        error: &str,
    ) -> ExecutionEvent {
        let event =
            ExecutionEvent::agent_error(execution_id, team_id, agent_id, agent_name, error);
        self.publish(event.clone()).await;
        event
    }

    /// Publish `execution_completed` (system).
    pub async fn emit_execution_completed(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        results_ref: &str,
    ) -> ExecutionEvent {
        let event =
            ExecutionEvent::execution_completed(execution_id, status.as_str(), results_ref);
        self.publish(event.clone()).await;
        event
    }

    /// Publish a free-form `warning` (system).
    pub async fn emit_warning(
        &self,
        execution_id: &str,
        team_id: Option<&str>,
        content: &str,
    ) -> ExecutionEvent {
        let event = ExecutionEvent::warning(execution_id, team_id, content);
        self.publish(event.clone()).await;
        event
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("max_subscribers", &self.config.max_subscribers)
            .field("event_buffer_size", &self.config.event_buffer_size)
            .finish()
    }
}
