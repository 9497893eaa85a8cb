//! Inter-agent message broker (spec.md §4 Message Broker). Per-agent
//! priority-ordered inboxes, broadcast fan-out, bounded history with a
//! TTL sweep, and correlation-tracked request/response.
//!
//! Grounded on the teacher's "Separated Service" shape
//! (`Arc<Mutex<HashMap<...>>>` behind a cloneable handle) and enriched
//! with the correlation-tracker idea from the messaging runtime example
//! in the broader reference pack.

use crate::clock::Clock;
use crate::error::{MeshError, Result};
use crate::events::{Event, EventSink};
use crate::models::Message;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

struct Inbox {
    messages: VecDeque<Message>,
    max_size: usize,
}

impl Inbox {
    fn new(max_size: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_size,
        }
    }

    /// Inserts keeping the queue priority-ordered (stable within a
    /// priority band), evicting the oldest, lowest-priority message
    /// when full.
    fn push(&mut self, message: Message) -> Option<Message> {
        let mut evicted = None;
        if self.messages.len() >= self.max_size {
            evicted = self.messages.pop_front();
        }

        let index = self
            .messages
            .iter()
            .position(|m| m.priority < message.priority)
            .unwrap_or(self.messages.len());
        self.messages.insert(index, message);
        evicted
    }

    fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }
}

struct PendingRequest {
    responder: oneshot::Sender<Message>,
}

pub struct MessageBroker {
    inboxes: Arc<Mutex<HashMap<String, Inbox>>>,
    subscriptions: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    history: Arc<Mutex<VecDeque<Message>>>,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    inbox_size: usize,
    history_size: usize,
    history_ttl_ms: i64,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl Clone for MessageBroker {
    fn clone(&self) -> Self {
        Self {
            inboxes: self.inboxes.clone(),
            subscriptions: self.subscriptions.clone(),
            history: self.history.clone(),
            pending: self.pending.clone(),
            inbox_size: self.inbox_size,
            history_size: self.history_size,
            history_ttl_ms: self.history_ttl_ms,
            clock: self.clock.clone(),
            events: self.events.clone(),
        }
    }
}

impl MessageBroker {
    pub fn new(
        inbox_size: usize,
        history_size: usize,
        history_ttl_ms: i64,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inboxes: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(Mutex::new(VecDeque::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            inbox_size,
            history_size,
            history_ttl_ms,
            clock,
            events,
        }
    }

    pub async fn ensure_inbox(&self, agent_id: &str) {
        let mut inboxes = self.inboxes.lock().await;
        inboxes
            .entry(agent_id.to_string())
            .or_insert_with(|| Inbox::new(self.inbox_size));
        self.subscriptions
            .lock()
            .await
            .entry(agent_id.to_string())
            .or_insert_with(HashSet::new);
    }

    pub async fn remove_inbox(&self, agent_id: &str) {
        self.inboxes.lock().await.remove(agent_id);
        self.subscriptions.lock().await.remove(agent_id);
    }

    /// Adds `message_type` to the set of types `agent_id`'s inbox accepts.
    pub async fn subscribe(&self, agent_id: &str, message_type: impl Into<String>) {
        self.subscriptions
            .lock()
            .await
            .entry(agent_id.to_string())
            .or_insert_with(HashSet::new)
            .insert(message_type.into());
    }

    /// Removes `message_type` from the agent's subscription set, or
    /// clears the whole set when `message_type` is `None`.
    pub async fn unsubscribe(&self, agent_id: &str, message_type: Option<&str>) {
        let mut subs = self.subscriptions.lock().await;
        if let Some(set) = subs.get_mut(agent_id) {
            match message_type {
                Some(t) => {
                    set.remove(t);
                }
                None => set.clear(),
            }
        }
    }

    async fn is_subscribed(&self, agent_id: &str, message_type: &str) -> bool {
        self.subscriptions
            .lock()
            .await
            .get(agent_id)
            .is_some_and(|set| set.contains(message_type))
    }

    /// Delivers a message to its addressed, subscribed recipient, or
    /// fans out to every other subscribed inbox when `message.to` is
    /// `None`. Returns whether at least one delivery occurred.
    pub async fn send(&self, message: Message) -> Result<bool> {
        self.record_history(message.clone()).await;

        if let Some(correlation_id) = message.correlation_id.clone() {
            let mut pending = self.pending.lock().await;
            if let Some(request) = pending.remove(&correlation_id) {
                let _ = request.responder.send(message.clone());
                return Ok(true);
            }
        }

        if message.is_broadcast() {
            let subscribed: Vec<String> = {
                let subs = self.subscriptions.lock().await;
                subs.iter()
                    .filter(|(agent_id, types)| {
                        agent_id.as_str() != message.from && types.contains(&message.message_type)
                    })
                    .map(|(agent_id, _)| agent_id.clone())
                    .collect()
            };

            let mut delivered = false;
            let mut inboxes = self.inboxes.lock().await;
            for agent_id in subscribed {
                let Some(inbox) = inboxes.get_mut(&agent_id) else {
                    continue;
                };
                delivered = true;
                if let Some(dropped) = inbox.push(message.clone()) {
                    warn!(agent_id, dropped_message_id = %dropped.id, "inbox overflow");
                    self.events
                        .emit(Event::QueueOverflow {
                            agent_id,
                            dropped_message_id: dropped.id,
                        })
                        .await;
                }
            }
            return Ok(delivered);
        }

        let to = message
            .to
            .clone()
            .ok_or_else(|| MeshError::NotFound { id: "<no recipient>".into() })?;

        let registered = self.inboxes.lock().await.contains_key(&to);
        if !registered || !self.is_subscribed(&to, &message.message_type).await {
            debug!(agent_id = %to, message_type = %message.message_type, "message dropped: not subscribed");
            self.events
                .emit(Event::MessageDropped {
                    agent_id: to,
                    message_id: message.id,
                })
                .await;
            return Ok(false);
        }

        let mut inboxes = self.inboxes.lock().await;
        let inbox = inboxes
            .entry(to.clone())
            .or_insert_with(|| Inbox::new(self.inbox_size));
        if let Some(dropped) = inbox.push(message) {
            warn!(agent_id = %to, dropped_message_id = %dropped.id, "inbox overflow");
            self.events
                .emit(Event::QueueOverflow {
                    agent_id: to,
                    dropped_message_id: dropped.id,
                })
                .await;
        }
        Ok(true)
    }

    pub async fn receive(&self, agent_id: &str) -> Option<Message> {
        let mut inboxes = self.inboxes.lock().await;
        inboxes.get_mut(agent_id).and_then(|inbox| inbox.pop())
    }

    pub async fn inbox_len(&self, agent_id: &str) -> usize {
        self.inboxes
            .lock()
            .await
            .get(agent_id)
            .map(|inbox| inbox.messages.len())
            .unwrap_or(0)
    }

    /// Sends `message` and waits for a reply carrying the same
    /// correlation id, or times out after `timeout_ms`. Subscribes the
    /// caller to `response.{correlationId}` for the duration of the
    /// wait and always cleans the subscription up afterwards.
    pub async fn request(&self, mut message: Message, timeout_ms: u64) -> Result<Message> {
        let correlation_id = crate::id::generate("corr", self.clock.now_millis());
        message.correlation_id = Some(correlation_id.clone());
        let response_type = format!("response.{correlation_id}");
        let from = message.from.clone();

        self.subscribe(&from, response_type.clone()).await;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(correlation_id.clone(), PendingRequest { responder: tx });
        }

        self.send(message).await?;

        let result = tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), rx).await;
        self.pending.lock().await.remove(&correlation_id);
        self.unsubscribe(&from, Some(&response_type)).await;

        match result {
            Ok(Ok(response)) => Ok(response),
            _ => Err(MeshError::Timeout {
                message: format!("no response for correlation id {correlation_id}"),
            }),
        }
    }

    /// Convenience wrapper that replies to a pending `request` by
    /// sending a `response.{correlationId}` message back to `to`.
    pub async fn respond(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        correlation_id: &str,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let mut message = Message::new(
            &*self.clock,
            from,
            Some(to.into()),
            format!("response.{correlation_id}"),
            payload,
        );
        message.correlation_id = Some(correlation_id.to_string());
        self.send(message).await
    }

    async fn record_history(&self, message: Message) {
        let mut history = self.history.lock().await;
        if history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(message);
    }

    /// Drops history entries older than the configured TTL.
    pub async fn sweep_history(&self) -> usize {
        let now = self.clock.now_utc();
        let mut history = self.history.lock().await;
        let before = history.len();
        history.retain(|m| (now - m.timestamp).num_milliseconds() <= self.history_ttl_ms);
        let removed = before - history.len();
        if removed > 0 {
            debug!(removed, "swept expired message history");
        }
        removed
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::events::NullEventSink;
    use crate::models::Priority;

    fn broker(clock: Arc<TestClock>) -> MessageBroker {
        MessageBroker::new(2, 100, 60_000, clock, Arc::new(NullEventSink))
    }

    #[tokio::test]
    async fn direct_message_is_delivered() {
        let clock = Arc::new(TestClock::new(0));
        let b = broker(clock.clone());
        b.ensure_inbox("agent-2").await;
        b.subscribe("agent-2", "ping").await;

        let msg = Message::new(&*clock, "agent-1", Some("agent-2".into()), "ping", serde_json::json!({}));
        assert!(b.send(msg).await.unwrap());

        let received = b.receive("agent-2").await.unwrap();
        assert_eq!(received.from, "agent-1");
    }

    #[tokio::test]
    async fn unsubscribed_direct_message_is_dropped() {
        let clock = Arc::new(TestClock::new(0));
        let b = broker(clock.clone());
        b.ensure_inbox("agent-2").await;

        let msg = Message::new(&*clock, "agent-1", Some("agent-2".into()), "ping", serde_json::json!({}));
        assert!(!b.send(msg).await.unwrap());
        assert!(b.receive("agent-2").await.is_none());
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let clock = Arc::new(TestClock::new(0));
        let b = broker(clock.clone());
        b.ensure_inbox("sender").await;
        b.ensure_inbox("other-1").await;
        b.ensure_inbox("other-2").await;
        b.subscribe("sender", "announce").await;
        b.subscribe("other-1", "announce").await;
        b.subscribe("other-2", "announce").await;

        let msg = Message::new(&*clock, "sender", None, "announce", serde_json::json!({}));
        b.send(msg).await.unwrap();

        assert!(b.receive("sender").await.is_none());
        assert!(b.receive("other-1").await.is_some());
        assert!(b.receive("other-2").await.is_some());
    }

    #[tokio::test]
    async fn broadcast_skips_non_subscribers() {
        let clock = Arc::new(TestClock::new(0));
        let b = broker(clock.clone());
        b.ensure_inbox("sender").await;
        b.ensure_inbox("a").await;
        b.ensure_inbox("b").await;
        b.ensure_inbox("c").await;
        b.subscribe("a", "ping").await;
        b.subscribe("b", "ping").await;

        let msg = Message::new(&*clock, "sender", None, "ping", serde_json::json!({}));
        b.send(msg).await.unwrap();

        assert!(b.receive("a").await.is_some());
        assert!(b.receive("b").await.is_some());
        assert!(b.receive("c").await.is_none());
        assert!(b.receive("sender").await.is_none());
    }

    #[tokio::test]
    async fn inbox_overflow_evicts_oldest() {
        let clock = Arc::new(TestClock::new(0));
        let b = broker(clock.clone());
        b.ensure_inbox("agent-2").await;

        for i in 0..3 {
            b.subscribe("agent-2", format!("m{i}")).await;
            let msg = Message::new(&*clock, "agent-1", Some("agent-2".into()), format!("m{i}"), serde_json::json!({}))
                .with_priority(Priority::Normal);
            b.send(msg).await.unwrap();
        }

        assert_eq!(b.inbox_len("agent-2").await, 2);
        let first = b.receive("agent-2").await.unwrap();
        assert_eq!(first.message_type, "m1");
    }

    #[tokio::test]
    async fn higher_priority_jumps_queue() {
        let clock = Arc::new(TestClock::new(0));
        let b = broker(clock.clone());
        b.ensure_inbox("agent-2").await;
        b.subscribe("agent-2", "low").await;
        b.subscribe("agent-2", "high").await;

        let low = Message::new(&*clock, "a1", Some("agent-2".into()), "low", serde_json::json!({}))
            .with_priority(Priority::Low);
        let high = Message::new(&*clock, "a1", Some("agent-2".into()), "high", serde_json::json!({}))
            .with_priority(Priority::Critical);
        b.send(low).await.unwrap();
        b.send(high).await.unwrap();

        let first = b.receive("agent-2").await.unwrap();
        assert_eq!(first.message_type, "high");
    }

    #[tokio::test]
    async fn sweep_history_drops_expired_entries() {
        let clock = Arc::new(TestClock::new(0));
        let b = broker(clock.clone());
        b.ensure_inbox("agent-2").await;
        b.subscribe("agent-2", "x").await;
        let msg = Message::new(&*clock, "a1", Some("agent-2".into()), "x", serde_json::json!({}));
        b.send(msg).await.unwrap();

        clock.advance(120_000);
        let removed = b.sweep_history().await;
        assert_eq!(removed, 1);
        assert_eq!(b.history_len().await, 0);
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let clock = Arc::new(TestClock::new(0));
        let b = broker(clock.clone());
        b.ensure_inbox("requester").await;
        b.ensure_inbox("responder").await;
        b.subscribe("responder", "ask").await;

        let requester = b.clone();
        let responder = b.clone();
        let handle = tokio::spawn(async move {
            let req = Message::new(&*clock, "requester", Some("responder".into()), "ask", serde_json::json!({}));
            requester.request(req, 1_000).await
        });

        // Give the spawned request a chance to register its inbox message.
        tokio::task::yield_now().await;
        let incoming = loop {
            if let Some(m) = responder.receive("responder").await {
                break m;
            }
            tokio::task::yield_now().await;
        };
        let correlation_id = incoming.correlation_id.clone().unwrap();
        responder
            .respond("responder", "requester", &correlation_id, serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.correlation_id.as_deref(), Some(correlation_id.as_str()));
    }
}
