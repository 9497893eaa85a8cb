//! Typed lifecycle events (spec.md §6, Design Note "Event-emitter
//! cross-wiring"). Each variant carries exactly the fields relevant to
//! that transition instead of an untyped `(name, payload)` pair.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub enum Event {
    OrchestratorStarted,
    OrchestratorStopped,
    OrchestratorError { operation: String, message: String },

    TaskSubmitted { task_id: String },
    TaskCreated { task_id: String },
    TaskAssigned { task_id: String, agent_id: String },
    TaskStarted { task_id: String },
    TaskCompleted { task_id: String, duration_ms: i64 },
    TaskFailed { task_id: String, message: String },
    TaskCancelled { task_id: String, source: CancelSource },
    TaskRetryScheduled { task_id: String, retry_count: u32 },
    TaskTimeout { task_id: String },

    AgentRegistered { agent_id: String },
    AgentUnregistered { agent_id: String },
    AgentStale { agent_id: String },
    AgentUnhealthy { agent_id: String },
    AgentHeartbeat { agent_id: String },

    MonitorAlert {
        rule_id: String,
        agent_id: String,
        severity: AlertSeverity,
        message: String,
    },

    SystemScale { current: usize, target: usize },
    QueueOverflow { agent_id: String, dropped_message_id: String },
    MessageDropped { agent_id: String, message_id: String },
    StatsUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    Queue,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Fire-and-forget sink for lifecycle events (spec.md §6
/// `EventSink.Emit`). Implementations must not block the dispatch loop;
/// a slow sink should buffer or spawn internally rather than making
/// `emit` expensive.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Sink that drops every event. Useful as a default when a host hasn't
/// wired anything yet.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: Event) {}
}

/// Sink that forwards events onto an unbounded channel, mirroring the
/// teacher's pattern of routing task results through an
/// `mpsc::UnboundedSender` rather than calling out inline.
pub struct ChannelEventSink {
    sender: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: Event) {
        // A closed receiver means nobody is listening anymore; that is
        // not a failure the orchestrator should care about.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.emit(Event::OrchestratorStarted).await;
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::OrchestratorStarted));
    }

    #[tokio::test]
    async fn null_sink_accepts_anything() {
        let sink = NullEventSink;
        sink.emit(Event::StatsUpdated).await;
    }
}
