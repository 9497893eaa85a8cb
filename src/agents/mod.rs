pub mod orchestrator;

pub use orchestrator::Orchestrator;

use crate::error::Result;
use crate::models::{AgentConfig, AgentMetrics, AgentStatus, Message, Task};
use async_trait::async_trait;

/// Contract a host implements to plug a worker into the mesh (spec.md
/// §6 `Agent`). The orchestrator and registry only ever see agents
/// through this trait — they never know what an agent actually does
/// with an assigned task.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn config(&self) -> &AgentConfig;

    async fn status(&self) -> AgentStatus;
    async fn metrics(&self) -> AgentMetrics;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    /// Offers a task to the agent. Returns `false` if the agent is at
    /// capacity or otherwise declines; the caller must requeue in that
    /// case rather than treat it as an error.
    async fn assign_task(&self, task: Task) -> Result<bool>;

    /// Best-effort cancellation signal; returns whether the agent
    /// acknowledged owning that task.
    async fn cancel_task(&self, task_id: &str) -> Result<bool>;

    async fn current_tasks(&self) -> Vec<String>;

    async fn handle_message(&self, message: Message) -> Result<()>;

    async fn health_check(&self) -> bool;
}
