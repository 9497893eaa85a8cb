use agentmesh_core::agents::Agent;
use agentmesh_core::agents::orchestrator::Orchestrator;
use agentmesh_core::clock::{Clock, SystemClock};
use agentmesh_core::config::OrchestratorConfig;
use agentmesh_core::error::Result;
use agentmesh_core::models::{AgentConfig, AgentMetrics, AgentStatus, Message, Priority, Task, TaskExecutionResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, Level};

/// Minimal demo agent: accepts whatever it's offered and reports
/// success immediately. Real hosts implement [`Agent`] against their
/// own worker logic.
struct EchoAgent {
    id: String,
    config: AgentConfig,
    current: Mutex<Vec<String>>,
}

impl EchoAgent {
    fn new(id: &str) -> Self {
        let mut capabilities = HashSet::new();
        capabilities.insert("echo".to_string());
        Self {
            id: id.to_string(),
            config: AgentConfig::new(id, capabilities),
            current: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn status(&self) -> AgentStatus {
        AgentStatus::Idle
    }

    async fn metrics(&self) -> AgentMetrics {
        AgentMetrics::default()
    }

    async fn start(&self) -> Result<()> {
        info!(agent_id = %self.id, "agent starting");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!(agent_id = %self.id, "agent stopping");
        Ok(())
    }

    async fn assign_task(&self, task: Task) -> Result<bool> {
        self.current.lock().await.push(task.id);
        Ok(true)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let mut current = self.current.lock().await;
        let before = current.len();
        current.retain(|id| id != task_id);
        Ok(current.len() != before)
    }

    async fn current_tasks(&self) -> Vec<String> {
        self.current.lock().await.clone()
    }

    async fn handle_message(&self, _message: Message) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting agent mesh demo");

    let config = OrchestratorConfig::load().unwrap_or_else(|e| {
        tracing::warn!("falling back to default config: {e}");
        OrchestratorConfig::default()
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = Arc::new(Orchestrator::new(config, clock.clone()));

    orchestrator.start().await?;

    let agent = Arc::new(EchoAgent::new("echo-1"));
    orchestrator.register_agent(agent.clone()).await?;

    let task = Task::new(&*clock, "demo.echo", Priority::Normal, serde_json::json!({"message": "hello"}));
    let task_id = orchestrator.submit_task(task).await?;
    info!(task_id = %task_id, "task submitted");

    orchestrator.dispatch_once().await?;
    orchestrator
        .report_task_outcome(
            &task_id,
            "echo-1",
            TaskExecutionResult::Success {
                output: serde_json::json!({"echoed": "hello"}),
            },
        )
        .await?;

    let status = orchestrator.system_status().await;
    info!(queue_length = status.queue_length, agent_count = status.agent_count, "system status");

    orchestrator.stop().await?;
    Ok(())
}
