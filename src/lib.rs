//! # Agent Mesh Core
//!
//! An in-process runtime for coordinating many concurrent agents
//! against a shared pool of work. Five pieces compose into one system:
//!
//! - **Task Queue**: priority, capability, and dependency-aware work
//!   queue.
//! - **Agent Registry**: capability/status/tag-indexed directory of
//!   registered agents, with heartbeat staleness detection.
//! - **Orchestrator**: dispatch loop, task lifecycle, retries with
//!   backoff, timeouts, cancellation, and scaling signals.
//! - **Message Broker**: per-agent inboxes, broadcast fan-out, and
//!   correlated request/response messaging.
//! - **Monitor**: per-agent performance history, alert rules, and
//!   aggregated health.
//!
//! Hosts plug in their own [`agents::Agent`] implementations; the core
//! has no opinion about what a task actually does.

/// Agent trait and the orchestration components built around it.
pub mod agents;
/// Typed configuration for the orchestration core.
pub mod config;
/// System-wide default values, overridable through [`config::OrchestratorConfig`].
pub mod constants;
/// Error types and handling.
pub mod error;
/// Typed lifecycle events and the sink trait that carries them out.
pub mod events;
/// Opaque identifier generation and validation.
pub mod id;
/// Core data models shared across components.
pub mod models;
/// Injectable time source used throughout the core.
pub mod clock;

pub use error::{MeshError, Result};
