//! muster-core - routing and bookkeeping for a team of named agents
//!
//! This crate provides:
//! - A durable agent registry and per-agent conversational memory
//! - The resolver that maps free text to an addressed agent
//! - An administrative command interpreter
//! - Task tracking with staleness detection and lifecycle notifications
//! - The `Hub`, which ties these together behind one `handle_message` call

pub mod agent;
pub mod clock;
pub mod commands;
pub mod context;
pub mod engine;
pub mod error;
pub mod memory;
pub mod notifications;
pub mod notifiers;
pub mod providers;
pub mod registry;
pub mod resolver;
pub mod tasks;
pub mod types;

pub use agent::{Hub, HubReply, HubSettings, Route};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commands::CommandContext;
pub use engine::{ConversationEngine, EngineOptions};
pub use error::{CoreError, CoreResult, EngineError, NotifyError};
pub use memory::MemoryStore;
pub use notifications::{NotificationService, NotifyConfig, NotifyEvent, Notifier};
pub use notifiers::{CommandNotifier, LogNotifier};
pub use providers::OllamaEngine;
pub use registry::Registry;
pub use resolver::{Resolution, resolve};
pub use tasks::{ActiveTask, Partition, TaskTracker, TaskUpdate};
pub use types::{AgentDefinition, KnowledgeEntry, TaskRecord, TaskStatus, Turn, TurnRole};
