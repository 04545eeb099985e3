//! Core runtime: the Agent Core state machine, consensus engine, ACE
//! condensation pipeline, MCP client subsystem, and tree supervision.

pub mod error;

pub mod history;
pub mod tokens;

pub mod events;
pub mod event_bus;

pub mod reflector;
pub mod lesson_manager;
pub mod condenser;

pub mod query_layer;
pub mod consensus;

pub mod router;
pub mod pool_switch;
pub mod mcp;

pub mod config;
pub mod persistence;

pub mod agent_messages;
pub mod agent;
pub mod supervisor;

#[cfg(test)]
pub mod testing;

pub use error::RuntimeError;
pub use events::{Envelope, PublishedEvent, Topic};
pub use event_bus::EventBus;
pub use history::{AgentConfig, AgentState, Decision, Wait};
pub use agent::{AgentCore, AgentCoreArgs, AgentDeps};
pub use supervisor::{Profile, ProfileCatalog, SpawnRequest, StaticProfileCatalog, TreeSupervisor};
