//! # Aegis Core
//!
//! Domain types, traits, and error definitions for the Aegis agent runtime.
//! This crate defines the model every other crate implements against,
//! including the in-process event bus that connects them.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here: model backends
//! ([`Provider`]), tools ([`Tool`]), session persistence ([`SessionStore`])
//! and skill metadata ([`SkillCatalog`]). Implementations live in their own
//! crates or in the embedding process, so tests can swap in scripted stubs.

pub mod agent;
pub mod bus;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod session;
pub mod skill;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentConfig, LoopState, LoopStats};
pub use bus::{EventBus, EventFilter, HandlerResult, SubscriptionHandle};
pub use error::{BusError, Error, ProviderError, Result, StoreError, ToolError};
pub use event::{Event, EventPayload, Topic, TraceContext};
pub use message::{Message, Role};
pub use provider::{Generation, Provider};
pub use session::{Session, SessionStore};
pub use skill::{SkillCatalog, SkillMetadata, StaticSkills};
pub use tool::{Tool, ToolCall, ToolDescriptor, ToolRegistry};
