//! The agent execution loop — the heart of Aegis.
//!
//! The agent follows a bounded **Generate → Act → Observe** cycle:
//!
//! 1. **Receive** an `agent.turn` event from the bus
//! 2. **Hydrate** the working history from the session store
//! 3. **Generate** with the configured provider
//! 4. **If tool calls**: execute them in order, append results, loop back to step 3
//! 5. **If text only**: publish `agent.complete` on the turn's trace
//!
//! The cycle stops after `max_iterations` rounds with an `agent.error`.
//! [`AgentClient`] is the caller side: send a turn, await the reply.

pub mod client;
pub mod loop_runner;
pub mod prompt;

pub use client::AgentClient;
pub use loop_runner::{AgentLoop, AgentLoopConfig};
pub use prompt::build_system_prompt;
