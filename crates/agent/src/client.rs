//! Request/reply helper for code that talks to an agent over the bus.

use aegis_core::bus::{EventBus, EventFilter};
use aegis_core::error::{Error, Result};
use aegis_core::event::{Event, EventPayload, Topic, TraceContext};
use std::time::Duration;
use tracing::debug;

/// Sends turns to agents and waits for their terminal event.
#[derive(Clone)]
pub struct AgentClient {
    bus: EventBus,
    timeout: Duration,
    caller_id: Option<String>,
}

impl AgentClient {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        Self {
            bus,
            timeout,
            caller_id: None,
        }
    }

    /// Stamp outgoing turns with `source_agent_id`, so replies are addressed back to us.
    pub fn with_caller_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    /// Send `message` to `agent_id` and return the agent's final answer.
    ///
    /// `agent.error` replies become [`Error::AgentFailed`]; no reply within the
    /// timeout becomes a bus timeout.
    pub async fn send(
        &self,
        agent_id: &str,
        message: impl Into<String>,
        session_id: Option<String>,
    ) -> Result<String> {
        let mut turn = Event::new(EventPayload::turn(message, session_id), TraceContext::root())
            .to_agent(agent_id);
        if let Some(caller) = &self.caller_id {
            turn = turn.from_agent(caller.clone());
        }

        let span_id = turn.trace.span_id.clone();
        let reply_filter = EventFilter::all()
            .topics([Topic::AgentComplete, Topic::AgentError])
            .with_predicate(move |event| event.trace.parent_span_id.as_deref() == Some(span_id.as_str()));

        debug!(agent_id, trace_id = %turn.trace.trace_id, "Sending turn");
        let reply = self.bus.request(turn, reply_filter, self.timeout).await?;

        match &reply.payload {
            EventPayload::Complete(complete) => Ok(complete.message.clone()),
            EventPayload::Error(failure) => Err(Error::AgentFailed(failure.error.clone())),
            other => Err(Error::Internal(format!("unexpected reply on {}", other.topic()))),
        }
    }
}
