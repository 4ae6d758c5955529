//! Events — the only currency that crosses component boundaries.
//!
//! Producers publish an [`Event`] on the [`EventBus`](crate::bus::EventBus);
//! subscribers react without knowing who sent it. The set of topics is closed
//! and each topic has exactly one payload shape, so the topic of an event is
//! derived from its payload rather than stored beside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All topics known to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// A unit of conversational work addressed to an agent
    #[serde(rename = "agent.turn")]
    AgentTurn,
    /// A turn finished with a final answer
    #[serde(rename = "agent.complete")]
    AgentComplete,
    /// A turn failed
    #[serde(rename = "agent.error")]
    AgentError,
    /// A tool call finished (observational)
    #[serde(rename = "tool.executed")]
    ToolExecuted,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::AgentTurn => "agent.turn",
            Topic::AgentComplete => "agent.complete",
            Topic::AgentError => "agent.error",
            Topic::ToolExecuted => "tool.executed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `agent.turn`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Payload of `agent.complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub message: String,
}

/// Payload of `agent.error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

/// Payload of `tool.executed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutedPayload {
    pub tool_name: String,
    pub call_id: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// Topic-specific event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "agent.turn")]
    Turn(TurnPayload),
    #[serde(rename = "agent.complete")]
    Complete(CompletePayload),
    #[serde(rename = "agent.error")]
    Error(ErrorPayload),
    #[serde(rename = "tool.executed")]
    ToolExecuted(ToolExecutedPayload),
}

impl EventPayload {
    pub fn turn(message: impl Into<String>, session_id: Option<String>) -> Self {
        Self::Turn(TurnPayload {
            message: message.into(),
            session_id,
        })
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::Complete(CompletePayload {
            message: message.into(),
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            error: error.into(),
        })
    }

    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::Turn(_) => Topic::AgentTurn,
            EventPayload::Complete(_) => Topic::AgentComplete,
            EventPayload::Error(_) => Topic::AgentError,
            EventPayload::ToolExecuted(_) => Topic::ToolExecuted,
        }
    }
}

/// Causal identifiers shared by every event derived from one external request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a new trace.
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
        }
    }

    /// A fresh span in the same trace, parented on this one.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    pub fn same_trace(&self, other: &TraceContext) -> bool {
        self.trace_id == other.trace_id
    }

    /// Whether this context was derived directly from `parent`.
    pub fn is_child_of(&self, parent: &TraceContext) -> bool {
        self.same_trace(parent) && self.parent_span_id.as_deref() == Some(parent.span_id.as_str())
    }
}

/// An immutable record published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,

    #[serde(flatten)]
    pub payload: EventPayload,

    pub trace: TraceContext,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
}

impl Event {
    pub fn new(payload: EventPayload, trace: TraceContext) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            trace,
            timestamp: Utc::now(),
            source_agent_id: None,
            target_agent_id: None,
        }
    }

    /// An event caused by `cause`: same trace, parented on the cause's span.
    pub fn reply_to(cause: &Event, payload: EventPayload) -> Self {
        Self::new(payload, cause.trace.child())
    }

    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.source_agent_id = Some(agent_id.into());
        self
    }

    pub fn to_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.target_agent_id = Some(agent_id.into());
        self
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_follows_payload() {
        let event = Event::new(EventPayload::turn("hi", None), TraceContext::root());
        assert_eq!(event.topic(), Topic::AgentTurn);
        let event = Event::new(EventPayload::error("boom"), TraceContext::root());
        assert_eq!(event.topic(), Topic::AgentError);
    }

    #[test]
    fn child_trace_links_to_parent() {
        let root = TraceContext::root();
        let child = root.child();
        assert!(child.same_trace(&root));
        assert!(child.is_child_of(&root));
        assert_ne!(child.span_id, root.span_id);
        assert!(!root.is_child_of(&child));

        let other = TraceContext::root();
        assert!(!child.is_child_of(&other));
    }

    #[test]
    fn reply_descends_from_cause() {
        let turn = Event::new(EventPayload::turn("hi", None), TraceContext::root()).to_agent("a1");
        let reply = Event::reply_to(&turn, EventPayload::complete("hello")).from_agent("a1");
        assert!(reply.trace.is_child_of(&turn.trace));
        assert_eq!(reply.source_agent_id.as_deref(), Some("a1"));
        assert!(reply.target_agent_id.is_none());
        assert_ne!(reply.id, turn.id);
    }

    #[test]
    fn wire_shape_matches_external_interface() {
        let event = Event::new(
            EventPayload::turn("Write it", Some("s-1".into())),
            TraceContext::root(),
        )
        .to_agent("aegis");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["topic"], "agent.turn");
        assert_eq!(json["payload"]["message"], "Write it");
        assert_eq!(json["payload"]["sessionId"], "s-1");
        assert_eq!(json["targetAgentId"], "aegis");
        assert!(json["trace"]["traceId"].is_string());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
