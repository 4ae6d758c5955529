//! The agent execution loop.
//!
//! An [`AgentLoop`] subscribes to `agent.turn` events addressed to its agent
//! id. For each turn it hydrates the working history from the session store,
//! then alternates model generation and tool execution for at most
//! `max_iterations` rounds, persisting every appended message. Every turn ends
//! with exactly one `agent.complete` or `agent.error` event on the turn's
//! trace.

use aegis_core::agent::{AgentConfig, LoopState, LoopStats};
use aegis_core::bus::{EventBus, EventFilter, HandlerResult, SubscriptionHandle};
use aegis_core::error::{Error, Result, ToolError};
use aegis_core::event::{Event, EventPayload, ToolExecutedPayload, Topic, TurnPayload};
use aegis_core::message::Message;
use aegis_core::provider::Provider;
use aegis_core::session::SessionStore;
use aegis_core::skill::SkillCatalog;
use aegis_core::tool::{ToolCall, ToolRegistry};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::prompt::build_system_prompt;

/// Everything an [`AgentLoop`] needs, supplied explicitly at construction.
pub struct AgentLoopConfig {
    pub agent: AgentConfig,
    pub provider: Arc<dyn Provider>,
    pub tools: Arc<ToolRegistry>,
    pub bus: EventBus,
    /// Without a store the loop runs in ephemeral mode.
    pub store: Option<Arc<dyn SessionStore>>,
    pub skills: Option<Arc<dyn SkillCatalog>>,
}

impl AgentLoopConfig {
    pub fn new(agent: AgentConfig, provider: Arc<dyn Provider>, bus: EventBus) -> Self {
        Self {
            agent,
            provider,
            tools: Arc::new(ToolRegistry::new()),
            bus,
            store: None,
            skills: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillCatalog>) -> Self {
        self.skills = Some(skills);
        self
    }
}

/// The loop's in-memory view of the conversation.
#[derive(Default)]
struct WorkingHistory {
    system_prompt: String,
    /// `messages[0]` is the system prompt once the loop has started.
    messages: Vec<Message>,
    /// Session the history was hydrated from; `None` means ephemeral.
    session_id: Option<String>,
}

impl WorkingHistory {
    fn reset(&mut self) {
        self.messages = vec![Message::system(&self.system_prompt)];
    }

    /// The part of the history that belongs in the session ledger.
    fn conversation(&self) -> &[Message] {
        self.messages.get(1..).unwrap_or_default()
    }
}

struct LoopInner {
    agent: AgentConfig,
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    bus: EventBus,
    store: Option<Arc<dyn SessionStore>>,
    skills: Option<Arc<dyn SkillCatalog>>,
    /// Held for the whole generation/tool cycle, so turns run one at a time.
    working: tokio::sync::Mutex<WorkingHistory>,
    state: Mutex<LoopState>,
    stats: Mutex<LoopStats>,
}

/// Processes turns for one agent identity.
pub struct AgentLoop {
    inner: Arc<LoopInner>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl AgentLoop {
    pub fn new(config: AgentLoopConfig) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                agent: config.agent,
                provider: config.provider,
                tools: config.tools,
                bus: config.bus,
                store: config.store,
                skills: config.skills,
                working: tokio::sync::Mutex::new(WorkingHistory::default()),
                state: Mutex::new(LoopState::Idle),
                stats: Mutex::new(LoopStats::default()),
            }),
            subscription: Mutex::new(None),
        }
    }

    /// Build the system prompt, seed the working history and start listening.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != LoopState::Idle {
                return Err(Error::InvalidState(format!(
                    "agent loop '{}' cannot start while {:?}",
                    self.inner.agent.id, *state
                )));
            }
            *state = LoopState::Listening;
        }

        let tools = self.inner.tools.descriptors();
        let skills = self
            .inner
            .skills
            .as_ref()
            .map(|catalog| catalog.skills())
            .unwrap_or_default();

        {
            let mut working = self.inner.working.lock().await;
            working.system_prompt = build_system_prompt(&self.inner.agent, &tools, &skills);
            working.reset();
        }

        let weak = Arc::downgrade(&self.inner);
        let filter = EventFilter::all()
            .topic(Topic::AgentTurn)
            .to_agent(self.inner.agent.id.clone());
        let handle = self.inner.bus.subscribe(filter, move |event| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.handle_turn(event).await,
                    None => Ok(()),
                }
            }
        });

        *self.subscription.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        if self.state() == LoopState::Stopped {
            self.release_subscription();
        }

        info!(
            agent_id = %self.inner.agent.id,
            tools = tools.len(),
            skills = skills.len(),
            persistent = self.inner.store.is_some(),
            "Agent loop listening"
        );
        Ok(())
    }

    /// Unsubscribe for good. A turn already in progress still finishes.
    pub fn stop(&self) {
        *self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) = LoopState::Stopped;
        self.release_subscription();
        info!(agent_id = %self.inner.agent.id, "Agent loop stopped");
    }

    fn release_subscription(&self) {
        let handle = self
            .subscription
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.unsubscribe();
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent.id
    }

    pub fn state(&self) -> LoopState {
        self.inner.state()
    }

    pub fn stats(&self) -> LoopStats {
        self.inner.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// The session the working history is currently bound to.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.working.lock().await.session_id.clone()
    }

    /// Snapshot of the working history, system prompt included.
    pub async fn history(&self) -> Vec<Message> {
        self.inner.working.lock().await.messages.clone()
    }
}

impl Drop for AgentLoop {
    fn drop(&mut self) {
        self.release_subscription();
    }
}

impl LoopInner {
    fn state(&self) -> LoopState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: LoopState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != LoopState::Stopped {
            *state = next;
        }
    }

    fn update_stats(&self, update: impl FnOnce(&mut LoopStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    async fn handle_turn(self: Arc<Self>, event: Arc<Event>) -> HandlerResult {
        let EventPayload::Turn(turn) = &event.payload else {
            return Ok(());
        };
        if self.state() == LoopState::Stopped {
            debug!(agent_id = %self.agent.id, event_id = %event.id, "Ignoring turn for stopped loop");
            return Ok(());
        }

        let mut executed = Vec::new();
        let outcome = {
            let mut working = self.working.lock().await;
            self.set_state(LoopState::Processing);
            let outcome = AssertUnwindSafe(self.run_turn(&mut working, &event, turn, &mut executed))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Internal("turn processing panicked".into())));
            self.set_state(LoopState::Listening);
            outcome
        };

        // Nothing is published while the working history is locked: any
        // subscriber may send this loop another turn and wait for it.
        for payload in executed {
            self.publish_tool_executed(&event, payload).await;
        }

        let payload = match outcome {
            Ok(text) => {
                self.update_stats(|s| s.turns_completed += 1);
                info!(agent_id = %self.agent.id, trace_id = %event.trace.trace_id, "Turn complete");
                EventPayload::complete(text)
            }
            Err(e) => {
                self.update_stats(|s| s.turns_failed += 1);
                warn!(agent_id = %self.agent.id, trace_id = %event.trace.trace_id, error = %e, "Turn failed");
                EventPayload::error(e.to_string())
            }
        };

        let mut reply = Event::reply_to(&event, payload).from_agent(self.agent.id.clone());
        if let Some(source) = &event.source_agent_id {
            reply = reply.to_agent(source.clone());
        }
        self.bus.publish(reply).await?;
        Ok(())
    }

    async fn run_turn(
        &self,
        working: &mut WorkingHistory,
        event: &Event,
        turn: &TurnPayload,
        executed: &mut Vec<ToolExecutedPayload>,
    ) -> Result<String> {
        if let Some(session_id) = turn.session_id.as_deref() {
            if working.session_id.as_deref() != Some(session_id) {
                self.hydrate(working, session_id).await;
            }
        }

        working.messages.push(Message::user(turn.message.clone()));
        self.persist(working).await;

        let limit = self.agent.max_iterations;
        for iteration in 1..=limit {
            debug!(
                agent_id = %self.agent.id,
                trace_id = %event.trace.trace_id,
                iteration,
                history = working.messages.len(),
                "Agent loop iteration"
            );

            let generation = self.provider.generate(&working.messages).await?;
            let text = generation.text.filter(|t| !t.is_empty());
            if let Some(text) = &text {
                working.messages.push(Message::assistant(text.clone()));
                self.persist(working).await;
            }

            if generation.tool_calls.is_empty() {
                return Ok(text.unwrap_or_default());
            }

            let calls = generation.tool_calls;
            debug!(agent_id = %self.agent.id, tool_count = calls.len(), "Executing tool calls");
            working.messages.push(Message::assistant_tool_calls(calls.clone()));

            // Strictly sequential: results land in the order the model asked.
            for call in &calls {
                let started = Instant::now();
                let result = self.execute_tool(call).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                let success = result.is_ok();

                let output = match result {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(agent_id = %self.agent.id, tool = %call.name, error = %e, "Tool execution failed");
                        format!("Error: {e}")
                    }
                };
                working.messages.push(Message::tool_result(call.id.clone(), output));
                self.persist(working).await;
                self.update_stats(|s| s.tool_calls += 1);
                executed.push(ToolExecutedPayload {
                    tool_name: call.name.clone(),
                    call_id: call.id.clone(),
                    success,
                    duration_ms,
                });
            }
        }

        warn!(agent_id = %self.agent.id, trace_id = %event.trace.trace_id, limit, "Max iterations reached");
        Err(Error::MaxIterations { limit })
    }

    async fn execute_tool(&self, call: &ToolCall) -> std::result::Result<String, ToolError> {
        AssertUnwindSafe(self.tools.execute(call))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ToolError::ExecutionFailed {
                    tool_name: call.name.clone(),
                    reason: "tool panicked".into(),
                })
            })
    }

    /// Bind the working history to `session_id`, loading whatever it already holds.
    ///
    /// Unlike a plain as-is rule, switching to an empty session drops the
    /// previous session's messages instead of carrying them over.
    async fn hydrate(&self, working: &mut WorkingHistory, session_id: &str) {
        let Some(store) = &self.store else {
            debug!(agent_id = %self.agent.id, session_id, "No session store; running ephemeral");
            return;
        };

        match store.get(session_id).await {
            Ok(Some(session)) => {
                if !session.history.is_empty() {
                    working.reset();
                    working.messages.extend(session.history);
                } else if working.session_id.is_some() {
                    // A fresh session must not inherit another session's messages.
                    working.reset();
                }
                working.session_id = Some(session_id.to_string());
                info!(
                    agent_id = %self.agent.id,
                    session_id,
                    messages = working.conversation().len(),
                    "Hydrated session"
                );
            }
            Ok(None) => {
                warn!(agent_id = %self.agent.id, session_id, "Session not found; continuing without persistence");
                working.session_id = None;
            }
            Err(e) => {
                warn!(agent_id = %self.agent.id, session_id, error = %e, "Failed to load session; continuing without persistence");
                self.update_stats(|s| s.persistence_failures += 1);
                working.session_id = None;
            }
        }
    }

    /// Best effort: a failed write is logged and counted, never fatal to the turn.
    async fn persist(&self, working: &WorkingHistory) {
        let (Some(store), Some(session_id)) = (&self.store, &working.session_id) else {
            return;
        };
        if let Err(e) = store.update(session_id, working.conversation()).await {
            warn!(agent_id = %self.agent.id, session_id = %session_id, error = %e, "Failed to persist session history");
            self.update_stats(|s| s.persistence_failures += 1);
        }
    }

    async fn publish_tool_executed(&self, turn: &Event, payload: ToolExecutedPayload) {
        let event = Event::reply_to(turn, EventPayload::ToolExecuted(payload)).from_agent(self.agent.id.clone());
        if let Err(e) = self.bus.publish(event).await {
            debug!(agent_id = %self.agent.id, error = %e, "Dropped tool.executed event");
        }
    }
}
