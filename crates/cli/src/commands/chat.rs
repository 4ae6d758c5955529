//! `aegis chat` — Interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;

use aegis_agent::{AgentClient, AgentLoop, AgentLoopConfig};
use aegis_config::AppConfig;
use aegis_core::bus::EventBus;
use aegis_core::error::Error;
use aegis_core::session::SessionStore;
use aegis_core::tool::ToolRegistry;
use anyhow::bail;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::echo::EchoProvider;

/// What the user sees when the agent answers with `agent.error`.
const APOLOGY: &str = "Sorry, something went wrong while handling that. Please try again.";

const CALLER_ID: &str = "cli";

pub async fn run(
    config: &AppConfig,
    message: Option<String>,
    session: Option<String>,
    new_session: bool,
) -> anyhow::Result<()> {
    let store = super::open_store(config).await?;
    let agent_config = config.agent.to_agent_config();

    let session_id = match (session, new_session) {
        (Some(id), _) => {
            if store.get(&id).await?.is_none() {
                store.close().await;
                bail!("Session {id} not found");
            }
            Some(id)
        }
        (None, true) => {
            let session = store.create(&agent_config.id, None).await?;
            eprintln!("  Session: {}", session.id);
            Some(session.id)
        }
        (None, false) => None,
    };

    let bus = EventBus::new();
    let agent = AgentLoop::new(AgentLoopConfig {
        agent: agent_config,
        provider: Arc::new(EchoProvider),
        tools: Arc::new(ToolRegistry::new()),
        bus: bus.clone(),
        store: Some(store.clone()),
        skills: None,
    });
    agent.start().await?;

    let client = AgentClient::new(bus.clone(), config.bus.request_timeout()).with_caller_id(CALLER_ID);
    let agent_id = agent.agent_id().to_string();

    let outcome = match message {
        Some(msg) => {
            let reply = ask(&client, &agent_id, &msg, session_id.as_deref()).await;
            reply.map(|text| println!("{text}"))
        }
        None => interactive(&client, &agent_id, session_id.as_deref()).await,
    };

    agent.stop();
    bus.close();
    store.close().await;
    outcome
}

async fn interactive(
    client: &AgentClient,
    agent_id: &str,
    session_id: Option<&str>,
) -> anyhow::Result<()> {
    println!();
    println!("  Aegis — Interactive Mode");
    println!("  Agent:    {agent_id}");
    match session_id {
        Some(id) => println!("  Session:  {id}"),
        None => println!("  Session:  (ephemeral)"),
    }
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let reply = ask(client, agent_id, line, session_id).await?;
        println!();
        for text in reply.lines() {
            println!("  Aegis > {text}");
        }
        println!();
    }
    Ok(())
}

/// Send one message; agent failures become the apology, transport failures are errors.
async fn ask(
    client: &AgentClient,
    agent_id: &str,
    message: &str,
    session_id: Option<&str>,
) -> anyhow::Result<String> {
    match client.send(agent_id, message, session_id.map(str::to_string)).await {
        Ok(reply) => Ok(reply),
        Err(Error::AgentFailed(detail)) => {
            debug!(error = %detail, "Agent reported an error");
            Ok(APOLOGY.to_string())
        }
        Err(e) => Err(e.into()),
    }
}
