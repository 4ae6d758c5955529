//! `aegis sessions` — Session housekeeping.

use aegis_config::AppConfig;
use aegis_core::message::Message;
use aegis_core::session::{Session, SessionStore};
use anyhow::bail;

pub async fn list(config: &AppConfig, agent: Option<String>) -> anyhow::Result<()> {
    let store = super::open_store(config).await?;
    let agent_id = agent.unwrap_or_else(|| config.agent.id.clone());
    let sessions = store.list_by_agent(&agent_id).await;
    store.close().await;
    let sessions = sessions?;

    if sessions.is_empty() {
        println!("No sessions for agent '{agent_id}'.");
        return Ok(());
    }

    println!("Sessions for agent '{agent_id}' (newest first):\n");
    for session in &sessions {
        println!("  {}", summary_line(session));
    }
    println!("\n{} session(s)", sessions.len());
    Ok(())
}

pub async fn show(config: &AppConfig, id: &str) -> anyhow::Result<()> {
    let store = super::open_store(config).await?;
    let session = store.get(id).await;
    store.close().await;

    let Some(session) = session? else {
        bail!("Session {id} not found");
    };

    println!("Session:     {}", session.id);
    println!("Agent:       {}", session.agent_id);
    println!("Created:     {}", session.created_at.to_rfc3339());
    println!("Last active: {}", session.last_active_at.to_rfc3339());
    if let Some(parent) = &session.parent_session_id {
        println!("Parent:      {parent} (depth {})", session.depth);
    }
    println!();

    if session.is_empty() {
        println!("  (no messages)");
    }
    for message in &session.history {
        println!("{}", message_line(message));
    }
    Ok(())
}

pub async fn delete(config: &AppConfig, id: &str) -> anyhow::Result<()> {
    let store = super::open_store(config).await?;
    let deleted = store.delete(id).await;
    store.close().await;

    if deleted? {
        println!("Deleted session {id}");
        Ok(())
    } else {
        bail!("Session {id} not found")
    }
}

fn summary_line(session: &Session) -> String {
    format!(
        "{}  created {}  last active {}  {} message(s)",
        session.id,
        session.created_at.format("%Y-%m-%d %H:%M:%S"),
        session.last_active_at.format("%Y-%m-%d %H:%M:%S"),
        session.history.len()
    )
}

fn message_line(message: &Message) -> String {
    let time = message.timestamp.format("%H:%M:%S");
    if !message.tool_calls.is_empty() {
        let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
        return format!("  [{time}] {}: <calls {}>", message.role, names.join(", "));
    }
    match &message.tool_call_id {
        Some(call_id) => format!("  [{time}] {} ({call_id}): {}", message.role, message.content),
        None => format!("  [{time}] {}: {}", message.role, message.content),
    }
}
