//! System prompt assembly.
//!
//! The prompt is built once when a loop starts, from the agent's own
//! configuration plus the metadata of whatever tools and skills are available
//! at that moment. Each part is wrapped in an XML-style tag so models can tell
//! the sections apart. Skills contribute only their name, description and
//! location; the model loads the full instructions itself when it needs them.

use aegis_core::agent::AgentConfig;
use aegis_core::skill::SkillMetadata;
use aegis_core::tool::ToolDescriptor;
use std::fmt::Write;

/// Build the system prompt for `agent`.
pub fn build_system_prompt(
    agent: &AgentConfig,
    tools: &[ToolDescriptor],
    skills: &[SkillMetadata],
) -> String {
    let mut prompt = String::with_capacity(1024);

    push_section(
        &mut prompt,
        "identity",
        &format!(
            "You are {}, a helpful AI agent. Be concise, accurate, and proactive.",
            agent.name
        ),
    );

    if !agent.instructions.trim().is_empty() {
        push_section(&mut prompt, "instructions", agent.instructions.trim());
    }

    if !tools.is_empty() {
        let mut body = String::from(
            "You can call the following tools. Use them when they help accomplish the task.\n",
        );
        for tool in tools {
            let _ = writeln!(body, "- {}: {}", tool.name, tool.description);
            let _ = writeln!(body, "  parameters: {}", tool.parameters);
        }
        push_section(&mut prompt, "tools", body.trim_end());
    }

    if !skills.is_empty() {
        let mut body = String::from(
            "The following skills are available. Read a skill's instructions before using it.\n",
        );
        for skill in skills {
            match &skill.location {
                Some(location) => {
                    let _ = writeln!(
                        body,
                        "- {}: {} ({})",
                        skill.name,
                        skill.description,
                        location.display()
                    );
                }
                None => {
                    let _ = writeln!(body, "- {}: {}", skill.name, skill.description);
                }
            }
        }
        push_section(&mut prompt, "skills", body.trim_end());
    }

    prompt.trim_end().to_string()
}

fn push_section(prompt: &mut String, tag: &str, content: &str) {
    if !prompt.is_empty() {
        prompt.push('\n');
    }
    let _ = write!(prompt, "<{tag}>\n{content}\n</{tag}>\n");
}
