//! System prompt composition.
//!
//! Composed exactly once per runner: an optional caller-supplied context
//! block first, then the agent's configured prompt (or the built-in
//! default), then the workspace skill catalogue.

use crate::skills::Skill;

use std::fmt::Write;

const DEFAULT_PROMPT: &str = "You are a helpful assistant reachable over several \
messaging channels. Be concise; chat messages are read on small screens. Use \
the available tools when they get the job done better than prose.";

pub struct PromptParams<'a> {
    /// The agent's configured prompt; `None` falls back to the default.
    pub agent_prompt: Option<&'a str>,
    pub skills: &'a [Skill],
    /// Prepended context, e.g. the background-task briefing or the
    /// scheduled-task delivery contract.
    pub extra: Option<&'a str>,
}

pub fn compose_system_prompt(params: &PromptParams<'_>) -> String {
    let mut prompt = String::new();

    if let Some(extra) = params.extra.map(str::trim).filter(|e| !e.is_empty()) {
        prompt.push_str(extra);
        prompt.push_str("\n\n");
    }

    prompt.push_str(
        params
            .agent_prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PROMPT),
    );

    if !params.skills.is_empty() {
        prompt.push_str("\n\n## Available Skills\n\n<available_skills>\n");
        for skill in params.skills {
            let _ = writeln!(
                prompt,
                "  <skill>\n    <name>{}</name>\n    <description>{}</description>\n    <location>{}</location>\n  </skill>",
                skill.name,
                skill.description,
                skill.location.display()
            );
        }
        prompt.push_str("</available_skills>");
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn skill(name: &str) -> Skill {
        Skill {
            name: name.into(),
            description: format!("{name} things"),
            location: PathBuf::from(format!("/ws/skills/{name}/SKILL.md")),
        }
    }

    #[test]
    fn default_prompt_when_agent_has_none() {
        let prompt = compose_system_prompt(&PromptParams {
            agent_prompt: None,
            skills: &[],
            extra: None,
        });
        assert!(prompt.contains("helpful assistant"));
        assert!(!prompt.contains("available_skills"));
    }

    #[test]
    fn agent_prompt_replaces_the_default() {
        let prompt = compose_system_prompt(&PromptParams {
            agent_prompt: Some("You are a pirate."),
            skills: &[],
            extra: None,
        });
        assert!(prompt.contains("pirate"));
        assert!(!prompt.contains("helpful assistant"));
    }

    #[test]
    fn extra_context_is_prepended() {
        let prompt = compose_system_prompt(&PromptParams {
            agent_prompt: Some("Base."),
            skills: &[],
            extra: Some("Scheduled-task contract."),
        });
        let extra_pos = prompt.find("Scheduled-task contract.").unwrap();
        let base_pos = prompt.find("Base.").unwrap();
        assert!(extra_pos < base_pos);
    }

    #[test]
    fn skills_render_as_xml_catalogue() {
        let skills = vec![skill("summarize"), skill("translate")];
        let prompt = compose_system_prompt(&PromptParams {
            agent_prompt: None,
            skills: &skills,
            extra: None,
        });
        assert!(prompt.contains("<available_skills>"));
        assert!(prompt.contains("<name>summarize</name>"));
        assert!(prompt.contains("<location>/ws/skills/translate/SKILL.md</location>"));
        assert!(prompt.contains("</available_skills>"));
    }
}
