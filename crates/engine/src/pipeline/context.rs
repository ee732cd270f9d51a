//! Prompt context composition and response post-processing.

use taleweaver_domain::{Actor, Role, TurnRecord};

use crate::llm::ChatMessage;
use crate::lore::{matching_lore, LoreEntry};
use crate::world::WorldState;

/// How many trailing visible entries feed the keyword-lore haystack.
const LORE_SCAN_TAIL: usize = 10;

/// Inputs for one context composition.
pub struct ContextInputs<'a> {
    pub state: &'a WorldState,
    /// Authored system context for the tab
    pub system_context: &'a str,
    /// PromptMods accumulated for position=first
    pub mods_first: &'a [String],
    /// PromptMods accumulated for position=last
    pub mods_last: &'a [String],
    /// Authored lore table
    pub lore: &'a [LoreEntry],
    /// Visible conversation tail, current scene only, already filtered
    pub visible_tail: Vec<&'a TurnRecord>,
    /// The speaking NPC; None composes for the narrator
    pub npc: Option<&'a Actor>,
}

/// Compose the ordered message list for one inference call.
///
/// Order: system context with first-position mods, NPC persona and memory
/// excerpts (NPC calls only), the player's setting description, triggered
/// lore snippets, the visible conversation tail, then last-position mods.
pub fn compose_context(inputs: &ContextInputs<'_>) -> Vec<ChatMessage> {
    let mut system = String::new();
    system.push_str(inputs.system_context);
    for mod_text in inputs.mods_first {
        system.push_str("\n\n");
        system.push_str(mod_text);
    }

    if let Some(npc) = inputs.npc {
        system.push_str(&format!("\n\nYou are {}.", npc.name()));
        push_trait_block(&mut system, "Description", npc.description());
        push_trait_block(&mut system, "Personality", npc.personality());
        push_trait_block(&mut system, "Appearance", npc.appearance());
        if !npc.notes().is_empty() {
            system.push_str("\n\nYour recent notes:");
            for note in npc.notes().iter().rev().take(10).rev() {
                system.push_str("\n- ");
                system.push_str(note);
            }
        }
    }

    let viewer_setting = match inputs.npc {
        Some(npc) => npc.current_setting(),
        None => inputs.state.player_setting(),
    };
    if let Some(setting) = viewer_setting.and_then(|key| inputs.state.get_setting(key)) {
        system.push_str(&format!(
            "\n\nCurrent setting: {}. {}",
            setting.name(),
            setting.description()
        ));
    }

    // Keyword lore triggered by the recent visible tail or the setting.
    let mut haystack: String = inputs
        .visible_tail
        .iter()
        .rev()
        .take(LORE_SCAN_TAIL)
        .rev()
        .map(|e| e.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if let Some(setting) = viewer_setting.and_then(|key| inputs.state.get_setting(key)) {
        haystack.push('\n');
        haystack.push_str(setting.name());
        haystack.push('\n');
        haystack.push_str(setting.description());
    }
    let triggered = matching_lore(inputs.lore, &haystack);
    if !triggered.is_empty() {
        system.push_str("\n\nLore:");
        for entry in triggered {
            system.push_str("\n- ");
            system.push_str(&entry.text);
        }
    }

    let mut messages = vec![ChatMessage::system(system)];
    for record in &inputs.visible_tail {
        messages.push(tail_message(record, inputs.state));
    }
    for mod_text in inputs.mods_last {
        messages.push(ChatMessage::system(mod_text.clone()));
    }
    messages
}

fn push_trait_block(system: &mut String, label: &str, traits: &[String]) {
    if !traits.is_empty() {
        system.push_str(&format!("\n{label}: {}", traits.join("; ")));
    }
}

fn tail_message(record: &TurnRecord, state: &WorldState) -> ChatMessage {
    match record.role {
        Role::Player => {
            let name = state
                .player_actor()
                .map(|a| a.name().to_string())
                .unwrap_or_else(|| "Player".to_string());
            ChatMessage::user(format!("{name}: {}", record.content))
        }
        Role::Narrator => ChatMessage::assistant(record.content.clone()),
        Role::Npc => {
            let name = record
                .speaker
                .as_ref()
                .and_then(|key| state.get_actor(key))
                .map(|a| a.name().to_string())
                .unwrap_or_else(|| "Someone".to_string());
            ChatMessage::assistant(format!("{name}: {}", record.content))
        }
        Role::System => ChatMessage::system(record.content.clone()),
    }
}

/// Strip a leading `SpeakerName:` prefix when it names the expected speaker.
pub fn strip_speaker_prefix(text: &str, speaker_names: &[&str]) -> String {
    let trimmed = text.trim_start();
    for name in speaker_names {
        let prefix = format!("{name}:");
        if let Some(head) = trimmed.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(&prefix) {
                return trimmed[prefix.len()..].trim_start().to_string();
            }
        }
    }
    text.to_string()
}

/// Remove `<think>...</think>` blocks emitted by reasoning models.
pub fn strip_think_blocks(text: &str) -> String {
    let mut out = text.to_string();
    loop {
        let Some(open) = out.find("<think>") else {
            break;
        };
        match out[open..].find("</think>") {
            Some(rel_close) => {
                let close = open + rel_close + "</think>".len();
                out.replace_range(open..close, "");
            }
            None => {
                // Unterminated block: drop the rest
                out.truncate(open);
                break;
            }
        }
    }
    out.trim().to_string()
}
