//! `{name}` placeholder substitution against world state
//!
//! Resolves variables plus a few derived bindings (player name, current
//! setting name, game clock). Unresolved placeholders stay literal. Values
//! may themselves contain placeholders; expansion recurses to depth 8, which
//! truncates circular references.

use super::store::WorldState;

const MAX_DEPTH: usize = 8;

/// Expand `{name}` placeholders in a template.
pub fn substitute(template: &str, state: &WorldState) -> String {
    substitute_depth(template, state, 0)
}

fn substitute_depth(template: &str, state: &WorldState, depth: usize) -> String {
    if depth >= MAX_DEPTH || !template.contains('{') {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut resolved_any = false;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let name = &after_open[..close];
                match resolve(name, state) {
                    Some(value) => {
                        out.push_str(&value);
                        resolved_any = true;
                    }
                    None => {
                        // Unknown placeholder stays literal
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                // Unbalanced brace; emit the remainder untouched
                out.push_str(&rest[open..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);

    if resolved_any && out.contains('{') {
        substitute_depth(&out, state, depth + 1)
    } else {
        out
    }
}

fn resolve(name: &str, state: &WorldState) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if let Some(value) = state.get_variable(name) {
        return Some(value.as_text());
    }
    match name {
        "player" | "player_name" => state.player_actor().map(|a| a.name().to_string()),
        "setting" | "setting_name" => state
            .player_setting()
            .and_then(|key| state.get_setting(key))
            .map(|s| s.name().to_string()),
        "time" => Some(state.clock().display_time()),
        "time_of_day" => Some(state.clock().time_of_day().to_string()),
        "turn" => Some(state.turn_count().to_string()),
        "scene" => Some(state.scene_number().to_string()),
        _ => None,
    }
}
