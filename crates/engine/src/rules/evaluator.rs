//! Pure rule evaluation against a state snapshot
//!
//! Everything here is a deterministic function of its inputs. The only
//! nondeterminism in the rule system - LLM tag classification - happens
//! before evaluation; its results arrive through `ClassifiedTags`.

use std::collections::BTreeMap;

use regex_lite::Regex;

use taleweaver_domain::{Action, CompareOp, Condition, ConditionTree, Rule, VarValue};

use crate::world::{substitute, WorldState};

/// Resolved tag classifications keyed by `tag_key` of the allow-list.
/// `None` means the classifier produced no recognized tag (or timed out).
pub type ClassifiedTags = BTreeMap<String, Option<String>>;

/// Canonical lookup key for one allow-list.
pub fn tag_key(allowed: &[String]) -> String {
    let mut sorted: Vec<String> = allowed.iter().map(|t| t.to_lowercase()).collect();
    sorted.sort();
    sorted.join("|")
}

/// Evaluate a rule. Returns the substituted action list when the condition
/// tree holds, None otherwise. Quarantined rules never fire.
pub fn evaluate_rule(
    rule: &Rule,
    state: &WorldState,
    text_target: Option<&str>,
    tags: &ClassifiedTags,
) -> Option<Vec<Action>> {
    if rule.is_quarantined() {
        return None;
    }
    if !evaluate_tree(rule.condition(), state, text_target, tags) {
        return None;
    }
    Some(
        rule.actions()
            .iter()
            .map(|action| substitute_action(action, state))
            .collect(),
    )
}

/// Evaluate a condition tree. Compound nodes short-circuit; an empty child
/// list is true.
pub fn evaluate_tree(
    tree: &ConditionTree,
    state: &WorldState,
    text_target: Option<&str>,
    tags: &ClassifiedTags,
) -> bool {
    match tree {
        ConditionTree::All { children } => children
            .iter()
            .all(|c| evaluate_tree(c, state, text_target, tags)),
        ConditionTree::Any { children } => {
            children.is_empty()
                || children
                    .iter()
                    .any(|c| evaluate_tree(c, state, text_target, tags))
        }
        ConditionTree::Not { child } => !evaluate_tree(child, state, text_target, tags),
        ConditionTree::Atom { condition } => evaluate_condition(condition, state, text_target, tags),
    }
}

fn evaluate_condition(
    condition: &Condition,
    state: &WorldState,
    text_target: Option<&str>,
    tags: &ClassifiedTags,
) -> bool {
    match condition {
        Condition::VariableCompare { name, op, value } => {
            // Missing variables compare as the default of the declared type.
            let current = state
                .get_variable(name)
                .cloned()
                .unwrap_or_else(|| value.type_default());
            current.compare(*op, value)
        }

        Condition::ActorInSetting { actor, setting } => state
            .get_actor(actor)
            .map(|a| a.current_setting() == Some(setting))
            .unwrap_or(false),

        Condition::ItemInInventory {
            actor,
            item_name,
            min_quantity,
        } => {
            let Some(actor) = state.get_actor(actor) else {
                return false;
            };
            let needle = item_name.to_lowercase();
            let held: u32 = actor
                .inventory()
                .iter()
                .filter(|entry| {
                    state
                        .get_item(&entry.item)
                        .map(|item| item.name().to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
                .map(|entry| entry.quantity)
                .sum();
            held >= min_quantity.unwrap_or(1)
        }

        Condition::TimeInWindow { window } => window.contains(state.clock().minute_of_day()),

        Condition::TextTag { allowed, expected } => tags
            .get(&tag_key(allowed))
            .and_then(|resolved| resolved.as_deref())
            .map(|tag| tag.eq_ignore_ascii_case(expected))
            .unwrap_or(false),

        Condition::Keyword { keywords } => {
            let Some(target) = text_target else {
                return false;
            };
            keywords.iter().any(|kw| word_match(target, kw))
        }

        Condition::SceneCompare { op, value } => {
            VarValue::Number(state.scene_number() as f64)
                .compare(*op, &VarValue::Number(*value as f64))
        }

        Condition::TurnCompare { op, value } => VarValue::Number(state.turn_count() as f64)
            .compare(*op, &VarValue::Number(*value as f64)),

        Condition::Unsupported { kind } => {
            tracing::warn!(kind, "unsupported condition type evaluated, failing closed");
            false
        }
    }
}

/// Whole-word, case-insensitive match.
pub(crate) fn word_match(haystack: &str, word: &str) -> bool {
    let escaped = escape_regex(word.trim());
    if escaped.is_empty() {
        return false;
    }
    match Regex::new(&format!(r"(?i)\b{escaped}\b")) {
        Ok(re) => re.is_match(haystack),
        Err(_) => false,
    }
}

fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == ' ' {
            out.push(c);
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

/// Substitute `{name}` placeholders in the text-bearing fields of an action.
fn substitute_action(action: &Action, state: &WorldState) -> Action {
    match action {
        Action::SetVariable {
            name,
            value: VarValue::Text(text),
        } => Action::SetVariable {
            name: name.clone(),
            value: VarValue::Text(substitute(text, state)),
        },
        Action::AppendSystemMessage { position, text } => Action::AppendSystemMessage {
            position: *position,
            text: substitute(text, state),
        },
        Action::OverrideResponse { text } => Action::OverrideResponse {
            text: substitute(text, state),
        },
        Action::DisplayMessage { text } => Action::DisplayMessage {
            text: substitute(text, state),
        },
        Action::PlayEffect { effect } => Action::PlayEffect {
            effect: substitute(effect, state),
        },
        other => other.clone(),
    }
}
