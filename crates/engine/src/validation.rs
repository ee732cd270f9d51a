//! Validation layer - pre- and post-inference consistency checks
//!
//! Pure functions over the state snapshot. Pre-validation rejects impossible
//! intents before the narrator is ever called; post-validation scans
//! generated text for entities the scene cannot contain. Match lists are
//! derived from the snapshot, never hardcoded.

use taleweaver_domain::{Actor, Intent, IntentKind};

use crate::rules::word_match;
use crate::world::WorldState;

/// Why an intent was rejected before inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// The player does not hold the named item
    MissingItem { name: String },
    /// The player's abilities do not include the named one
    MissingAbility { name: String },
    /// The named target is not present in the player's setting
    TargetNotPresent { name: String },
    /// The named destination does not connect to the player's setting
    Unreachable { name: String },
}

/// Result of pre-validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(InvalidReason),
}

/// A forbidden token found in generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub token: String,
    pub reason: &'static str,
}

/// Check a structured intent against the snapshot before inference.
pub fn pre_validate(intent: &Intent, state: &WorldState) -> Verdict {
    let Some(player) = state.player_actor() else {
        return Verdict::Valid;
    };

    match intent.kind {
        IntentKind::UseItem => {
            let Some(target) = &intent.target else {
                return Verdict::Valid;
            };
            if holds_item(player, state, target) {
                Verdict::Valid
            } else {
                Verdict::Invalid(InvalidReason::MissingItem {
                    name: target.clone(),
                })
            }
        }
        IntentKind::Attack | IntentKind::Talk => {
            // An attack method naming a known ability must be one the
            // player's class actually grants.
            if intent.kind == IntentKind::Attack {
                if let Some(method) = &intent.method {
                    let known_somewhere = state
                        .actors()
                        .any(|a| a.abilities().iter().any(|ab| ab.eq_ignore_ascii_case(method)));
                    let player_has = player
                        .abilities()
                        .iter()
                        .any(|ab| ab.eq_ignore_ascii_case(method));
                    if known_somewhere && !player_has {
                        return Verdict::Invalid(InvalidReason::MissingAbility {
                            name: method.clone(),
                        });
                    }
                }
            }
            let Some(target) = &intent.target else {
                return Verdict::Valid;
            };
            if target_present(state, target) {
                Verdict::Valid
            } else {
                Verdict::Invalid(InvalidReason::TargetNotPresent {
                    name: target.clone(),
                })
            }
        }
        IntentKind::Move => {
            let Some(target) = &intent.target else {
                return Verdict::Valid;
            };
            if destination_reachable(state, target) {
                Verdict::Valid
            } else {
                Verdict::Invalid(InvalidReason::Unreachable {
                    name: target.clone(),
                })
            }
        }
        IntentKind::Examine | IntentKind::Other => Verdict::Valid,
    }
}

/// Templated failure narration for a rejected intent; the narrator is not
/// called at all.
pub fn failure_narration(reason: &InvalidReason) -> String {
    match reason {
        InvalidReason::MissingItem { name } => {
            format!("You reach for the {name}, but you are not carrying it.")
        }
        InvalidReason::MissingAbility { name } => {
            format!("You strain, but {name} is beyond your training.")
        }
        InvalidReason::TargetNotPresent { name } => {
            format!("You look around, but {name} is nowhere to be seen.")
        }
        InvalidReason::Unreachable { name } => {
            format!("There is no way to reach {name} from here.")
        }
    }
}

/// Scan generated text for entities the player cannot have or see.
///
/// Forbidden lists are derived from the snapshot: items in the catalog the
/// player does not hold, and actors not present in the player's setting.
/// Matching is word-bounded and case-insensitive.
pub fn post_validate(output: &str, state: &WorldState) -> Vec<Violation> {
    let mut violations = Vec::new();
    let Some(player) = state.player_actor() else {
        return violations;
    };
    let player_setting = player.current_setting();

    for item in state.items() {
        if holds_item(player, state, item.name()) {
            continue;
        }
        // Items lying in the current setting are fair game for narration.
        let in_setting = player_setting
            .and_then(|key| state.get_setting(key))
            .map(|s| s.items().contains(item.key()))
            .unwrap_or(false);
        if in_setting {
            continue;
        }
        if word_match(output, item.name()) {
            violations.push(Violation {
                token: item.name().to_string(),
                reason: "item not held by the player",
            });
        }
    }

    for actor in state.actors() {
        if actor.key() == state.player() {
            continue;
        }
        if actor.current_setting() == player_setting && player_setting.is_some() {
            continue;
        }
        if word_match(output, actor.name()) {
            violations.push(Violation {
                token: actor.name().to_string(),
                reason: "actor not present in the setting",
            });
        }
    }

    violations
}

/// Constraint addendum appended to the system context for the single
/// post-validation retry.
pub fn constraint_addendum(violations: &[Violation]) -> String {
    let tokens: Vec<&str> = violations.iter().map(|v| v.token.as_str()).collect();
    format!(
        "Strict constraint: do not mention or use the following, which are not \
         present in this scene: {}.",
        tokens.join(", ")
    )
}

fn holds_item(player: &Actor, state: &WorldState, name: &str) -> bool {
    let needle = name.to_lowercase();
    player.inventory().iter().any(|entry| {
        state
            .get_item(&entry.item)
            .map(|item| item.name().to_lowercase().contains(&needle) && entry.quantity > 0)
            .unwrap_or(false)
    })
}

fn target_present(state: &WorldState, target: &str) -> bool {
    let Some(setting) = state.player_setting() else {
        return false;
    };
    state
        .actors_in(setting)
        .iter()
        .filter_map(|key| state.get_actor(key))
        .any(|actor| {
            actor.key() != state.player()
                && (actor.name().eq_ignore_ascii_case(target)
                    || actor.key().as_str().eq_ignore_ascii_case(target))
        })
}

fn destination_reachable(state: &WorldState, target: &str) -> bool {
    let Some(setting_key) = state.player_setting() else {
        return false;
    };
    let Some(setting) = state.get_setting(setting_key) else {
        return false;
    };
    setting.connections().keys().any(|neighbor| {
        neighbor.as_str().eq_ignore_ascii_case(target)
            || state
                .get_setting(neighbor)
                .map(|s| s.name().eq_ignore_ascii_case(target))
                .unwrap_or(false)
    })
}
