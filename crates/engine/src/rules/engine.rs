//! Rule engine - applies evaluator output to the world
//!
//! Owns the priority-sorted rule table and the executed-once fingerprints.
//! A phase run evaluates eligible rules against one snapshot, then executes
//! the accumulated action plan sequentially against the store. Each rule's
//! mutations form one change set: a missing key rejects that rule's
//! mutations and the run moves on to the next rule.

use std::collections::BTreeSet;

use taleweaver_domain::{
    Action, PromptPosition, Rule, RuleFrequency, RuleId, Timer, TimerKey,
};

use crate::rules::evaluator::{evaluate_rule, ClassifiedTags};
use crate::world::{Change, ChangeSet, WorldStore};

/// Which part of the turn a phase run belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPhase {
    Pre,
    Post,
    Timer,
}

/// Which speaker class the phase is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerClass {
    Narrator,
    Npc,
}

/// Everything a phase run hands back to the pipeline.
#[derive(Debug, Default, Clone)]
pub struct PhaseOutput {
    /// System-context text accumulated for position=first
    pub prompt_mods_first: Vec<String>,
    /// System-context text accumulated for position=last
    pub prompt_mods_last: Vec<String>,
    /// Messages to show the player
    pub display_messages: Vec<String>,
    /// Replacement for the next generated response, if requested
    pub override_response: Option<String>,
    /// Opaque effect strings for the external sink
    pub effects: Vec<String>,
    /// Store keys touched by applied change sets
    pub changed_keys: Vec<String>,
    /// Timers to start
    pub timer_starts: Vec<Timer>,
    /// Timers to cancel
    pub timer_cancels: Vec<(RuleId, TimerKey)>,
    /// Rules whose condition held this run
    pub fired_rules: Vec<RuleId>,
}

/// Maximum trigger-rule chaining depth inside one phase.
const MAX_TRIGGER_DEPTH: usize = 4;

/// Holds the rule table for one tab.
pub struct RuleEngine {
    /// Sorted by priority descending, stable on insertion order
    rules: Vec<Rule>,
    /// Ids of frequency=once rules that have fired, persisted per tab
    fired_once: BTreeSet<RuleId>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        let mut engine = Self {
            rules: Vec::new(),
            fired_once: BTreeSet::new(),
        };
        for rule in rules {
            engine.add_rule(rule);
        }
        engine
    }

    /// Insert keeping priority order (higher first, stable within equal).
    pub fn add_rule(&mut self, rule: Rule) {
        let pos = self
            .rules
            .iter()
            .position(|r| r.priority() < rule.priority())
            .unwrap_or(self.rules.len());
        self.rules.insert(pos, rule);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: &RuleId) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id() == id)
    }

    pub fn fired_once(&self) -> &BTreeSet<RuleId> {
        &self.fired_once
    }

    /// Restore fingerprints from a loaded gamestate.
    pub fn set_fired_once(&mut self, fired: BTreeSet<RuleId>) {
        self.fired_once = fired;
    }

    /// Distinct text-tag allow-lists among rules eligible for this phase.
    /// The pipeline classifies these up front (one call each) so evaluation
    /// itself stays pure.
    pub fn pending_tag_lists(
        &self,
        phase: TriggerPhase,
        speaker: SpeakerClass,
        dispatched: Option<&RuleId>,
    ) -> Vec<Vec<String>> {
        let mut seen = BTreeSet::new();
        let mut lists = Vec::new();
        for rule in self.eligible(phase, speaker, dispatched) {
            collect_tag_lists(rule.condition(), &mut seen, &mut lists);
        }
        lists
    }

    fn eligible<'a>(
        &'a self,
        phase: TriggerPhase,
        speaker: SpeakerClass,
        dispatched: Option<&'a RuleId>,
    ) -> impl Iterator<Item = &'a Rule> {
        let fired_once = &self.fired_once;
        self.rules.iter().filter(move |rule| {
            if !rule.enabled() || rule.is_quarantined() {
                return false;
            }
            let scope_ok = match speaker {
                SpeakerClass::Narrator => rule.scope().applies_to_narrator(),
                SpeakerClass::Npc => rule.scope().applies_to_npc(),
            };
            if !scope_ok {
                return false;
            }
            match (phase, rule.frequency()) {
                (TriggerPhase::Timer, _) => dispatched == Some(rule.id()),
                (_, RuleFrequency::Timer) => false,
                (_, RuleFrequency::Once) => !fired_once.contains(rule.id()),
                (_, RuleFrequency::PerTurn) => true,
            }
        })
    }

    /// Run one phase: evaluate eligible rules against a snapshot taken at
    /// entry, then execute the action plan sequentially.
    pub fn run_phase(
        &mut self,
        store: &mut WorldStore,
        phase: TriggerPhase,
        speaker: SpeakerClass,
        text_target: Option<&str>,
        tags: &ClassifiedTags,
        dispatched: Option<&RuleId>,
    ) -> PhaseOutput {
        let snapshot = store.snapshot();

        // Evaluation pass: build the ordered action plan.
        let mut plan: Vec<(RuleId, Vec<Action>)> = Vec::new();
        let mut visited: BTreeSet<RuleId> = BTreeSet::new();
        let eligible: Vec<&Rule> = self.eligible(phase, speaker, dispatched).collect();
        for rule in eligible {
            self.plan_rule(rule, &snapshot, text_target, tags, &mut plan, &mut visited, 0);
        }

        // Record executed-once fingerprints.
        let mut fired = Vec::new();
        for (id, _) in &plan {
            fired.push(id.clone());
            if let Some(rule) = self.get(id) {
                if rule.frequency() == RuleFrequency::Once {
                    self.fired_once.insert(id.clone());
                }
            }
        }

        // Execution pass: one change set per fired rule, applied in order.
        let mut output = PhaseOutput {
            fired_rules: fired,
            ..PhaseOutput::default()
        };
        for (id, actions) in plan {
            self.execute_rule_actions(store, &id, &actions, &mut output);
        }
        output
    }

    /// Evaluate one rule and, when it fires, append its plan entry followed
    /// by any trigger-rule chaining.
    fn plan_rule(
        &self,
        rule: &Rule,
        snapshot: &crate::world::StateView,
        text_target: Option<&str>,
        tags: &ClassifiedTags,
        plan: &mut Vec<(RuleId, Vec<Action>)>,
        visited: &mut BTreeSet<RuleId>,
        depth: usize,
    ) {
        if depth > MAX_TRIGGER_DEPTH || !visited.insert(rule.id().clone()) {
            return;
        }
        let Some(actions) = evaluate_rule(rule, snapshot, text_target, tags) else {
            return;
        };
        tracing::debug!(rule = %rule.id(), "rule fired");
        plan.push((rule.id().clone(), actions.clone()));

        for action in &actions {
            if let Action::TriggerRule { rule: target_id } = action {
                match self.get(target_id) {
                    Some(target)
                        if target.enabled()
                            && !(target.frequency() == RuleFrequency::Once
                                && self.fired_once.contains(target_id)) =>
                    {
                        self.plan_rule(
                            target,
                            snapshot,
                            text_target,
                            tags,
                            plan,
                            visited,
                            depth + 1,
                        );
                    }
                    Some(_) => {}
                    None => {
                        // Referenced rule is missing: fail that trigger closed
                        tracing::warn!(rule = %rule.id(), target = %target_id, "trigger-rule target missing");
                    }
                }
            }
        }
    }

    fn execute_rule_actions(
        &self,
        store: &mut WorldStore,
        rule_id: &RuleId,
        actions: &[Action],
        output: &mut PhaseOutput,
    ) {
        let mut change_set = ChangeSet::new();
        for action in actions {
            match action {
                Action::SetVariable { name, value } => change_set.push(Change::SetVariable {
                    name: name.clone(),
                    value: value.clone(),
                }),
                Action::ModifyVariable { name, op, amount } => {
                    change_set.push(Change::ModifyVariable {
                        name: name.clone(),
                        op: *op,
                        amount: *amount,
                    })
                }
                Action::MoveActor { actor, to } => change_set.push(Change::MoveActor {
                    actor: actor.clone(),
                    to: to.clone(),
                }),
                Action::GiveItem {
                    actor,
                    item,
                    quantity,
                } => change_set.push(Change::GiveItem {
                    actor: actor.clone(),
                    item: item.clone(),
                    quantity: *quantity,
                }),
                Action::RemoveItem {
                    actor,
                    item,
                    quantity,
                } => change_set.push(Change::RemoveItem {
                    actor: actor.clone(),
                    item: item.clone(),
                    quantity: *quantity,
                }),
                Action::SetScene { scene } => change_set.push(Change::SetScene { scene: *scene }),
                Action::EndScene => change_set.push(Change::EndScene),

                Action::StartTimer {
                    rule,
                    key,
                    interval_ms,
                    periodic,
                    jitter,
                    clock,
                } => {
                    let mut timer = if *periodic {
                        Timer::periodic(rule.clone(), key.clone(), *interval_ms)
                    } else {
                        Timer::one_shot(rule.clone(), key.clone(), *interval_ms)
                    };
                    if *jitter {
                        timer = timer.with_jitter();
                    }
                    timer.clock = *clock;
                    output.timer_starts.push(timer);
                }
                Action::CancelTimer { rule, key } => {
                    output.timer_cancels.push((rule.clone(), key.clone()));
                }

                Action::AppendSystemMessage { position, text } => match position {
                    PromptPosition::First => output.prompt_mods_first.push(text.clone()),
                    PromptPosition::Last => output.prompt_mods_last.push(text.clone()),
                },
                Action::OverrideResponse { text } => {
                    output.override_response = Some(text.clone());
                }
                Action::DisplayMessage { text } => output.display_messages.push(text.clone()),
                Action::PlayEffect { effect } => output.effects.push(effect.clone()),

                // Chaining handled during planning; nothing to execute here.
                Action::TriggerRule { .. } => {}
                // Quarantined rules are filtered before planning.
                Action::Unsupported { kind } => {
                    tracing::warn!(rule = %rule_id, kind, "skipping unsupported action");
                }
            }
        }

        // Rule-level system-message modification applies when the rule fires.
        if let Some(rule) = self.get(rule_id) {
            if let Some(mod_) = rule.system_message() {
                match mod_.position {
                    PromptPosition::First => output.prompt_mods_first.push(mod_.text.clone()),
                    PromptPosition::Last => output.prompt_mods_last.push(mod_.text.clone()),
                }
            }
        }

        if change_set.is_empty() {
            return;
        }
        match store.apply(&change_set) {
            Ok(applied) => output.changed_keys.extend(applied.keys),
            Err(e) => {
                // Fail this rule closed; remaining rules proceed.
                tracing::warn!(rule = %rule_id, error = %e, "change set rejected");
            }
        }
    }
}

fn collect_tag_lists(
    tree: &taleweaver_domain::ConditionTree,
    seen: &mut BTreeSet<String>,
    lists: &mut Vec<Vec<String>>,
) {
    use taleweaver_domain::ConditionTree as Tree;
    match tree {
        Tree::All { children } | Tree::Any { children } => {
            for child in children {
                collect_tag_lists(child, seen, lists);
            }
        }
        Tree::Not { child } => collect_tag_lists(child, seen, lists),
        Tree::Atom { condition } => {
            if let taleweaver_domain::Condition::TextTag { allowed, .. } = condition {
                let key = crate::rules::evaluator::tag_key(allowed);
                if seen.insert(key) {
                    lists.push(allowed.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{WorldState, WorldStore};
    use taleweaver_domain::{
        Actor, ActorKey, CompareOp, Condition, ConditionTree, Setting, SettingKey, VarValue,
    };

    fn store() -> WorldStore {
        let mut store = WorldStore::new(WorldState::new(ActorKey::new("rowan")));
        store.insert_setting(Setting::new("haunted_mansion", "The Haunted Mansion"));
        store.insert_actor(Actor::new("rowan", "Rowan").with_setting("haunted_mansion"));
        store.insert_actor(Actor::new("ghost", "The Ghost"));
        store
    }

    fn always() -> ConditionTree {
        ConditionTree::all(vec![])
    }

    fn no_tags() -> ClassifiedTags {
        ClassifiedTags::new()
    }

    #[test]
    fn test_priority_order_is_descending_and_stable() {
        let engine = RuleEngine::new(vec![
            Rule::new("low", "Low", always()).with_priority(1),
            Rule::new("high", "High", always()).with_priority(10),
            Rule::new("also_high", "Also high", always()).with_priority(10),
        ]);
        let ids: Vec<&str> = engine.rules().iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["high", "also_high", "low"]);
    }

    #[test]
    fn test_once_rule_fires_exactly_once() {
        let mut store = store();
        let mut engine = RuleEngine::new(vec![Rule::new("greet", "Greet", always())
            .with_frequency(RuleFrequency::Once)
            .with_actions(vec![Action::DisplayMessage {
                text: "hello".into(),
            }])]);

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        assert_eq!(out.display_messages, vec!["hello".to_string()]);

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        assert!(out.display_messages.is_empty());
        assert!(engine.fired_once().contains(&RuleId::new("greet")));
    }

    #[test]
    fn test_missing_key_fails_single_rule_closed() {
        let mut store = store();
        let mut engine = RuleEngine::new(vec![
            Rule::new("bad", "Bad", always())
                .with_priority(5)
                .with_actions(vec![Action::MoveActor {
                    actor: ActorKey::new("nobody"),
                    to: SettingKey::new("haunted_mansion"),
                }]),
            Rule::new("good", "Good", always()).with_actions(vec![Action::SetVariable {
                name: "ran".into(),
                value: VarValue::Bool(true),
            }]),
        ]);

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        // Both fired; the bad one's mutations were rejected wholesale.
        assert_eq!(out.fired_rules.len(), 2);
        assert_eq!(
            store.state().get_variable("ran"),
            Some(&VarValue::Bool(true))
        );
        assert!(store
            .state()
            .get_actor(&ActorKey::new("nobody"))
            .is_none());
    }

    #[test]
    fn test_scope_filtering() {
        let mut store = store();
        let mut engine = RuleEngine::new(vec![Rule::new("npc_only", "NPC only", always())
            .with_scope(taleweaver_domain::RuleScope::Npc)
            .with_actions(vec![Action::DisplayMessage { text: "x".into() }])]);

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        assert!(out.display_messages.is_empty());

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Npc,
            None,
            &no_tags(),
            None,
        );
        assert_eq!(out.display_messages.len(), 1);
    }

    #[test]
    fn test_timer_rules_only_run_when_dispatched() {
        let mut store = store();
        let mut engine = RuleEngine::new(vec![Rule::new("tick", "Tick", always())
            .with_frequency(RuleFrequency::Timer)
            .with_actions(vec![Action::DisplayMessage { text: "tick".into() }])]);

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        assert!(out.display_messages.is_empty());

        let id = RuleId::new("tick");
        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Timer,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            Some(&id),
        );
        assert_eq!(out.display_messages, vec!["tick".to_string()]);
    }

    #[test]
    fn test_prompt_mods_accumulate_by_position() {
        let mut store = store();
        let mut engine = RuleEngine::new(vec![
            Rule::new("first_mod", "First", always()).with_actions(vec![
                Action::AppendSystemMessage {
                    position: PromptPosition::First,
                    text: "Keep it eerie.".into(),
                },
            ]),
            Rule::new("last_mod", "Last", always()).with_system_message(
                PromptPosition::Last,
                "Never mention the attic.",
            ),
        ]);

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        assert_eq!(out.prompt_mods_first, vec!["Keep it eerie.".to_string()]);
        assert_eq!(
            out.prompt_mods_last,
            vec!["Never mention the attic.".to_string()]
        );
    }

    #[test]
    fn test_trigger_rule_chaining_with_cycle_guard() {
        let mut store = store();
        let mut engine = RuleEngine::new(vec![
            Rule::new("a", "A", always()).with_actions(vec![
                Action::TriggerRule {
                    rule: RuleId::new("b"),
                },
                Action::SetVariable {
                    name: "a_ran".into(),
                    value: VarValue::Bool(true),
                },
            ]),
            // b triggers a back: the visited set stops the cycle.
            Rule::new("b", "B", always())
                .with_enabled(true)
                .with_priority(-1)
                .with_actions(vec![
                    Action::TriggerRule {
                        rule: RuleId::new("a"),
                    },
                    Action::SetVariable {
                        name: "b_ran".into(),
                        value: VarValue::Bool(true),
                    },
                ]),
        ]);

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        assert_eq!(out.fired_rules.len(), 2);
        assert_eq!(
            store.state().get_variable("a_ran"),
            Some(&VarValue::Bool(true))
        );
        assert_eq!(
            store.state().get_variable("b_ran"),
            Some(&VarValue::Bool(true))
        );
    }

    #[test]
    fn test_snapshot_semantics_within_phase() {
        // Both rules see the snapshot taken before the phase; the first
        // rule's mutation is invisible to the second rule's condition.
        let mut store = store();
        let mut engine = RuleEngine::new(vec![
            Rule::new("sets", "Sets flag", always())
                .with_priority(10)
                .with_actions(vec![Action::SetVariable {
                    name: "flag".into(),
                    value: VarValue::Bool(true),
                }]),
            Rule::new(
                "reads",
                "Reads flag",
                ConditionTree::atom(Condition::VariableCompare {
                    name: "flag".into(),
                    op: CompareOp::Eq,
                    value: VarValue::Bool(true),
                }),
            )
            .with_actions(vec![Action::DisplayMessage {
                text: "saw it".into(),
            }]),
        ]);

        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        assert!(out.display_messages.is_empty());

        // Next phase observes the committed mutation.
        let out = engine.run_phase(
            &mut store,
            TriggerPhase::Post,
            SpeakerClass::Narrator,
            None,
            &no_tags(),
            None,
        );
        assert_eq!(out.display_messages, vec!["saw it".to_string()]);
    }
}
