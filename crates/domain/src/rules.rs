//! Rule model - designer-authored condition/action records
//!
//! Rules are evaluated every turn (or on timer dispatch) against a state
//! snapshot. Conditions form a recursive tree; actions are an ordered list of
//! concrete state mutations and prompt modifications.
//!
//! Unknown condition or action types encountered while loading a rule file
//! are represented by the `Unsupported` variants; a rule carrying one never
//! fires (fail-closed) but is kept so it round-trips through saves.

use serde::{Deserialize, Serialize};

use crate::game_clock::TimeWindow;
use crate::keys::{ActorKey, ItemKey, RuleId, SettingKey};
use crate::timer::{ClockSource, TimerKey};
use crate::variables::{CompareOp, VarValue};

/// Which speakers a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Narrator,
    Npc,
    #[default]
    Both,
}

impl RuleScope {
    /// Whether a rule with this scope participates in a phase run for the
    /// given speaker class.
    pub fn applies_to_narrator(&self) -> bool {
        matches!(self, RuleScope::Narrator | RuleScope::Both)
    }

    pub fn applies_to_npc(&self) -> bool {
        matches!(self, RuleScope::Npc | RuleScope::Both)
    }
}

/// How often a rule is eligible to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFrequency {
    /// At most once per tab lifetime; the fingerprint persists across saves
    Once,
    #[default]
    PerTurn,
    /// Only when dispatched by an expired timer
    Timer,
}

/// Where an appended system message lands in the next inference context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPosition {
    First,
    Last,
}

/// A system-context modification a rule contributes when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessageMod {
    pub position: PromptPosition,
    pub text: String,
}

/// An atomic condition.
///
/// Every variant that references an entity fails closed (evaluates false)
/// when the referenced key is missing from the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Variable comparison with coercion to the variable's declared type
    VariableCompare {
        name: String,
        op: CompareOp,
        value: VarValue,
    },

    /// Exact match on an actor's current setting
    ActorInSetting { actor: ActorKey, setting: SettingKey },

    /// Case-insensitive substring match on item names in an inventory
    ItemInInventory {
        actor: ActorKey,
        item_name: String,
        #[serde(default)]
        min_quantity: Option<u32>,
    },

    /// Game clock inside a daily window (inclusive start, exclusive end)
    TimeInWindow { window: TimeWindow },

    /// An LLM classification of the text target emitted the expected tag.
    /// The classifier output is validated against `allowed`; anything else
    /// counts as "no tag" and the condition is false.
    TextTag {
        allowed: Vec<String>,
        expected: String,
    },

    /// Whole-word, case-insensitive match against the text target
    Keyword { keywords: Vec<String> },

    /// Scene counter comparison
    SceneCompare { op: CompareOp, value: u64 },

    /// Turn counter comparison
    TurnCompare { op: CompareOp, value: u64 },

    /// Placeholder for a condition type this build does not recognize.
    /// Always evaluates false.
    Unsupported { kind: String },
}

/// A recursive condition tree.
///
/// Compound nodes short-circuit; `Not` has exactly one child; an empty
/// child list evaluates true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionTree {
    All { children: Vec<ConditionTree> },
    Any { children: Vec<ConditionTree> },
    Not { child: Box<ConditionTree> },
    Atom { condition: Condition },
}

impl ConditionTree {
    pub fn all(children: Vec<ConditionTree>) -> Self {
        ConditionTree::All { children }
    }

    pub fn any(children: Vec<ConditionTree>) -> Self {
        ConditionTree::Any { children }
    }

    pub fn not(child: ConditionTree) -> Self {
        ConditionTree::Not {
            child: Box::new(child),
        }
    }

    pub fn atom(condition: Condition) -> Self {
        ConditionTree::Atom { condition }
    }

    /// Promote a flat legacy list with AND/OR logic into a tree.
    pub fn from_flat(logic: ConditionLogic, conditions: Vec<Condition>) -> Self {
        let children = conditions.into_iter().map(ConditionTree::atom).collect();
        match logic {
            ConditionLogic::And => ConditionTree::All { children },
            ConditionLogic::Or => ConditionTree::Any { children },
        }
    }

    /// True when any atom anywhere in the tree is an unsupported type.
    pub fn has_unsupported(&self) -> bool {
        match self {
            ConditionTree::All { children } | ConditionTree::Any { children } => {
                children.iter().any(|c| c.has_unsupported())
            }
            ConditionTree::Not { child } => child.has_unsupported(),
            ConditionTree::Atom { condition } => {
                matches!(condition, Condition::Unsupported { .. })
            }
        }
    }

    /// True when any atom requires an LLM classification call.
    pub fn needs_classifier(&self) -> bool {
        match self {
            ConditionTree::All { children } | ConditionTree::Any { children } => {
                children.iter().any(|c| c.needs_classifier())
            }
            ConditionTree::Not { child } => child.needs_classifier(),
            ConditionTree::Atom { condition } => matches!(condition, Condition::TextTag { .. }),
        }
    }
}

/// Combination logic for the flat rule-file condition list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionLogic {
    #[default]
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// Arithmetic applied by modify-variable actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericOp {
    Add,
    Sub,
    Mul,
}

impl NumericOp {
    pub fn apply(&self, current: f64, amount: f64) -> f64 {
        match self {
            NumericOp::Add => current + amount,
            NumericOp::Sub => current - amount,
            NumericOp::Mul => current * amount,
        }
    }
}

/// A concrete action executed when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    SetVariable {
        name: String,
        value: VarValue,
    },

    ModifyVariable {
        name: String,
        op: NumericOp,
        amount: f64,
    },

    MoveActor {
        actor: ActorKey,
        to: SettingKey,
    },

    GiveItem {
        actor: ActorKey,
        item: ItemKey,
        #[serde(default = "default_quantity")]
        quantity: u32,
    },

    RemoveItem {
        actor: ActorKey,
        item: ItemKey,
        #[serde(default = "default_quantity")]
        quantity: u32,
    },

    StartTimer {
        rule: RuleId,
        key: TimerKey,
        interval_ms: u64,
        #[serde(default)]
        periodic: bool,
        #[serde(default)]
        jitter: bool,
        #[serde(default = "default_clock_source")]
        clock: ClockSource,
    },

    CancelTimer {
        rule: RuleId,
        key: TimerKey,
    },

    /// Evaluate and, if true, execute another rule by id this phase
    TriggerRule {
        rule: RuleId,
    },

    AppendSystemMessage {
        position: PromptPosition,
        text: String,
    },

    /// Replace the next generated response outright
    OverrideResponse {
        text: String,
    },

    /// Show a message to the player (system-visible log entry)
    DisplayMessage {
        text: String,
    },

    /// Jump the scene counter forward (never backward)
    SetScene {
        scene: u64,
    },

    /// Close the current scene and open the next
    EndScene,

    /// Opaque effect string passed to the external sink
    PlayEffect {
        effect: String,
    },

    /// Placeholder for an action type this build does not recognize.
    /// A rule carrying one fails closed.
    Unsupported {
        kind: String,
    },
}

fn default_quantity() -> u32 {
    1
}

fn default_clock_source() -> ClockSource {
    ClockSource::Real
}

/// A designer-authored rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    id: RuleId,
    name: String,
    #[serde(default)]
    description: String,
    enabled: bool,
    #[serde(default)]
    scope: RuleScope,
    #[serde(default)]
    frequency: RuleFrequency,
    #[serde(default)]
    priority: i32,
    condition: ConditionTree,
    actions: Vec<Action>,
    #[serde(default)]
    system_message: Option<SystemMessageMod>,
}

impl Rule {
    pub fn new(id: impl Into<RuleId>, name: impl Into<String>, condition: ConditionTree) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            scope: RuleScope::default(),
            frequency: RuleFrequency::default(),
            priority: 0,
            condition,
            actions: Vec::new(),
            system_message: None,
        }
    }

    // Read accessors
    pub fn id(&self) -> &RuleId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn scope(&self) -> RuleScope {
        self.scope
    }

    pub fn frequency(&self) -> RuleFrequency {
        self.frequency
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn condition(&self) -> &ConditionTree {
        &self.condition
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn system_message(&self) -> Option<&SystemMessageMod> {
        self.system_message.as_ref()
    }

    /// A rule referencing any unsupported condition or action type never
    /// fires.
    pub fn is_quarantined(&self) -> bool {
        self.condition.has_unsupported()
            || self
                .actions
                .iter()
                .any(|a| matches!(a, Action::Unsupported { .. }))
    }

    // Builder methods
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_frequency(mut self, frequency: RuleFrequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_system_message(mut self, position: PromptPosition, text: impl Into<String>) -> Self {
        self.system_message = Some(SystemMessageMod {
            position,
            text: text.into(),
        });
        self
    }
}
