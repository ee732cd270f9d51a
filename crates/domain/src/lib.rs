extern crate self as taleweaver_domain;

pub mod conversation;
pub mod entities;
pub mod error;
pub mod game_clock;
pub mod intent;
pub mod keys;
pub mod rules;
pub mod timer;
pub mod variables;

// Re-export entities
pub use entities::{Actor, Connection, InventoryEntry, Item, ScheduleEntry, Setting, EQUIP_SLOTS};

pub use error::DomainError;

// Re-export conversation types
pub use conversation::{Role, TurnRecord, Visibility, ERROR_MARKER_PREFIX};

// Re-export game clock types
pub use game_clock::{ClockMode, GameClock, TimeOfDay, TimeWindow};

// Re-export key types
pub use keys::{ActorKey, ItemKey, RuleId, SettingKey, TabId};

// Re-export rule model
pub use rules::{
    Action, Condition, ConditionLogic, ConditionTree, NumericOp, PromptPosition, Rule,
    RuleFrequency, RuleScope, SystemMessageMod,
};

// Re-export timers and intents
pub use intent::{Intent, IntentKind};
pub use timer::{ClockSource, Timer, TimerKey};

// Re-export variables
pub use variables::{CompareOp, VarValue, VariableMap, PRESERVED_PREFIX};
