use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taleweaver_domain::{
    Actor, ActorKey, GameClock, Item, ItemKey, NumericOp, Setting, SettingKey, VarValue,
    VariableMap,
};

/// Errors raised while applying a change set
#[derive(Debug, Error, Clone)]
pub enum WorldError {
    /// A change referenced a key that does not exist; nothing was applied
    #[error("Missing key: {entity_type} '{key}'")]
    MissingKey {
        entity_type: &'static str,
        key: String,
    },
}

/// The complete mutable state of one tab's world.
///
/// `WorldStore` wraps this for mutation; `StateView` shares a frozen copy
/// with the pure rule evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldState {
    actors: BTreeMap<ActorKey, Actor>,
    settings: BTreeMap<SettingKey, Setting>,
    items: BTreeMap<ItemKey, Item>,
    variables: VariableMap,
    scene_number: u64,
    turn_count: u64,
    clock: GameClock,
    player: ActorKey,
}

impl WorldState {
    pub fn new(player: ActorKey) -> Self {
        Self {
            actors: BTreeMap::new(),
            settings: BTreeMap::new(),
            items: BTreeMap::new(),
            variables: VariableMap::new(),
            scene_number: 1,
            turn_count: 0,
            clock: GameClock::new(),
            player,
        }
    }

    // Read access

    pub fn get_actor(&self, key: &ActorKey) -> Option<&Actor> {
        self.actors.get(key)
    }

    pub fn get_setting(&self, key: &SettingKey) -> Option<&Setting> {
        self.settings.get(key)
    }

    pub fn get_item(&self, key: &ItemKey) -> Option<&Item> {
        self.items.get(key)
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn settings(&self) -> impl Iterator<Item = &Setting> {
        self.settings.values()
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    /// Keys of actors currently in a setting, sorted for determinism.
    /// Derived from `current_setting`; never stored.
    pub fn actors_in(&self, setting: &SettingKey) -> Vec<ActorKey> {
        self.actors
            .values()
            .filter(|a| a.current_setting() == Some(setting))
            .map(|a| a.key().clone())
            .collect()
    }

    pub fn player(&self) -> &ActorKey {
        &self.player
    }

    pub fn player_actor(&self) -> Option<&Actor> {
        self.actors.get(&self.player)
    }

    pub fn player_setting(&self) -> Option<&SettingKey> {
        self.player_actor().and_then(|a| a.current_setting())
    }

    pub fn variables(&self) -> &VariableMap {
        &self.variables
    }

    pub fn scene_number(&self) -> u64 {
        self.scene_number
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn clock(&self) -> &GameClock {
        &self.clock
    }

    /// Resolve a variable name, honoring the `actor_key.name` scope prefix.
    ///
    /// A dotted name whose prefix matches an actor reads that actor's
    /// variable map; otherwise the full name reads the tab-wide map.
    pub fn get_variable(&self, name: &str) -> Option<&VarValue> {
        if let Some((prefix, rest)) = name.split_once('.') {
            let actor_key = ActorKey::new(prefix);
            if let Some(actor) = self.actors.get(&actor_key) {
                return actor.variables().get(rest);
            }
        }
        self.variables.get(name)
    }
}

/// A cheap cloneable snapshot handed to the pure evaluator.
pub type StateView = Arc<WorldState>;

/// One concrete mutation inside a change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
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
        quantity: u32,
    },
    RemoveItem {
        actor: ActorKey,
        item: ItemKey,
        quantity: u32,
    },
    AppendNote {
        actor: ActorKey,
        note: String,
    },
    SetScene {
        scene: u64,
    },
    EndScene,
}

/// An ordered group of mutations that applies all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }
}

impl FromIterator<Change> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

/// Keys touched by a successful apply, for StateChanged events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub keys: Vec<String>,
}

/// Exclusive owner of the world. Accessed sequentially from the tab's
/// pipeline task; never shared across threads.
#[derive(Debug, Clone)]
pub struct WorldStore {
    state: WorldState,
}

impl WorldStore {
    pub fn new(state: WorldState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    /// Frozen snapshot for the pure evaluator.
    pub fn snapshot(&self) -> StateView {
        Arc::new(self.state.clone())
    }

    // Seeding (authoring tools and session load)

    pub fn insert_actor(&mut self, actor: Actor) {
        self.state.actors.insert(actor.key().clone(), actor);
    }

    pub fn insert_setting(&mut self, setting: Setting) {
        self.state.settings.insert(setting.key().clone(), setting);
    }

    pub fn insert_item(&mut self, item: Item) {
        self.state.items.insert(item.key().clone(), item);
    }

    pub fn remove_actor(&mut self, key: &ActorKey) -> Option<Actor> {
        self.state.actors.remove(key)
    }

    // Counters and clock

    pub fn increment_turn(&mut self) -> u64 {
        self.state.turn_count += 1;
        self.state.turn_count
    }

    pub fn clock_mut(&mut self) -> &mut GameClock {
        &mut self.state.clock
    }

    pub fn set_counters(&mut self, scene_number: u64, turn_count: u64) {
        self.state.scene_number = scene_number;
        self.state.turn_count = turn_count;
    }

    /// Replace the tab-wide variable map (session load).
    pub fn set_variables(&mut self, variables: VariableMap) {
        self.state.variables = variables;
    }

    /// Reset the workflow: counters and clock start over, variables are
    /// dropped except the preserved (`*`-prefixed) ones. Authored entity
    /// records survive.
    pub fn reset_preserving(&mut self) {
        self.state.variables = self.state.variables.preserved();
        self.state.scene_number = 1;
        self.state.turn_count = 0;
        self.state.clock = GameClock::new();
        for actor in self.state.actors.values_mut() {
            *actor.variables_mut() = actor.variables().preserved();
        }
    }

    /// Set a variable, honoring the actor scope prefix.
    pub fn set_variable(&mut self, name: &str, value: VarValue) {
        if let Some((prefix, rest)) = name.split_once('.') {
            let actor_key = ActorKey::new(prefix);
            if let Some(actor) = self.state.actors.get_mut(&actor_key) {
                actor.variables_mut().set(rest, value);
                return;
            }
        }
        self.state.variables.set(name, value);
    }

    /// Apply a change set transactionally.
    ///
    /// All referenced keys are validated first; a missing key rejects the
    /// whole set and the store is untouched.
    pub fn apply(&mut self, change_set: &ChangeSet) -> Result<AppliedChanges, WorldError> {
        self.validate(change_set)?;

        let mut applied = AppliedChanges::default();
        for change in change_set.changes() {
            self.apply_one(change, &mut applied);
        }
        Ok(applied)
    }

    fn validate(&self, change_set: &ChangeSet) -> Result<(), WorldError> {
        let missing_actor = |key: &ActorKey| WorldError::MissingKey {
            entity_type: "Actor",
            key: key.to_string(),
        };
        for change in change_set.changes() {
            match change {
                Change::MoveActor { actor, to } => {
                    if !self.state.actors.contains_key(actor) {
                        return Err(missing_actor(actor));
                    }
                    if !self.state.settings.contains_key(to) {
                        return Err(WorldError::MissingKey {
                            entity_type: "Setting",
                            key: to.to_string(),
                        });
                    }
                }
                Change::GiveItem { actor, item, .. } | Change::RemoveItem { actor, item, .. } => {
                    if !self.state.actors.contains_key(actor) {
                        return Err(missing_actor(actor));
                    }
                    if !self.state.items.contains_key(item) {
                        return Err(WorldError::MissingKey {
                            entity_type: "Item",
                            key: item.to_string(),
                        });
                    }
                }
                Change::AppendNote { actor, .. } => {
                    if !self.state.actors.contains_key(actor) {
                        return Err(missing_actor(actor));
                    }
                }
                Change::SetVariable { .. }
                | Change::ModifyVariable { .. }
                | Change::SetScene { .. }
                | Change::EndScene => {}
            }
        }
        Ok(())
    }

    fn apply_one(&mut self, change: &Change, applied: &mut AppliedChanges) {
        match change {
            Change::SetVariable { name, value } => {
                self.set_variable(name, value.clone());
                applied.keys.push(name.clone());
            }
            Change::ModifyVariable { name, op, amount } => {
                let current = self
                    .state
                    .get_variable(name)
                    .map(|v| v.as_number())
                    .unwrap_or(0.0);
                self.set_variable(name, VarValue::Number(op.apply(current, *amount)));
                applied.keys.push(name.clone());
            }
            Change::MoveActor { actor, to } => {
                if let Some(record) = self.state.actors.get_mut(actor) {
                    record.move_to(Some(to.clone()));
                }
                applied.keys.push(actor.to_string());
            }
            Change::GiveItem {
                actor,
                item,
                quantity,
            } => {
                if let Some(record) = self.state.actors.get_mut(actor) {
                    record.give_item(item.clone(), *quantity);
                }
                applied.keys.push(actor.to_string());
            }
            Change::RemoveItem {
                actor,
                item,
                quantity,
            } => {
                if let Some(record) = self.state.actors.get_mut(actor) {
                    record.remove_item(item, *quantity);
                }
                applied.keys.push(actor.to_string());
            }
            Change::AppendNote { actor, note } => {
                if let Some(record) = self.state.actors.get_mut(actor) {
                    record.add_note(note.clone());
                }
                applied.keys.push(actor.to_string());
            }
            Change::SetScene { scene } => {
                // Scene counter never decreases
                self.state.scene_number = self.state.scene_number.max(*scene);
                applied.keys.push("scene_number".to_string());
            }
            Change::EndScene => {
                self.state.scene_number += 1;
                applied.keys.push("scene_number".to_string());
            }
        }
    }
}
