//! Actor entity - player characters and NPCs
//!
//! Actors hold keys into the world, never references. The store derives
//! presence sets from `current_setting`; actors never list each other.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::game_clock::TimeWindow;
use crate::keys::{ActorKey, ItemKey, SettingKey};
use crate::variables::VariableMap;

/// The fixed set of equipment slot keys.
pub const EQUIP_SLOTS: &[&str] = &[
    "head", "torso", "legs", "feet", "hands", "weapon", "offhand", "accessory",
];

/// Most recent personal notes kept per actor; older notes are dropped.
pub const MAX_NOTES: usize = 50;

/// An inventory line: item reference plus quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub item: ItemKey,
    pub quantity: u32,
}

/// A schedule binding: during this window the actor should be at this setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub window: TimeWindow,
    pub setting: SettingKey,
}

/// A player character or NPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    key: ActorKey,
    name: String,
    /// Short trait strings describing the actor
    #[serde(default)]
    description: Vec<String>,
    #[serde(default)]
    personality: Vec<String>,
    #[serde(default)]
    appearance: Vec<String>,
    /// Ability names granted by the actor's class or nature
    #[serde(default)]
    abilities: Vec<String>,
    /// Slot key -> short description
    #[serde(default)]
    equipment: BTreeMap<String, String>,
    #[serde(default)]
    inventory: Vec<InventoryEntry>,
    current_setting: Option<SettingKey>,
    /// Actor-scoped free-form variables
    #[serde(default)]
    variables: VariableMap,
    #[serde(default)]
    schedule: Vec<ScheduleEntry>,
    /// Append-only first-person notes, newest last
    #[serde(default)]
    notes: Vec<String>,
}

impl Actor {
    pub fn new(key: impl Into<ActorKey>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: Vec::new(),
            personality: Vec::new(),
            appearance: Vec::new(),
            abilities: Vec::new(),
            equipment: BTreeMap::new(),
            inventory: Vec::new(),
            current_setting: None,
            variables: VariableMap::new(),
            schedule: Vec::new(),
            notes: Vec::new(),
        }
    }

    // Read accessors
    pub fn key(&self) -> &ActorKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &[String] {
        &self.description
    }

    pub fn personality(&self) -> &[String] {
        &self.personality
    }

    pub fn appearance(&self) -> &[String] {
        &self.appearance
    }

    pub fn abilities(&self) -> &[String] {
        &self.abilities
    }

    pub fn equipment(&self) -> &BTreeMap<String, String> {
        &self.equipment
    }

    pub fn inventory(&self) -> &[InventoryEntry] {
        &self.inventory
    }

    pub fn current_setting(&self) -> Option<&SettingKey> {
        self.current_setting.as_ref()
    }

    pub fn variables(&self) -> &VariableMap {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut VariableMap {
        &mut self.variables
    }

    pub fn schedule(&self) -> &[ScheduleEntry] {
        &self.schedule
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    // Builder methods
    pub fn with_description(mut self, traits: Vec<String>) -> Self {
        self.description = traits;
        self
    }

    pub fn with_personality(mut self, traits: Vec<String>) -> Self {
        self.personality = traits;
        self
    }

    pub fn with_appearance(mut self, traits: Vec<String>) -> Self {
        self.appearance = traits;
        self
    }

    pub fn with_abilities(mut self, abilities: Vec<String>) -> Self {
        self.abilities = abilities;
        self
    }

    pub fn with_setting(mut self, setting: impl Into<SettingKey>) -> Self {
        self.current_setting = Some(setting.into());
        self
    }

    pub fn with_schedule(mut self, schedule: Vec<ScheduleEntry>) -> Self {
        self.schedule = schedule;
        self
    }

    // Mutations (invoked by the store when applying change sets)

    pub fn move_to(&mut self, setting: Option<SettingKey>) {
        self.current_setting = setting;
    }

    /// Equip a description into one of the fixed slots.
    pub fn equip(
        &mut self,
        slot: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), DomainError> {
        let slot = slot.into();
        if !EQUIP_SLOTS.contains(&slot.as_str()) {
            return Err(DomainError::validation(format!(
                "unknown equipment slot '{slot}'"
            )));
        }
        self.equipment.insert(slot, description.into());
        Ok(())
    }

    /// Add quantity of an item, merging with an existing line.
    pub fn give_item(&mut self, item: ItemKey, quantity: u32) {
        if let Some(entry) = self.inventory.iter_mut().find(|e| e.item == item) {
            entry.quantity = entry.quantity.saturating_add(quantity);
        } else {
            self.inventory.push(InventoryEntry { item, quantity });
        }
    }

    /// Remove up to quantity of an item; the line disappears at zero.
    /// Returns how many were actually removed.
    pub fn remove_item(&mut self, item: &ItemKey, quantity: u32) -> u32 {
        let Some(pos) = self.inventory.iter().position(|e| &e.item == item) else {
            return 0;
        };
        let entry = &mut self.inventory[pos];
        let removed = entry.quantity.min(quantity);
        entry.quantity -= removed;
        if entry.quantity == 0 {
            self.inventory.remove(pos);
        }
        removed
    }

    /// Total quantity held of an item.
    pub fn quantity_of(&self, item: &ItemKey) -> u32 {
        self.inventory
            .iter()
            .filter(|e| &e.item == item)
            .map(|e| e.quantity)
            .sum()
    }

    /// Append a first-person note, dropping the oldest past the cap.
    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
        if self.notes.len() > MAX_NOTES {
            let excess = self.notes.len() - MAX_NOTES;
            self.notes.drain(..excess);
        }
    }

    /// The setting this actor's schedule places it at for the given minute.
    pub fn scheduled_setting(&self, minute_of_day: u16) -> Option<&SettingKey> {
        self.schedule
            .iter()
            .find(|entry| entry.window.contains(minute_of_day))
            .map(|entry| &entry.setting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_merge_and_remove() {
        let mut actor = Actor::new("rowan", "Rowan");
        actor.give_item(ItemKey::new("torch"), 2);
        actor.give_item(ItemKey::new("torch"), 1);
        assert_eq!(actor.quantity_of(&ItemKey::new("torch")), 3);

        let removed = actor.remove_item(&ItemKey::new("torch"), 5);
        assert_eq!(removed, 3);
        assert!(actor.inventory().is_empty());
    }

    #[test]
    fn test_equip_rejects_unknown_slot() {
        let mut actor = Actor::new("rowan", "Rowan");
        assert!(actor.equip("weapon", "a worn shortsword").is_ok());
        assert!(actor.equip("tail", "ribbon").is_err());
    }

    #[test]
    fn test_note_log_caps_at_most_recent() {
        let mut actor = Actor::new("ghost", "The Ghost");
        for i in 0..(MAX_NOTES + 10) {
            actor.add_note(format!("note {i}"));
        }
        assert_eq!(actor.notes().len(), MAX_NOTES);
        assert_eq!(actor.notes()[0], "note 10");
    }

    #[test]
    fn test_scheduled_setting() {
        let actor = Actor::new("guard", "Gate Guard").with_schedule(vec![
            ScheduleEntry {
                window: TimeWindow::new(8 * 60, 18 * 60),
                setting: SettingKey::new("gatehouse"),
            },
            ScheduleEntry {
                window: TimeWindow::new(18 * 60, 8 * 60),
                setting: SettingKey::new("barracks"),
            },
        ]);
        assert_eq!(
            actor.scheduled_setting(12 * 60).map(|s| s.as_str()),
            Some("gatehouse")
        );
        assert_eq!(
            actor.scheduled_setting(23 * 60).map(|s| s.as_str()),
            Some("barracks")
        );
    }
}
