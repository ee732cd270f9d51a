//! Item entity - objects that can be carried, equipped, or placed in settings

use serde::{Deserialize, Serialize};

use crate::keys::ItemKey;

/// An object that can be possessed or interacted with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    key: ItemKey,
    name: String,
    description: Option<String>,
    /// Weight in abstract units; feeds carry-capacity checks
    weight: f64,
    /// Trade value in the world's base currency
    value: i64,
    /// Opaque effect tags interpreted by rules ("healing", "cursed")
    effect_tags: Vec<String>,
    /// Equipment slot this item prefers, if any
    slot_affinity: Option<String>,
}

impl Item {
    pub fn new(key: impl Into<ItemKey>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: None,
            weight: 0.0,
            value: 0,
            effect_tags: Vec::new(),
            slot_affinity: None,
        }
    }

    // Read accessors
    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn effect_tags(&self) -> &[String] {
        &self.effect_tags
    }

    pub fn slot_affinity(&self) -> Option<&str> {
        self.slot_affinity.as_deref()
    }

    // Builder methods
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    pub fn with_effect_tag(mut self, tag: impl Into<String>) -> Self {
        self.effect_tags.push(tag.into());
        self
    }

    pub fn with_slot_affinity(mut self, slot: impl Into<String>) -> Self {
        self.slot_affinity = Some(slot.into());
        self
    }
}
