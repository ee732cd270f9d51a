//! Setting entity - locations the player and NPCs move between
//!
//! Settings reference each other by key through the connection map. The set
//! of actors present is derived by the store, never stored here.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::keys::{ItemKey, SettingKey};

/// Travel metadata attached to a connection between two settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Minutes of game time a traversal costs
    #[serde(default)]
    pub travel_minutes: Option<u32>,
    /// Short description of the passage ("a narrow servant's stair")
    #[serde(default)]
    pub description: Option<String>,
}

/// A location in the world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    key: SettingKey,
    name: String,
    description: String,
    /// Neighbor key -> travel metadata
    #[serde(default)]
    connections: BTreeMap<SettingKey, Connection>,
    /// Items lying in this setting
    #[serde(default)]
    items: BTreeSet<ItemKey>,
    /// Free-form region tag ("old quarter", "wilds")
    #[serde(default)]
    region: Option<String>,
    /// Set when this setting is interior to a parent region setting
    #[serde(default)]
    parent: Option<SettingKey>,
}

impl Setting {
    pub fn new(key: impl Into<SettingKey>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: String::new(),
            connections: BTreeMap::new(),
            items: BTreeSet::new(),
            region: None,
            parent: None,
        }
    }

    // Read accessors
    pub fn key(&self) -> &SettingKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn connections(&self) -> &BTreeMap<SettingKey, Connection> {
        &self.connections
    }

    pub fn items(&self) -> &BTreeSet<ItemKey> {
        &self.items
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn parent(&self) -> Option<&SettingKey> {
        self.parent.as_ref()
    }

    pub fn connects_to(&self, other: &SettingKey) -> bool {
        self.connections.contains_key(other)
    }

    // Builder methods
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_connection(mut self, to: impl Into<SettingKey>, connection: Connection) -> Self {
        self.connections.insert(to.into(), connection);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<SettingKey>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    // Mutations (invoked by the store when applying change sets)

    pub fn add_item(&mut self, item: ItemKey) {
        self.items.insert(item);
    }

    pub fn remove_item(&mut self, item: &ItemKey) -> bool {
        self.items.remove(item)
    }
}
