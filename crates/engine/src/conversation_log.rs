//! Conversation log - append-only, scene-partitioned turn history
//!
//! The full log survives in saves for replay; prompt construction only ever
//! sees the currently active scene, filtered per viewer.

use taleweaver_domain::{ActorKey, Role, SettingKey, TurnRecord};

/// Append-only ordered record of turns for one tab.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    entries: Vec<TurnRecord>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<TurnRecord>) -> Self {
        Self { entries }
    }

    pub fn append(&mut self, record: TurnRecord) {
        tracing::debug!(
            turn = record.turn,
            scene = record.scene,
            role = ?record.role,
            "log append"
        );
        self.entries.push(record);
    }

    pub fn entries(&self) -> &[TurnRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of the given scene, error markers excluded.
    ///
    /// This is the narrator's context slice; the narrator is omniscient
    /// within the scene.
    pub fn scene_context(&self, scene: u64) -> Vec<&TurnRecord> {
        self.entries
            .iter()
            .filter(|e| e.scene == scene && !e.is_error_marker())
            .collect()
    }

    /// Entries of the given scene visible to a viewer, error markers
    /// excluded. Used when building context for any speaker other than the
    /// narrator.
    pub fn visible_context(
        &self,
        scene: u64,
        viewer: &ActorKey,
        viewer_setting: Option<&SettingKey>,
    ) -> Vec<&TurnRecord> {
        self.entries
            .iter()
            .filter(|e| {
                e.scene == scene && !e.is_error_marker() && e.visible_to(viewer, viewer_setting)
            })
            .collect()
    }

    /// Prior assistant-side texts from one speaker, for duplicate detection.
    ///
    /// The narrator is addressed by `None`; NPCs by their key.
    pub fn assistant_texts(&self, speaker: Option<&ActorKey>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| match speaker {
                None => e.role == Role::Narrator,
                Some(key) => e.role == Role::Npc && e.speaker.as_ref() == Some(key),
            })
            .map(|e| e.content.clone())
            .collect()
    }
}
