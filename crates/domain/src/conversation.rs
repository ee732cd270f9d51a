//! Turn records - the units of the append-only conversation log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{ActorKey, SettingKey};

/// Who produced a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Player,
    Narrator,
    Npc,
    System,
}

/// Who is allowed to see a log entry when rebuilding an actor's context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to actors whose current setting matches
    PublicInSetting { setting: SettingKey },
    /// Visible only to speaker and target
    WhisperTo { target: ActorKey },
    /// Visible only to the speaker
    PrivateThought,
    /// Visible to everyone regardless of location
    GlobalAnnouncement,
}

/// Error notes injected into the conversation carry this prefix; entries
/// starting with it are excluded when rebuilding inference context.
pub const ERROR_MARKER_PREFIX: &str = "Sorry,";

/// One entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub role: Role,
    pub content: String,
    pub scene: u64,
    pub turn: u64,
    /// Speaking actor; None for the narrator and system notes
    #[serde(default)]
    pub speaker: Option<ActorKey>,
    pub visibility: Visibility,
    /// Tag attached by an LLM classification, if any
    #[serde(default)]
    pub text_tag: Option<String>,
    /// Wall-clock timestamp
    pub timestamp: DateTime<Utc>,
    /// Game-clock timestamp
    pub game_time: DateTime<Utc>,
}

impl TurnRecord {
    pub fn new(
        role: Role,
        content: impl Into<String>,
        scene: u64,
        turn: u64,
        visibility: Visibility,
        game_time: DateTime<Utc>,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            scene,
            turn,
            speaker: None,
            visibility,
            text_tag: None,
            timestamp: Utc::now(),
            game_time,
        }
    }

    pub fn with_speaker(mut self, speaker: impl Into<ActorKey>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    pub fn with_text_tag(mut self, tag: impl Into<String>) -> Self {
        self.text_tag = Some(tag.into());
        self
    }

    /// Whether this entry is an error note that must not feed back into
    /// inference context.
    pub fn is_error_marker(&self) -> bool {
        self.content.trim_start().starts_with(ERROR_MARKER_PREFIX)
    }

    /// Visibility check for a viewer at a given setting.
    ///
    /// System entries are always included; error markers are the caller's
    /// concern (context building skips them separately).
    pub fn visible_to(&self, viewer: &ActorKey, viewer_setting: Option<&SettingKey>) -> bool {
        if self.role == Role::System {
            return true;
        }
        match &self.visibility {
            Visibility::PublicInSetting { setting } => viewer_setting == Some(setting),
            Visibility::WhisperTo { target } => {
                self.speaker.as_ref() == Some(viewer) || target == viewer
            }
            Visibility::PrivateThought => self.speaker.as_ref() == Some(viewer),
            Visibility::GlobalAnnouncement => true,
        }
    }
}
