//! Structured player intent extracted by a utility classification call

use serde::{Deserialize, Serialize};

/// The closed set of intent kinds the classifier may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Move,
    Attack,
    Talk,
    UseItem,
    Examine,
    #[default]
    Other,
}

impl std::str::FromStr for IntentKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "move" => Ok(IntentKind::Move),
            "attack" => Ok(IntentKind::Attack),
            "talk" => Ok(IntentKind::Talk),
            "use-item" | "use_item" | "useitem" => Ok(IntentKind::UseItem),
            "examine" => Ok(IntentKind::Examine),
            "other" => Ok(IntentKind::Other),
            _ => Err(()),
        }
    }
}

/// Structured representation of the player's input.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

impl Intent {
    pub fn other() -> Self {
        Self::default()
    }

    /// Parse the classifier's `kind|target|method` line.
    ///
    /// Anything that does not validate against the enum maps to `Other`;
    /// empty segments map to None.
    pub fn from_classifier_output(output: &str) -> Self {
        let line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let mut parts = line.splitn(3, '|');

        let kind = parts
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IntentKind::Other);

        let segment = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
                .map(str::to_string)
        };

        Intent {
            kind,
            target: segment(parts.next()),
            method: segment(parts.next()),
        }
    }
}
