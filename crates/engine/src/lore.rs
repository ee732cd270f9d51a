//! Keyword-triggered lore snippets
//!
//! Authored entries loaded from the session's data files. A snippet joins
//! the prompt when one of its trigger keys appears (whole-word,
//! case-insensitive) in the recent visible log or the current setting.

use serde::{Deserialize, Serialize};

use crate::rules::word_match;

/// One authored lore snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoreEntry {
    /// Trigger keys; any match includes the snippet
    pub keys: Vec<String>,
    /// The text injected into the prompt
    pub text: String,
}

/// Select the lore snippets triggered by the given haystack (recent visible
/// log text plus the current setting's name and description).
pub fn matching_lore<'a>(lore: &'a [LoreEntry], haystack: &str) -> Vec<&'a LoreEntry> {
    lore.iter()
        .filter(|entry| entry.keys.iter().any(|key| word_match(haystack, key)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lore() -> Vec<LoreEntry> {
        vec![
            LoreEntry {
                keys: vec!["ghost".into(), "haunting".into()],
                text: "The mansion's ghost is bound to the hour of midnight.".into(),
            },
            LoreEntry {
                keys: vec!["lantern".into()],
                text: "Silver lanterns ward off restless spirits.".into(),
            },
        ]
    }

    #[test]
    fn test_whole_word_trigger() {
        let lore = lore();
        let hits = matching_lore(&lore, "Did you see the Ghost upstairs?");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("midnight"));
    }

    #[test]
    fn test_partial_word_does_not_trigger() {
        let lore = lore();
        assert!(matching_lore(&lore, "a ghostly wail").is_empty());
        assert!(matching_lore(&lore, "lanterns everywhere").is_empty());
    }
}
