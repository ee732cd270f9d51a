//! Rule evaluation and orchestration.
//!
//! `evaluator` is pure: a function of (rule, snapshot, text target, resolved
//! tags). `engine` owns the rule table, fingerprints, and phase execution.

mod engine;
mod evaluator;

pub use engine::{PhaseOutput, RuleEngine, SpeakerClass, TriggerPhase};
pub use evaluator::{evaluate_rule, evaluate_tree, tag_key, ClassifiedTags};
pub(crate) use evaluator::word_match;
