//! Taleweaver Engine - deterministic rule engine and LLM turn pipeline
//!
//! The engine owns ordering, concurrency, failure recovery, and consistency
//! across three unreliable collaborators: a designer-authored rule set, an
//! external LLM service, and a persistent world. Rendering, authoring UIs,
//! and audio are external subscribers of the event stream.

pub mod config;
pub mod conversation_log;
pub mod engine;
pub mod error;
pub mod events;
pub mod llm;
pub mod lore;
pub mod persistence;
pub mod pipeline;
pub mod rules;
pub mod timers;
pub mod validation;
pub mod world;

#[cfg(test)]
mod scenario_tests;

pub use config::{AppConfig, ConfigError, Service, TabOverrides};
pub use engine::Engine;
pub use error::EngineError;
pub use events::{EngineEvent, EventEnvelope};
