//! Session directory layout, artifact schemas, and atomic save/load.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use taleweaver_domain::{
    Action, Actor, ActorKey, ClockSource, Condition, ConditionLogic, ConditionTree, GameClock,
    Item, Rule, RuleFrequency, RuleId, RuleScope, Setting, SettingKey, SystemMessageMod, Timer,
    TimerKey, TurnRecord, VariableMap,
};

use super::{
    read_json_lines, read_json_or_default, read_json_strict, write_json_atomic, write_json_lines,
    PersistenceError,
};
use crate::conversation_log::ConversationLog;
use crate::lore::LoreEntry;
use crate::timers::TimerSet;
use crate::world::{WorldState, WorldStore};

/// Player key used when a session has no gamestate yet.
pub const DEFAULT_PLAYER_KEY: &str = "player";

const GAMESTATE_VERSION: u32 = 1;

/// The file layout of one session directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    root: PathBuf,
}

impl SessionPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn game_dir(&self) -> PathBuf {
        self.root.join("game")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("resources").join("data files")
    }

    pub fn gamestate(&self) -> PathBuf {
        self.game_dir().join("gamestate.json")
    }

    pub fn context_log(&self) -> PathBuf {
        self.game_dir().join("context_log.jsonl")
    }

    pub fn agent_notes(&self) -> PathBuf {
        self.game_dir().join("agent_notes.json")
    }

    pub fn system_context(&self) -> PathBuf {
        self.game_dir().join("system_context.json")
    }

    pub fn workflow_settings(&self) -> PathBuf {
        self.game_dir().join("settings.json")
    }

    pub fn actors(&self) -> PathBuf {
        self.data_dir().join("actors.json")
    }

    pub fn items(&self) -> PathBuf {
        self.data_dir().join("items.json")
    }

    pub fn settings(&self) -> PathBuf {
        self.data_dir().join("settings.json")
    }

    pub fn keywords(&self) -> PathBuf {
        self.data_dir().join("keywords.json")
    }

    pub fn rules(&self) -> PathBuf {
        self.data_dir().join("rules.json")
    }

    /// Relative paths of every artifact participating in atomic load.
    fn artifact_rel_paths() -> &'static [&'static str] {
        &[
            "game/gamestate.json",
            "game/context_log.jsonl",
            "game/agent_notes.json",
            "game/system_context.json",
            "game/settings.json",
            "resources/data files/actors.json",
            "resources/data files/items.json",
            "resources/data files/settings.json",
            "resources/data files/keywords.json",
            "resources/data files/rules.json",
        ]
    }
}

// =============================================================================
// Artifact schemas
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct GamestateFile {
    version: u32,
    scene_number: u64,
    turn_count: u64,
    variables: VariableMap,
    player: PlayerStateDto,
    timers: TimersDto,
    #[serde(default)]
    clock: Option<GameClock>,
    /// Executed-once rule fingerprints; per tab lifetime, survive save/load
    #[serde(default)]
    fired_rules: Vec<RuleId>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlayerStateDto {
    #[serde(default)]
    key: Option<ActorKey>,
    #[serde(default)]
    current_setting: Option<SettingKey>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TimersDto {
    #[serde(default)]
    active_timers: Vec<TimerDto>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TimerDto {
    rule_id: RuleId,
    key: String,
    is_character: bool,
    #[serde(default)]
    character: Option<ActorKey>,
    time_remaining_ms: u64,
    interval_ms: u64,
    is_random: bool,
    #[serde(default)]
    is_periodic: bool,
    #[serde(default = "default_clock_source")]
    clock: ClockSource,
}

fn default_clock_source() -> ClockSource {
    ClockSource::Real
}

impl From<&Timer> for TimerDto {
    fn from(timer: &Timer) -> Self {
        let (key, is_character, character) = match &timer.key {
            TimerKey::Global => ("global".to_string(), false, None),
            TimerKey::Actor(actor) => (actor.to_string(), true, Some(actor.clone())),
        };
        TimerDto {
            rule_id: timer.rule.clone(),
            key,
            is_character,
            character,
            time_remaining_ms: timer.remaining_ms,
            interval_ms: timer.interval_ms,
            is_random: timer.jitter,
            is_periodic: timer.periodic,
            clock: timer.clock,
        }
    }
}

impl From<TimerDto> for Timer {
    fn from(dto: TimerDto) -> Self {
        let key = if dto.is_character {
            TimerKey::Actor(dto.character.unwrap_or_else(|| ActorKey::new(dto.key)))
        } else {
            TimerKey::Global
        };
        Timer {
            rule: dto.rule_id,
            key,
            interval_ms: dto.interval_ms,
            remaining_ms: dto.time_remaining_ms,
            periodic: dto.is_periodic,
            jitter: dto.is_random,
            clock: dto.clock,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SystemContextFile {
    #[serde(default)]
    system_context: String,
    /// Thought-rule configuration, opaque to the core
    #[serde(default)]
    thought_rules: serde_json::Value,
}

/// One record of the authored rule file.
///
/// Modern records carry `condition_logic` and a `conditions` list; the
/// legacy single `condition` form is accepted and promoted. Unknown
/// condition or action types fail the rule closed with a logged warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: RuleId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub frequency: RuleFrequency,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub condition_logic: ConditionLogic,
    #[serde(default)]
    pub conditions: Option<Vec<serde_json::Value>>,
    /// Legacy single-condition form
    #[serde(default)]
    pub condition: Option<serde_json::Value>,
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
    #[serde(default)]
    pub system_message: Option<SystemMessageMod>,
}

fn default_true() -> bool {
    true
}

/// Build a rule from a file record, quarantining unknown types.
pub fn parse_rule_record(record: RuleRecord) -> Rule {
    let raw_conditions = match (record.conditions, record.condition) {
        (Some(list), _) => list,
        (None, Some(single)) => vec![single],
        (None, None) => Vec::new(),
    };

    let children: Vec<ConditionTree> = raw_conditions
        .into_iter()
        .map(|value| parse_condition_entry(&record.id, value))
        .collect();
    let tree = match record.condition_logic {
        ConditionLogic::And => ConditionTree::All { children },
        ConditionLogic::Or => ConditionTree::Any { children },
    };

    let actions: Vec<Action> = record
        .actions
        .into_iter()
        .map(|value| parse_tagged(&record.id, "action", value))
        .collect();

    let mut rule = Rule::new(record.id, record.name, tree)
    .with_description(record.description)
    .with_enabled(record.enabled)
    .with_priority(record.priority)
    .with_frequency(record.frequency)
    .with_scope(record.scope)
    .with_actions(actions);
    if let Some(mod_) = record.system_message {
        rule = rule.with_system_message(mod_.position, mod_.text);
    }
    rule
}

/// A condition entry is usually an atomic condition object, but nested
/// compound nodes (`all`/`any`/`not`/`atom`) are accepted too.
fn parse_condition_entry(rule_id: &RuleId, value: serde_json::Value) -> ConditionTree {
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("missing")
        .to_string();
    if matches!(kind.as_str(), "all" | "any" | "not" | "atom") {
        match serde_json::from_value::<ConditionTree>(value) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!(rule = %rule_id, kind, error = %e, "unreadable compound condition, rule fails closed");
                ConditionTree::Atom {
                    condition: Condition::Unsupported { kind },
                }
            }
        }
    } else {
        ConditionTree::Atom {
            condition: parse_tagged(rule_id, "condition", value),
        }
    }
}

fn parse_tagged<T: serde::de::DeserializeOwned + Unsupportable>(
    rule_id: &RuleId,
    what: &str,
    value: serde_json::Value,
) -> T {
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("missing")
        .to_string();
    match serde_json::from_value(value) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(rule = %rule_id, what, kind, error = %e, "unknown type, rule fails closed");
            T::unsupported(kind)
        }
    }
}

trait Unsupportable {
    fn unsupported(kind: String) -> Self;
}

impl Unsupportable for Condition {
    fn unsupported(kind: String) -> Self {
        Condition::Unsupported { kind }
    }
}

impl Unsupportable for Action {
    fn unsupported(kind: String) -> Self {
        Action::Unsupported { kind }
    }
}

fn to_rule_record(rule: &Rule) -> RuleRecord {
    let (condition_logic, conditions) = match rule.condition() {
        ConditionTree::All { children } => (ConditionLogic::And, flatten_atoms(children)),
        ConditionTree::Any { children } => (ConditionLogic::Or, flatten_atoms(children)),
        other => (
            ConditionLogic::And,
            vec![serde_json::to_value(other).unwrap_or_default()],
        ),
    };
    RuleRecord {
        id: rule.id().clone(),
        name: rule.name().to_string(),
        description: rule.description().to_string(),
        enabled: rule.enabled(),
        priority: rule.priority(),
        frequency: rule.frequency(),
        scope: rule.scope(),
        condition_logic,
        conditions: Some(conditions),
        condition: None,
        actions: rule
            .actions()
            .iter()
            .map(|a| serde_json::to_value(a).unwrap_or_default())
            .collect(),
        system_message: rule.system_message().cloned(),
    }
}

fn flatten_atoms(children: &[ConditionTree]) -> Vec<serde_json::Value> {
    children
        .iter()
        .map(|child| match child {
            ConditionTree::Atom { condition } => {
                serde_json::to_value(condition).unwrap_or_default()
            }
            nested => serde_json::to_value(nested).unwrap_or_default(),
        })
        .collect()
}

// =============================================================================
// Session load / save
// =============================================================================

/// Everything a tab needs from disk.
pub struct SessionData {
    pub store: WorldStore,
    pub log: ConversationLog,
    pub rules: Vec<Rule>,
    pub fired_once: BTreeSet<RuleId>,
    pub timers: TimerSet,
    pub system_context: String,
    pub thought_rules: serde_json::Value,
    pub lore: Vec<LoreEntry>,
    /// Workflow-level settings (theme, streaming, model), opaque to the core
    pub workflow_settings: serde_json::Value,
}

/// Open a session directory, fail-soft: missing or unreadable artifacts
/// yield empty containers.
pub fn load_session(paths: &SessionPaths) -> SessionData {
    let gamestate: GamestateFile = read_json_or_default(&paths.gamestate());
    let player_key = gamestate
        .player
        .key
        .clone()
        .unwrap_or_else(|| ActorKey::new(DEFAULT_PLAYER_KEY));

    let mut store = WorldStore::new(WorldState::new(player_key.clone()));
    let actors: Vec<Actor> = read_json_or_default(&paths.actors());
    let items: Vec<Item> = read_json_or_default(&paths.items());
    let settings: Vec<Setting> = read_json_or_default(&paths.settings());
    for setting in settings {
        store.insert_setting(setting);
    }
    for item in items {
        store.insert_item(item);
    }
    // agent_notes.json mirrors the per-actor note logs for host tooling;
    // the actor records themselves are authoritative on load.
    for actor in actors {
        store.insert_actor(actor);
    }

    store.set_counters(gamestate.scene_number.max(1), gamestate.turn_count);
    store.set_variables(gamestate.variables);
    if let Some(clock) = gamestate.clock {
        *store.clock_mut() = clock;
    }
    if let Some(setting) = gamestate.player.current_setting {
        if store.state().get_setting(&setting).is_some()
            && store.state().get_actor(&player_key).is_some()
        {
            let mut set = crate::world::ChangeSet::new();
            set.push(crate::world::Change::MoveActor {
                actor: player_key,
                to: setting,
            });
            if let Err(e) = store.apply(&set) {
                tracing::warn!(error = %e, "could not restore player setting");
            }
        }
    }

    let records: Vec<RuleRecord> = read_json_or_default(&paths.rules());
    let rules = records.into_iter().map(parse_rule_record).collect();

    let log_entries: Vec<TurnRecord> = read_json_lines(&paths.context_log());
    let system: SystemContextFile = read_json_or_default(&paths.system_context());

    SessionData {
        store,
        log: ConversationLog::from_entries(log_entries),
        rules,
        fired_once: gamestate.fired_rules.into_iter().collect(),
        timers: TimerSet::from_timers(
            gamestate
                .timers
                .active_timers
                .into_iter()
                .map(Timer::from)
                .collect(),
        ),
        system_context: system.system_context,
        thought_rules: system.thought_rules,
        lore: read_json_or_default(&paths.keywords()),
        workflow_settings: read_json_or_default(&paths.workflow_settings()),
    }
}

/// Persist all session artifacts atomically (each file: temp + rename).
pub fn save_session(paths: &SessionPaths, data: &SessionData) -> Result<(), PersistenceError> {
    let state = data.store.state();

    let gamestate = GamestateFile {
        version: GAMESTATE_VERSION,
        scene_number: state.scene_number(),
        turn_count: state.turn_count(),
        variables: state.variables().clone(),
        player: PlayerStateDto {
            key: Some(state.player().clone()),
            current_setting: state.player_setting().cloned(),
        },
        timers: TimersDto {
            active_timers: data.timers.timers().iter().map(TimerDto::from).collect(),
        },
        clock: Some(state.clock().clone()),
        fired_rules: data.fired_once.iter().cloned().collect(),
    };
    write_json_atomic(&paths.gamestate(), &gamestate)?;

    write_json_lines(&paths.context_log(), data.log.entries())?;

    let notes: BTreeMap<&ActorKey, &[String]> = state
        .actors()
        .map(|actor| (actor.key(), actor.notes()))
        .collect();
    write_json_atomic(&paths.agent_notes(), &notes)?;

    write_json_atomic(
        &paths.system_context(),
        &SystemContextFile {
            system_context: data.system_context.clone(),
            thought_rules: data.thought_rules.clone(),
        },
    )?;
    write_json_atomic(&paths.workflow_settings(), &data.workflow_settings)?;

    let actors: Vec<&Actor> = state.actors().collect();
    write_json_atomic(&paths.actors(), &actors)?;
    let items: Vec<&Item> = state.items().collect();
    write_json_atomic(&paths.items(), &items)?;
    let settings: Vec<&Setting> = state.settings().collect();
    write_json_atomic(&paths.settings(), &settings)?;
    write_json_atomic(&paths.keywords(), &data.lore)?;

    let records: Vec<RuleRecord> = data.rules.iter().map(to_rule_record).collect();
    write_json_atomic(&paths.rules(), &records)?;

    tracing::info!(root = %paths.root().display(), "session saved");
    Ok(())
}

// =============================================================================
// Atomic import with rollback
// =============================================================================

/// Replace this session's artifacts with those from `source`.
///
/// Existing files are renamed aside with a timestamp suffix, the incoming
/// files are placed, and the placed set is validated by strict parsing. Any
/// failure restores the previous state completely. On success the backups
/// remain on disk for a grace period; call `cleanup_backups`.
pub fn import_session(paths: &SessionPaths, source: &Path) -> Result<(), PersistenceError> {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
    let mut backed_up: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut placed: Vec<PathBuf> = Vec::new();

    let result = (|| -> Result<(), PersistenceError> {
        for rel in SessionPaths::artifact_rel_paths() {
            let dest = paths.root().join(rel);
            let incoming = source.join(rel);
            if !incoming.exists() {
                continue;
            }

            if dest.exists() {
                let backup = backup_path(&dest, &stamp);
                fs::rename(&dest, &backup).map_err(|e| PersistenceError::io(&dest, e))?;
                backed_up.push((dest.clone(), backup));
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
            }
            fs::copy(&incoming, &dest).map_err(|e| PersistenceError::io(&incoming, e))?;
            placed.push(dest);
        }
        validate_artifacts(paths)
    })();

    match result {
        Ok(()) => {
            tracing::info!(root = %paths.root().display(), "session import complete");
            Ok(())
        }
        Err(e) => {
            // Full rollback: remove everything placed, restore every backup.
            for path in placed {
                if let Err(remove_err) = fs::remove_file(&path) {
                    tracing::error!(path = %path.display(), error = %remove_err, "rollback remove failed");
                }
            }
            for (original, backup) in backed_up {
                if let Err(rename_err) = fs::rename(&backup, &original) {
                    tracing::error!(path = %original.display(), error = %rename_err, "rollback restore failed");
                }
            }
            tracing::warn!(error = %e, "session import rolled back");
            Err(PersistenceError::RolledBack(e.to_string()))
        }
    }
}

/// Strict validation of the artifacts now present in the session directory.
fn validate_artifacts(paths: &SessionPaths) -> Result<(), PersistenceError> {
    if paths.gamestate().exists() {
        let _: GamestateFile = read_json_strict(&paths.gamestate())?;
    }
    if paths.rules().exists() {
        let _: Vec<RuleRecord> = read_json_strict(&paths.rules())?;
    }
    if paths.actors().exists() {
        let _: Vec<Actor> = read_json_strict(&paths.actors())?;
    }
    if paths.items().exists() {
        let _: Vec<Item> = read_json_strict(&paths.items())?;
    }
    if paths.settings().exists() {
        let _: Vec<Setting> = read_json_strict(&paths.settings())?;
    }
    if paths.keywords().exists() {
        let _: Vec<LoreEntry> = read_json_strict(&paths.keywords())?;
    }
    Ok(())
}

/// Remove backup files left behind by a successful import. The caller
/// decides the grace period.
pub fn cleanup_backups(paths: &SessionPaths) -> usize {
    let mut removed = 0;
    for rel in SessionPaths::artifact_rel_paths() {
        let dest = paths.root().join(rel);
        let Some(parent) = dest.parent() else {
            continue;
        };
        let Some(stem) = dest.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(entries) = fs::read_dir(parent) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(stem) && name.contains(".bak-") {
                if fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    removed
}

fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    path.with_file_name(format!("{name}.bak-{stamp}"))
}
