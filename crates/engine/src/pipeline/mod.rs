//! Turn pipeline - the per-tab state machine
//!
//! One task per tab owns all tab state and processes mailbox messages one
//! at a time: player submissions, timer heartbeats, save/load/reset, and
//! cancellation. Within a turn the world store is mutated only from this
//! task; inference calls are the only suspension points.

mod context;

pub use context::{compose_context, strip_speaker_prefix, strip_think_blocks, ContextInputs};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};

use taleweaver_domain::{ActorKey, Role, RuleScope, TabId, TurnRecord, VarValue, Visibility};

use crate::config::{AppConfig, TabOverrides};
use crate::conversation_log::ConversationLog;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventEnvelope};
use crate::llm::{CallSpec, InferenceError, InferenceGateway, TurnGuards};
use crate::lore::LoreEntry;
use crate::persistence::{
    cleanup_backups, import_session, load_session, save_session, SessionData, SessionPaths,
};
use crate::rules::{ClassifiedTags, PhaseOutput, RuleEngine, SpeakerClass, TriggerPhase};
use crate::timers::TimerSet;
use crate::validation;
use crate::world::{Change, ChangeSet, WorldStore};

/// Grace period before import backups are deleted.
const BACKUP_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// Variable consulted for the NPC action mode.
const NPC_MODE_VAR: &str = "npc_mode";
/// Variable prefix a post-rule sets to schedule an NPC explicitly.
const NPC_ACT_PREFIX: &str = "npc_act.";

/// Pipeline states; terminal-per-turn is Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    AcceptingInput,
    PreRules,
    NarratorInference,
    PostRules,
    NpcScheduling,
    NpcInference,
    Persisting,
    Cancelled,
}

/// Mailbox messages processed by the tab task.
pub enum PipelineMsg {
    Submit {
        text: String,
        done: oneshot::Sender<Result<(), EngineError>>,
    },
    Heartbeat,
    Save {
        done: oneshot::Sender<Result<(), EngineError>>,
    },
    Load {
        source: PathBuf,
        done: oneshot::Sender<Result<(), EngineError>>,
    },
    Reset {
        done: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        done: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// All state owned by one tab's pipeline task.
pub struct TabRuntime {
    tab: TabId,
    paths: SessionPaths,
    store: WorldStore,
    log: ConversationLog,
    rules: RuleEngine,
    timers: TimerSet,
    system_context: String,
    thought_rules: serde_json::Value,
    lore: Vec<LoreEntry>,
    workflow_settings: serde_json::Value,
    overrides: TabOverrides,
    gateway: InferenceGateway,
    spec: CallSpec,
    events: broadcast::Sender<EventEnvelope>,
    state: PipelineState,
    last_tick: Instant,
}

impl TabRuntime {
    pub fn new(
        tab: TabId,
        paths: SessionPaths,
        data: SessionData,
        config: &AppConfig,
        gateway: InferenceGateway,
        events: broadcast::Sender<EventEnvelope>,
    ) -> Self {
        let overrides = TabOverrides::from_workflow_settings(&data.workflow_settings);
        let spec = config.call_spec(&overrides);
        let mut rules = RuleEngine::new(data.rules);
        rules.set_fired_once(data.fired_once);
        Self {
            tab,
            paths,
            store: data.store,
            log: data.log,
            rules,
            timers: data.timers,
            system_context: data.system_context,
            thought_rules: data.thought_rules,
            lore: data.lore,
            workflow_settings: data.workflow_settings,
            overrides,
            gateway,
            spec,
            events,
            state: PipelineState::Idle,
            last_tick: Instant::now(),
        }
    }

    /// Mailbox loop. Runs until the sender side is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PipelineMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                PipelineMsg::Submit { text, done } => {
                    let result = if self.state == PipelineState::Cancelled {
                        Err(EngineError::Cancelled)
                    } else {
                        self.run_turn(&text).await
                    };
                    let _ = done.send(result);
                }
                PipelineMsg::Heartbeat => {
                    // Timer-fired rules never interleave with turn steps;
                    // the mailbox only hands us a heartbeat between them.
                    if self.state == PipelineState::Idle {
                        self.timer_tick().await;
                    }
                }
                PipelineMsg::Save { done } => {
                    let _ = done.send(self.persist());
                }
                PipelineMsg::Load { source, done } => {
                    let _ = done.send(self.load_from(&source));
                }
                PipelineMsg::Reset { done } => {
                    let _ = done.send(self.reset());
                }
                PipelineMsg::Cancel { done } => {
                    // Any in-flight inference already finished: the mailbox
                    // delivers Cancel only between messages.
                    self.state = PipelineState::Cancelled;
                    let result = self.persist();
                    tracing::info!(tab = %self.tab, "pipeline cancelled");
                    let _ = done.send(result);
                }
            }
        }
    }

    // =========================================================================
    // Turn execution
    // =========================================================================

    async fn run_turn(&mut self, raw: &str) -> Result<(), EngineError> {
        let input = raw.trim().to_string();
        if input.is_empty() {
            return Err(EngineError::EmptyInput);
        }

        self.state = PipelineState::AcceptingInput;
        let mut guards = TurnGuards::new();
        let turn = self.store.increment_turn();
        let scene = self.store.state().scene_number();
        self.emit(EngineEvent::TurnStarted { turn });
        tracing::info!(tab = %self.tab, turn, scene, "turn started");

        // 1. Ingest the player entry (with optional whisper addressing).
        let (content, visibility) = self.parse_player_visibility(&input);
        let player = self.store.state().player().clone();
        let record = TurnRecord::new(
            Role::Player,
            content.clone(),
            scene,
            turn,
            visibility,
            self.store.state().clock().current(),
        )
        .with_speaker(player.clone());
        self.append_record(record);

        // 2. Optional intent extraction.
        let intent = if self.overrides.intent_extraction {
            Some(self.gateway.extract_intent(&self.spec, &content).await)
        } else {
            None
        };

        // 3. Optional pre-validation: impossible actions short-circuit to a
        // templated failure narration; the narrator is not called.
        if self.overrides.validation {
            if let Some(intent) = &intent {
                if let validation::Verdict::Invalid(reason) =
                    validation::pre_validate(intent, self.store.state())
                {
                    let narration = validation::failure_narration(&reason);
                    self.append_narrator(narration, scene, turn);
                    self.state = PipelineState::Persisting;
                    let persisted = self.persist();
                    self.timer_tick().await;
                    self.state = PipelineState::Idle;
                    self.emit(EngineEvent::TurnCompleted { turn });
                    return persisted;
                }
            }
        }

        // 4. Pre-rules, scope narrator, text target = player input.
        self.state = PipelineState::PreRules;
        let tags = self
            .classify_phase_tags(TriggerPhase::Pre, SpeakerClass::Narrator, &content)
            .await;
        let pre = self.rules.run_phase(
            &mut self.store,
            TriggerPhase::Pre,
            SpeakerClass::Narrator,
            Some(&content),
            &tags,
            None,
        );
        self.consume_phase_output(&pre, scene, turn);

        // 5-6. Narrator inference and post-processing.
        self.state = PipelineState::NarratorInference;
        let mut narrator_text = if let Some(text) = pre.override_response.clone() {
            Some(text)
        } else {
            self.narrator_inference(&pre, &mut guards, scene).await
        };

        // 7. Optional post-validation with a single constrained retry.
        if self.overrides.validation {
            if let Some(text) = narrator_text.clone() {
                narrator_text = Some(self.post_validate_narration(text, &pre, &mut guards, scene).await);
            }
        }

        // 8. Post-rules, text target = narrator output (player input when
        // the narrator produced nothing).
        self.state = PipelineState::PostRules;
        let post_target = narrator_text.clone().unwrap_or_else(|| content.clone());
        let tags = self
            .classify_phase_tags(TriggerPhase::Post, SpeakerClass::Narrator, &post_target)
            .await;
        let post = self.rules.run_phase(
            &mut self.store,
            TriggerPhase::Post,
            SpeakerClass::Narrator,
            Some(&post_target),
            &tags,
            None,
        );
        self.consume_phase_output(&post, scene, turn);
        if let Some(override_text) = post.override_response.clone() {
            narrator_text = Some(override_text);
        }

        // 9. Append the narrator turn.
        if let Some(text) = narrator_text.clone() {
            self.append_narrator(text, scene, turn);
        }

        // 10-11. NPC scheduling and inference.
        self.state = PipelineState::NpcScheduling;
        let npcs = self.eligible_npcs();
        if !npcs.is_empty() {
            self.state = PipelineState::NpcInference;
            let npc_target = narrator_text.unwrap_or(content);
            if self.npc_mode_parallel() {
                self.npc_round_parallel(&npcs, &npc_target, scene, turn).await;
            } else {
                for npc in &npcs {
                    self.npc_round_sequential(npc, &npc_target, scene, turn).await;
                }
            }
        }

        // 12. Persist, 13. timer tick, then back to Idle.
        self.state = PipelineState::Persisting;
        let persisted = self.persist();
        self.timer_tick().await;
        self.state = PipelineState::Idle;
        self.emit(EngineEvent::TurnCompleted { turn });
        tracing::info!(tab = %self.tab, turn, "turn completed");
        persisted
    }

    /// `/whisper <actor> <text>` addresses one actor; everything else is
    /// public in the player's setting (or global when the player is
    /// nowhere).
    fn parse_player_visibility(&self, input: &str) -> (String, Visibility) {
        if let Some(rest) = input.strip_prefix("/whisper ") {
            if let Some((target, text)) = rest.split_once(' ') {
                let target_key = ActorKey::new(target);
                if self.store.state().get_actor(&target_key).is_some() {
                    return (text.trim().to_string(), Visibility::WhisperTo { target: target_key });
                }
            }
        }
        let visibility = match self.store.state().player_setting() {
            Some(setting) => Visibility::PublicInSetting {
                setting: setting.clone(),
            },
            None => Visibility::GlobalAnnouncement,
        };
        (input.to_string(), visibility)
    }

    async fn narrator_inference(
        &mut self,
        pre: &PhaseOutput,
        guards: &mut TurnGuards,
        scene: u64,
    ) -> Option<String> {
        let messages = self.narrator_context(pre, scene, None);
        let prior = self.log.assistant_texts(None);
        match self
            .gateway
            .speak(&self.spec, messages, "narrator", &prior, guards)
            .await
        {
            Ok(outcome) => Some(self.post_process("Narrator", outcome.text)),
            Err(e) => {
                self.note_inference_error(&e, scene);
                None
            }
        }
    }

    fn narrator_context(
        &self,
        phase: &PhaseOutput,
        scene: u64,
        addendum: Option<&str>,
    ) -> Vec<crate::llm::ChatMessage> {
        let state = self.store.state();
        let mut mods_first = phase.prompt_mods_first.clone();
        if let Some(extra) = addendum {
            mods_first.push(extra.to_string());
        }
        let inputs = ContextInputs {
            state,
            system_context: &self.system_context,
            mods_first: &mods_first,
            mods_last: &phase.prompt_mods_last,
            lore: &self.lore,
            visible_tail: self.log.scene_context(scene),
            npc: None,
        };
        compose_context(&inputs)
    }

    fn post_process(&self, speaker_name: &str, text: String) -> String {
        let text = strip_think_blocks(&text);
        strip_speaker_prefix(&text, &[speaker_name, "Narrator"])
    }

    async fn post_validate_narration(
        &mut self,
        text: String,
        pre: &PhaseOutput,
        guards: &mut TurnGuards,
        scene: u64,
    ) -> String {
        let violations = validation::post_validate(&text, self.store.state());
        if violations.is_empty() || !guards.grant_post_validation_retry() {
            return text;
        }
        tracing::warn!(
            tab = %self.tab,
            violations = violations.len(),
            "post-validation violations, retrying with constraints"
        );
        let addendum = validation::constraint_addendum(&violations);
        let messages = self.narrator_context(pre, scene, Some(&addendum));
        let prior = self.log.assistant_texts(None);
        match self
            .gateway
            .speak(&self.spec, messages, "narrator", &prior, guards)
            .await
        {
            // Retry budget spent: accept whatever came back.
            Ok(outcome) => self.post_process("Narrator", outcome.text),
            Err(e) => {
                self.note_inference_error(&e, scene);
                text
            }
        }
    }

    // =========================================================================
    // NPC rounds
    // =========================================================================

    /// NPCs eligible this turn: present in the player's setting, scheduled
    /// into it for the current window, or flagged by a post-rule through an
    /// `npc_act.<key>` variable.
    fn eligible_npcs(&mut self) -> Vec<ActorKey> {
        let state = self.store.state();
        let player = state.player().clone();
        let player_setting = state.player_setting().cloned();
        let minute = state.clock().minute_of_day();

        let mut eligible: BTreeSet<ActorKey> = BTreeSet::new();
        if let Some(setting) = &player_setting {
            for key in state.actors_in(setting) {
                if key != player {
                    eligible.insert(key);
                }
            }
        }
        for actor in state.actors() {
            if actor.key() == &player {
                continue;
            }
            if let (Some(scheduled), Some(setting)) =
                (actor.scheduled_setting(minute), &player_setting)
            {
                if scheduled == setting {
                    eligible.insert(actor.key().clone());
                }
            }
        }

        let mut flagged = Vec::new();
        for (name, value) in state.variables().iter() {
            if let Some(key) = name.strip_prefix(NPC_ACT_PREFIX) {
                if value.as_bool() {
                    let actor_key = ActorKey::new(key);
                    if state.get_actor(&actor_key).is_some() {
                        eligible.insert(actor_key);
                    }
                    flagged.push(name.clone());
                }
            }
        }
        // Consume the one-shot flags.
        for name in flagged {
            self.store.set_variable(&name, VarValue::Bool(false));
        }

        eligible.into_iter().collect()
    }

    fn npc_mode_parallel(&self) -> bool {
        self.store
            .state()
            .get_variable(NPC_MODE_VAR)
            .map(|v| v.as_text().eq_ignore_ascii_case("parallel"))
            .unwrap_or(false)
    }

    /// Sequential mode: each NPC completes inference, rules, and append
    /// before the next begins.
    async fn npc_round_sequential(&mut self, npc: &ActorKey, target: &str, scene: u64, turn: u64) {
        let pre = self.npc_pre_rules(npc, target, scene).await;
        let Some(text) = self.npc_inference(npc, &pre, scene).await else {
            return;
        };
        self.npc_finish(npc, text, scene, turn).await;
    }

    /// Parallel mode: pre-rules run first under the single-writer
    /// discipline, all inference calls are dispatched concurrently, and the
    /// collected outputs are serialized back in NPC-key order before any
    /// post-rule mutation runs.
    async fn npc_round_parallel(&mut self, npcs: &[ActorKey], target: &str, scene: u64, turn: u64) {
        let mut contexts = Vec::new();
        for npc in npcs {
            let pre = self.npc_pre_rules(npc, target, scene).await;
            let Some(actor) = self.store.state().get_actor(npc) else {
                continue;
            };
            let messages = {
                let state = self.store.state();
                let inputs = ContextInputs {
                    state,
                    system_context: &self.system_context,
                    mods_first: &pre.prompt_mods_first,
                    mods_last: &pre.prompt_mods_last,
                    lore: &self.lore,
                    visible_tail: self.log.visible_context(
                        scene,
                        npc,
                        actor.current_setting(),
                    ),
                    npc: Some(actor),
                };
                compose_context(&inputs)
            };
            let prior = self.log.assistant_texts(Some(npc));
            contexts.push((npc.clone(), messages, prior, pre.override_response.clone()));
        }

        let calls = contexts.into_iter().map(|(npc, messages, prior, override_text)| {
            let gateway = &self.gateway;
            let spec = self.spec.clone();
            async move {
                if let Some(text) = override_text {
                    return (npc, Ok(text));
                }
                let mut guards = TurnGuards::new();
                let speaker = npc.to_string();
                let result = gateway
                    .speak(&spec, messages, &speaker, &prior, &mut guards)
                    .await
                    .map(|outcome| outcome.text);
                (npc, result)
            }
        });
        let mut results = futures_util::future::join_all(calls).await;
        // Deterministic log order regardless of completion order.
        results.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (npc, result) in results {
            match result {
                Ok(text) => self.npc_finish(&npc, text, scene, turn).await,
                Err(e) => self.note_inference_error(&e, scene),
            }
        }
    }

    async fn npc_pre_rules(&mut self, npc: &ActorKey, target: &str, _scene: u64) -> PhaseOutput {
        let tags = self
            .classify_phase_tags(TriggerPhase::Pre, SpeakerClass::Npc, target)
            .await;
        self.rules.run_phase(
            &mut self.store,
            TriggerPhase::Pre,
            SpeakerClass::Npc,
            Some(target),
            &tags,
            None,
        )
    }

    async fn npc_inference(
        &mut self,
        npc: &ActorKey,
        pre: &PhaseOutput,
        scene: u64,
    ) -> Option<String> {
        if let Some(text) = pre.override_response.clone() {
            return Some(text);
        }
        let Some(actor) = self.store.state().get_actor(npc) else {
            return None;
        };
        let messages = {
            let state = self.store.state();
            let inputs = ContextInputs {
                state,
                system_context: &self.system_context,
                mods_first: &pre.prompt_mods_first,
                mods_last: &pre.prompt_mods_last,
                lore: &self.lore,
                visible_tail: self.log.visible_context(scene, npc, actor.current_setting()),
                npc: Some(actor),
            };
            compose_context(&inputs)
        };
        let prior = self.log.assistant_texts(Some(npc));
        let mut guards = TurnGuards::new();
        let speaker = npc.to_string();
        match self
            .gateway
            .speak(&self.spec, messages, &speaker, &prior, &mut guards)
            .await
        {
            Ok(outcome) => Some(outcome.text),
            Err(e) => {
                self.note_inference_error(&e, scene);
                None
            }
        }
    }

    /// Post-rules, log append, and note generation for one NPC.
    async fn npc_finish(&mut self, npc: &ActorKey, text: String, scene: u64, turn: u64) {
        let name = self
            .store
            .state()
            .get_actor(npc)
            .map(|a| a.name().to_string())
            .unwrap_or_else(|| npc.to_string());
        let text = {
            let stripped = strip_think_blocks(&text);
            strip_speaker_prefix(&stripped, &[name.as_str()])
        };

        let tags = self
            .classify_phase_tags(TriggerPhase::Post, SpeakerClass::Npc, &text)
            .await;
        let post = self.rules.run_phase(
            &mut self.store,
            TriggerPhase::Post,
            SpeakerClass::Npc,
            Some(&text),
            &tags,
            None,
        );
        self.consume_phase_output(&post, scene, turn);
        let final_text = post.override_response.unwrap_or(text);

        let visibility = match self
            .store
            .state()
            .get_actor(npc)
            .and_then(|a| a.current_setting())
        {
            Some(setting) => Visibility::PublicInSetting {
                setting: setting.clone(),
            },
            None => Visibility::GlobalAnnouncement,
        };
        let record = TurnRecord::new(
            Role::Npc,
            final_text.clone(),
            scene,
            turn,
            visibility,
            self.store.state().clock().current(),
        )
        .with_speaker(npc.clone());
        self.append_record(record);

        // Short first-person observation appended to the actor's note log.
        if let Some(note) = self.gateway.npc_note(&self.spec, &name, &final_text).await {
            let mut set = ChangeSet::new();
            set.push(Change::AppendNote {
                actor: npc.clone(),
                note,
            });
            if let Err(e) = self.store.apply(&set) {
                tracing::warn!(tab = %self.tab, npc = %npc, error = %e, "note append rejected");
            }
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Advance the game clock and both timer clocks; dispatch expired
    /// timers' rules. Runs at turn boundaries and on idle heartbeats only.
    async fn timer_tick(&mut self) {
        let now = Instant::now();
        let real_elapsed_ms = now.duration_since(self.last_tick).as_millis() as u64;
        self.last_tick = now;

        let before = self.store.state().clock().current();
        self.store.clock_mut().tick(
            chrono::Duration::milliseconds(real_elapsed_ms as i64),
            Utc::now(),
        );
        let game_elapsed_ms = (self.store.state().clock().current() - before)
            .num_milliseconds()
            .max(0) as u64;

        let fired = self.timers.tick(real_elapsed_ms, game_elapsed_ms);
        if fired.is_empty() {
            return;
        }

        let scene = self.store.state().scene_number();
        let turn = self.store.state().turn_count();
        for timer in fired {
            self.emit(EngineEvent::TimerFired {
                rule: timer.rule.clone(),
            });
            tracing::info!(tab = %self.tab, rule = %timer.rule, "timer fired");
            let speaker = match self.rules.get(&timer.rule).map(|r| r.scope()) {
                Some(RuleScope::Npc) => SpeakerClass::Npc,
                _ => SpeakerClass::Narrator,
            };
            let out = self.rules.run_phase(
                &mut self.store,
                TriggerPhase::Timer,
                speaker,
                None,
                &ClassifiedTags::new(),
                Some(&timer.rule),
            );
            self.consume_phase_output(&out, scene, turn);
        }
        if let Err(e) = self.persist() {
            tracing::error!(tab = %self.tab, error = %e, "persist after timer dispatch failed");
        }
    }

    // =========================================================================
    // Shared plumbing
    // =========================================================================

    /// Classify the distinct text-tag allow-lists needed by a phase. One
    /// utility call per list; timeouts and junk resolve to no tag.
    async fn classify_phase_tags(
        &self,
        phase: TriggerPhase,
        speaker: SpeakerClass,
        target: &str,
    ) -> ClassifiedTags {
        let mut tags = ClassifiedTags::new();
        for allowed in self.rules.pending_tag_lists(phase, speaker, None) {
            let resolved = self.gateway.classify_tag(&self.spec, target, &allowed).await;
            tags.insert(crate::rules::tag_key(&allowed), resolved);
        }
        tags
    }

    /// Fold a phase's side outputs into the log, timer set, and event
    /// stream.
    fn consume_phase_output(&mut self, output: &PhaseOutput, scene: u64, turn: u64) {
        for message in &output.display_messages {
            let record = TurnRecord::new(
                Role::System,
                message.clone(),
                scene,
                turn,
                Visibility::GlobalAnnouncement,
                self.store.state().clock().current(),
            );
            self.append_record(record);
        }
        for effect in &output.effects {
            tracing::debug!(tab = %self.tab, effect, "play-effect emitted");
        }
        for timer in &output.timer_starts {
            self.timers.start(timer.clone());
        }
        for (rule, key) in &output.timer_cancels {
            self.timers.cancel(rule, key);
        }
        if !output.changed_keys.is_empty() {
            self.emit(EngineEvent::StateChanged {
                keys: output.changed_keys.clone(),
            });
        }
    }

    fn append_narrator(&mut self, text: String, scene: u64, turn: u64) {
        let visibility = match self.store.state().player_setting() {
            Some(setting) => Visibility::PublicInSetting {
                setting: setting.clone(),
            },
            None => Visibility::GlobalAnnouncement,
        };
        let record = TurnRecord::new(
            Role::Narrator,
            text,
            scene,
            turn,
            visibility,
            self.store.state().clock().current(),
        );
        self.append_record(record);
    }

    /// Inference failures surface as a polite system note and an event; the
    /// turn continues.
    fn note_inference_error(&mut self, error: &InferenceError, scene: u64) {
        self.emit(EngineEvent::InferenceError {
            kind: error.kind().to_string(),
        });
        tracing::warn!(tab = %self.tab, kind = error.kind(), "inference error");
        let turn = self.store.state().turn_count();
        self.append_system_note(error.user_facing(), scene, turn);
    }

    fn append_system_note(&mut self, content: String, scene: u64, turn: u64) {
        let record = TurnRecord::new(
            Role::System,
            content,
            scene,
            turn,
            Visibility::GlobalAnnouncement,
            self.store.state().clock().current(),
        );
        self.append_record(record);
    }

    fn append_record(&mut self, record: TurnRecord) {
        self.emit(EngineEvent::MessageAppended {
            role: record.role,
            speaker: record.speaker.clone(),
            content: record.content.clone(),
            visibility: record.visibility.clone(),
        });
        self.log.append(record);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(EventEnvelope::new(event));
    }

    // =========================================================================
    // Persistence operations
    // =========================================================================

    fn session_data(&self) -> SessionData {
        SessionData {
            store: self.store.clone(),
            log: self.log.clone(),
            rules: self.rules.rules().to_vec(),
            fired_once: self.rules.fired_once().clone(),
            timers: self.timers.clone(),
            system_context: self.system_context.clone(),
            thought_rules: self.thought_rules.clone(),
            lore: self.lore.clone(),
            workflow_settings: self.workflow_settings.clone(),
        }
    }

    fn persist(&self) -> Result<(), EngineError> {
        save_session(&self.paths, &self.session_data()).map_err(EngineError::from)
    }

    /// Atomic load with rollback, then reinstall the tab state from disk.
    fn load_from(&mut self, source: &std::path::Path) -> Result<(), EngineError> {
        import_session(&self.paths, source)?;
        let data = load_session(&self.paths);
        self.install(data);

        // Backups are cleaned up after a grace period.
        let paths = self.paths.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BACKUP_GRACE).await;
            let removed = cleanup_backups(&paths);
            tracing::debug!(removed, "import backups cleaned up");
        });
        Ok(())
    }

    fn install(&mut self, data: SessionData) {
        self.overrides = TabOverrides::from_workflow_settings(&data.workflow_settings);
        let mut rules = RuleEngine::new(data.rules);
        rules.set_fired_once(data.fired_once);
        self.store = data.store;
        self.log = data.log;
        self.rules = rules;
        self.timers = data.timers;
        self.system_context = data.system_context;
        self.thought_rules = data.thought_rules;
        self.lore = data.lore;
        self.workflow_settings = data.workflow_settings;
    }

    /// Workflow reset: fresh counters, clock, log, timers, and fingerprints.
    /// Preserved (`*`-prefixed) variables and the authored system context
    /// survive.
    fn reset(&mut self) -> Result<(), EngineError> {
        self.store.reset_preserving();
        self.log = ConversationLog::new();
        self.timers = TimerSet::new();
        let rules = self.rules.rules().to_vec();
        self.rules = RuleEngine::new(rules);
        tracing::info!(tab = %self.tab, "workflow reset");
        self.persist()
    }
}

