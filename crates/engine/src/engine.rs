//! Engine facade - the in-process API the host UI consumes
//!
//! Holds the tab registry. Each open tab runs its own pipeline task plus a
//! heartbeat task; the facade forwards operations through the tab's mailbox
//! and enforces the input gate while a turn is in flight.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};

use taleweaver_domain::TabId;

use crate::config::AppConfig;
use crate::error::EngineError;
use crate::events::EventEnvelope;
use crate::llm::{CompletionClient, InferenceGateway};
use crate::persistence::{load_session, SessionPaths};
use crate::pipeline::{PipelineMsg, TabRuntime};
use crate::timers::HEARTBEAT;

/// Capacity of each tab's event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct TabHandle {
    mailbox: mpsc::UnboundedSender<PipelineMsg>,
    events: broadcast::Sender<EventEnvelope>,
    in_turn: Arc<AtomicBool>,
}

/// The multi-tab engine. Tabs are fully isolated; the inference client is
/// shared and stateless.
pub struct Engine {
    config: AppConfig,
    client: Arc<dyn CompletionClient>,
    tabs: DashMap<TabId, TabHandle>,
}

impl Engine {
    /// Build the engine from configuration, constructing the provider
    /// client for the configured service.
    pub fn new(config: AppConfig) -> Result<Self, EngineError> {
        let client = config.build_client()?;
        Ok(Self::with_client(config, client))
    }

    /// Build with an injected inference client (tests, embedders).
    pub fn with_client(config: AppConfig, client: Arc<dyn CompletionClient>) -> Self {
        Self {
            config,
            client,
            tabs: DashMap::new(),
        }
    }

    /// Open a session directory as a tab and start its pipeline.
    pub fn open_tab(&self, tab: TabId, session_dir: impl Into<PathBuf>) {
        let paths = SessionPaths::new(session_dir);
        let data = load_session(&paths);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        let runtime = TabRuntime::new(
            tab.clone(),
            paths,
            data,
            &self.config,
            InferenceGateway::new(Arc::clone(&self.client)),
            events.clone(),
        );
        tokio::spawn(runtime.run(rx));

        // Coarse real-time heartbeat; the pipeline only acts on it at Idle.
        let heartbeat_tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if heartbeat_tx.send(PipelineMsg::Heartbeat).is_err() {
                    break;
                }
            }
        });

        self.tabs.insert(
            tab,
            TabHandle {
                mailbox: tx,
                events,
                in_turn: Arc::new(AtomicBool::new(false)),
            },
        );
        tracing::info!("tab opened");
    }

    /// Close a tab, dropping its mailbox; the pipeline task drains and
    /// exits.
    pub fn close_tab(&self, tab: &TabId) {
        self.tabs.remove(tab);
    }

    /// Submit player input. Resolves when the turn completes (or was
    /// rejected). Input is disabled while a turn is in progress.
    pub async fn submit_input(&self, tab: &TabId, text: &str) -> Result<(), EngineError> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let handle = self
                .tabs
                .get(tab)
                .ok_or_else(|| EngineError::UnknownTab(tab.clone()))?;
            if handle.in_turn.swap(true, Ordering::SeqCst) {
                return Err(EngineError::InputDisabled);
            }
            let sent = handle.mailbox.send(PipelineMsg::Submit {
                text: text.to_string(),
                done: done_tx,
            });
            if sent.is_err() {
                handle.in_turn.store(false, Ordering::SeqCst);
                return Err(EngineError::Pipeline("tab task is gone".into()));
            }
        }

        let result = done_rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Pipeline("tab task dropped the turn".into())));
        if let Some(handle) = self.tabs.get(tab) {
            handle.in_turn.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Subscribe to a tab's event stream.
    pub fn subscribe(&self, tab: &TabId) -> Result<broadcast::Receiver<EventEnvelope>, EngineError> {
        let handle = self
            .tabs
            .get(tab)
            .ok_or_else(|| EngineError::UnknownTab(tab.clone()))?;
        Ok(handle.events.subscribe())
    }

    pub async fn save(&self, tab: &TabId) -> Result<(), EngineError> {
        self.request(tab, |done| PipelineMsg::Save { done }).await
    }

    /// Atomic load from another session directory; rolls back completely on
    /// failure.
    pub async fn load(&self, tab: &TabId, path: &Path) -> Result<(), EngineError> {
        let source = path.to_path_buf();
        self.request(tab, move |done| PipelineMsg::Load { source, done })
            .await
    }

    /// Workflow reset; `*`-prefixed variables and the authored system
    /// context survive.
    pub async fn reset(&self, tab: &TabId) -> Result<(), EngineError> {
        self.request(tab, |done| PipelineMsg::Reset { done }).await
    }

    /// Cancel the tab. An in-flight turn finishes (up to its inference
    /// timeout) before the cancel is processed; completed work persists.
    pub async fn cancel(&self, tab: &TabId) -> Result<(), EngineError> {
        self.request(tab, |done| PipelineMsg::Cancel { done }).await
    }

    async fn request<F>(&self, tab: &TabId, build: F) -> Result<(), EngineError>
    where
        F: FnOnce(oneshot::Sender<Result<(), EngineError>>) -> PipelineMsg,
    {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let handle = self
                .tabs
                .get(tab)
                .ok_or_else(|| EngineError::UnknownTab(tab.clone()))?;
            handle
                .mailbox
                .send(build(done_tx))
                .map_err(|_| EngineError::Pipeline("tab task is gone".into()))?;
        }
        done_rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Pipeline("tab task dropped the request".into())))
    }
}
