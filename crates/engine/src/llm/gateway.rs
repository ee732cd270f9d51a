//! Inference gateway - the one place LLM call policy lives
//!
//! Wraps a `CompletionClient` with the per-call guarantees the pipeline
//! relies on: a bounded fallback chain for refusals and duplicates, a single
//! summarization retry on context overflow, and no hidden retries on any
//! other error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use taleweaver_domain::Intent;

use super::{ChatMessage, ChatRequest, CompletionClient, InferenceError, MessageRole};

/// Refusal prefixes, matched case-insensitively against the first non-space
/// characters of a response. Expanding this list is a product decision.
pub const REFUSAL_PREFIXES: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "i cannot",
    "i can't",
    "as an ai",
];

/// Substituted when the fallback chain is exhausted.
pub const CANNED_TROUBLE_MESSAGE: &str = "The character is having trouble responding.";

/// Upper bound on the fallback list.
pub const MAX_FALLBACK_MODELS: usize = 3;

/// Model and sampling parameters for one logical call.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub model: String,
    /// Ordered replacements tried on refusal or duplicate; truncated to
    /// `MAX_FALLBACK_MODELS`.
    pub fallback_models: Vec<String>,
    /// Cheap model used for summaries, classification, and notes
    pub utility_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl CallSpec {
    pub fn new(model: impl Into<String>, utility_model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fallback_models: Vec::new(),
            utility_model: utility_model.into(),
            temperature: 0.7,
            max_tokens: 1024,
            timeout: super::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_fallbacks(mut self, mut fallbacks: Vec<String>) -> Self {
        fallbacks.truncate(MAX_FALLBACK_MODELS);
        self.fallback_models = fallbacks;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Per-turn retry bookkeeping owned by the pipeline.
///
/// Reset at the start of every turn; the guards are what keep the bounded
/// retries bounded.
#[derive(Debug, Default)]
pub struct TurnGuards {
    duplicate_retry_used: BTreeSet<String>,
    summarization_used: bool,
    post_validation_retry_used: bool,
}

impl TurnGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the speaker's single duplicate-driven retry for this turn.
    /// Returns false once spent.
    pub fn grant_duplicate_retry(&mut self, speaker: &str) -> bool {
        self.duplicate_retry_used.insert(speaker.to_string())
    }

    /// Reentrancy flag for summarization recovery. Returns false once spent.
    pub fn grant_summarization(&mut self) -> bool {
        if self.summarization_used {
            false
        } else {
            self.summarization_used = true;
            true
        }
    }

    /// Single post-validation retry budget. Returns false once spent.
    pub fn grant_post_validation_retry(&mut self) -> bool {
        if self.post_validation_retry_used {
            false
        } else {
            self.post_validation_retry_used = true;
            true
        }
    }
}

/// The accepted result of a speak call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpokenOutcome {
    pub text: String,
    /// How many fallback models were traversed before acceptance
    pub fallbacks_used: u32,
    /// True when the chain was exhausted and the canned message substituted
    pub canned: bool,
}

/// Whether a response opens with a refusal prefix.
pub fn is_refusal(text: &str) -> bool {
    let lead = text.trim_start().to_lowercase();
    REFUSAL_PREFIXES.iter().any(|p| lead.starts_with(p))
}

/// The abstraction over an LLM service the rest of the engine consumes.
pub struct InferenceGateway {
    client: Arc<dyn CompletionClient>,
}

impl InferenceGateway {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    /// Produce a spoken response for one speaker, traversing the fallback
    /// chain on refusal or duplicate.
    ///
    /// `prior_replies` are earlier assistant turns from the same speaker in
    /// this tab; a byte-equal response (after trimming) counts as a
    /// duplicate and is granted at most one retry per speaker per turn.
    pub async fn speak(
        &self,
        spec: &CallSpec,
        messages: Vec<ChatMessage>,
        speaker: &str,
        prior_replies: &[String],
        guards: &mut TurnGuards,
    ) -> Result<SpokenOutcome, InferenceError> {
        let mut chain = Vec::with_capacity(1 + spec.fallback_models.len());
        chain.push(spec.model.clone());
        chain.extend(spec.fallback_models.iter().cloned());

        let mut fallbacks_used = 0u32;
        for (idx, model) in chain.iter().enumerate() {
            let text = self
                .complete_with_recovery(spec, model, messages.clone(), guards)
                .await?;

            if is_refusal(&text) {
                tracing::warn!(speaker, model = %model, "response matched refusal prefix");
                fallbacks_used = idx as u32 + 1;
                continue;
            }

            let trimmed = text.trim();
            let duplicate = prior_replies.iter().any(|r| r.trim() == trimmed);
            if duplicate {
                if guards.grant_duplicate_retry(speaker) {
                    tracing::warn!(speaker, model = %model, "duplicate response, retrying once");
                    fallbacks_used = idx as u32 + 1;
                    continue;
                }
                tracing::warn!(speaker, "duplicate retry already spent this turn");
                return Ok(SpokenOutcome {
                    text: CANNED_TROUBLE_MESSAGE.to_string(),
                    fallbacks_used,
                    canned: true,
                });
            }

            return Ok(SpokenOutcome {
                text,
                fallbacks_used,
                canned: false,
            });
        }

        tracing::warn!(speaker, "fallback chain exhausted, substituting canned message");
        Ok(SpokenOutcome {
            text: CANNED_TROUBLE_MESSAGE.to_string(),
            fallbacks_used: chain.len() as u32,
            canned: true,
        })
    }

    /// One provider call with the single summarization-on-overflow recovery.
    async fn complete_with_recovery(
        &self,
        spec: &CallSpec,
        model: &str,
        messages: Vec<ChatMessage>,
        guards: &mut TurnGuards,
    ) -> Result<String, InferenceError> {
        let request = ChatRequest::new(messages.clone(), model)
            .with_temperature(spec.temperature)
            .with_max_tokens(spec.max_tokens)
            .with_timeout(spec.timeout);

        match self.client.complete(request).await {
            Err(InferenceError::ContextOverflow) => {}
            other => return other,
        }

        if !guards.grant_summarization() {
            return Err(InferenceError::ContextOverflow);
        }
        tracing::info!(model, "context overflow, summarizing conversational tail");

        let condensed = self.condense_tail(spec, &messages).await?;
        let request = ChatRequest::new(condensed, model)
            .with_temperature(spec.temperature)
            .with_max_tokens(spec.max_tokens)
            .with_timeout(spec.timeout);

        match self.client.complete(request).await {
            // A second overflow surfaces the original error, not another pass.
            Err(InferenceError::ContextOverflow) => Err(InferenceError::ContextOverflow),
            other => other,
        }
    }

    /// Split the conversational tail at its midpoint, summarize each half
    /// independently, and substitute the concatenated summaries while
    /// preserving system messages verbatim.
    async fn condense_tail(
        &self,
        spec: &CallSpec,
        messages: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>, InferenceError> {
        let (system, tail): (Vec<&ChatMessage>, Vec<&ChatMessage>) = messages
            .iter()
            .partition(|m| m.role == MessageRole::System);

        if tail.is_empty() {
            return Err(InferenceError::ContextOverflow);
        }

        let mid = tail.len() / 2;
        let first = render_transcript(&tail[..mid.max(1)]);
        let second = render_transcript(&tail[mid.max(1)..]);

        let first_summary = self.summarize(spec, &first).await?;
        let second_summary = if second.is_empty() {
            String::new()
        } else {
            self.summarize(spec, &second).await?
        };

        let mut condensed: Vec<ChatMessage> = system.into_iter().cloned().collect();
        condensed.push(ChatMessage::user(format!(
            "[Earlier events, summarized]\n{first_summary}\n{second_summary}"
        )));
        Ok(condensed)
    }

    /// Strict-factuality utility summarization.
    pub async fn summarize(&self, spec: &CallSpec, text: &str) -> Result<String, InferenceError> {
        let messages = vec![
            ChatMessage::system(
                "Summarize the following game transcript. State only facts present in \
                 the text. Do not invent new information and do not continue the story.",
            ),
            ChatMessage::user(text.to_string()),
        ];
        let request = ChatRequest::new(messages, &spec.utility_model)
            .with_temperature(0.0)
            .with_max_tokens(spec.max_tokens.min(512))
            .with_timeout(spec.timeout);
        self.client.complete(request).await
    }

    /// Classify a text against an allowed tag list.
    ///
    /// Any output not on the list counts as "no tag". Errors and timeouts
    /// also resolve to None; the caller treats that as a false condition.
    pub async fn classify_tag(
        &self,
        spec: &CallSpec,
        text: &str,
        allowed: &[String],
    ) -> Option<String> {
        if allowed.is_empty() {
            return None;
        }
        let messages = vec![
            ChatMessage::system(format!(
                "Classify the text with exactly one tag from this list: {}. \
                 Reply with the tag alone, or the word none.",
                allowed.join(", ")
            )),
            ChatMessage::user(text.to_string()),
        ];
        let request = ChatRequest::new(messages, &spec.utility_model)
            .with_temperature(0.0)
            .with_max_tokens(10)
            .with_timeout(spec.timeout);

        match self.client.complete(request).await {
            Ok(output) => {
                let cleaned = output
                    .trim()
                    .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
                    .to_lowercase();
                allowed
                    .iter()
                    .find(|tag| tag.to_lowercase() == cleaned)
                    .cloned()
            }
            Err(e) => {
                tracing::warn!(error = %e, "tag classification failed, treating as no tag");
                None
            }
        }
    }

    /// Extract a structured intent from raw player input.
    pub async fn extract_intent(&self, spec: &CallSpec, input: &str) -> Intent {
        let messages = vec![
            ChatMessage::system(
                "Classify the player's input. Reply with a single line in the form \
                 kind|target|method where kind is one of: move, attack, talk, \
                 use-item, examine, other. Use none for an absent target or method.",
            ),
            ChatMessage::user(input.to_string()),
        ];
        let request = ChatRequest::new(messages, &spec.utility_model)
            .with_temperature(0.1)
            .with_max_tokens(50)
            .with_timeout(spec.timeout);

        match self.client.complete(request).await {
            Ok(output) => Intent::from_classifier_output(&output),
            Err(e) => {
                tracing::warn!(error = %e, "intent extraction failed, defaulting to other");
                Intent::other()
            }
        }
    }

    /// Generate a short first-person observation for an NPC's note log.
    pub async fn npc_note(&self, spec: &CallSpec, npc_name: &str, recent: &str) -> Option<String> {
        let messages = vec![
            ChatMessage::system(format!(
                "You are {npc_name}. Write one short first-person note about what \
                 you just observed. One or two sentences."
            )),
            ChatMessage::user(recent.to_string()),
        ];
        let request = ChatRequest::new(messages, &spec.utility_model)
            .with_temperature(0.3)
            .with_max_tokens(100)
            .with_timeout(spec.timeout);

        match self.client.complete(request).await {
            Ok(note) => {
                let note = note.trim().to_string();
                (!note.is_empty()).then_some(note)
            }
            Err(e) => {
                tracing::warn!(npc = npc_name, error = %e, "note generation failed");
                None
            }
        }
    }
}

fn render_transcript(messages: &[&ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            format!("{role}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Mock client that pops scripted results and records requests.
    struct ScriptedClient {
        script: Mutex<Vec<Result<String, InferenceError>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<String, InferenceError>>) -> Self {
            Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.requests.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, request: ChatRequest) -> Result<String, InferenceError> {
            self.requests.lock().expect("lock").push(request);
            let mut script = self.script.lock().expect("lock");
            if script.is_empty() {
                return Err(InferenceError::Transport("script exhausted".into()));
            }
            script.remove(0)
        }
    }

    fn spec() -> CallSpec {
        CallSpec::new("primary", "utility").with_fallbacks(vec!["backup".into()])
    }

    #[test]
    fn test_refusal_prefix_matching() {
        assert!(is_refusal("I'm sorry, I can't help with that."));
        assert!(is_refusal("  i cannot continue"));
        assert!(!is_refusal("Sorry seems to be the hardest word."));
        assert!(!is_refusal("You push the door open."));
    }

    #[tokio::test]
    async fn test_refusal_traverses_fallback_chain() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("I'm sorry, I can't...".to_string()),
            Ok("You push the door open; it creaks.".to_string()),
        ]));
        let gateway = InferenceGateway::new(client.clone());
        let mut guards = TurnGuards::new();

        let outcome = gateway
            .speak(&spec(), vec![ChatMessage::user("open the door")], "narrator", &[], &mut guards)
            .await
            .expect("speak");

        assert_eq!(outcome.text, "You push the door open; it creaks.");
        assert_eq!(outcome.fallbacks_used, 1);
        assert!(!outcome.canned);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_chain_yields_canned_message() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("I'm sorry, no.".to_string()),
            Ok("I am sorry, still no.".to_string()),
        ]));
        let gateway = InferenceGateway::new(client);
        let mut guards = TurnGuards::new();

        let outcome = gateway
            .speak(&spec(), vec![ChatMessage::user("hi")], "narrator", &[], &mut guards)
            .await
            .expect("speak");

        assert!(outcome.canned);
        assert_eq!(outcome.text, CANNED_TROUBLE_MESSAGE);
    }

    #[tokio::test]
    async fn test_duplicate_grants_single_retry_per_speaker() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("Same old line.".to_string()),
            Ok("A fresh reply.".to_string()),
        ]));
        let gateway = InferenceGateway::new(client);
        let mut guards = TurnGuards::new();

        let outcome = gateway
            .speak(
                &spec(),
                vec![ChatMessage::user("hi")],
                "npc_x",
                &["Same old line.".to_string()],
                &mut guards,
            )
            .await
            .expect("speak");

        assert_eq!(outcome.text, "A fresh reply.");
        assert_eq!(outcome.fallbacks_used, 1);
    }

    #[tokio::test]
    async fn test_second_duplicate_same_turn_goes_canned() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("Same old line.".to_string()),
            Ok("Same old line.".to_string()),
        ]));
        let gateway = InferenceGateway::new(client);
        let mut guards = TurnGuards::new();

        let outcome = gateway
            .speak(
                &spec(),
                vec![ChatMessage::user("hi")],
                "npc_x",
                &["Same old line.".to_string()],
                &mut guards,
            )
            .await
            .expect("speak");

        assert!(outcome.canned);
    }

    #[tokio::test]
    async fn test_duplicate_retry_resets_next_turn() {
        // Fresh guards each turn; a text equal to a reply from an earlier
        // turn is still flagged, but a brand-new text is accepted untouched.
        let client = Arc::new(ScriptedClient::new(vec![Ok("Brand new words.".to_string())]));
        let gateway = InferenceGateway::new(client);
        let mut guards = TurnGuards::new();

        let outcome = gateway
            .speak(
                &spec(),
                vec![ChatMessage::user("hi")],
                "npc_x",
                &["Same old line.".to_string()],
                &mut guards,
            )
            .await
            .expect("speak");
        assert_eq!(outcome.text, "Brand new words.");
        assert_eq!(outcome.fallbacks_used, 0);
    }

    #[tokio::test]
    async fn test_overflow_summarizes_once_then_retries() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(InferenceError::ContextOverflow),
            Ok("first half summary".to_string()),
            Ok("second half summary".to_string()),
            Ok("The story continues.".to_string()),
        ]));
        let gateway = InferenceGateway::new(client.clone());
        let mut guards = TurnGuards::new();

        let messages = vec![
            ChatMessage::system("You are the narrator."),
            ChatMessage::user("a"),
            ChatMessage::assistant("b"),
            ChatMessage::user("c"),
            ChatMessage::assistant("d"),
        ];
        let outcome = gateway
            .speak(&spec(), messages, "narrator", &[], &mut guards)
            .await
            .expect("speak");

        assert_eq!(outcome.text, "The story continues.");
        // 1 overflow + 2 summaries + 1 retry
        assert_eq!(client.call_count(), 4);

        // The retried request preserves the system message verbatim and
        // substitutes the tail with the concatenated summaries.
        let requests = client.requests.lock().expect("lock");
        let retry = &requests[3];
        assert_eq!(retry.messages[0].content, "You are the narrator.");
        assert!(retry.messages[1].content.contains("first half summary"));
        assert!(retry.messages[1].content.contains("second half summary"));
        assert_eq!(retry.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_second_overflow_surfaces_original_error() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(InferenceError::ContextOverflow),
            Ok("s1".to_string()),
            Ok("s2".to_string()),
            Err(InferenceError::ContextOverflow),
        ]));
        let gateway = InferenceGateway::new(client.clone());
        let mut guards = TurnGuards::new();

        let messages = vec![ChatMessage::user("a"), ChatMessage::assistant("b")];
        let err = gateway
            .speak(&spec(), messages, "narrator", &[], &mut guards)
            .await
            .expect_err("should overflow");

        assert_eq!(err, InferenceError::ContextOverflow);
        // No second summarization pass.
        assert_eq!(client.call_count(), 4);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let client = Arc::new(ScriptedClient::new(vec![Err(InferenceError::Timeout)]));
        let gateway = InferenceGateway::new(client.clone());
        let mut guards = TurnGuards::new();

        let err = gateway
            .speak(&spec(), vec![ChatMessage::user("hi")], "narrator", &[], &mut guards)
            .await
            .expect_err("should time out");

        assert_eq!(err, InferenceError::Timeout);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_classify_tag_validates_allow_list() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("Threat.".to_string()),
            Ok("confetti".to_string()),
        ]));
        let gateway = InferenceGateway::new(client);
        let allowed = vec!["threat".to_string(), "greeting".to_string()];

        let tag = gateway.classify_tag(&spec(), "I'll get you!", &allowed).await;
        assert_eq!(tag.as_deref(), Some("threat"));

        let tag = gateway.classify_tag(&spec(), "hello there", &allowed).await;
        assert_eq!(tag, None);
    }

    #[tokio::test]
    async fn test_extract_intent_maps_errors_to_other() {
        let client = Arc::new(ScriptedClient::new(vec![Err(InferenceError::Timeout)]));
        let gateway = InferenceGateway::new(client);
        let intent = gateway.extract_intent(&spec(), "do a flip").await;
        assert_eq!(intent, Intent::other());
    }
}
