//! # Stage: Application coordinator and single-turn pipeline
//!
//! ## Responsibility
//! [`ChatApp`] owns the application state (transcript, settings, live
//! cancellation handles) behind one lock and drives request/response cycles
//! against the primary endpoint, streaming deltas into a placeholder
//! assistant message.
//!
//! ## Guarantees
//! - The state lock is never held across an await; every mutation between
//!   two suspension points is applied atomically.
//! - A pipeline checks its token under the lock before every write, so once
//!   an operation is cancelled it never touches the transcript again.
//! - Cancelling a single-turn operation removes its placeholder in the same
//!   critical section, before any other action proceeds.
//!
//! ## NOT Responsible For
//! - Rendering (see [`StreamObserver`])
//! - Retry: transport failures are final

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::{CancellationCoordinator, Domain, LiveHandle};
use crate::client::CompletionBackend;
use crate::decoder::DeltaStream;
use crate::error::ChatError;
use crate::observer::StreamObserver;
use crate::providers::{ChatMessage, ChatRequest, EndpointTarget, Role};
use crate::settings::Settings;
use crate::storage::KeyValueStore;
use crate::transcript::{round_seconds, MessageKind, TranscriptStore};

// ---------------------------------------------------------------------------
// Pipeline state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Requesting,
    Streaming,
    Finalized,
    Errored,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Finalized | PipelineState::Errored | PipelineState::Cancelled)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Requesting => "requesting",
            PipelineState::Streaming => "streaming",
            PipelineState::Finalized => "finalized",
            PipelineState::Errored => "errored",
            PipelineState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// How a single-turn operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Finalized { message_id: String, content: String, response_time: f64 },
    Errored { message_id: String, message: String },
    Cancelled,
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub transcript: TranscriptStore,
    pub settings: Settings,
    pub cancel: CancellationCoordinator,
    /// Partition of the active identity scope; `None` after teardown.
    scope: Option<String>,
    states: HashMap<Domain, (u64, PipelineState)>,
}

impl AppState {
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn pipeline_state(&self, domain: Domain) -> PipelineState {
        self.states.get(&domain).map(|(_, s)| *s).unwrap_or(PipelineState::Idle)
    }

    pub(crate) fn transition(&mut self, domain: Domain, op_id: u64, state: PipelineState) {
        let entry = self.states.entry(domain).or_insert((0, PipelineState::Idle));
        if op_id >= entry.0 {
            debug!(target: "streamchat::pipeline", %domain, op_id, from = %entry.1, to = %state, "pipeline transition");
            *entry = (op_id, state);
        }
    }

    pub(crate) fn require_scope(&self) -> Result<(), ChatError> {
        if self.scope.is_none() {
            return Err(ChatError::Configuration("no identity scope is active".into()));
        }
        Ok(())
    }

    pub(crate) fn require_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        self.transcript
            .chat(chat_id)
            .map(|_| ())
            .ok_or_else(|| ChatError::chat_not_found(chat_id))
    }

    /// Append the user message and the placeholder, then build the request
    /// history with the system prompt in front.
    fn prepare_turn(&mut self, chat_id: &str, text: &str) -> Result<(String, Vec<ChatMessage>), ChatError> {
        self.transcript.add_message(chat_id, Role::User, text, MessageKind::Text)?;
        let placeholder = self.transcript.add_placeholder(chat_id)?;
        let mut messages = self.transcript.history_for_request(chat_id)?;
        if let Some(system) = self.settings.system_prompt() {
            messages.insert(0, ChatMessage { role: Role::System, content: system.to_string() });
        }
        Ok((placeholder, messages))
    }

    /// Append the user message and build the shared comparison history. No
    /// system prompt is sent to comparison endpoints.
    pub(crate) fn prepare_comparison(&mut self, chat_id: &str, text: &str) -> Result<(String, Vec<ChatMessage>), ChatError> {
        let user_message_id = self.transcript.add_message(chat_id, Role::User, text, MessageKind::Text)?;
        let messages = self.transcript.history_for_request(chat_id)?;
        Ok((user_message_id, messages))
    }

    /// Remove whatever a cancelled handle left behind.
    pub(crate) fn discard(&mut self, handle: &LiveHandle) {
        if let Some(placeholder) = &handle.placeholder {
            if self.transcript.remove_message(&handle.chat_id, placeholder) {
                debug!(target: "streamchat::pipeline", chat_id = %handle.chat_id, message_id = %placeholder, "removed cancelled placeholder");
            }
        }
    }

    fn abort(&mut self, domain: Domain) -> bool {
        match self.cancel.cancel(domain) {
            Some(handle) => {
                self.discard(&handle);
                true
            }
            None => false,
        }
    }

    fn abort_all(&mut self) {
        for handle in self.cancel.cancel_all() {
            self.discard(&handle);
        }
    }

    /// Cancel live operations that stream into `chat_id`.
    fn abort_targeting(&mut self, chat_id: &str) {
        for domain in [Domain::SingleTurn, Domain::Comparison] {
            if self.cancel.live(domain).is_some_and(|h| h.chat_id == chat_id) {
                self.abort(domain);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChatApp
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to the application.
#[derive(Clone)]
pub struct ChatApp {
    pub(crate) state: Arc<Mutex<AppState>>,
    pub(crate) backend: Arc<dyn CompletionBackend>,
    pub(crate) observer: Arc<dyn StreamObserver>,
}

impl ChatApp {
    /// Build the application over a persistence port. Settings are loaded
    /// immediately; no identity scope is active until [`ChatApp::activate`].
    pub fn new(
        port: Box<dyn KeyValueStore>,
        backend: Arc<dyn CompletionBackend>,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        let settings = Settings::load(port.as_ref());
        let state = AppState {
            transcript: TranscriptStore::new(port),
            settings,
            cancel: CancellationCoordinator::new(),
            scope: None,
            states: HashMap::new(),
        };
        ChatApp {
            state: Arc::new(Mutex::new(state)),
            backend,
            observer,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AppState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against a consistent snapshot of the state.
    pub fn with_state<R>(&self, f: impl FnOnce(&AppState) -> R) -> R {
        f(&self.lock())
    }

    // -- identity scope -------------------------------------------------------

    /// Activate a partition (`None` = local), cancelling everything in flight
    /// and reloading the chat list.
    pub fn activate(&self, identity: Option<&str>) {
        let mut st = self.lock();
        st.abort_all();
        st.transcript.activate(identity);
        let partition = st.transcript.partition().to_string();
        info!(target: "streamchat::pipeline", partition = %partition, chats = st.transcript.chats().len(), "identity scope activated");
        st.scope = Some(partition);
    }

    /// React to an identity change notification. Identities compare
    /// case-insensitively; an unchanged identity is a no-op.
    pub fn identity_changed(&self, identity: Option<&str>) {
        let unchanged = {
            let st = self.lock();
            match (st.scope(), identity) {
                (Some(current), Some(new)) => current.eq_ignore_ascii_case(new.trim()),
                (Some(current), None) => current == crate::transcript::LOCAL_PARTITION,
                (None, _) => false,
            }
        };
        if !unchanged {
            self.activate(identity);
        }
    }

    /// Tear down the identity scope: cancel both domains, drop chats.
    pub fn teardown(&self) {
        let mut st = self.lock();
        st.abort_all();
        st.transcript.reset();
        st.scope = None;
        info!(target: "streamchat::pipeline", "identity scope torn down");
    }

    // -- chat management ------------------------------------------------------

    pub fn create_chat(&self) -> Result<String, ChatError> {
        let mut st = self.lock();
        st.require_scope()?;
        // the new chat becomes active, which is a switch for both domains
        st.abort_all();
        Ok(st.transcript.create_chat())
    }

    /// Switch the displayed chat. Both domains are cancelled first.
    pub fn set_active_chat(&self, chat_id: Option<&str>) -> Result<(), ChatError> {
        let mut st = self.lock();
        st.require_scope()?;
        if let Some(id) = chat_id {
            st.require_chat(id)?;
        }
        st.abort_all();
        st.transcript.set_active(chat_id)
    }

    pub fn rename_chat(&self, chat_id: &str, title: &str) -> Result<(), ChatError> {
        let mut st = self.lock();
        st.require_scope()?;
        st.transcript.rename_chat(chat_id, title)
    }

    pub fn delete_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        let mut st = self.lock();
        st.require_scope()?;
        st.require_chat(chat_id)?;
        st.abort_targeting(chat_id);
        st.transcript.delete_chat(chat_id).map(|_| ())
    }

    pub fn clear_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        let mut st = self.lock();
        st.require_scope()?;
        st.require_chat(chat_id)?;
        st.abort_targeting(chat_id);
        st.transcript.clear_chat(chat_id)
    }

    // -- settings -------------------------------------------------------------

    /// Mutate settings and persist them.
    pub fn update_settings<R>(&self, f: impl FnOnce(&mut Settings) -> Result<R, ChatError>) -> Result<R, ChatError> {
        let mut guard = self.lock();
        let st = &mut *guard;
        let out = f(&mut st.settings)?;
        st.settings.save(st.transcript.port_mut())?;
        Ok(out)
    }

    /// Mutate settings for this process only; nothing is persisted.
    pub fn override_settings(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.lock().settings);
    }

    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    pub fn take_persistence_error(&self) -> Option<ChatError> {
        self.lock().transcript.take_persistence_error()
    }

    // -- aborts ---------------------------------------------------------------

    /// User-initiated abort of the live single-turn operation.
    pub fn abort_turn(&self) -> bool {
        self.lock().abort(Domain::SingleTurn)
    }

    /// User-initiated abort of the live comparison.
    pub fn abort_comparison(&self) -> bool {
        self.lock().abort(Domain::Comparison)
    }

    // -- single-turn pipeline -------------------------------------------------

    /// Send `user_text` to the primary endpoint and stream the answer into a
    /// new assistant message of `chat_id`.
    ///
    /// Configuration problems fail before any message is written or any
    /// request is sent. Transport failures finalize the assistant message as
    /// an error; cancellation removes it.
    pub async fn send_turn(&self, chat_id: &str, user_text: &str) -> Result<TurnOutcome, ChatError> {
        let text = user_text.trim();
        let started = Instant::now();

        let (handle, placeholder, target, request) = {
            let mut st = self.lock();
            st.require_scope()?;
            st.require_chat(chat_id)?;
            if text.is_empty() {
                return Err(ChatError::Configuration("message is empty".into()));
            }
            let target = st.settings.primary_target()?;

            let (handle, previous) = st.cancel.begin(Domain::SingleTurn, chat_id);
            if let Some(prev) = previous {
                st.discard(&prev);
            }
            st.transition(Domain::SingleTurn, handle.op_id, PipelineState::Requesting);

            let (placeholder, messages) = match st.prepare_turn(chat_id, text) {
                Ok(p) => p,
                Err(e) => {
                    st.cancel.release(Domain::SingleTurn, handle.op_id);
                    st.transition(Domain::SingleTurn, handle.op_id, PipelineState::Idle);
                    return Err(e);
                }
            };
            st.cancel.attach_placeholder(handle.op_id, &placeholder);
            let request = ChatRequest::streaming(target.model.clone(), messages, st.settings.sampling());
            (handle, placeholder, target, request)
        };

        self.observer.on_started(&placeholder, &target.model);
        let streamed = self
            .stream_into_message(&handle, chat_id, &placeholder, &target, &request)
            .await;

        let outcome = {
            let mut st = self.lock();
            let outcome = match streamed {
                _ if handle.token.is_cancelled() => {
                    st.transcript.remove_message(chat_id, &placeholder);
                    TurnOutcome::Cancelled
                }
                Err(ChatError::Cancelled) => {
                    st.transcript.remove_message(chat_id, &placeholder);
                    TurnOutcome::Cancelled
                }
                Ok(content) => {
                    let response_time = round_seconds(started.elapsed().as_secs_f64());
                    match st.transcript.finalize_message(chat_id, &placeholder, &content, MessageKind::Text, Some(response_time)) {
                        Ok(()) => TurnOutcome::Finalized { message_id: placeholder.clone(), content, response_time },
                        Err(e) => TurnOutcome::Errored { message_id: placeholder.clone(), message: e.display_message() },
                    }
                }
                Err(e) => {
                    let message = e.display_message();
                    warn!(target: "streamchat::pipeline", chat_id = %chat_id, error = %e, "single-turn request failed");
                    let response_time = round_seconds(started.elapsed().as_secs_f64());
                    if let Err(fe) = st.transcript.finalize_message(chat_id, &placeholder, &message, MessageKind::Error, Some(response_time)) {
                        warn!(target: "streamchat::pipeline", error = %fe, "could not record error message");
                    }
                    TurnOutcome::Errored { message_id: placeholder.clone(), message }
                }
            };
            let terminal = match &outcome {
                TurnOutcome::Finalized { .. } => PipelineState::Finalized,
                TurnOutcome::Errored { .. } => PipelineState::Errored,
                TurnOutcome::Cancelled => PipelineState::Cancelled,
            };
            st.transition(Domain::SingleTurn, handle.op_id, terminal);
            st.cancel.release(Domain::SingleTurn, handle.op_id);
            outcome
        };

        match &outcome {
            TurnOutcome::Finalized { message_id, response_time, .. } => {
                info!(target: "streamchat::pipeline", chat_id = %chat_id, response_time, "turn finalized");
                self.observer.on_finalized(message_id, *response_time);
            }
            TurnOutcome::Errored { message_id, message } => self.observer.on_error(message_id, message),
            TurnOutcome::Cancelled => {
                debug!(target: "streamchat::pipeline", chat_id = %chat_id, "turn cancelled");
                self.observer.on_aborted(&placeholder);
            }
        }
        Ok(outcome)
    }

    /// Open the stream and apply each delta to the placeholder in arrival
    /// order. Returns the accumulated content.
    async fn stream_into_message(
        &self,
        handle: &LiveHandle,
        chat_id: &str,
        placeholder: &str,
        target: &EndpointTarget,
        request: &ChatRequest,
    ) -> Result<String, ChatError> {
        let token = &handle.token;
        let mut deltas = self.open(token, target, request).await?;
        self.lock().transition(Domain::SingleTurn, handle.op_id, PipelineState::Streaming);

        let mut content = String::new();
        while let Some(delta) = deltas.next_delta().await? {
            content.push_str(&delta);
            {
                let mut st = self.lock();
                if token.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }
                st.transcript.apply_partial(chat_id, placeholder, &content)?;
            }
            self.observer.on_delta_applied(placeholder, &content);
        }
        Ok(content)
    }

    /// Open a stream against `target`, abandoning the attempt as soon as
    /// `token` fires.
    pub(crate) async fn open(
        &self,
        token: &CancellationToken,
        target: &EndpointTarget,
        request: &ChatRequest,
    ) -> Result<DeltaStream, ChatError> {
        let bytes = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ChatError::Cancelled),
            opened = self.backend.open_stream(target, request) => opened?,
        };
        Ok(DeltaStream::new(bytes, token.clone()))
    }
}
