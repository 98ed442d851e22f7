//! Streaming message pipeline
//!
//! Drives one turn at a time through
//! `Idle -> Submitting -> AwaitingSession -> Streaming -> Finalizing -> Idle`,
//! with `Errored` reachable from any in-flight state. Every path out of
//! [`ChatPipeline::submit`] leaves the pipeline in `Idle` or `Errored`;
//! only input validation, caller identity and a busy pipeline are reported
//! as `Err` before anything is touched.

use super::metrics::TurnMetrics;
use super::quota::{QuotaDenial, QuotaGate};
use super::session_store::{SessionStore, TurnHandles};
use super::title::{is_default_title, TitleGenerator};
use crate::config::Config;
use crate::error::{ChatflowError, Result};
use crate::identity::IdentityProvider;
use crate::providers::{ChatStream, ModelProvider, StreamEvent, StreamRequest, TokenUsage};
use crate::storage::MessageStatus;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Text shown in place of a reply whose stream failed
pub const STREAM_ERROR_TEXT: &str = "Sorry, there was an error generating the response.";

/// Text shown when a finished reply could not be saved
pub const PERSIST_ERROR_TEXT: &str = "The response could not be saved.";

/// Text shown when the quota gate cannot be consulted
pub const QUOTA_UNAVAILABLE_TEXT: &str =
    "Unable to verify your usage limits right now. Please try again shortly.";

/// Pipeline lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    /// Ready for a new turn
    Idle,
    /// Validating and checking quota
    Submitting,
    /// Creating the session for the first turn
    AwaitingSession,
    /// Reading deltas from the provider
    Streaming,
    /// Persisting the completed reply
    Finalizing,
    /// Last turn failed; carries the user-facing message
    Errored(String),
}

impl PipelineState {
    /// Whether a new turn may start
    pub fn accepts_submit(&self) -> bool {
        matches!(self, PipelineState::Idle | PipelineState::Errored(_))
    }
}

/// Progress notifications for observers
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// The pipeline moved to a new state
    StateChanged(PipelineState),
    /// A session was created for the turn
    SessionCreated {
        /// New session id
        session_id: String,
    },
    /// A fragment was appended to the streaming reply
    Delta {
        /// Session being written
        session_id: String,
        /// Placeholder message id
        message_id: String,
        /// Fragment just received
        delta: String,
        /// Reply content after the fragment was applied
        content: String,
    },
    /// Synthetic assistant notice that is not stored
    Notice(String),
}

/// How a submitted turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// Reply streamed, persisted and billed
    Completed {
        /// Session the turn belongs to
        session_id: String,
        /// Assistant message id
        message_id: String,
        /// Final reply
        content: String,
        /// Token usage reported by the provider
        usage: Option<TokenUsage>,
        /// Background title task, started after the first exchange only
        title_task: Option<JoinHandle<()>>,
    },
    /// Gate refused the turn; nothing was created
    QuotaDenied {
        /// Which limit was hit
        reason: QuotaDenial,
        /// Text shown to the user
        notice: String,
    },
    /// Caller stopped the stream; partial content kept, nothing billed
    Cancelled {
        /// Session the turn belongs to
        session_id: String,
        /// Assistant message id
        message_id: String,
        /// Content received before cancellation
        partial: String,
    },
    /// Turn failed; `message` is safe to show to the user
    Failed {
        /// Session the turn belongs to, if one was reached
        session_id: Option<String>,
        /// Assistant message id, if one was created
        message_id: Option<String>,
        /// User-facing description
        message: String,
    },
}

/// Tunables for the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Model requested from the provider
    pub model: String,
    /// Most recent messages sent as context
    pub max_history_messages: usize,
    /// Abort the stream after this long without a frame
    pub idle_timeout: Duration,
    /// Extra persistence attempts when finalizing
    pub persist_retries: u32,
}

impl PipelineSettings {
    /// Settings drawn from the loaded configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.provider.openai.model.clone(),
            max_history_messages: config.chat.max_history_messages,
            idle_timeout: Duration::from_secs(config.chat.stream_idle_timeout_seconds),
            persist_retries: config.chat.persist_retries,
        }
    }
}

enum StreamEnd {
    Done,
    Cancelled,
    Failed(anyhow::Error),
}

/// Returns the pipeline to `Idle` if a turn is abandoned mid-flight
struct BusyGuard<'a> {
    state: &'a watch::Sender<PipelineState>,
    armed: bool,
}

impl BusyGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("Turn abandoned before completion; resetting pipeline");
            self.state.send_replace(PipelineState::Idle);
        }
    }
}

/// One conversation view's turn driver
///
/// The pipeline mutates sessions only through the shared [`SessionStore`].
pub struct ChatPipeline {
    store: Arc<SessionStore>,
    quota: Arc<QuotaGate>,
    provider: Arc<dyn ModelProvider>,
    titles: Arc<TitleGenerator>,
    identity: Arc<dyn IdentityProvider>,
    settings: PipelineSettings,
    active_session: Mutex<Option<String>>,
    state: watch::Sender<PipelineState>,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl ChatPipeline {
    /// Create an idle pipeline with no active session
    pub fn new(
        store: Arc<SessionStore>,
        quota: Arc<QuotaGate>,
        provider: Arc<dyn ModelProvider>,
        titles: Arc<TitleGenerator>,
        identity: Arc<dyn IdentityProvider>,
        settings: PipelineSettings,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            store,
            quota,
            provider,
            titles,
            identity,
            settings,
            active_session: Mutex::new(None),
            state,
            events: None,
        }
    }

    /// Send progress events to `tx`
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Current state
    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Model used for new turns
    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// Session the next turn is appended to
    pub async fn active_session(&self) -> Option<String> {
        self.active_session.lock().await.clone()
    }

    /// Choose the session for the next turn; `None` starts a new one
    pub async fn set_active_session(&self, session_id: Option<String>) {
        *self.active_session.lock().await = session_id;
    }

    /// Clear an `Errored` state
    pub fn acknowledge(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, PipelineState::Errored(_)) {
                *state = PipelineState::Idle;
                true
            } else {
                false
            }
        });
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn transition(&self, next: PipelineState) {
        tracing::debug!(state = ?next, "Pipeline transition");
        self.state.send_replace(next.clone());
        self.emit(PipelineEvent::StateChanged(next));
    }

    /// Run one turn
    ///
    /// # Errors
    ///
    /// Returns `Validation` for blank input, `Unauthorized` when the caller
    /// cannot be identified or does not own the store, and `PipelineBusy`
    /// while another turn is in flight. All later failures are reported
    /// through [`TurnOutcome`].
    pub async fn submit(&self, text: &str, cancel: CancellationToken) -> Result<TurnOutcome> {
        let input = text.trim();
        if input.is_empty() {
            return Err(ChatflowError::Validation("Message must not be empty".into()).into());
        }

        let owner_id = self.identity.current_owner_id().await?;
        if owner_id != self.store.owner_id() {
            return Err(ChatflowError::Unauthorized(format!(
                "Caller {} does not own this session list",
                owner_id
            ))
            .into());
        }

        let claimed = self.state.send_if_modified(|state| {
            if state.accepts_submit() {
                *state = PipelineState::Submitting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ChatflowError::PipelineBusy("A response is already in progress".into()).into());
        }
        self.emit(PipelineEvent::StateChanged(PipelineState::Submitting));

        let mut guard = BusyGuard {
            state: &self.state,
            armed: true,
        };
        let outcome = self.run_turn(&owner_id, input, cancel).await;
        guard.disarm();
        Ok(outcome)
    }

    async fn run_turn(&self, owner_id: &str, input: &str, cancel: CancellationToken) -> TurnOutcome {
        match self.quota.check_quota(owner_id).await {
            Ok(decision) => {
                if let Some(reason) = decision.reason {
                    let notice = reason.notice().to_string();
                    self.emit(PipelineEvent::Notice(notice.clone()));
                    self.transition(PipelineState::Idle);
                    return TurnOutcome::QuotaDenied { reason, notice };
                }
            }
            Err(e) => {
                tracing::error!(owner_id = %owner_id, "Quota gate unavailable: {:#}", e);
                return self.fail(None, None, QUOTA_UNAVAILABLE_TEXT);
            }
        }

        let session_id = match self.resolve_session().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Failed to create session: {:#}", e);
                return self.fail(None, None, STREAM_ERROR_TEXT);
            }
        };

        let handles = match self
            .store
            .begin_turn(
                &session_id,
                input,
                &self.settings.model,
                self.settings.max_history_messages,
            )
            .await
        {
            Ok(handles) => handles,
            Err(e) => {
                tracing::error!(session_id = %session_id, "Failed to start turn: {:#}", e);
                return self.fail(Some(session_id), None, STREAM_ERROR_TEXT);
            }
        };

        self.transition(PipelineState::Streaming);
        let metrics = TurnMetrics::new(&self.settings.model);
        let request = StreamRequest {
            history: handles.history.clone(),
            input: input.to_string(),
            model: self.settings.model.clone(),
            session_id: session_id.clone(),
        };

        let mut usage = None;
        let end = self
            .read_stream(request, &session_id, &handles, &cancel, &metrics, &mut usage)
            .await;

        match end {
            StreamEnd::Done => {
                self.finalize(owner_id, &session_id, &handles, usage, &metrics)
                    .await
            }
            StreamEnd::Cancelled => self.cancelled(&session_id, &handles, &metrics).await,
            StreamEnd::Failed(e) => self.failed(&session_id, &handles, e, &metrics).await,
        }
    }

    async fn resolve_session(&self) -> Result<String> {
        let mut active = self.active_session.lock().await;
        if let Some(id) = active.as_ref() {
            if self.store.session(id).await.is_some() {
                return Ok(id.clone());
            }
            tracing::warn!(session_id = %id, "Active session no longer exists; starting a new one");
        }

        self.transition(PipelineState::AwaitingSession);
        let id = self.store.create_session().await?;
        *active = Some(id.clone());
        self.emit(PipelineEvent::SessionCreated {
            session_id: id.clone(),
        });
        Ok(id)
    }

    async fn read_stream(
        &self,
        request: StreamRequest,
        session_id: &str,
        handles: &TurnHandles,
        cancel: &CancellationToken,
        metrics: &TurnMetrics,
        usage: &mut Option<TokenUsage>,
    ) -> StreamEnd {
        let idle = self.settings.idle_timeout;
        let mut stream: ChatStream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            opened = tokio::time::timeout(idle, self.provider.open_stream(request)) => match opened {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return StreamEnd::Failed(e),
                Err(_) => {
                    return StreamEnd::Failed(
                        ChatflowError::StreamTimeout {
                            seconds: idle.as_secs(),
                        }
                        .into(),
                    )
                }
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    return StreamEnd::Failed(
                        ChatflowError::StreamTimeout {
                            seconds: idle.as_secs(),
                        }
                        .into(),
                    )
                }
                Ok(None) | Ok(Some(Ok(StreamEvent::Done))) => return StreamEnd::Done,
                Ok(Some(Err(e))) => return StreamEnd::Failed(e),
                Ok(Some(Ok(StreamEvent::Usage(reported)))) => *usage = Some(reported),
                Ok(Some(Ok(StreamEvent::Delta(delta)))) => {
                    let content = match self
                        .store
                        .append_delta(session_id, &handles.assistant_message_id, &delta)
                        .await
                    {
                        Ok(content) => content,
                        Err(e) => return StreamEnd::Failed(e),
                    };
                    metrics.record_chunk();
                    self.emit(PipelineEvent::Delta {
                        session_id: session_id.to_string(),
                        message_id: handles.assistant_message_id.clone(),
                        delta,
                        content,
                    });
                }
            }
        }
    }

    async fn finalize(
        &self,
        owner_id: &str,
        session_id: &str,
        handles: &TurnHandles,
        usage: Option<TokenUsage>,
        metrics: &TurnMetrics,
    ) -> TurnOutcome {
        self.transition(PipelineState::Finalizing);

        let message = match self
            .store
            .finish_message(
                session_id,
                &handles.assistant_message_id,
                MessageStatus::Complete,
                None,
                usage,
            )
            .await
        {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(session_id = %session_id, "Failed to finalize reply: {:#}", e);
                metrics.record_outcome("failed", None);
                return self.fail(
                    Some(session_id.to_string()),
                    Some(handles.assistant_message_id.clone()),
                    STREAM_ERROR_TEXT,
                );
            }
        };

        if let Err(e) = self.persist_with_retry(session_id, handles).await {
            tracing::error!(
                session_id = %session_id,
                "Giving up on saving the reply after {} attempts: {:#}",
                self.settings.persist_retries + 1,
                e
            );
            metrics.record_outcome("persist_failed", None);
            return self.fail(
                Some(session_id.to_string()),
                Some(handles.assistant_message_id.clone()),
                PERSIST_ERROR_TEXT,
            );
        }

        if let Err(e) = self.quota.increment_usage(owner_id).await {
            tracing::error!(owner_id = %owner_id, "Failed to record usage: {:#}", e);
        }

        let title_task = if self.store.completed_exchanges(session_id).await == 1 {
            let prefix = self.store.default_session_name();
            self.store
                .session(session_id)
                .await
                .filter(|session| is_default_title(&session.name, prefix))
                .and_then(|session| {
                    session
                        .messages
                        .iter()
                        .find(|m| m.id == handles.user_message_id)
                        .map(|first| {
                            self.titles
                                .spawn(session_id.to_string(), first.content.clone())
                        })
                })
        } else {
            None
        };

        metrics.record_outcome("completed", usage.map(|u| u.total_tokens));
        tracing::info!(
            session_id = %session_id,
            message_id = %message.id,
            chunks = metrics.chunks(),
            "Turn completed"
        );
        self.transition(PipelineState::Idle);

        TurnOutcome::Completed {
            session_id: session_id.to_string(),
            message_id: message.id,
            content: message.content,
            usage,
            title_task,
        }
    }

    async fn persist_with_retry(&self, session_id: &str, handles: &TurnHandles) -> Result<()> {
        let ids = [
            handles.user_message_id.clone(),
            handles.assistant_message_id.clone(),
        ];
        let mut attempt = 0;
        loop {
            match self.store.persist_turn(session_id, &ids).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.settings.persist_retries => {
                    attempt += 1;
                    tracing::warn!(
                        session_id = %session_id,
                        attempt,
                        "Saving reply failed, retrying: {:#}",
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn cancelled(
        &self,
        session_id: &str,
        handles: &TurnHandles,
        metrics: &TurnMetrics,
    ) -> TurnOutcome {
        let partial = match self
            .store
            .finish_message(
                session_id,
                &handles.assistant_message_id,
                MessageStatus::Cancelled,
                None,
                None,
            )
            .await
        {
            Ok(message) => message.content,
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Cancelled reply is gone: {:#}", e);
                String::new()
            }
        };

        metrics.record_outcome("cancelled", None);
        tracing::info!(session_id = %session_id, chunks = metrics.chunks(), "Turn cancelled");
        self.transition(PipelineState::Idle);

        TurnOutcome::Cancelled {
            session_id: session_id.to_string(),
            message_id: handles.assistant_message_id.clone(),
            partial,
        }
    }

    async fn failed(
        &self,
        session_id: &str,
        handles: &TurnHandles,
        cause: anyhow::Error,
        metrics: &TurnMetrics,
    ) -> TurnOutcome {
        tracing::error!(session_id = %session_id, "Response stream failed: {:#}", cause);

        match self
            .store
            .finish_message(
                session_id,
                &handles.assistant_message_id,
                MessageStatus::Errored,
                Some(STREAM_ERROR_TEXT.to_string()),
                None,
            )
            .await
        {
            Ok(_) => {
                let ids = [
                    handles.user_message_id.clone(),
                    handles.assistant_message_id.clone(),
                ];
                if let Err(e) = self.store.persist_turn(session_id, &ids).await {
                    tracing::warn!(session_id = %session_id, "Failed to save errored turn: {:#}", e);
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Errored reply is gone: {:#}", e);
            }
        }

        metrics.record_outcome("failed", None);
        self.fail(
            Some(session_id.to_string()),
            Some(handles.assistant_message_id.clone()),
            STREAM_ERROR_TEXT,
        )
    }

    fn fail(
        &self,
        session_id: Option<String>,
        message_id: Option<String>,
        message: &str,
    ) -> TurnOutcome {
        self.transition(PipelineState::Errored(message.to_string()));
        TurnOutcome::Failed {
            session_id,
            message_id,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::FixedPlanResolver;
    use crate::billing::PlanTier;
    use crate::config::QuotaConfig;
    use crate::identity::StaticIdentity;
    use crate::providers::base::{MockModelProvider, MockSummarizer};
    use crate::storage::{MemoryStorage, Persistence, StorageOp};

    struct Harness {
        storage: Arc<MemoryStorage>,
        store: Arc<SessionStore>,
        pipeline: ChatPipeline,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            model: "test-model".to_string(),
            max_history_messages: 100,
            idle_timeout: Duration::from_secs(5),
            persist_retries: 1,
        }
    }

    fn events(items: Vec<Result<StreamEvent>>) -> ChatStream {
        Box::pin(futures::stream::iter(items))
    }

    fn harness(provider: MockModelProvider, summarizer: MockSummarizer) -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(SessionStore::new(storage.clone(), "owner", "Untitled Chat"));
        let quota = Arc::new(QuotaGate::new(
            storage.clone(),
            Arc::new(FixedPlanResolver(PlanTier::Free)),
            QuotaConfig::default(),
        ));
        let titles = Arc::new(TitleGenerator::new(Arc::new(summarizer), store.clone()));
        let pipeline = ChatPipeline::new(
            store.clone(),
            quota,
            Arc::new(provider),
            titles,
            Arc::new(StaticIdentity::new("owner")),
            settings(),
        );
        Harness {
            storage,
            store,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_blank_input_is_rejected_without_state_change() {
        let h = harness(MockModelProvider::new(), MockSummarizer::new());
        let err = h
            .pipeline
            .submit("   ", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatflowError>(),
            Some(ChatflowError::Validation(_))
        ));
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert_eq!(h.storage.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_completed_turn_persists_and_bills_once() {
        let mut provider = MockModelProvider::new();
        provider.expect_open_stream().times(1).returning(|request| {
            assert!(request.history.is_empty());
            assert_eq!(request.input, "hello");
            Ok(events(vec![
                Ok(StreamEvent::Delta("Hi".to_string())),
                Ok(StreamEvent::Delta("!".to_string())),
                Ok(StreamEvent::Usage(TokenUsage::new(5, 2))),
                Ok(StreamEvent::Done),
            ]))
        });
        let mut summarizer = MockSummarizer::new();
        summarizer
            .expect_summarize()
            .times(1)
            .returning(|_, _| Ok("Greeting".to_string()));
        let h = harness(provider, summarizer);

        let outcome = h
            .pipeline
            .submit("hello", CancellationToken::new())
            .await
            .expect("submit");
        let (session_id, content, usage, title_task) = match outcome {
            TurnOutcome::Completed {
                session_id,
                content,
                usage,
                title_task,
                ..
            } => (session_id, content, usage, title_task),
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(content, "Hi!");
        assert_eq!(usage.map(|u| u.total_tokens), Some(7));
        title_task.expect("title task").await.expect("join");

        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert_eq!(h.storage.increment_calls().await, 1);
        let stored = h.storage.list_messages(&session_id).await.expect("list");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "Hi!");
        assert_eq!(stored[1].completion_tokens, Some(2));
        assert_eq!(
            h.store.session(&session_id).await.expect("session").name,
            "Greeting"
        );
    }

    #[tokio::test]
    async fn test_malformed_transport_error_keeps_error_message() {
        let mut provider = MockModelProvider::new();
        provider.expect_open_stream().returning(|_| {
            Ok(events(vec![
                Ok(StreamEvent::Delta("partial".to_string())),
                Err(ChatflowError::Transport("connection reset".into()).into()),
            ]))
        });
        let h = harness(provider, MockSummarizer::new());

        let outcome = h
            .pipeline
            .submit("hello", CancellationToken::new())
            .await
            .expect("submit");
        let (session_id, message) = match outcome {
            TurnOutcome::Failed {
                session_id: Some(session_id),
                message,
                ..
            } => (session_id, message),
            other => panic!("expected failure, got {:?}", other),
        };
        assert_eq!(message, STREAM_ERROR_TEXT);
        assert_eq!(
            h.pipeline.state(),
            PipelineState::Errored(STREAM_ERROR_TEXT.to_string())
        );
        assert_eq!(h.storage.increment_calls().await, 0);

        let stored = h.storage.list_messages(&session_id).await.expect("list");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, STREAM_ERROR_TEXT);
        assert_eq!(stored[1].status, MessageStatus::Errored);
    }

    #[tokio::test]
    async fn test_errored_pipeline_accepts_next_submit() {
        let mut provider = MockModelProvider::new();
        let mut calls = 0;
        provider.expect_open_stream().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(ChatflowError::Transport("refused".into()).into())
            } else {
                Ok(events(vec![
                    Ok(StreamEvent::Delta("ok".to_string())),
                    Ok(StreamEvent::Done),
                ]))
            }
        });
        let mut summarizer = MockSummarizer::new();
        summarizer
            .expect_summarize()
            .returning(|_, _| Ok("Title".to_string()));
        let h = harness(provider, summarizer);

        let first = h
            .pipeline
            .submit("one", CancellationToken::new())
            .await
            .expect("submit");
        assert!(matches!(first, TurnOutcome::Failed { .. }));
        assert!(matches!(h.pipeline.state(), PipelineState::Errored(_)));

        let second = h
            .pipeline
            .submit("two", CancellationToken::new())
            .await
            .expect("submit");
        assert!(matches!(second, TurnOutcome::Completed { .. }));
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_persist_failure_is_not_billed_and_keeps_content() {
        let mut provider = MockModelProvider::new();
        provider.expect_open_stream().returning(|_| {
            Ok(events(vec![
                Ok(StreamEvent::Delta("kept".to_string())),
                Ok(StreamEvent::Done),
            ]))
        });
        let h = harness(provider, MockSummarizer::new());
        let session_id = h.store.create_session().await.expect("create");
        h.pipeline.set_active_session(Some(session_id.clone())).await;
        h.storage.fail_on(StorageOp::UpsertMessages).await;

        let outcome = h
            .pipeline
            .submit("hello", CancellationToken::new())
            .await
            .expect("submit");
        assert!(matches!(
            outcome,
            TurnOutcome::Failed { ref message, .. } if message == PERSIST_ERROR_TEXT
        ));
        assert_eq!(h.storage.increment_calls().await, 0);
        let session = h.store.session(&session_id).await.expect("session");
        assert_eq!(session.messages[1].content, "kept");
    }

    #[tokio::test]
    async fn test_quota_unavailable_fails_closed() {
        let h = harness(MockModelProvider::new(), MockSummarizer::new());
        h.storage.fail_on(StorageOp::Quota).await;

        let outcome = h
            .pipeline
            .submit("hello", CancellationToken::new())
            .await
            .expect("submit");
        assert!(matches!(
            outcome,
            TurnOutcome::Failed { ref message, .. } if message == QUOTA_UNAVAILABLE_TEXT
        ));
        assert_eq!(h.storage.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_owner_is_unauthorized() {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(SessionStore::new(storage.clone(), "owner", "Untitled Chat"));
        let quota = Arc::new(QuotaGate::new(
            storage.clone(),
            Arc::new(FixedPlanResolver(PlanTier::Free)),
            QuotaConfig::default(),
        ));
        let titles = Arc::new(TitleGenerator::new(
            Arc::new(MockSummarizer::new()),
            store.clone(),
        ));
        let pipeline = ChatPipeline::new(
            store,
            quota,
            Arc::new(MockModelProvider::new()),
            titles,
            Arc::new(StaticIdentity::new("someone-else")),
            settings(),
        );

        let err = pipeline
            .submit("hi", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatflowError>(),
            Some(ChatflowError::Unauthorized(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_acknowledge_clears_errored_only() {
        let h = harness(MockModelProvider::new(), MockSummarizer::new());
        h.pipeline.acknowledge();
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        h.pipeline
            .transition(PipelineState::Errored("x".to_string()));
        h.pipeline.acknowledge();
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
    }
}
