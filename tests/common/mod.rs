use async_trait::async_trait;
use chatflow::billing::{FixedPlanResolver, PlanTier};
use chatflow::chat::{
    ChatPipeline, PipelineEvent, PipelineSettings, QuotaGate, SessionStore, TitleGenerator,
};
use chatflow::config::QuotaConfig;
use chatflow::error::{ChatflowError, Result};
use chatflow::identity::StaticIdentity;
use chatflow::providers::{
    ChatStream, ModelProvider, StreamEvent, StreamRequest, Summarizer, TokenUsage,
};
use chatflow::storage::{Persistence, SqliteStorage};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const OWNER: &str = "owner-1";

#[allow(dead_code)]
pub fn create_temp_storage() -> (SqliteStorage, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("chatflow.db");
    let storage =
        SqliteStorage::new_with_path(db_path).expect("failed to create sqlite storage with path");
    (storage, tmp)
}

#[allow(dead_code)]
pub fn temp_db_path() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let path = tmp.path().join("env.db");
    (tmp, path)
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    std::fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// One scripted action of a fake response stream
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Step {
    Delta(&'static str),
    Usage(u32, u32),
    Done,
    Error(&'static str),
    Delay(u64),
    /// Stop sending without closing the stream
    Hang,
}

/// Model provider that replays one script per opened stream
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

#[allow(dead_code)]
impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn open_stream(&self, request: StreamRequest) -> Result<ChatStream> {
        self.requests.lock().expect("requests lock").push(request);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_else(|| vec![Step::Delta("ok"), Step::Done]);

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for step in script {
                let item = match step {
                    Step::Delta(text) => Ok(StreamEvent::Delta(text.to_string())),
                    Step::Usage(prompt, completion) => {
                        Ok(StreamEvent::Usage(TokenUsage::new(prompt, completion)))
                    }
                    Step::Done => Ok(StreamEvent::Done),
                    Step::Error(message) => Err(ChatflowError::Transport(message.to_string()).into()),
                    Step::Delay(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        continue;
                    }
                    Step::Hang => {
                        tx.closed().await;
                        return;
                    }
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Model provider that accepts the request but never produces a stream
#[allow(dead_code)]
pub struct StalledProvider;

#[async_trait]
impl ModelProvider for StalledProvider {
    async fn open_stream(&self, _request: StreamRequest) -> Result<ChatStream> {
        std::future::pending().await
    }
}

/// Summarizer returning a fixed title and counting calls
#[allow(dead_code)]
pub struct CountingSummarizer {
    title: String,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingSummarizer {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, _instruction: &str, _text: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.title.clone())
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub storage: Arc<dyn Persistence>,
    pub store: Arc<SessionStore>,
    pub quota: Arc<QuotaGate>,
    pub pipeline: ChatPipeline,
    pub events: mpsc::UnboundedReceiver<PipelineEvent>,
}

#[allow(dead_code)]
pub fn settings() -> PipelineSettings {
    PipelineSettings {
        model: "test-model".to_string(),
        max_history_messages: 100,
        idle_timeout: Duration::from_secs(5),
        persist_retries: 1,
    }
}

/// Wire a pipeline over `storage` for [`OWNER`] on the free plan
#[allow(dead_code)]
pub async fn build_pipeline(
    storage: Arc<dyn Persistence>,
    provider: Arc<dyn ModelProvider>,
    summarizer: Arc<dyn Summarizer>,
    limits: QuotaConfig,
    settings: PipelineSettings,
) -> Harness {
    let store = Arc::new(SessionStore::new(storage.clone(), OWNER, "Untitled Chat"));
    store.load().await.expect("load sessions");
    let quota = Arc::new(QuotaGate::new(
        storage.clone(),
        Arc::new(FixedPlanResolver(PlanTier::Free)),
        limits,
    ));
    let titles = Arc::new(TitleGenerator::new(summarizer, store.clone()));
    let (tx, events) = mpsc::unbounded_channel();
    let pipeline = ChatPipeline::new(
        store.clone(),
        quota.clone(),
        provider,
        titles,
        Arc::new(StaticIdentity::new(OWNER)),
        settings,
    )
    .with_events(tx);

    Harness {
        storage,
        store,
        quota,
        pipeline,
        events,
    }
}
