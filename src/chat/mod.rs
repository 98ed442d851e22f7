//! Chat core
//!
//! The quota gate, the session store, the streaming pipeline, title
//! generation, session grouping and per-turn telemetry.

pub mod grouping;
pub mod metrics;
pub mod pipeline;
pub mod quota;
pub mod session_store;
pub mod title;

pub use grouping::{group_sessions, SessionGroup, TimeBucket};
pub use pipeline::{
    ChatPipeline, PipelineEvent, PipelineSettings, PipelineState, TurnOutcome, STREAM_ERROR_TEXT,
};
pub use quota::{QuotaDecision, QuotaDenial, QuotaGate};
pub use session_store::{SessionStore, TurnHandles};
pub use title::TitleGenerator;
