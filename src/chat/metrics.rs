//! Telemetry for streamed chat turns
//!
//! Records one set of measurements per turn through the `metrics` facade.
//! No exporter is installed by this crate; embedders choose one.
//!
//! # Metrics
//!
//! - `chat_turns_total`: Counter of turns that passed validation
//! - `chat_turn_outcomes_total`: Counter of finished turns by outcome
//! - `chat_turn_duration_seconds`: Histogram of turn duration by outcome
//! - `chat_stream_chunks`: Histogram of content deltas received per turn
//! - `chat_tokens_consumed`: Histogram of total tokens reported per turn
//! - `chat_active_streams`: Gauge of turns currently streaming
//!
//! # Examples
//!
//! ```
//! use chatflow::chat::metrics::TurnMetrics;
//!
//! let metrics = TurnMetrics::new("gpt-4o-mini");
//! metrics.record_chunk();
//! metrics.record_outcome("completed", Some(42));
//! ```

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collection for a single turn
///
/// The outcome is recorded at most once; later calls are ignored.
#[derive(Debug)]
pub struct TurnMetrics {
    model: String,
    start: Instant,
    chunks: AtomicU64,
    recorded: AtomicBool,
}

impl TurnMetrics {
    /// Start tracking a turn for `model`
    ///
    /// Increments the turn counter and the active stream gauge.
    pub fn new(model: &str) -> Self {
        increment_counter!("chat_turns_total", "model" => model.to_string());
        increment_gauge!("chat_active_streams", 1.0);

        Self {
            model: model.to_string(),
            start: Instant::now(),
            chunks: AtomicU64::new(0),
            recorded: AtomicBool::new(false),
        }
    }

    /// Count one content delta
    pub fn record_chunk(&self) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of deltas counted so far
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    /// Record how the turn ended
    ///
    /// # Arguments
    ///
    /// * `outcome` - "completed", "cancelled", "failed", or "persist_failed"
    /// * `total_tokens` - Total tokens reported by the provider, if any
    pub fn record_outcome(&self, outcome: &str, total_tokens: Option<u32>) {
        if self.recorded.swap(true, Ordering::SeqCst) {
            return;
        }

        histogram!(
            "chat_turn_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "model" => self.model.clone(),
            "outcome" => outcome.to_string()
        );

        histogram!(
            "chat_stream_chunks",
            self.chunks() as f64,
            "model" => self.model.clone()
        );

        if let Some(tokens) = total_tokens {
            histogram!(
                "chat_tokens_consumed",
                f64::from(tokens),
                "model" => self.model.clone()
            );
        }

        increment_counter!(
            "chat_turn_outcomes_total",
            "model" => self.model.clone(),
            "outcome" => outcome.to_string()
        );

        decrement_gauge!("chat_active_streams", 1.0);
    }

    /// Whether an outcome has been recorded
    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::SeqCst)
    }
}

impl Drop for TurnMetrics {
    fn drop(&mut self) {
        if !self.is_recorded() {
            self.record_outcome("dropped", None);
        }
    }
}
