//! ============================================================================
//! Core Types for LifeLine
//! ============================================================================
//! Data model for the simulated call lifecycle: the single active call, the
//! ephemeral incoming-call prompt, persisted call-log entries, and the events
//! surfaced to the host UI layer.
//! ============================================================================

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a call relative to the user
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Coarse call lifecycle state. Ringing is never a state here: an open
/// [`IncomingCallPrompt`] represents it and is discarded on resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Active,
}

/// Optional character sheet for a contact, fed into the outgoing-call
/// accept/reject arbitration prompt when known.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub relationship: Option<String>,
}

/// The one in-progress call. Exists only between start_call and end_call;
/// never persisted, lost if the process dies mid-call.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub contact_name: String,
    /// Tokio clock so duration math works under paused time in tests
    pub started_at: tokio::time::Instant,
    /// Transcript length at call start; the call record covers
    /// [start_index, length at end)
    pub transcript_start_index: usize,
    /// True when the caller is the host's primary chat persona, in which
    /// case assistant turns need no re-attribution
    pub is_primary_persona: bool,
    pub direction: CallDirection,
}

/// Ephemeral ringing prompt. At most one may be open; it resolves to exactly
/// one of accept, reject, or missed.
#[derive(Debug, Clone)]
pub struct IncomingCallPrompt {
    pub caller_name: String,
    pub profile: Option<ContactProfile>,
}

/// Inclusive transcript index range captured for a completed call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptRange {
    pub start: usize,
    pub end: usize,
}

impl TranscriptRange {
    /// A range is valid against a transcript of `len` turns when it is
    /// internally consistent and its end still points inside the transcript.
    pub fn is_valid_for(&self, len: usize) -> bool {
        self.start <= self.end && self.end < len
    }
}

/// Persisted call-log record, one JSON array of these per chat binding.
/// Only `summary` and `include_in_context` are mutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub id: Uuid,
    pub contact_name: String,
    pub date: chrono::DateTime<chrono::Utc>,
    pub duration_seconds: u64,
    pub summary: String,
    /// None for missed/rejected calls (no conversation happened)
    pub transcript_range: Option<TranscriptRange>,
    pub include_in_context: bool,
    pub missed: bool,
}

impl CallLogEntry {
    /// A missed/rejected record: no range, zero duration
    pub fn missed(contact_name: &str, summary: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_name: contact_name.to_string(),
            date: chrono::Utc::now(),
            duration_seconds: 0,
            summary: summary.to_string(),
            transcript_range: None,
            include_in_context: false,
            missed: true,
        }
    }
}

/// Events surfaced to the host UI layer (popup/banner/toast rendering is the
/// host's concern; this core only reports)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CallEvent {
    IncomingCall { caller: String },
    CallStarted { contact: String, direction: CallDirection },
    DurationTick { seconds: u64 },
    CallEnded { contact: String, duration_seconds: u64 },
    /// Transient, non-fatal degradation (failed summary, skipped opening line)
    Warning { message: String },
    /// User-visible failure that left state untouched (stale transcript edit)
    ErrorToast { message: String },
}

/// Sink for [`CallEvent`]s. Injected by the host; implementations must not
/// block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CallEvent);
}

/// Discards all events
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CallEvent) {}
}

/// Collects events in memory for polling hosts and tests
#[derive(Default)]
pub struct BufferSink {
    events: Mutex<Vec<CallEvent>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything emitted so far
    pub fn take(&self) -> Vec<CallEvent> {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *guard)
    }

    pub fn snapshot(&self) -> Vec<CallEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl EventSink for BufferSink {
    fn emit(&self, event: CallEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

/// Forwards events into a tokio channel
pub struct ChannelSink(pub tokio::sync::mpsc::UnboundedSender<CallEvent>);

impl EventSink for ChannelSink {
    fn emit(&self, event: CallEvent) {
        // Receiver gone means the host shut down; nothing useful to do
        let _ = self.0.send(event);
    }
}

/// Typed failures surfaced through the public API; hosts match on these to
/// pick the right user-facing message
#[derive(Debug, Clone, thiserror::Error)]
pub enum LineError {
    #[error("Call log entry not found: {0}")]
    LogNotFound(Uuid),

    #[error("No transcript recorded for call log entry {0}")]
    NoTranscript(Uuid),
}

// ============================================================================
// Shared session state
// ============================================================================

/// All cross-cutting mutable state, owned by one orchestrator instance and
/// shared by injection. Guards are checked and set inside one lock scope
/// before any suspension point; the lock is never held across an await.
#[derive(Debug, Default)]
pub struct LineState {
    /// The single active call, if any
    pub active: Option<ActiveCall>,
    /// The single open ringing prompt, if any
    pub prompt: Option<IncomingCallPrompt>,
    /// Prevents two concurrent re-attribution passes when assistant turns
    /// render back-to-back
    pub reattribution_in_flight: bool,
    /// At most one proactive attempt in flight
    pub proactive_pending: bool,
    /// Caller parked until the next assistant turn renders
    pub deferred_caller: Option<IncomingCallPrompt>,
    /// Last successful proactive fire, for the cooldown window
    pub last_fire: Option<tokio::time::Instant>,
}

impl LineState {
    pub fn call_state(&self) -> CallState {
        if self.active.is_some() {
            CallState::Active
        } else {
            CallState::Idle
        }
    }
}

/// Cloneable handle to the shared state with poison-tolerant locking
#[derive(Clone, Default)]
pub struct SharedLine(Arc<Mutex<LineState>>);

impl SharedLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, LineState> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}
