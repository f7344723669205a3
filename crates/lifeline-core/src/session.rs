//! ============================================================================
//! CallSession - the single in-progress call
//! ============================================================================
//! Owns the Idle -> Active -> Idle lifecycle and its side effects: the
//! standing role-play note, the call-connected/ended transcript entries, the
//! live duration ticker, re-attribution of assistant turns when the caller is
//! not the primary persona, and the end-of-call summary + archive record.
//!
//! start_call while active and end_call while idle are defined no-ops, not
//! errors: racing triggers are expected and first-writer-wins.
//! ============================================================================

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::LineConfig;
use crate::generation::TextGenerationService;
use crate::scheduler::TaskHandle;
use crate::store::CallLogStore;
use crate::transcript::{SpeakerRole, TranscriptView};
use crate::types::{
    ActiveCall, CallDirection, CallEvent, CallLogEntry, ContactProfile, EventSink, SharedLine,
    TranscriptRange,
};

/// State machine for one in-progress call
pub struct CallSession {
    state: SharedLine,
    transcript: Arc<dyn TranscriptView>,
    generation: Arc<dyn TextGenerationService>,
    store: Arc<CallLogStore>,
    events: Arc<dyn EventSink>,
    config: LineConfig,
    ticker: Mutex<Option<TaskHandle>>,
}

impl CallSession {
    pub fn new(
        state: SharedLine,
        transcript: Arc<dyn TranscriptView>,
        generation: Arc<dyn TextGenerationService>,
        store: Arc<CallLogStore>,
        events: Arc<dyn EventSink>,
        config: LineConfig,
    ) -> Self {
        Self {
            state,
            transcript,
            generation,
            store,
            events,
            config,
            ticker: Mutex::new(None),
        }
    }

    /// Begin a call with `contact`. Silent no-op (returns false) when a call
    /// is already active.
    pub async fn start_call(
        &self,
        contact: &str,
        profile: Option<&ContactProfile>,
        direction: CallDirection,
    ) -> Result<bool> {
        let call = {
            let mut st = self.state.lock();
            if st.active.is_some() {
                debug!("start_call while active, ignoring");
                return Ok(false);
            }
            let call = ActiveCall {
                contact_name: contact.to_string(),
                started_at: tokio::time::Instant::now(),
                transcript_start_index: self.transcript.len(),
                is_primary_persona: contact == self.config.primary_persona,
                direction,
            };
            st.active = Some(call.clone());
            call
        };

        if !call.is_primary_persona {
            let note = standing_note(contact, profile);
            if let Err(e) = self.transcript.set_standing_note(&note).await {
                warn!("Failed to install standing note: {}", e);
                self.events.emit(CallEvent::Warning {
                    message: format!("Could not set call role-play note: {}", e),
                });
            }
        }

        if let Err(e) = self
            .transcript
            .append_as(
                SpeakerRole::System,
                "System",
                &format!("📞 Call connected with {}.", contact),
            )
            .await
        {
            self.events.emit(CallEvent::ErrorToast {
                message: format!("Failed to announce call: {}", e),
            });
        }

        self.start_ticker();
        self.events.emit(CallEvent::CallStarted {
            contact: contact.to_string(),
            direction,
        });
        Ok(true)
    }

    /// End the active call: stop the ticker, clear the note, record the
    /// transcript range, summarize, and archive. Silent no-op when idle.
    /// Summarization failure never blocks the flow; the record is saved with
    /// an empty summary.
    pub async fn end_call(&self) -> Result<Option<CallLogEntry>> {
        let call = {
            let mut st = self.state.lock();
            match st.active.take() {
                Some(call) => call,
                None => {
                    debug!("end_call while idle, ignoring");
                    return Ok(None);
                }
            }
        };

        if let Some(handle) = self.ticker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.cancel();
        }

        let duration_seconds = call.started_at.elapsed().as_secs();

        if let Err(e) = self.transcript.clear_standing_note().await {
            warn!("Failed to clear standing note: {}", e);
        }

        if let Err(e) = self
            .transcript
            .append_as(
                SpeakerRole::System,
                "System",
                &format!(
                    "📵 Call with {} ended ({}).",
                    call.contact_name,
                    format_duration(duration_seconds)
                ),
            )
            .await
        {
            self.events.emit(CallEvent::ErrorToast {
                message: format!("Failed to announce call end: {}", e),
            });
        }

        // Capture the range and the slice text now, before the summary
        // request suspends; turns arriving during summarization must not
        // drift the record.
        let end_index = self.transcript.len().saturating_sub(1);
        let start = call.transcript_start_index.min(end_index);
        let range = TranscriptRange {
            start,
            end: end_index,
        };
        let conversation: String = self
            .transcript
            .slice_from(start)
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker, turn.text))
            .collect::<Vec<_>>()
            .join("\n");

        let summary = self.summarize(&call.contact_name, &conversation).await;

        let entry = CallLogEntry {
            id: Uuid::new_v4(),
            contact_name: call.contact_name.clone(),
            date: chrono::Utc::now(),
            duration_seconds,
            summary,
            transcript_range: Some(range),
            include_in_context: false,
            missed: false,
        };

        // Optimistic: a lost record on reload is acceptable for a simulation
        // feature, losing the user's call-end flow is not
        if let Err(e) = self.store.append(entry.clone(), self.transcript.len()) {
            error!("Failed to persist call log entry: {}", e);
        }

        self.events.emit(CallEvent::CallEnded {
            contact: call.contact_name,
            duration_seconds,
        });
        Ok(Some(entry))
    }

    /// Re-attribute a freshly rendered assistant turn to the simulated
    /// caller: append a copy under the contact's name, excise the original
    /// primary-persona entry. Guarded so back-to-back renders cannot run two
    /// passes at once.
    pub async fn reattribute_assistant_turn(&self, index: usize, text: &str) {
        let contact = {
            let mut st = self.state.lock();
            let Some(call) = st.active.as_ref() else {
                return;
            };
            if call.is_primary_persona {
                return;
            }
            if st.reattribution_in_flight {
                debug!("Re-attribution already in flight, skipping index {}", index);
                return;
            }
            let contact = call.contact_name.clone();
            st.reattribution_in_flight = true;
            contact
        };

        // Turns we appended ourselves already carry the contact's name
        let already_attributed = self
            .transcript
            .slice_from(index)
            .first()
            .map(|turn| turn.speaker == contact)
            .unwrap_or(true);
        if already_attributed {
            self.state.lock().reattribution_in_flight = false;
            return;
        }

        let result = async {
            self.transcript
                .append_as(SpeakerRole::Assistant, &contact, text)
                .await?;
            self.transcript.cut_range(index, index).await
        }
        .await;

        if let Err(e) = result {
            warn!("Re-attribution failed: {}", e);
            self.events.emit(CallEvent::ErrorToast {
                message: format!("Failed to re-attribute call message: {}", e),
            });
        }

        self.state.lock().reattribution_in_flight = false;
    }

    /// Summary fallback chain: dedicated route -> generic quiet generation ->
    /// empty string with a transient warning
    async fn summarize(&self, contact: &str, conversation: &str) -> String {
        let instruction = format!(
            "Summarize the following phone call with {} in 2-3 sentences. \
            Mention the key topics and how the call ended.\n\n{}",
            contact, conversation
        );

        if let Some(route) = &self.config.summary_route {
            match self.generation.raw_generate(&instruction, route).await {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) => warn!("Summary route returned empty text, falling back"),
                Err(e) => warn!("Summary route failed ({}), falling back", e),
            }
        }

        match self.generation.quiet_generate(&instruction, "system").await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Call summarization failed: {}", e);
                self.events.emit(CallEvent::Warning {
                    message: "Could not summarize the call; saved without a summary".to_string(),
                });
                String::new()
            }
        }
    }

    fn start_ticker(&self) {
        let events = self.events.clone();
        let handle = TaskHandle::new(tokio::spawn(async move {
            let mut seconds = 0u64;
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                seconds += 1;
                events.emit(CallEvent::DurationTick { seconds });
            }
        }));

        let mut guard = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = guard.replace(handle) {
            old.cancel();
        }
    }
}

fn standing_note(contact: &str, profile: Option<&ContactProfile>) -> String {
    let mut note = format!(
        "[A phone call with {contact} is in progress. Role-play strictly as \
        {contact} for the duration of the call: speak only in their voice, \
        never as anyone else, and stay on the phone.]"
    );
    if let Some(profile) = profile {
        if let Some(personality) = &profile.personality {
            note.push_str(&format!(" [Personality: {}]", personality));
        }
        if let Some(relationship) = &profile.relationship {
            note.push_str(&format!(" [Relationship to the user: {}]", relationship));
        }
    }
    note
}

fn format_duration(seconds: u64) -> String {
    if seconds >= 60 {
        format!("{}m {:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}
