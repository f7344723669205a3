//! ============================================================================
//! CallOrchestrator - the host-facing facade
//! ============================================================================
//! One orchestrator per chat binding. Owns the shared line state and wires
//! the session, scheduler, and classifier together; the host talks to this
//! type only. Every host event funnels through handle_assistant_turn, so the
//! active-call branch (re-attribution) and the idle branch (deferred release,
//! call detection) can never interleave incoherently for one turn.
//! ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::IncomingCallClassifier;
use crate::config::LineConfig;
use crate::generation::TextGenerationService;
use crate::scheduler::{ProactiveCallScheduler, TriggerOptions, TriggerOutcome};
use crate::session::CallSession;
use crate::store::CallLogStore;
use crate::transcript::{SpeakerRole, TranscriptEventSource, TranscriptView};
use crate::types::{
    CallDirection, CallEvent, CallLogEntry, CallState, ContactProfile, EventSink,
    IncomingCallPrompt, LineError, SharedLine,
};

const SUMMARY_MISSED: &str = "Missed call";
const SUMMARY_REJECTED: &str = "Call rejected";
const SUMMARY_DECLINED: &str = "Declined call";

/// Result of an outgoing dial attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    /// The contact picked up; a call is now active
    Connected,
    /// The contact declined; a declined-call record was archived
    Declined,
    /// A call or ringing prompt was already open
    Busy,
}

/// Facade over the call subsystem for one chat binding
pub struct CallOrchestrator {
    state: SharedLine,
    transcript: Arc<dyn TranscriptView>,
    generation: Arc<dyn TextGenerationService>,
    store: Arc<CallLogStore>,
    events: Arc<dyn EventSink>,
    config: LineConfig,
    session: CallSession,
    scheduler: ProactiveCallScheduler,
    classifier: IncomingCallClassifier,
}

impl CallOrchestrator {
    pub fn new(
        transcript: Arc<dyn TranscriptView>,
        generation: Arc<dyn TextGenerationService>,
        store: Arc<CallLogStore>,
        events: Arc<dyn EventSink>,
        config: LineConfig,
    ) -> Self {
        let state = SharedLine::new();
        let session = CallSession::new(
            state.clone(),
            transcript.clone(),
            generation.clone(),
            store.clone(),
            events.clone(),
            config.clone(),
        );
        let scheduler = ProactiveCallScheduler::new(state.clone(), events.clone(), config.clone());
        let classifier =
            IncomingCallClassifier::new(generation.clone(), config.confidence_threshold);

        Self {
            state,
            transcript,
            generation,
            store,
            events,
            config,
            session,
            scheduler,
            classifier,
        }
    }

    // ========================================================================
    // Call lifecycle
    // ========================================================================

    /// User-initiated outgoing call. The contact decides whether to pick up
    /// via one quiet generation; arbitration failures connect anyway (the
    /// phone working is the default, the AI veto is the extra).
    pub async fn dial(&self, contact: &str, profile: Option<ContactProfile>) -> Result<DialOutcome> {
        {
            let st = self.state.lock();
            if st.active.is_some() || st.prompt.is_some() {
                debug!("dial while line busy, ignoring");
                return Ok(DialOutcome::Busy);
            }
        }

        if !self.arbitrate_pickup(contact, profile.as_ref()).await {
            info!("{} declined the outgoing call", contact);
            if let Err(e) = self
                .transcript
                .append_as(
                    SpeakerRole::System,
                    "System",
                    &format!("📵 {} declined your call.", contact),
                )
                .await
            {
                self.events.emit(CallEvent::ErrorToast {
                    message: format!("Failed to announce declined call: {}", e),
                });
            }
            // Losing the record beats losing the user's dial flow
            if let Err(e) = self
                .store
                .append(CallLogEntry::missed(contact, SUMMARY_DECLINED), self.transcript.len())
            {
                error!("Failed to persist declined-call record: {}", e);
            }
            return Ok(DialOutcome::Declined);
        }

        // The arbitration awaited; the line may have gotten busy meanwhile
        if self
            .session
            .start_call(contact, profile.as_ref(), CallDirection::Outgoing)
            .await?
        {
            Ok(DialOutcome::Connected)
        } else {
            Ok(DialOutcome::Busy)
        }
    }

    /// Answer the open ringing prompt. Returns false when none is open.
    /// The caller speaks first: one generated opening line seeded with the
    /// recent conversation, skipped with a warning when generation fails.
    pub async fn accept_incoming(&self) -> Result<bool> {
        let prompt = {
            let mut st = self.state.lock();
            match st.prompt.take() {
                Some(prompt) => prompt,
                None => return Ok(false),
            }
        };

        let started = self
            .session
            .start_call(
                &prompt.caller_name,
                prompt.profile.as_ref(),
                CallDirection::Incoming,
            )
            .await?;
        if started {
            self.speak_as_caller(
                &prompt.caller_name,
                &format!(
                    "The phone call with {} just connected. Write {}'s opening line on \
                    the call, one or two sentences.",
                    prompt.caller_name, prompt.caller_name
                ),
                "Skipped the caller's opening line",
            )
            .await;
        }
        Ok(started)
    }

    /// Decline the open ringing prompt; archives a rejected-call record.
    pub async fn reject_incoming(&self) -> Result<bool> {
        let Some(prompt) = self.take_prompt() else {
            return Ok(false);
        };
        let narration = format!("📵 You declined the call from {}.", prompt.caller_name);
        self.archive_unanswered(&prompt, SUMMARY_REJECTED, &narration)
            .await
    }

    /// Dismiss the open ringing prompt without answering (timeout, closed
    /// popup); archives a missed-call record.
    pub async fn dismiss_incoming(&self) -> Result<bool> {
        let Some(prompt) = self.take_prompt() else {
            return Ok(false);
        };
        let narration = format!("📵 You missed a call from {}.", prompt.caller_name);
        self.archive_unanswered(&prompt, SUMMARY_MISSED, &narration)
            .await
    }

    fn take_prompt(&self) -> Option<IncomingCallPrompt> {
        self.state.lock().prompt.take()
    }

    /// Shared tail of reject/dismiss: narrate the resolution, archive one
    /// missed-type record, and let the caller react in chat
    async fn archive_unanswered(
        &self,
        prompt: &IncomingCallPrompt,
        summary: &str,
        narration: &str,
    ) -> Result<bool> {
        info!("Incoming call from {} resolved: {}", prompt.caller_name, summary);

        if let Err(e) = self
            .transcript
            .append_as(SpeakerRole::System, "System", narration)
            .await
        {
            self.events.emit(CallEvent::ErrorToast {
                message: format!("Failed to announce unanswered call: {}", e),
            });
        }

        // Optimistic: the resolution still narrates and the caller still
        // reacts even when the archive write fails
        if let Err(e) = self.store.append(
            CallLogEntry::missed(&prompt.caller_name, summary),
            self.transcript.len(),
        ) {
            error!("Failed to persist unanswered-call record: {}", e);
        }

        self.speak_as_caller(
            &prompt.caller_name,
            &format!(
                "{} tried to call the user just now but the call went unanswered. \
                Write {}'s next chat message reacting to that, one or two sentences.",
                prompt.caller_name, prompt.caller_name
            ),
            "Skipped the caller's reaction",
        )
        .await;
        Ok(true)
    }

    /// Generate one line in `caller`'s voice, seeded with the last few turns,
    /// and append it under their name. Failures skip the line with a warning.
    async fn speak_as_caller(&self, caller: &str, instruction: &str, skip_note: &str) {
        let context: String = self
            .transcript
            .slice_from(self.transcript.len().saturating_sub(6))
            .iter()
            .map(|turn| format!("{}: {}", turn.speaker, turn.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!("Recent conversation:\n{}\n\n{}", context, instruction);

        match self.generation.quiet_generate(&prompt, caller).await {
            Ok(line) if !line.trim().is_empty() => {
                if let Err(e) = self
                    .transcript
                    .append_as(SpeakerRole::Assistant, caller, line.trim())
                    .await
                {
                    self.events.emit(CallEvent::ErrorToast {
                        message: format!("Failed to append {}'s line: {}", caller, e),
                    });
                }
            }
            Ok(_) => {
                warn!("{}: empty generation", skip_note);
                self.events.emit(CallEvent::Warning {
                    message: skip_note.to_string(),
                });
            }
            Err(e) => {
                warn!("{}: {}", skip_note, e);
                self.events.emit(CallEvent::Warning {
                    message: skip_note.to_string(),
                });
            }
        }
    }

    /// End the active call; no-op when idle.
    pub async fn hang_up(&self) -> Result<Option<CallLogEntry>> {
        self.session.end_call().await
    }

    // ========================================================================
    // Host events
    // ========================================================================

    /// Single entry point for "an assistant turn at `index` finished
    /// rendering". During a call this re-attributes the turn; while idle it
    /// releases a parked proactive trigger and screens the text for an
    /// in-fiction incoming call.
    pub async fn handle_assistant_turn(&self, index: usize, text: &str) {
        if self.state.lock().active.is_some() {
            self.classifier.note_rendered(index);
            self.session.reattribute_assistant_turn(index, text).await;
            return;
        }

        self.scheduler.notify_assistant_turn().await;

        if self.classifier.classify(index, text).await {
            // The fiction says the phone is ringing, so the draw and the
            // cooldown do not apply; the at-most-one guards still do
            let outcome = self
                .scheduler
                .maybe_trigger(
                    &self.config.primary_persona,
                    None,
                    100,
                    TriggerOptions {
                        force: true,
                        ..Default::default()
                    },
                )
                .await;
            if outcome != TriggerOutcome::Shown {
                debug!("Detected incoming call not shown: {:?}", outcome);
            }
        }
    }

    /// Subscribe this orchestrator to a host transcript event source. Every
    /// rendered assistant turn is forwarded to
    /// [`handle_assistant_turn`](Self::handle_assistant_turn) on its own
    /// task, so the host's render loop never blocks on classification.
    pub fn attach_source(self: &Arc<Self>, source: &dyn TranscriptEventSource) {
        let orchestrator = Arc::clone(self);
        source.on_new_assistant_turn(Box::new(move |index, text| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator.handle_assistant_turn(index, &text).await;
            });
        }));
    }

    /// Probabilistic proactive trigger, e.g. from a host idle timer
    pub async fn maybe_proactive_call(
        &self,
        caller: &str,
        profile: Option<ContactProfile>,
        opts: TriggerOptions,
    ) -> TriggerOutcome {
        self.scheduler
            .maybe_trigger(caller, profile, self.config.proactive_probability, opts)
            .await
    }

    // ========================================================================
    // State accessors
    // ========================================================================

    pub fn call_state(&self) -> CallState {
        self.state.lock().call_state()
    }

    pub fn is_call_active(&self) -> bool {
        self.call_state() == CallState::Active
    }

    pub fn current_prompt(&self) -> Option<IncomingCallPrompt> {
        self.state.lock().prompt.clone()
    }

    // ========================================================================
    // Call log management
    // ========================================================================

    /// The archive, sanitized against the current transcript
    pub fn list_logs(&self) -> Result<Vec<CallLogEntry>> {
        self.store.load(self.transcript.len())
    }

    pub fn edit_summary(&self, id: Uuid, summary: &str) -> Result<bool> {
        self.store.update(id, self.transcript.len(), |entry| {
            entry.summary = summary.to_string();
        })
    }

    /// Toggle whether the call's transcript range feeds generation context.
    /// The transcript edit happens first; if it fails (stale range) the flag
    /// is left untouched and an error toast is emitted.
    pub async fn set_include_in_context(&self, id: Uuid, include: bool) -> Result<bool> {
        let len = self.transcript.len();
        let Some(entry) = self.store.find(id, len)? else {
            return Ok(false);
        };

        if let Some(range) = entry.transcript_range {
            let result = if include {
                self.transcript.unhide_range(range.start, range.end).await
            } else {
                self.transcript.hide_range(range.start, range.end).await
            };
            if let Err(e) = result {
                warn!("Context toggle failed for {}: {}", id, e);
                self.events.emit(CallEvent::ErrorToast {
                    message: format!("Could not update call visibility: {}", e),
                });
                return Ok(false);
            }
        }

        self.store.update(id, len, |entry| {
            entry.include_in_context = include;
        })
    }

    /// Remove the archive entry only; the transcript keeps the conversation
    pub fn delete_log(&self, id: Uuid) -> Result<bool> {
        self.store.delete(id, self.transcript.len())
    }

    /// Remove the archive entry AND excise its transcript turns. If the cut
    /// fails the entry stays put; half-deleted state is worse than stale
    /// state the next load would prune anyway.
    pub async fn hard_delete_log(&self, id: Uuid) -> Result<bool> {
        let len = self.transcript.len();
        let Some(entry) = self.store.find(id, len)? else {
            return Ok(false);
        };

        if let Some(range) = entry.transcript_range {
            if let Err(e) = self.transcript.cut_range(range.start, range.end).await {
                warn!("Hard delete cut failed for {}: {}", id, e);
                self.events.emit(CallEvent::ErrorToast {
                    message: format!("Could not delete call messages: {}", e),
                });
                return Ok(false);
            }
        }

        // Delete against the pre-cut length: the cut just invalidated this
        // entry's own range, and sanitization would otherwise prune it before
        // the delete finds it
        self.store.delete(id, len)
    }

    /// Scroll the host view to the start of the call's transcript
    pub async fn open_log_transcript(&self, id: Uuid) -> Result<()> {
        let entry = self
            .store
            .find(id, self.transcript.len())?
            .ok_or(LineError::LogNotFound(id))?;
        let range = entry
            .transcript_range
            .ok_or(LineError::NoTranscript(id))?;
        self.transcript.jump_to(range.start).await
    }

    // ========================================================================
    // UI collapse state
    // ========================================================================

    pub fn collapse_state(&self) -> Result<HashMap<String, bool>> {
        self.store.load_collapse_state()
    }

    pub fn set_collapsed(&self, section: &str, collapsed: bool) -> Result<()> {
        let mut state = self.store.load_collapse_state()?;
        state.insert(section.to_string(), collapsed);
        self.store.save_collapse_state(&state)
    }

    // ========================================================================
    // Dial arbitration
    // ========================================================================

    /// Ask the generator whether `contact` picks up. Anything that is not a
    /// clear rejection connects the call, including arbitration failures.
    async fn arbitrate_pickup(&self, contact: &str, profile: Option<&ContactProfile>) -> bool {
        let mut prompt = format!(
            "The user is calling {} on the phone right now. Based on the story so far, \
            would {} pick up?",
            contact, contact
        );
        if let Some(profile) = profile {
            if let Some(personality) = &profile.personality {
                prompt.push_str(&format!(" Their personality: {}.", personality));
            }
            if let Some(relationship) = &profile.relationship {
                prompt.push_str(&format!(" Relationship to the user: {}.", relationship));
            }
        }
        prompt.push_str(" Answer with exactly one word: ACCEPT or REJECT.");

        match self.generation.quiet_generate(&prompt, "system").await {
            Ok(reply) => {
                let verdict = !reply.to_uppercase().contains("REJECT");
                debug!("Dial arbitration for {}: {:?} -> {}", contact, reply, verdict);
                verdict
            }
            Err(e) => {
                warn!("Dial arbitration failed ({}), connecting anyway", e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ScriptedService;
    use crate::store::{BlobStorage, MemoryStorage};
    use crate::transcript::InMemoryTranscript;
    use crate::types::BufferSink;

    struct Fixture {
        orchestrator: Arc<CallOrchestrator>,
        transcript: Arc<InMemoryTranscript>,
        service: Arc<ScriptedService>,
        store: Arc<CallLogStore>,
        events: Arc<BufferSink>,
    }

    fn fixture() -> Fixture {
        fixture_over(Arc::new(MemoryStorage::new()))
    }

    fn fixture_over(storage: Arc<dyn BlobStorage>) -> Fixture {
        let transcript = Arc::new(InMemoryTranscript::new());
        let service = Arc::new(ScriptedService::new());
        let store = Arc::new(CallLogStore::new(storage, "chat-1"));
        let events = Arc::new(BufferSink::new());
        let config = LineConfig {
            primary_persona: "Assistant".to_string(),
            ring_delay_ms: 10,
            ..LineConfig::default()
        };
        let orchestrator = Arc::new(CallOrchestrator::new(
            transcript.clone(),
            service.clone(),
            store.clone(),
            events.clone(),
            config,
        ));
        Fixture {
            orchestrator,
            transcript,
            service,
            store,
            events,
        }
    }

    /// Storage whose writes always fail, for the degraded-persistence paths
    struct FailingStorage;

    impl BlobStorage for FailingStorage {
        fn read(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn write(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }

        fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct HostSource {
        handler: std::sync::Mutex<Option<Box<dyn Fn(usize, String) + Send + Sync>>>,
    }

    impl HostSource {
        fn fire(&self, index: usize, text: &str) {
            if let Some(handler) = self.handler.lock().expect("lock").as_ref() {
                handler(index, text.to_string());
            }
        }
    }

    impl TranscriptEventSource for HostSource {
        fn on_new_assistant_turn(&self, handler: Box<dyn Fn(usize, String) + Send + Sync>) {
            *self.handler.lock().expect("lock") = Some(handler);
        }
    }

    fn ring(f: &Fixture, caller: &str) {
        f.orchestrator.state.lock().prompt = Some(IncomingCallPrompt {
            caller_name: caller.to_string(),
            profile: None,
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_accept_connects() {
        let f = fixture();
        f.service.push_ok("ACCEPT");

        let outcome = f.orchestrator.dial("Mina", None).await.expect("dial");
        assert_eq!(outcome, DialOutcome::Connected);
        assert!(f.orchestrator.is_call_active());

        let st = f.orchestrator.state.lock();
        let call = st.active.as_ref().expect("active");
        assert_eq!(call.contact_name, "Mina");
        assert_eq!(call.direction, CallDirection::Outgoing);
        drop(st);

        assert!(f
            .events
            .snapshot()
            .iter()
            .any(|e| matches!(e, CallEvent::CallStarted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_reject_archives_declined_call() {
        let f = fixture();
        f.service.push_ok("REJECT - she is in a meeting");

        let outcome = f.orchestrator.dial("Mina", None).await.expect("dial");
        assert_eq!(outcome, DialOutcome::Declined);
        assert!(!f.orchestrator.is_call_active());

        let logs = f.orchestrator.list_logs().expect("logs");
        assert_eq!(logs.len(), 1);
        assert!(logs[0].missed);
        assert_eq!(logs[0].summary, "Declined call");
        assert!(logs[0].transcript_range.is_none());

        // The decline was narrated in the transcript
        assert!(f
            .transcript
            .turn(f.transcript.len() - 1)
            .expect("turn")
            .text
            .contains("declined"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_arbitration_failure_connects() {
        let f = fixture();
        f.service.push_err("backend down");

        let outcome = f.orchestrator.dial("Mina", None).await.expect("dial");
        assert_eq!(outcome, DialOutcome::Connected);
        assert!(f.orchestrator.is_call_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_while_busy() {
        let f = fixture();
        f.service.push_ok("ACCEPT");
        f.orchestrator.dial("Mina", None).await.expect("dial");

        // No arbitration request should be issued for the second dial
        let requests_before = f.service.requests().len();
        let outcome = f.orchestrator.dial("Jae", None).await.expect("dial");
        assert_eq!(outcome, DialOutcome::Busy);
        assert_eq!(f.service.requests().len(), requests_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_incoming_starts_call() {
        let f = fixture();
        ring(&f, "Mina");

        assert!(f.orchestrator.accept_incoming().await.expect("accept"));
        assert!(f.orchestrator.is_call_active());
        assert!(f.orchestrator.current_prompt().is_none());

        let st = f.orchestrator.state.lock();
        assert_eq!(
            st.active.as_ref().expect("active").direction,
            CallDirection::Incoming
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_incoming_archives_one_entry() {
        let f = fixture();
        ring(&f, "Mina");

        assert!(f.orchestrator.reject_incoming().await.expect("reject"));
        assert!(!f.orchestrator.is_call_active());
        assert!(f.orchestrator.current_prompt().is_none());

        let logs = f.orchestrator.list_logs().expect("logs");
        assert_eq!(logs.len(), 1);
        assert!(logs[0].missed);
        assert_eq!(logs[0].summary, "Call rejected");

        // The rejection was narrated; the reactive line was skipped because
        // generation had nothing to say
        assert!(f
            .transcript
            .turn(0)
            .expect("turn")
            .text
            .contains("declined the call from Mina"));
        assert!(f
            .events
            .snapshot()
            .iter()
            .any(|e| matches!(e, CallEvent::Warning { .. })));

        // Resolving twice does nothing
        assert!(!f.orchestrator.reject_incoming().await.expect("reject"));
        assert_eq!(f.orchestrator.list_logs().expect("logs").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_incoming_archives_missed_call() {
        let f = fixture();
        ring(&f, "Mina");
        f.service.push_ok("oh... you didn't pick up. call me back?");

        assert!(f.orchestrator.dismiss_incoming().await.expect("dismiss"));
        let logs = f.orchestrator.list_logs().expect("logs");
        assert_eq!(logs[0].summary, "Missed call");

        // The caller reacted in chat under her own name
        let last = f.transcript.turn(f.transcript.len() - 1).expect("turn");
        assert_eq!(last.speaker, "Mina");
        assert!(last.text.contains("call me back"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_generates_opening_line() {
        let f = fixture();
        f.transcript.push(SpeakerRole::User, "You", "what a day");
        ring(&f, "Mina");
        f.service.push_ok("Hey! Finally caught you, got a minute?");

        assert!(f.orchestrator.accept_incoming().await.expect("accept"));

        let last = f.transcript.turn(f.transcript.len() - 1).expect("turn");
        assert_eq!(last.speaker, "Mina");
        assert_eq!(last.text, "Hey! Finally caught you, got a minute?");
        // The instruction carried recent conversation context
        assert!(f.service.requests()[0].contains("what a day"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_assistant_turn_detection_opens_prompt() {
        let f = fixture();
        f.transcript
            .push(SpeakerRole::Assistant, "Assistant", "Your phone rings. It's Mina!");

        f.orchestrator
            .handle_assistant_turn(0, "Your phone rings. It's Mina!")
            .await;

        let prompt = f.orchestrator.current_prompt().expect("prompt");
        assert_eq!(prompt.caller_name, "Assistant");
        assert_eq!(
            f.events.snapshot(),
            vec![CallEvent::IncomingCall {
                caller: "Assistant".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_assistant_turn_during_call_reattributes_only() {
        let f = fixture();
        f.service.push_ok("ACCEPT");
        f.orchestrator.dial("Mina", None).await.expect("dial");

        // Text that would classify as an incoming call must not open a
        // prompt while the line is busy
        f.transcript
            .push(SpeakerRole::Assistant, "Assistant", "Your phone rings again!");
        let index = f.transcript.len() - 1;
        f.orchestrator
            .handle_assistant_turn(index, "Your phone rings again!")
            .await;

        assert!(f.orchestrator.current_prompt().is_none());
        let last = f.transcript.turn(f.transcript.len() - 1).expect("turn");
        assert_eq!(last.speaker, "Mina");
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_call_then_context_toggle() {
        let f = fixture();
        f.transcript.push(SpeakerRole::User, "You", "quiet night");
        f.service.push_ok("ACCEPT");
        f.service.push_ok("They caught up briefly.");

        f.orchestrator.dial("Mina", None).await.expect("dial");
        f.transcript.push(SpeakerRole::Assistant, "Mina", "hey!");
        let entry = f
            .orchestrator
            .hang_up()
            .await
            .expect("hang up")
            .expect("entry");
        let range = entry.transcript_range.expect("range");

        // Include, then exclude; hidden flags follow
        assert!(f
            .orchestrator
            .set_include_in_context(entry.id, true)
            .await
            .expect("toggle"));
        assert!(!f.transcript.turn(range.start).expect("turn").hidden);

        assert!(f
            .orchestrator
            .set_include_in_context(entry.id, false)
            .await
            .expect("toggle"));
        for i in range.start..=range.end {
            assert!(f.transcript.turn(i).expect("turn").hidden);
        }
        let logs = f.orchestrator.list_logs().expect("logs");
        assert!(!logs[0].include_in_context);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_log_keeps_transcript() {
        let f = fixture();
        f.service.push_ok("ACCEPT");
        f.service.push_ok("Summary.");
        f.orchestrator.dial("Mina", None).await.expect("dial");
        let entry = f
            .orchestrator
            .hang_up()
            .await
            .expect("hang up")
            .expect("entry");

        let len_before = f.transcript.len();
        assert!(f.orchestrator.delete_log(entry.id).expect("delete"));
        assert_eq!(f.transcript.len(), len_before);
        assert!(f.orchestrator.list_logs().expect("logs").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_delete_excises_transcript() {
        let f = fixture();
        f.transcript.push(SpeakerRole::User, "You", "before the call");
        f.service.push_ok("ACCEPT");
        f.service.push_ok("Summary.");
        f.orchestrator.dial("Mina", None).await.expect("dial");
        f.transcript.push(SpeakerRole::Assistant, "Mina", "mid-call chatter");
        let entry = f
            .orchestrator
            .hang_up()
            .await
            .expect("hang up")
            .expect("entry");
        let range = entry.transcript_range.expect("range");
        let cut_len = range.end - range.start + 1;
        let len_before = f.transcript.len();

        assert!(f
            .orchestrator
            .hard_delete_log(entry.id)
            .await
            .expect("hard delete"));
        assert_eq!(f.transcript.len(), len_before - cut_len);
        assert!(f.orchestrator.list_logs().expect("logs").is_empty());
        // The pre-call turn survived
        assert_eq!(f.transcript.turn(0).expect("turn").text, "before the call");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_delete_stale_range_leaves_entry() {
        let f = fixture();
        f.service.push_ok("ACCEPT");
        f.service.push_ok("Summary.");
        f.orchestrator.dial("Mina", None).await.expect("dial");
        let entry = f
            .orchestrator
            .hang_up()
            .await
            .expect("hang up")
            .expect("entry");

        // find() sanitizes against the current length, so the entry itself
        // disappears once the transcript shrinks under its range
        f.transcript.truncate(0);
        assert!(!f
            .orchestrator
            .hard_delete_log(entry.id)
            .await
            .expect("hard delete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_log_transcript_jumps() {
        let f = fixture();
        f.transcript.push(SpeakerRole::User, "You", "before");
        f.service.push_ok("ACCEPT");
        f.service.push_ok("Summary.");
        f.orchestrator.dial("Mina", None).await.expect("dial");
        let entry = f
            .orchestrator
            .hang_up()
            .await
            .expect("hang up")
            .expect("entry");
        let range = entry.transcript_range.expect("range");

        f.orchestrator
            .open_log_transcript(entry.id)
            .await
            .expect("open");
        assert_eq!(f.transcript.cursor(), range.start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_missed_log_fails() {
        let f = fixture();
        let entry = CallLogEntry::missed("Mina", "Missed call");
        let id = entry.id;
        f.store.append(entry, 0).expect("append");

        // Both failure modes carry a typed error the host can match on
        let err = f
            .orchestrator
            .open_log_transcript(id)
            .await
            .expect_err("error");
        assert!(matches!(
            err.downcast_ref::<LineError>(),
            Some(LineError::NoTranscript(_))
        ));

        let err = f
            .orchestrator
            .open_log_transcript(Uuid::new_v4())
            .await
            .expect_err("error");
        assert!(matches!(
            err.downcast_ref::<LineError>(),
            Some(LineError::LogNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_does_not_abort_prompt_resolution() {
        let f = fixture_over(Arc::new(FailingStorage));
        ring(&f, "Mina");
        f.service.push_ok("aw, busy? text me later then.");

        assert!(f.orchestrator.reject_incoming().await.expect("reject"));
        assert!(f.orchestrator.current_prompt().is_none());

        // Narration and the caller's reaction both landed despite the
        // failed archive write
        assert!(f
            .transcript
            .turn(0)
            .expect("turn")
            .text
            .contains("declined the call"));
        let last = f.transcript.turn(f.transcript.len() - 1).expect("turn");
        assert_eq!(last.speaker, "Mina");

        // Declined outgoing dials survive the same failure
        f.service.push_ok("REJECT");
        let outcome = f.orchestrator.dial("Jae", None).await.expect("dial");
        assert_eq!(outcome, DialOutcome::Declined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_source_drives_detection() {
        let f = fixture();
        let source = HostSource::default();
        f.orchestrator.attach_source(&source);

        source.fire(0, "Suddenly your phone rings.");
        // The handler runs on its own task; let it pass the ring delay
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let prompt = f.orchestrator.current_prompt().expect("prompt");
        assert_eq!(prompt.caller_name, "Assistant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_summary() {
        let f = fixture();
        ring(&f, "Mina");
        f.orchestrator.reject_incoming().await.expect("reject");
        let id = f.orchestrator.list_logs().expect("logs")[0].id;

        assert!(f
            .orchestrator
            .edit_summary(id, "She called about the trip.")
            .expect("edit"));
        assert_eq!(
            f.orchestrator.list_logs().expect("logs")[0].summary,
            "She called about the trip."
        );
        assert!(!f
            .orchestrator
            .edit_summary(Uuid::new_v4(), "x")
            .expect("edit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collapse_state_persists() {
        let f = fixture();
        f.orchestrator
            .set_collapsed("call-log", true)
            .expect("set");
        f.orchestrator.set_collapsed("sns", false).expect("set");

        let state = f.orchestrator.collapse_state().expect("state");
        assert_eq!(state.get("call-log"), Some(&true));
        assert_eq!(state.get("sns"), Some(&false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_call_end_to_end() {
        let f = fixture();

        let outcome = f
            .orchestrator
            .maybe_proactive_call(
                "Mina",
                None,
                TriggerOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(outcome, TriggerOutcome::Shown);

        assert!(f.orchestrator.accept_incoming().await.expect("accept"));
        assert!(f.orchestrator.is_call_active());

        f.service.push_ok("Short call.");
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        let entry = f
            .orchestrator
            .hang_up()
            .await
            .expect("hang up")
            .expect("entry");
        assert_eq!(entry.duration_seconds, 30);
        assert!(!f.orchestrator.is_call_active());
    }
}
