//! ============================================================================
//! Proactive Call Scheduler - probability, cooldown, deferred triggers
//! ============================================================================
//! Decides when an incoming-call prompt may surface. Firing a prompt while
//! the host is mid-generation overlaps the render incoherently, so a trigger
//! can be parked until the next assistant turn finishes: the phone rings a
//! beat after the character stops talking. A parked trigger is abandoned
//! after a bounded wait.
//!
//! All guards live in the shared LineState and are checked inside one lock
//! scope before any await, so concurrent triggers serialize to at most one
//! attempt in flight and at most one shown prompt.
//! ============================================================================

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::LineConfig;
use crate::types::{CallEvent, ContactProfile, EventSink, IncomingCallPrompt, SharedLine};

/// Handle to a spawned deferred task. Cancelling is idempotent; dropping the
/// handle does not cancel the task.
pub struct TaskHandle {
    inner: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(inner: tokio::task::JoinHandle<()>) -> Self {
        Self { inner }
    }

    pub fn cancel(&self) {
        self.inner.abort();
    }
}

/// Options for one trigger attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerOptions {
    /// Skip the probability draw and cooldown window
    pub force: bool,
    /// Park the prompt until the next assistant turn has rendered
    pub defer_until_next_assistant_turn: bool,
}

/// Why a trigger attempt did not show a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    CallActive,
    PromptOpen,
    AttemptPending,
    Cooldown,
    ProbabilityMiss,
}

/// Result of one trigger attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The prompt is open
    Shown,
    /// Parked until the next assistant turn (or the max wait elapses)
    Deferred,
    Declined(DeclineReason),
}

/// Probability + cooldown + deferral layer above the call session
pub struct ProactiveCallScheduler {
    state: SharedLine,
    events: Arc<dyn EventSink>,
    config: LineConfig,
    deferred_timeout: Mutex<Option<TaskHandle>>,
}

impl ProactiveCallScheduler {
    pub fn new(state: SharedLine, events: Arc<dyn EventSink>, config: LineConfig) -> Self {
        Self {
            state,
            events,
            config,
            deferred_timeout: Mutex::new(None),
        }
    }

    /// Attempt to surface an incoming-call prompt from `caller`.
    /// `probability_percent` is the chance (0-100) the attempt survives the
    /// random draw; `force` bypasses the draw and the cooldown but never the
    /// at-most-one guards.
    pub async fn maybe_trigger(
        &self,
        caller: &str,
        profile: Option<ContactProfile>,
        probability_percent: u8,
        opts: TriggerOptions,
    ) -> TriggerOutcome {
        let prompt = IncomingCallPrompt {
            caller_name: caller.to_string(),
            profile,
        };

        // Guards and flag-set happen in one lock scope, before any await
        {
            let mut st = self.state.lock();
            if st.active.is_some() {
                return TriggerOutcome::Declined(DeclineReason::CallActive);
            }
            if st.prompt.is_some() {
                return TriggerOutcome::Declined(DeclineReason::PromptOpen);
            }
            if st.proactive_pending {
                return TriggerOutcome::Declined(DeclineReason::AttemptPending);
            }

            if !opts.force {
                if let Some(last) = st.last_fire {
                    if last.elapsed() < Duration::from_secs(self.config.cooldown_secs) {
                        debug!("Proactive trigger inside cooldown window");
                        return TriggerOutcome::Declined(DeclineReason::Cooldown);
                    }
                }
                let draw = rand::thread_rng().gen_range(0..100u8);
                if draw >= probability_percent {
                    debug!("Proactive draw missed ({} >= {})", draw, probability_percent);
                    return TriggerOutcome::Declined(DeclineReason::ProbabilityMiss);
                }
            }

            st.proactive_pending = true;
            if opts.defer_until_next_assistant_turn {
                st.deferred_caller = Some(prompt.clone());
            }
        }

        if opts.defer_until_next_assistant_turn {
            self.arm_deferred_timeout();
            return TriggerOutcome::Deferred;
        }

        tokio::time::sleep(Duration::from_millis(self.config.ring_delay_ms)).await;
        self.show_prompt(prompt)
    }

    /// Called when a new assistant turn has finished rendering; releases a
    /// parked trigger if one is waiting.
    pub async fn notify_assistant_turn(&self) {
        let prompt = {
            let mut st = self.state.lock();
            match st.deferred_caller.take() {
                Some(prompt) => prompt,
                None => return,
            }
        };

        if let Some(handle) = self
            .deferred_timeout
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.cancel();
        }

        // Short human-perceptible delay so the ring lands after the turn
        tokio::time::sleep(Duration::from_millis(self.config.ring_delay_ms)).await;
        self.show_prompt(prompt);
    }

    /// Abandon the parked trigger if no assistant turn arrives in time
    fn arm_deferred_timeout(&self) {
        let state = self.state.clone();
        let max_wait = Duration::from_secs(self.config.deferred_max_wait_secs);

        let handle = TaskHandle::new(tokio::spawn(async move {
            tokio::time::sleep(max_wait).await;
            let mut st = state.lock();
            if st.deferred_caller.take().is_some() {
                st.proactive_pending = false;
                warn!("Deferred incoming call abandoned after max wait");
            }
        }));

        let mut guard = self
            .deferred_timeout
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(old) = guard.replace(handle) {
            old.cancel();
        }
    }

    /// Final re-check and prompt installation after the ring delay. The delay
    /// is an await point, so another trigger or a started call may have won.
    fn show_prompt(&self, prompt: IncomingCallPrompt) -> TriggerOutcome {
        let caller = {
            let mut st = self.state.lock();
            st.proactive_pending = false;
            if st.active.is_some() {
                return TriggerOutcome::Declined(DeclineReason::CallActive);
            }
            if st.prompt.is_some() {
                return TriggerOutcome::Declined(DeclineReason::PromptOpen);
            }
            let caller = prompt.caller_name.clone();
            st.prompt = Some(prompt);
            st.last_fire = Some(tokio::time::Instant::now());
            caller
        };

        info!("Incoming call prompt shown for {}", caller);
        self.events.emit(CallEvent::IncomingCall { caller });
        TriggerOutcome::Shown
    }
}
