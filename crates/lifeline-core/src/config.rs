//! ============================================================================
//! LifeLine Configuration
//! ============================================================================
//! Tunables for the call subsystem. Timing values are deliberately coarse:
//! the cooldown stops proactive call spam, the ring delay makes the phone
//! ring a beat after the character finishes talking, and the deferred
//! max-wait bounds how long a parked trigger may sit before it is abandoned.
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::generation::GenerationRoute;

/// Configuration for the call subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    /// Name the host attributes generated turns to by default. Calls from
    /// anyone else trigger re-attribution of assistant turns.
    pub primary_persona: String,
    /// Percent chance (0-100) a proactive trigger actually fires
    pub proactive_probability: u8,
    /// Minimum seconds between successful proactive fires
    pub cooldown_secs: u64,
    /// Delay before the ringing prompt is shown
    pub ring_delay_ms: u64,
    /// How long a deferred trigger may wait for the next assistant turn
    pub deferred_max_wait_secs: u64,
    /// Minimum AI confidence to accept an incoming-call classification
    pub confidence_threshold: f32,
    /// Optional dedicated model route for end-of-call summaries
    pub summary_route: Option<GenerationRoute>,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            primary_persona: std::env::var("LIFELINE_PRIMARY_PERSONA")
                .unwrap_or_else(|_| "Assistant".to_string()),
            proactive_probability: 30,
            cooldown_secs: 600,
            ring_delay_ms: 1200,
            deferred_max_wait_secs: 120,
            confidence_threshold: 0.5,
            summary_route: None,
        }
    }
}
