//! ============================================================================
//! LIFELINE-CORE: Simulated Phone Line
//! ============================================================================
//! This crate handles all call logic for the LifeLine companion:
//! - Call session lifecycle (dial, ring, accept/reject, hang up)
//! - Proactive call scheduling with probability, cooldown, and deferral
//! - Incoming-call detection over rendered assistant turns
//! - Durable call archive via redb with lazy range sanitization
//! ============================================================================

pub mod classifier;
pub mod config;
pub mod generation;
pub mod orchestrator;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transcript;
pub mod types;

// Re-export main types for convenience
pub use types::*;
pub use classifier::IncomingCallClassifier;
pub use config::LineConfig;
pub use generation::{GenerationRoute, HttpTextService, Provider, TextGenerationService};
pub use orchestrator::{CallOrchestrator, DialOutcome};
pub use scheduler::{ProactiveCallScheduler, TriggerOptions, TriggerOutcome};
pub use session::CallSession;
pub use store::{BlobStorage, CallLogStore, MemoryStorage, RedbStorage, StoreStats};
pub use transcript::{InMemoryTranscript, SpeakerRole, TranscriptTurn, TranscriptView};
