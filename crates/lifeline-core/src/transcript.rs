//! ============================================================================
//! Transcript Seam - host-owned conversation log
//! ============================================================================
//! The transcript belongs to the host chat application. This core only ever
//! appends, or cuts/hides ranges it created itself; arbitrary edits are off
//! limits. The host may delete or rewrite turns underneath us at any time,
//! which is why the call-log store re-validates ranges on every load.
//! ============================================================================

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Who a transcript turn is attributed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    User,
    Assistant,
    System,
}

/// One turn of the host conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: SpeakerRole,
    /// Visible speaker name; for assistant turns this is the persona the
    /// host rendered, which re-attribution may rewrite
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub hidden: bool,
}

/// Read/append/bounded-edit view over the host transcript. Mutations may
/// suspend (the host renders asynchronously); reads are synchronous.
#[async_trait]
pub trait TranscriptView: Send + Sync {
    /// Current number of turns
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone of all turns from `index` to the end
    fn slice_from(&self, index: usize) -> Vec<TranscriptTurn>;

    /// Append a turn attributed to `speaker`
    async fn append_as(&self, role: SpeakerRole, speaker: &str, text: &str) -> Result<()>;

    /// Remove turns in the inclusive range. Fails on stale indices.
    async fn cut_range(&self, start: usize, end: usize) -> Result<()>;

    /// Exclude turns in the inclusive range from generation context
    async fn hide_range(&self, start: usize, end: usize) -> Result<()>;

    async fn unhide_range(&self, start: usize, end: usize) -> Result<()>;

    /// Scroll the host view to `index`
    async fn jump_to(&self, index: usize) -> Result<()>;

    /// Install the standing role-play note the generator sees on every
    /// request until it is cleared
    async fn set_standing_note(&self, note: &str) -> Result<()>;

    async fn clear_standing_note(&self) -> Result<()>;
}

/// Subscription seam for "a new assistant turn finished rendering". The host
/// adapter implements this; the core never learns the host's event names.
pub trait TranscriptEventSource: Send + Sync {
    fn on_new_assistant_turn(&self, handler: Box<dyn Fn(usize, String) + Send + Sync>);
}

// ============================================================================
// In-memory implementation (tests, CLI demo)
// ============================================================================

#[derive(Debug, Default)]
struct TranscriptInner {
    turns: Vec<TranscriptTurn>,
    standing_note: Option<String>,
    cursor: usize,
}

/// Self-contained [`TranscriptView`] used by tests and the demo driver
#[derive(Default)]
pub struct InMemoryTranscript {
    inner: Mutex<TranscriptInner>,
}

impl InMemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TranscriptInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Host-side append, bypassing the view seam (simulates the host's own
    /// generation pipeline writing turns)
    pub fn push(&self, role: SpeakerRole, speaker: &str, text: &str) {
        self.lock().turns.push(TranscriptTurn {
            role,
            speaker: speaker.to_string(),
            text: text.to_string(),
            hidden: false,
        });
    }

    /// Host-side deletion (simulates the user deleting messages)
    pub fn truncate(&self, len: usize) {
        self.lock().turns.truncate(len);
    }

    pub fn turn(&self, index: usize) -> Option<TranscriptTurn> {
        self.lock().turns.get(index).cloned()
    }

    pub fn standing_note(&self) -> Option<String> {
        self.lock().standing_note.clone()
    }

    pub fn cursor(&self) -> usize {
        self.lock().cursor
    }

    fn check_range(inner: &TranscriptInner, start: usize, end: usize) -> Result<()> {
        if start > end || end >= inner.turns.len() {
            bail!(
                "range [{}, {}] out of bounds for transcript of {} turns",
                start,
                end,
                inner.turns.len()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl TranscriptView for InMemoryTranscript {
    fn len(&self) -> usize {
        self.lock().turns.len()
    }

    fn slice_from(&self, index: usize) -> Vec<TranscriptTurn> {
        let inner = self.lock();
        inner.turns.get(index..).map(<[_]>::to_vec).unwrap_or_default()
    }

    async fn append_as(&self, role: SpeakerRole, speaker: &str, text: &str) -> Result<()> {
        self.push(role, speaker, text);
        Ok(())
    }

    async fn cut_range(&self, start: usize, end: usize) -> Result<()> {
        let mut inner = self.lock();
        Self::check_range(&inner, start, end)?;
        inner.turns.drain(start..=end);
        Ok(())
    }

    async fn hide_range(&self, start: usize, end: usize) -> Result<()> {
        let mut inner = self.lock();
        Self::check_range(&inner, start, end)?;
        for turn in &mut inner.turns[start..=end] {
            turn.hidden = true;
        }
        Ok(())
    }

    async fn unhide_range(&self, start: usize, end: usize) -> Result<()> {
        let mut inner = self.lock();
        Self::check_range(&inner, start, end)?;
        for turn in &mut inner.turns[start..=end] {
            turn.hidden = false;
        }
        Ok(())
    }

    async fn jump_to(&self, index: usize) -> Result<()> {
        let mut inner = self.lock();
        if index >= inner.turns.len() {
            bail!("jump target {} out of bounds", index);
        }
        inner.cursor = index;
        Ok(())
    }

    async fn set_standing_note(&self, note: &str) -> Result<()> {
        self.lock().standing_note = Some(note.to_string());
        Ok(())
    }

    async fn clear_standing_note(&self) -> Result<()> {
        self.lock().standing_note = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_slice() {
        let t = InMemoryTranscript::new();
        t.push(SpeakerRole::User, "You", "hey");
        t.append_as(SpeakerRole::Assistant, "Mina", "hi!")
            .await
            .expect("append");

        assert_eq!(t.len(), 2);
        let tail = t.slice_from(1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].speaker, "Mina");

        assert!(t.slice_from(5).is_empty());
    }

    #[tokio::test]
    async fn test_cut_range_validates_bounds() {
        let t = InMemoryTranscript::new();
        t.push(SpeakerRole::User, "You", "a");
        t.push(SpeakerRole::User, "You", "b");

        assert!(t.cut_range(1, 0).await.is_err());
        assert!(t.cut_range(0, 2).await.is_err());
        assert!(t.cut_range(0, 0).await.is_ok());
        assert_eq!(t.len(), 1);
        assert_eq!(t.turn(0).expect("turn").text, "b");
    }

    #[tokio::test]
    async fn test_hide_and_unhide() {
        let t = InMemoryTranscript::new();
        for i in 0..4 {
            t.push(SpeakerRole::User, "You", &format!("m{}", i));
        }

        t.hide_range(1, 2).await.expect("hide");
        assert!(!t.turn(0).expect("turn").hidden);
        assert!(t.turn(1).expect("turn").hidden);
        assert!(t.turn(2).expect("turn").hidden);

        t.unhide_range(1, 2).await.expect("unhide");
        assert!(!t.turn(1).expect("turn").hidden);
    }

    #[tokio::test]
    async fn test_standing_note_lifecycle() {
        let t = InMemoryTranscript::new();
        t.set_standing_note("speak only as Mina").await.expect("set");
        assert_eq!(t.standing_note().as_deref(), Some("speak only as Mina"));
        t.clear_standing_note().await.expect("clear");
        assert!(t.standing_note().is_none());
    }

    #[tokio::test]
    async fn test_jump_to() {
        let t = InMemoryTranscript::new();
        t.push(SpeakerRole::User, "You", "a");
        t.push(SpeakerRole::User, "You", "b");

        t.jump_to(1).await.expect("jump");
        assert_eq!(t.cursor(), 1);
        assert!(t.jump_to(9).await.is_err());
    }
}
