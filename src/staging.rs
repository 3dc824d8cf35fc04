//! In-memory staging of diary entries awaiting confirmation.
//!
//! One mutable draft per chat. A newer flow overwrites the previous draft;
//! the draft is removed on confirm or discard, and kept on a failed confirm
//! so the user can retry. Also owns the per-chat photo busy flag.
//!
//! A draft may reference a downloaded photo on disk. The file exists for the
//! lifetime of the draft: whichever way the draft leaves the store (confirm,
//! discard, overwrite by a newer flow) deletes it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::{self, NewEntry};
use crate::nutrition::parse_field_tokens;

#[derive(Debug)]
pub enum StagingError {
    /// No draft is staged for this chat.
    NoDraft,
    /// An edit input contained no recognized `key=value` token.
    NoFieldsRecognized,
    Db(sqlx::Error),
}

impl std::fmt::Display for StagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingError::NoDraft => write!(f, "no pending entry for this chat"),
            StagingError::NoFieldsRecognized => write!(f, "no recognized fields in edit input"),
            StagingError::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for StagingError {}

impl From<sqlx::Error> for StagingError {
    fn from(e: sqlx::Error) -> Self {
        StagingError::Db(e)
    }
}

/// Per-chat session state shared across handlers.
///
/// The mutexes are plain `std::sync` because no lock is ever held across an
/// await point; every method takes the lock, mutates, and returns.
#[derive(Debug, Default)]
pub struct SessionStore {
    drafts: Mutex<HashMap<i64, NewEntry>>,
    photo_busy: Mutex<HashSet<i64>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a draft for the chat, replacing any previous one.
    pub fn stage(&self, chat_id: i64, draft: NewEntry) {
        let replaced = self.drafts.lock().unwrap().insert(chat_id, draft);
        if let Some(previous) = replaced {
            remove_photo_file(&previous);
            info!(user_id = chat_id, "Previous pending entry replaced by a newer flow");
        }
    }

    /// A copy of the current draft, if any.
    pub fn peek(&self, chat_id: i64) -> Option<NewEntry> {
        self.drafts.lock().unwrap().get(&chat_id).cloned()
    }

    /// Apply `key=value` edits to the staged draft and return the updated
    /// copy. Fields not mentioned stay as they were.
    pub fn apply_edit(&self, chat_id: i64, text: &str) -> Result<NewEntry, StagingError> {
        let updates = parse_field_tokens(text);
        if updates.is_empty() {
            return Err(StagingError::NoFieldsRecognized);
        }

        let mut drafts = self.drafts.lock().unwrap();
        let draft = drafts.get_mut(&chat_id).ok_or(StagingError::NoDraft)?;
        draft.apply(&updates);
        Ok(draft.clone())
    }

    /// Persist the staged draft. The draft is removed only after the insert
    /// commits; on a database failure it stays staged for retry.
    ///
    /// Returns the new entry id and whether the entry implies a meal, so the
    /// caller can arm after-meal reminders.
    pub async fn confirm(
        &self,
        chat_id: i64,
        pool: &SqlitePool,
    ) -> Result<(i64, bool), StagingError> {
        let draft = self.peek(chat_id).ok_or(StagingError::NoDraft)?;
        let implies_meal = draft.implies_meal();

        let mut tx = pool.begin().await?;
        let entry_id = db::insert_entry(&mut *tx, &draft).await?;
        if let Err(e) = tx.commit().await {
            warn!(user_id = chat_id, error = %e, "Entry confirm failed, draft kept");
            return Err(StagingError::Db(e));
        }

        if let Some(saved) = self.drafts.lock().unwrap().remove(&chat_id) {
            remove_photo_file(&saved);
        }
        info!(user_id = chat_id, entry_id, "Entry confirmed");
        Ok((entry_id, implies_meal))
    }

    /// Drop the staged draft. Returns `false` if there was none.
    pub fn discard(&self, chat_id: i64) -> bool {
        match self.drafts.lock().unwrap().remove(&chat_id) {
            Some(dropped) => {
                remove_photo_file(&dropped);
                true
            }
            None => false,
        }
    }

    /// Mark the chat as busy with photo analysis. Returns `false` when a
    /// photo is already being processed for this chat.
    pub fn begin_photo(&self, chat_id: i64) -> bool {
        self.photo_busy.lock().unwrap().insert(chat_id)
    }

    pub fn end_photo(&self, chat_id: i64) {
        self.photo_busy.lock().unwrap().remove(&chat_id);
    }
}

/// Delete the draft's photo file, if it has one. The entry keeps the path as
/// provenance; the bytes themselves are not needed once the draft is
/// resolved.
fn remove_photo_file(draft: &NewEntry) {
    let Some(path) = draft.photo_path.as_deref() else {
        return;
    };
    if Path::new(path).exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(photo_path = path, error = %e, "Failed to remove photo file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(chat_id: i64) -> NewEntry {
        let mut d = NewEntry::new(chat_id);
        d.carbs_g = Some(40.0);
        d.sugar_before = Some(6.5);
        d
    }

    #[test]
    fn test_stage_overwrites_previous_draft() {
        let store = SessionStore::new();
        store.stage(1, draft(1));

        let mut newer = NewEntry::new(1);
        newer.sugar_before = Some(9.0);
        store.stage(1, newer.clone());

        assert_eq!(store.peek(1), Some(newer));
    }

    #[test]
    fn test_edit_updates_only_mentioned_fields() {
        let store = SessionStore::new();
        store.stage(1, draft(1));

        let updated = store.apply_edit(1, "сахар=7,2 dose=4").unwrap();
        assert_eq!(updated.sugar_before, Some(7.2));
        assert_eq!(updated.dose, Some(4.0));
        assert_eq!(updated.carbs_g, Some(40.0));
    }

    #[test]
    fn test_edit_with_no_recognized_fields() {
        let store = SessionStore::new();
        store.stage(1, draft(1));

        assert!(matches!(
            store.apply_edit(1, "просто текст"),
            Err(StagingError::NoFieldsRecognized)
        ));
        // draft untouched
        assert_eq!(store.peek(1).unwrap().carbs_g, Some(40.0));
    }

    #[test]
    fn test_discard() {
        let store = SessionStore::new();
        store.stage(1, draft(1));

        assert!(store.discard(1));
        assert!(!store.discard(1));
        assert!(store.peek(1).is_none());
    }

    #[test]
    fn test_photo_busy_guard() {
        let store = SessionStore::new();

        assert!(store.begin_photo(1));
        assert!(!store.begin_photo(1));
        assert!(store.begin_photo(2));

        store.end_photo(1);
        assert!(store.begin_photo(1));
    }
}
