//! Whitelist normalization, matching and the persistent preference store.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use tracing::{info, instrument};

use crate::classify::Classified;
use crate::db::{self, Pool, StoreError};
use crate::model::ConversationId;

/// Telegram's service notifications account. Never touched.
pub const SERVICE_NOTIFICATIONS_ID: ConversationId = ConversationId(777000);

static LINK_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:https?://)?(?:www\.)?(?:t|telegram)\.me/").expect("valid link regex")
});

static NUMERIC_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").expect("valid id regex"));

/// Normalize a username, link or display name for whitelist comparison.
///
/// `@Name`, `t.me/Name`, `https://t.me/Name/123?x=1` all become `name`;
/// anything else is trimmed and lowercased. Returns `None` for blank input.
pub fn normalize(entry: &str) -> Option<String> {
    let trimmed = entry.trim();
    let handle = match LINK_PREFIX.find(trimmed) {
        Some(m) => {
            let rest = &trimmed[m.end()..];
            rest.split(|c: char| matches!(c, '/' | '?' | '#'))
                .next()
                .unwrap_or_default()
        }
        None => trimmed,
    };
    let handle = handle.trim_start_matches('@').trim();
    if handle.is_empty() {
        None
    } else {
        Some(handle.to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistMatch {
    /// The account itself or the service notifications chat.
    System,
    User,
}

/// Normalized set of identifiers to preserve.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    identifiers: BTreeSet<String>,
    system_ids: BTreeSet<ConversationId>,
}

impl Whitelist {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut whitelist = Whitelist::default();
        for entry in entries {
            whitelist.insert(entry.as_ref());
        }
        whitelist
    }

    /// Returns `false` if the entry was blank or already present.
    pub fn insert(&mut self, entry: &str) -> bool {
        match normalize(entry) {
            Some(norm) => self.identifiers.insert(norm),
            None => false,
        }
    }

    pub fn protect_system(&mut self, id: ConversationId) {
        self.system_ids.insert(id);
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub fn contains(&self, entry: &str) -> bool {
        normalize(entry).is_some_and(|norm| self.identifiers.contains(&norm))
    }

    /// Exact match on id, normalized username, link or full display name.
    pub fn matches(&self, dialog: &Classified) -> Option<WhitelistMatch> {
        let id = dialog.conversation.id;
        if self.system_ids.contains(&id) {
            return Some(WhitelistMatch::System);
        }
        let id_matches = self
            .identifiers
            .iter()
            .filter(|entry| NUMERIC_ID.is_match(entry))
            .any(|entry| entry.parse::<i64>().ok() == Some(id.0));
        if id_matches || !self.identifiers.is_disjoint(&dialog.identifiers) {
            return Some(WhitelistMatch::User);
        }
        None
    }
}

/// Persistent whitelist for one session.
///
/// Entries are stored normalized and in insertion order, so storage never
/// holds two spellings of the same identifier.
#[derive(Debug)]
pub struct PreferenceStore {
    pool: Pool,
    session: String,
    entries: Vec<String>,
}

impl PreferenceStore {
    #[instrument(skip_all, fields(session = %session.as_ref()))]
    pub async fn load(pool: Pool, session: impl AsRef<str>) -> Result<Self, StoreError> {
        let session = session.as_ref().to_string();
        let stored = db::load_preferences(&pool, &session).await?;
        let mut store = Self {
            pool,
            session,
            entries: Vec::with_capacity(stored.len()),
        };
        store.merge(stored);
        info!(entries = store.entries.len(), "loaded whitelist preferences");
        Ok(store)
    }

    /// Fold entries into the set, returning how many were new.
    pub fn merge<I, S>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for entry in entries {
            if let Some(norm) = normalize(entry.as_ref()) {
                if !self.entries.contains(&norm) {
                    self.entries.push(norm);
                    added += 1;
                }
            }
        }
        added
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn whitelist(&self) -> Whitelist {
        Whitelist::from_entries(&self.entries)
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        db::replace_preferences(&self.pool, &self.session, &self.entries).await
    }
}
