//! Persisted cursor state for one calendar pair

use crate::calendar::{EventPage, ListQuery, TimeWindow};
use crate::store::TokenStore;
use crate::Result;
use serde::Serialize;

/// Store keys for one (source, target) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub source: String,
    pub target: String,
}

impl PairKey {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn sync_token_key(&self) -> String {
        format!("sync/{}/{}/sync_token", self.source, self.target)
    }

    pub fn page_token_key(&self) -> String {
        format!("sync/{}/{}/page_token", self.source, self.target)
    }
}

/// Sync and page cursors of a calendar pair
///
/// `sync_token == None` means the next listing is a full sync. `page_token` is only
/// present while a page sequence is partially processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub sync_token: Option<String>,
    pub page_token: Option<String>,
}

impl SyncState {
    pub fn load(store: &dyn TokenStore, key: &PairKey) -> Result<Self> {
        Ok(Self {
            sync_token: store.get(&key.sync_token_key())?,
            page_token: store.get(&key.page_token_key())?,
        })
    }

    /// Drop both cursors so the next listing is a full sync
    pub fn clear(store: &dyn TokenStore, key: &PairKey) -> Result<()> {
        store.delete(&key.page_token_key())?;
        store.delete(&key.sync_token_key())?;
        Ok(())
    }

    pub fn needs_full_sync(&self) -> bool {
        self.sync_token.is_none()
    }

    /// Listing request that continues from this state
    pub fn query(&self, window: &TimeWindow) -> ListQuery {
        match &self.sync_token {
            Some(sync_token) => ListQuery::Incremental {
                sync_token: sync_token.clone(),
                page_token: self.page_token.clone(),
            },
            None => ListQuery::Full {
                page_token: self.page_token.clone(),
                window: *window,
            },
        }
    }

    /// Record a fully processed page and persist the result
    ///
    /// The page token follows the page exactly (set when present, removed when
    /// absent). The sync token only changes when the page carries a new one, which
    /// the provider does on the final page of a sequence.
    pub fn advance(&mut self, store: &dyn TokenStore, key: &PairKey, page: &EventPage) -> Result<()> {
        match &page.next_page_token {
            Some(token) => store.set(&key.page_token_key(), token)?,
            None => store.delete(&key.page_token_key())?,
        }
        self.page_token = page.next_page_token.clone();

        if let Some(token) = &page.next_sync_token {
            store.set(&key.sync_token_key(), token)?;
            self.sync_token = Some(token.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTokenStore;

    fn page(next_page: Option<&str>, next_sync: Option<&str>) -> EventPage {
        EventPage {
            items: Vec::new(),
            next_page_token: next_page.map(str::to_string),
            next_sync_token: next_sync.map(str::to_string),
        }
    }

    #[test]
    fn test_keys_are_scoped_to_the_pair() {
        let key = PairKey::new("src@example.com", "dst@example.com");
        assert_eq!(key.sync_token_key(), "sync/src@example.com/dst@example.com/sync_token");
        assert_eq!(key.page_token_key(), "sync/src@example.com/dst@example.com/page_token");
    }

    #[test]
    fn test_empty_state_requests_full_sync_with_window() {
        let state = SyncState::default();
        assert!(state.needs_full_sync());
        assert!(state.query(&TimeWindow::unbounded()).is_full());
    }

    #[test]
    fn test_mid_sequence_page_keeps_old_sync_token() {
        let store = MemoryTokenStore::new();
        let key = PairKey::new("a", "b");
        store.set(&key.sync_token_key(), "s1").unwrap();
        let mut state = SyncState::load(&store, &key).unwrap();

        state.advance(&store, &key, &page(Some("p2"), None)).unwrap();
        assert_eq!(
            SyncState::load(&store, &key).unwrap(),
            SyncState {
                sync_token: Some("s1".into()),
                page_token: Some("p2".into()),
            }
        );

        assert_eq!(
            state.query(&TimeWindow::unbounded()),
            ListQuery::Incremental {
                sync_token: "s1".into(),
                page_token: Some("p2".into()),
            }
        );
    }

    #[test]
    fn test_final_page_clears_page_token_and_stores_sync_token() {
        let store = MemoryTokenStore::new();
        let key = PairKey::new("a", "b");
        store.set(&key.page_token_key(), "p2").unwrap();
        let mut state = SyncState::load(&store, &key).unwrap();

        state.advance(&store, &key, &page(None, Some("s2"))).unwrap();

        let loaded = SyncState::load(&store, &key).unwrap();
        assert_eq!(loaded.page_token, None);
        assert_eq!(loaded.sync_token.as_deref(), Some("s2"));
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_clear_removes_both_tokens() {
        let store = MemoryTokenStore::new();
        let key = PairKey::new("a", "b");
        store.set(&key.sync_token_key(), "s1").unwrap();
        store.set(&key.page_token_key(), "p1").unwrap();

        SyncState::clear(&store, &key).unwrap();
        assert_eq!(SyncState::load(&store, &key).unwrap(), SyncState::default());
    }
}
