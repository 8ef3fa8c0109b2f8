//! Incremental one-way synchronization
//!
//! [`SyncEngine`] drives token-paginated listings of the source calendar and hands
//! each event to [`ReconciliationPolicy`], persisting cursors through the
//! [`TokenStore`](crate::store::TokenStore) only after a page is fully processed.

mod engine;
mod reconcile;
mod state;

pub use engine::{SyncEngine, SyncReport};
pub use reconcile::{decide, Action, Decision, ReconciliationPolicy};
pub use state::{PairKey, SyncState};
