//! Identity-store contract consumed by the engine and camera workers.

use crate::types::{CameraStatus, KnownIdentity};
use chrono::{DateTime, Local};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("descriptor encoding: {0}")]
    Encoding(String),
}

/// Persistence boundary for identities, attendance, unknown-face events
/// and camera liveness.
///
/// Writes are individually atomic at the store level; the engine never
/// spans a transaction across calls. Implementations must be safe to
/// call concurrently from every camera worker.
pub trait IdentityStore: Send + Sync {
    /// All enrolled identities, in stable (insertion) order.
    fn fetch_known_identities(&self) -> Result<Vec<KnownIdentity>, StoreError>;

    /// Record a check-in for `identity_id` on the calendar date of `at`.
    ///
    /// Idempotent per identity+date: when an attendance row for that day
    /// already exists its id is returned and the original in-time is
    /// left untouched.
    fn upsert_check_in(&self, identity_id: i64, at: DateTime<Local>) -> Result<i64, StoreError>;

    /// Set the check-out time on the attendance row for `identity_id` on
    /// the calendar date of `at`.
    fn set_check_out(&self, identity_id: i64, at: DateTime<Local>) -> Result<(), StoreError>;

    /// Record an unknown-face event pointing at a saved snapshot.
    fn log_unknown(&self, snapshot: &Path, at: DateTime<Local>) -> Result<i64, StoreError>;

    /// Report a camera source's liveness. Called by workers on status
    /// transitions, never per frame.
    fn set_source_status(&self, source_id: i64, status: CameraStatus) -> Result<(), StoreError>;
}
