// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lease persistence contract shared by every process in the fleet.
//!
//! The store is the single arbiter of cross-process ownership. Every mutation
//! is an atomic conditional write; a read-then-write pair is never correct
//! here because two processes could both observe an expired row and both
//! believe their acquisition succeeded.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryLeaseStore;
pub use sqlite::SqliteLeaseStore;

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One persisted lease row. A record whose `expires_at` lies in the past is
/// treated as absent by any acquirer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub key: String,
    pub owner_token: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage contract for lease rows.
///
/// `Ok(false)` from `renew` is the invalidation signal: the row is missing,
/// expired, or owned by another token. An `Err` from any operation is a
/// transport problem (store unreachable) and carries no ownership meaning.
pub trait LeaseStore: Send + Sync {
    /// Claims `key` for `owner_token`. Succeeds when no live record exists or
    /// the live record already belongs to `owner_token`; the record is
    /// written with `expires_at = now + ttl`.
    fn try_acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool>;

    /// Extends the expiry of a live record owned by `owner_token`.
    fn renew(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool>;

    /// Deletes the record when owned by `owner_token`; otherwise a no-op.
    fn release(&self, key: &str, owner_token: &str) -> Result<()>;
}

pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(ttl.as_millis() as i64)
}
