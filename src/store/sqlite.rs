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

//! SQLite-backed [`LeaseStore`].
//!
//! Each operation maps to a single conditional statement so the database is
//! the arbiter of every acquire/renew race. WAL mode plus a busy timeout let
//! multiple worker processes share the same database file.

use crate::error::{KagiError, Result};
use crate::store::LeaseStore;
use chrono::Utc;
use log::debug;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SqliteLeaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLeaseStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|err| KagiError::Store(format!("open lease store: {err}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| KagiError::Store(format!("set journal_mode: {err}")))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| KagiError::Store(format!("set busy_timeout: {err}")))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        debug!("Opened sqlite lease store at {}", db_path.display());
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS lease_records (
                 key TEXT PRIMARY KEY,
                 owner_token TEXT NOT NULL,
                 expires_at_ms INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_lease_records_expires
                 ON lease_records(expires_at_ms);",
        )
        .map_err(|err| KagiError::Store(format!("ensure lease schema: {err}")))?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| KagiError::Store("lease store connection lock poisoned".to_string()))
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn try_acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + ttl.as_millis() as i64;
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "INSERT INTO lease_records (key, owner_token, expires_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     owner_token = excluded.owner_token,
                     expires_at_ms = excluded.expires_at_ms
                 WHERE lease_records.expires_at_ms <= ?4
                    OR lease_records.owner_token = excluded.owner_token",
                params![key, owner_token, expires_at_ms, now_ms],
            )
            .map_err(|err| KagiError::Store(format!("acquire lease '{key}': {err}")))?;
        Ok(changed == 1)
    }

    fn renew(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + ttl.as_millis() as i64;
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE lease_records SET expires_at_ms = ?3
                 WHERE key = ?1 AND owner_token = ?2 AND expires_at_ms > ?4",
                params![key, owner_token, expires_at_ms, now_ms],
            )
            .map_err(|err| KagiError::Store(format!("renew lease '{key}': {err}")))?;
        Ok(changed == 1)
    }

    fn release(&self, key: &str, owner_token: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM lease_records WHERE key = ?1 AND owner_token = ?2",
            params![key, owner_token],
        )
        .map_err(|err| KagiError::Store(format!("release lease '{key}': {err}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(30);

    fn open_store(dir: &TempDir) -> SqliteLeaseStore {
        SqliteLeaseStore::open(&dir.path().join("leases.db")).unwrap()
    }

    #[test]
    fn acquire_creates_row_and_blocks_other_tokens() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.try_acquire("trace-1", "worker-a", TTL).unwrap());
        assert!(!store.try_acquire("trace-1", "worker-b", TTL).unwrap());
        assert!(store.try_acquire("trace-2", "worker-b", TTL).unwrap());
    }

    #[test]
    fn reacquire_by_owner_extends_expiry() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.try_acquire("trace-1", "worker-a", TTL).unwrap());
        assert!(store.try_acquire("trace-1", "worker-a", TTL).unwrap());
    }

    #[test]
    fn expired_row_can_be_taken_over() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(
            store
                .try_acquire("trace-1", "worker-a", Duration::from_millis(30))
                .unwrap()
        );
        std::thread::sleep(Duration::from_millis(60));
        assert!(store.try_acquire("trace-1", "worker-b", TTL).unwrap());
        assert!(!store.renew("trace-1", "worker-a", TTL).unwrap());
    }

    #[test]
    fn renew_requires_live_owned_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(!store.renew("trace-1", "worker-a", TTL).unwrap());
        assert!(store.try_acquire("trace-1", "worker-a", TTL).unwrap());
        assert!(store.renew("trace-1", "worker-a", TTL).unwrap());
        assert!(!store.renew("trace-1", "worker-b", TTL).unwrap());
    }

    #[test]
    fn release_only_removes_owned_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.try_acquire("trace-1", "worker-a", TTL).unwrap());
        store.release("trace-1", "worker-b").unwrap();
        assert!(!store.try_acquire("trace-1", "worker-b", TTL).unwrap());
        store.release("trace-1", "worker-a").unwrap();
        assert!(store.try_acquire("trace-1", "worker-b", TTL).unwrap());
    }

    #[test]
    fn two_connections_share_one_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leases.db");
        let first = SqliteLeaseStore::open(&path).unwrap();
        let second = SqliteLeaseStore::open(&path).unwrap();

        assert!(first.try_acquire("trace-1", "worker-a", TTL).unwrap());
        assert!(!second.try_acquire("trace-1", "worker-b", TTL).unwrap());
        first.release("trace-1", "worker-a").unwrap();
        assert!(second.try_acquire("trace-1", "worker-b", TTL).unwrap());
    }
}
