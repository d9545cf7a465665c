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

use crate::error::Result;
use crate::store::{LeaseRecord, LeaseStore, expiry_after};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Mutex-guarded map implementation of [`LeaseStore`].
///
/// Suitable for tests and single-node deployments. Several registries sharing
/// one instance behave like several processes sharing one database, which is
/// how the cross-process tests simulate a fleet.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    records: Mutex<HashMap<String, LeaseRecord>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) records. Diagnostic accessor for tests.
    pub fn live_count(&self) -> usize {
        let now = Utc::now();
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.values().filter(|r| !r.is_expired(now)).count()
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn try_acquire(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = records.get(key)
            && !existing.is_expired(now)
            && existing.owner_token != owner_token
        {
            return Ok(false);
        }

        records.insert(
            key.to_string(),
            LeaseRecord {
                key: key.to_string(),
                owner_token: owner_token.to_string(),
                expires_at: expiry_after(now, ttl),
            },
        );
        Ok(true)
    }

    fn renew(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match records.get_mut(key) {
            Some(record) if !record.is_expired(now) && record.owner_token == owner_token => {
                record.expires_at = expiry_after(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str, owner_token: &str) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let owned = records
            .get(key)
            .is_some_and(|record| record.owner_token == owner_token);
        if owned {
            records.remove(key);
        }
        Ok(())
    }
}
