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

//! Per-process cache of lease handles.
//!
//! The registry guarantees one handle instance per key per process: the map
//! insertion happens under the registry mutex, so concurrent first access
//! produces a single winner and every later call observes the same `Arc`.
//! There is deliberately no global singleton; each worker constructs one
//! registry and passes it where needed.

use crate::config::LockingConfig;
use crate::error::Result;
use crate::locking::handle::LeaseHandle;
use crate::locking::invalidation::InvalidationHub;
use crate::locking::renewal::RenewalScheduler;
use crate::store::LeaseStore;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Summary of a registry sweep.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub examined: usize,
    pub removed: usize,
    pub duration: Duration,
}

/// Per-process lock registry handing out cluster-aware lease handles.
pub struct LockRegistry {
    store: Arc<dyn LeaseStore>,
    scheduler: Arc<RenewalScheduler>,
    hub: Arc<InvalidationHub>,
    owner_token: String,
    ttl: Duration,
    handles: Mutex<HashMap<String, Arc<LeaseHandle>>>,
}

impl LockRegistry {
    pub fn new(store: Arc<dyn LeaseStore>, config: &LockingConfig) -> Result<Self> {
        config.validate()?;
        let owner_token = config
            .owner_token
            .clone()
            .unwrap_or_else(generate_owner_token);
        let hub = Arc::new(InvalidationHub::new());
        let scheduler = Arc::new(RenewalScheduler::new(
            store.clone(),
            hub.clone(),
            owner_token.clone(),
            config.lease_ttl(),
            config.renew_interval(),
        ));
        debug!("Lock registry initialized with owner token '{owner_token}'");
        Ok(Self {
            store,
            scheduler,
            hub,
            owner_token,
            ttl: config.lease_ttl(),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the handle for `key`, creating it on first access. Repeated
    /// calls with the same key return the identical `Arc`.
    pub fn get_lock(&self, key: &str) -> Arc<LeaseHandle> {
        let mut handles = self.lock_handles();
        handles
            .entry(key.to_string())
            .or_insert_with(|| {
                LeaseHandle::new(
                    key.to_string(),
                    self.owner_token.clone(),
                    self.ttl,
                    self.store.clone(),
                    self.scheduler.clone(),
                )
            })
            .clone()
    }

    /// Removes cached handles that are idle and untouched for at least
    /// `threshold`, bounding registry memory. A caller that kept an `Arc`
    /// across a sweep should fetch a fresh handle rather than reuse it.
    pub fn sweep_expired(&self, threshold: Duration) -> SweepReport {
        let start = Instant::now();
        let mut handles = self.lock_handles();
        let examined = handles.len();
        handles.retain(|_, handle| match handle.idle_for() {
            Some(idle) => idle < threshold,
            None => true,
        });
        let removed = examined - handles.len();
        drop(handles);
        if removed > 0 {
            debug!("Swept {removed} idle lease handle(s) from the registry");
        }
        SweepReport {
            examined,
            removed,
            duration: start.elapsed(),
        }
    }

    /// Number of cached handles. Diagnostic accessor for tests.
    pub fn handle_count(&self) -> usize {
        self.lock_handles().len()
    }

    /// Keys with a cached handle. Diagnostic accessor for tests.
    pub fn keys(&self) -> Vec<String> {
        self.lock_handles().keys().cloned().collect()
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// Hub publishing lease-lost events for leases this registry held.
    pub fn invalidation_hub(&self) -> &Arc<InvalidationHub> {
        &self.hub
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<String, Arc<LeaseHandle>>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for LockRegistry {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry")
            .field("owner_token", &self.owner_token)
            .field("handles", &self.handle_count())
            .finish()
    }
}

fn generate_owner_token() -> String {
    format!("{}#{}", std::process::id(), uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLeaseStore;
    use std::sync::Barrier;
    use std::thread;

    fn registry() -> LockRegistry {
        let store = Arc::new(InMemoryLeaseStore::new());
        LockRegistry::new(store, &LockingConfig::default()).unwrap()
    }

    #[test]
    fn same_key_returns_identical_handle() {
        let registry = registry();
        let first = registry.get_lock("trace-1");
        let second = registry.get_lock("trace-1");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn distinct_keys_return_distinct_handles() {
        let registry = registry();
        let first = registry.get_lock("trace-1");
        let second = registry.get_lock("trace-2");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.handle_count(), 2);
    }

    #[test]
    fn concurrent_first_access_produces_single_winner() {
        let registry = Arc::new(registry());
        let barrier = Arc::new(Barrier::new(8));

        let mut workers = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            workers.push(thread::spawn(move || {
                barrier.wait();
                registry.get_lock("trace-1")
            }));
        }
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect();

        assert_eq!(registry.handle_count(), 1);
        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], handle));
        }
    }

    #[test]
    fn generated_tokens_are_unique_per_registry() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let first = LockRegistry::new(store.clone(), &LockingConfig::default()).unwrap();
        let second = LockRegistry::new(store, &LockingConfig::default()).unwrap();
        assert_ne!(first.owner_token(), second.owner_token());
    }

    #[test]
    fn sweep_removes_only_stale_idle_handles() {
        let registry = registry();
        let held = registry.get_lock("trace-held");
        held.acquire().unwrap();
        let _idle = registry.get_lock("trace-idle");

        thread::sleep(Duration::from_millis(50));
        let report = registry.sweep_expired(Duration::from_millis(20));
        assert_eq!(report.examined, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(registry.keys(), vec!["trace-held".to_string()]);

        held.release().unwrap();
        let report = registry.sweep_expired(Duration::from_secs(3600));
        assert_eq!(report.removed, 0, "fresh idle handles stay cached");
    }

    #[test]
    fn sweep_keeps_recently_used_handles() {
        let registry = registry();
        let _handle = registry.get_lock("trace-1");
        let report = registry.sweep_expired(Duration::from_secs(60));
        assert_eq!(report.examined, 1);
        assert_eq!(report.removed, 0);
    }
}
