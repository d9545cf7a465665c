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

//! Background renewal of held leases.
//!
//! One thread per registry renews every held lease on a fixed interval; a
//! failed renewal (`Ok(false)` from the store) revokes local ownership and
//! publishes a lease-lost event. A store transport error is retried on the
//! next tick: the row's TTL remains the arbiter, so once the outage outlasts
//! the TTL the next successful round trip reports the loss.

use crate::locking::handle::LeaseHandle;
use crate::locking::invalidation::{InvalidationHub, LeaseLostEvent};
use crate::store::LeaseStore;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct SchedulerInner {
    active: HashMap<String, Weak<LeaseHandle>>,
    worker: Option<JoinHandle<()>>,
    shutdown: bool,
}

/// Shared periodic renewal task for all held leases in a process.
pub struct RenewalScheduler {
    store: Arc<dyn LeaseStore>,
    hub: Arc<InvalidationHub>,
    owner_token: String,
    ttl: Duration,
    interval: Duration,
    inner: Mutex<SchedulerInner>,
    wakeup: Condvar,
}

impl RenewalScheduler {
    pub(crate) fn new(
        store: Arc<dyn LeaseStore>,
        hub: Arc<InvalidationHub>,
        owner_token: String,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            owner_token,
            ttl,
            interval,
            inner: Mutex::new(SchedulerInner {
                active: HashMap::new(),
                worker: None,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Number of leases currently under renewal. Diagnostic accessor for
    /// tests.
    pub fn active_count(&self) -> usize {
        self.lock_inner().active.len()
    }

    /// Registers a held handle for renewal. The worker thread is spawned
    /// lazily on the first registration.
    pub(crate) fn register(this: &Arc<Self>, key: &str, handle: Weak<LeaseHandle>) {
        let mut inner = this.lock_inner();
        inner.active.insert(key.to_string(), handle);
        if inner.worker.is_none() && !inner.shutdown {
            let weak = Arc::downgrade(this);
            let spawned = thread::Builder::new()
                .name("kagi-lease-renewal".to_string())
                .spawn(move || run(weak));
            match spawned {
                Ok(worker) => inner.worker = Some(worker),
                Err(err) => warn!("Failed to spawn lease renewal thread: {err}"),
            }
        }
    }

    pub(crate) fn unregister(&self, key: &str) {
        self.lock_inner().active.remove(key);
    }

    /// Stops the worker thread and waits for it to exit. Called by the
    /// registry on drop; leases no longer renewed expire at the store.
    pub(crate) fn shutdown(&self) {
        let worker = {
            let mut inner = self.lock_inner();
            inner.shutdown = true;
            inner.worker.take()
        };
        self.wakeup.notify_all();
        if let Some(worker) = worker
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }

    /// Parks for one interval, then renews the active set. Returns `true`
    /// when the scheduler is shutting down.
    fn park_and_renew(&self) -> bool {
        let mut inner = self.lock_inner();
        if inner.shutdown {
            return true;
        }
        let (next, _) = self
            .wakeup
            .wait_timeout(inner, self.interval)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner = next;
        if inner.shutdown {
            return true;
        }
        let snapshot: Vec<(String, Weak<LeaseHandle>)> = inner
            .active
            .iter()
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect();
        drop(inner);

        for (key, weak_handle) in snapshot {
            let Some(handle) = weak_handle.upgrade() else {
                self.unregister(&key);
                continue;
            };
            match self.store.renew(&key, &self.owner_token, self.ttl) {
                Ok(true) => trace!("Renewed lease '{key}'"),
                Ok(false) => {
                    self.unregister(&key);
                    if handle.invalidate() {
                        self.hub.publish(&LeaseLostEvent::now(
                            key,
                            self.owner_token.clone(),
                        ));
                    }
                }
                Err(err) => warn!("Failed to renew lease '{key}': {err}"),
            }
        }
        false
    }

    fn lock_inner(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("owner_token", &self.owner_token)
            .field("ttl", &self.ttl)
            .field("interval", &self.interval)
            .field("active", &self.active_count())
            .finish()
    }
}

/// Worker loop. Holds only a weak reference between ticks so an abandoned
/// scheduler winds itself down after one final interval.
fn run(weak: Weak<RenewalScheduler>) {
    debug!("Lease renewal thread started");
    loop {
        let Some(scheduler) = weak.upgrade() else {
            break;
        };
        if scheduler.park_and_renew() {
            break;
        }
    }
    debug!("Lease renewal thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLeaseStore;

    fn make_scheduler(
        store: Arc<InMemoryLeaseStore>,
        hub: Arc<InvalidationHub>,
        ttl: Duration,
        interval: Duration,
    ) -> Arc<RenewalScheduler> {
        Arc::new(RenewalScheduler::new(
            store,
            hub,
            "worker-a".to_string(),
            ttl,
            interval,
        ))
    }

    fn held_handle(
        store: &Arc<InMemoryLeaseStore>,
        scheduler: &Arc<RenewalScheduler>,
        ttl: Duration,
    ) -> Arc<LeaseHandle> {
        let handle = LeaseHandle::new(
            "trace-1".to_string(),
            "worker-a".to_string(),
            ttl,
            store.clone() as Arc<dyn LeaseStore>,
            scheduler.clone(),
        );
        handle.acquire().unwrap();
        handle
    }

    #[test]
    fn renewal_keeps_short_lease_alive() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let hub = Arc::new(InvalidationHub::default());
        let ttl = Duration::from_millis(100);
        let scheduler = make_scheduler(store.clone(), hub, ttl, Duration::from_millis(50));
        let handle = held_handle(&store, &scheduler, ttl);

        thread::sleep(Duration::from_millis(400));
        assert!(handle.is_held(), "renewals should outlive the raw ttl");
        assert!(
            !store
                .try_acquire("trace-1", "worker-z", Duration::from_secs(1))
                .unwrap(),
            "a renewed lease must not be claimable by another token"
        );
        handle.release().unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn missed_renewal_invalidates_and_publishes() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let hub = Arc::new(InvalidationHub::default());
        let (tx, rx) = std::sync::mpsc::channel::<String>();
        let tx = Mutex::new(tx);
        hub.subscribe_fn(move |event| {
            let _ = tx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .send(event.key.clone());
        });

        let ttl = Duration::from_millis(80);
        // Interval far above the ttl: the lease expires before the first tick.
        let scheduler = make_scheduler(store.clone(), hub, ttl, Duration::from_millis(200));
        let handle = held_handle(&store, &scheduler, ttl);

        let lost_key = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(lost_key, "trace-1");
        assert!(!handle.is_held());
        assert_eq!(scheduler.active_count(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn release_before_tick_produces_no_event() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let hub = Arc::new(InvalidationHub::default());
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_flag = Arc::clone(&fired);
        hub.subscribe_fn(move |_| fired_flag.store(true, std::sync::atomic::Ordering::SeqCst));

        let ttl = Duration::from_millis(80);
        let scheduler = make_scheduler(store.clone(), hub, ttl, Duration::from_millis(150));
        let handle = held_handle(&store, &scheduler, ttl);
        handle.release().unwrap();

        thread::sleep(Duration::from_millis(400));
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
        scheduler.shutdown();
    }
}
