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

//! Fan-out channel for lost leases.
//!
//! When a renewal fails, the scheduler revokes local ownership and publishes
//! a key-based event here so external consumers (e.g. a trace-ownership
//! cache in the flow engine) can drop their own notion of ownership without
//! polling. Events carry keys, never handle references; matching by key is
//! equivalent and survives a handle being swept and recreated.

use chrono::{DateTime, Utc};
use log::debug;
use std::sync::{Arc, Mutex};

/// Published when a held lease is lost despite local belief of ownership.
#[derive(Debug, Clone)]
pub struct LeaseLostEvent {
    pub key: String,
    pub owner_token: String,
    pub lost_at: DateTime<Utc>,
}

impl LeaseLostEvent {
    pub(crate) fn now(key: String, owner_token: String) -> Self {
        Self {
            key,
            owner_token,
            lost_at: Utc::now(),
        }
    }
}

/// Callback invoked on the renewal thread; implementations must not block.
pub trait InvalidationListener: Send + Sync {
    fn lease_lost(&self, event: &LeaseLostEvent);
}

struct FnListener<F>(F);

impl<F> InvalidationListener for FnListener<F>
where
    F: Fn(&LeaseLostEvent) + Send + Sync,
{
    fn lease_lost(&self, event: &LeaseLostEvent) {
        (self.0)(event)
    }
}

/// Subscribe/publish hub for lease-lost events.
#[derive(Default)]
pub struct InvalidationHub {
    listeners: Mutex<Vec<Arc<dyn InvalidationListener>>>,
}

impl InvalidationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        self.lock_listeners().push(listener);
    }

    pub fn subscribe_fn<F>(&self, callback: F)
    where
        F: Fn(&LeaseLostEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnListener(callback)));
    }

    /// Number of registered listeners. Diagnostic accessor for tests.
    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    pub(crate) fn publish(&self, event: &LeaseLostEvent) {
        let snapshot: Vec<_> = self.lock_listeners().clone();
        debug!(
            "Publishing lease-lost event for '{}' to {} listener(s)",
            event.key,
            snapshot.len()
        );
        for listener in snapshot {
            listener.lease_lost(event);
        }
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn InvalidationListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for InvalidationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_reaches_every_listener() {
        let hub = InvalidationHub::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            hub.subscribe_fn(move |event| {
                assert_eq!(event.key, "trace-7");
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hub.listener_count(), 3);

        hub.publish(&LeaseLostEvent::now(
            "trace-7".to_string(),
            "worker-a".to_string(),
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn publish_without_listeners_is_harmless() {
        let hub = InvalidationHub::new();
        hub.publish(&LeaseLostEvent::now(
            "trace-7".to_string(),
            "worker-a".to_string(),
        ));
    }
}
