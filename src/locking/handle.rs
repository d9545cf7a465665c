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

//! Per-key lease handle.
//!
//! The handle layers thread-level reentrancy over a remote lease: the owning
//! thread re-acquires without a store round trip, while non-owning threads
//! serialize on an intra-process gate so only one thread per process polls
//! the store for a given key. The store row stays the sole arbiter of
//! cross-process exclusivity; everything in this struct is a local cache
//! that is authoritative only between renewals.

use crate::error::{KagiError, Result};
use crate::locking::acquisition::{AcquireMode, AcquireOutcome, AcquireRequest};
use crate::locking::cancellation::CancellationToken;
use crate::locking::renewal::RenewalScheduler;
use crate::locking::timeout::LeaseTimeoutValue;
use crate::store::LeaseStore;
use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Upper bound on a single gate wait so cancellation and deadlines are
/// observed even when no release wakes the condvar.
const GATE_WAIT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct HandleState {
    owner: Option<ThreadId>,
    reentrancy: u32,
    attempt_in_flight: bool,
    invalidated_owner: Option<ThreadId>,
    idle_since: Instant,
}

/// Cluster-aware lock for one key, shaped like a conventional mutual-exclusion
/// primitive. Obtained through `LockRegistry::get_lock`; one instance per key
/// per process.
pub struct LeaseHandle {
    key: String,
    owner_token: String,
    ttl: Duration,
    store: Arc<dyn LeaseStore>,
    scheduler: Arc<RenewalScheduler>,
    self_ref: Weak<LeaseHandle>,
    state: Mutex<HandleState>,
    state_changed: Condvar,
}

impl LeaseHandle {
    pub(crate) fn new(
        key: String,
        owner_token: String,
        ttl: Duration,
        store: Arc<dyn LeaseStore>,
        scheduler: Arc<RenewalScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            key,
            owner_token,
            ttl,
            store,
            scheduler,
            self_ref: self_ref.clone(),
            state: Mutex::new(HandleState {
                owner: None,
                reentrancy: 0,
                attempt_in_flight: false,
                invalidated_owner: None,
                idle_since: Instant::now(),
            }),
            state_changed: Condvar::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn is_held(&self) -> bool {
        self.lock_state().reentrancy > 0
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.lock_state().owner == Some(thread::current().id())
    }

    /// Current reentrancy depth. Diagnostic accessor for tests.
    pub fn reentrancy(&self) -> u32 {
        self.lock_state().reentrancy
    }

    /// How long the handle has been idle, or `None` while held or while a
    /// local thread is mid-attempt. Used by the registry sweep.
    pub(crate) fn idle_for(&self) -> Option<Duration> {
        let state = self.lock_state();
        if state.reentrancy > 0 || state.attempt_in_flight {
            None
        } else {
            Some(state.idle_since.elapsed())
        }
    }

    /// Blocks until the lease is acquired, retrying store outages with
    /// backoff.
    pub fn acquire(&self) -> Result<()> {
        let mut request = AcquireRequest::new(LeaseTimeoutValue::Infinite);
        match self.acquire_with_request(&mut request)? {
            AcquireOutcome::Acquired => Ok(()),
            AcquireOutcome::NotAcquired => Err(KagiError::AcquireTimeout {
                key: self.key.clone(),
                waited_secs: request.elapsed().as_secs_f64(),
            }),
        }
    }

    /// Blocks like [`acquire`](Self::acquire) but observes `token` at every
    /// poll boundary and returns `AcquireCancelled` once it fires.
    pub fn acquire_interruptibly(&self, token: &CancellationToken) -> Result<()> {
        let mut request = AcquireRequest::new(LeaseTimeoutValue::Infinite)
            .with_cancellation(token.clone());
        match self.acquire_with_request(&mut request)? {
            AcquireOutcome::Acquired => Ok(()),
            AcquireOutcome::NotAcquired => Err(KagiError::AcquireTimeout {
                key: self.key.clone(),
                waited_secs: request.elapsed().as_secs_f64(),
            }),
        }
    }

    /// Bounded wait. `Ok(false)` when the deadline passes without the lease;
    /// the intra-process gate is left free for the next waiter.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<bool> {
        let mut request = AcquireRequest::new(LeaseTimeoutValue::Finite(timeout));
        let outcome = self.acquire_with_request(&mut request)?;
        Ok(outcome == AcquireOutcome::Acquired)
    }

    /// Single non-blocking attempt. Store transport errors propagate here;
    /// the blocking variants retry them instead.
    pub fn try_acquire(&self) -> Result<bool> {
        let mut request = AcquireRequest::new(LeaseTimeoutValue::Finite(Duration::ZERO))
            .with_mode(AcquireMode::NonBlocking);
        let outcome = self.acquire_with_request(&mut request)?;
        Ok(outcome == AcquireOutcome::Acquired)
    }

    /// Low-level acquisition entry point carrying backoff, budget,
    /// cancellation, and observer configuration.
    pub fn acquire_with_request(
        &self,
        request: &mut AcquireRequest<'_>,
    ) -> Result<AcquireOutcome> {
        let me = thread::current().id();
        let mut state = self.lock_state();

        // Pure local reentrancy: no store call when the calling thread is
        // already the owner.
        if state.owner == Some(me) {
            state.reentrancy = state.reentrancy.saturating_add(1);
            request.notify_acquired(&self.key);
            return Ok(AcquireOutcome::Acquired);
        }

        // Intra-process gate: wait while another local thread holds the lease
        // or is mid-attempt against the store.
        while state.owner.is_some() || state.attempt_in_flight {
            if request.mode().is_non_blocking() {
                return Ok(AcquireOutcome::NotAcquired);
            }
            request.record_wait_start(&self.key);
            if request.cancellation().is_cancelled() {
                request.notify_cancelled(&self.key);
                return Err(self.cancelled_error(request));
            }
            if request.budget().is_expired() {
                request.notify_timeout(&self.key);
                return Ok(AcquireOutcome::NotAcquired);
            }
            let wait_for = request
                .remaining()
                .map_or(GATE_WAIT_SLICE, |remaining| remaining.min(GATE_WAIT_SLICE));
            let (next, _) = self
                .state_changed
                .wait_timeout(state, wait_for)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }

        state.attempt_in_flight = true;
        drop(state);

        self.poll_store(me, request)
    }

    fn poll_store(&self, me: ThreadId, request: &mut AcquireRequest<'_>) -> Result<AcquireOutcome> {
        loop {
            if request.cancellation().is_cancelled() {
                self.end_attempt();
                request.notify_cancelled(&self.key);
                return Err(self.cancelled_error(request));
            }

            match self.store.try_acquire(&self.key, &self.owner_token, self.ttl) {
                Ok(true) => {
                    {
                        let mut state = self.lock_state();
                        state.owner = Some(me);
                        state.reentrancy = 1;
                        state.invalidated_owner = None;
                        state.attempt_in_flight = false;
                    }
                    self.state_changed.notify_all();
                    RenewalScheduler::register(&self.scheduler, &self.key, self.self_ref.clone());
                    request.notify_acquired(&self.key);
                    debug!(
                        "Acquired lease '{}' after {:.3}s",
                        self.key,
                        request.elapsed().as_secs_f64()
                    );
                    return Ok(AcquireOutcome::Acquired);
                }
                Ok(false) => {
                    if request.mode().is_non_blocking() {
                        self.end_attempt();
                        return Ok(AcquireOutcome::NotAcquired);
                    }
                }
                Err(err) => {
                    if request.mode().is_non_blocking() {
                        self.end_attempt();
                        return Err(err);
                    }
                    // Transient; never treated as acquired.
                    warn!(
                        "Lease store unavailable while acquiring '{}': {err}",
                        self.key
                    );
                }
            }

            request.record_wait_start(&self.key);
            if request.budget().is_expired() {
                self.end_attempt();
                request.notify_timeout(&self.key);
                return Ok(AcquireOutcome::NotAcquired);
            }
            request.record_retry(&self.key);
            match request.next_sleep_interval() {
                Some(delay) => thread::sleep(delay),
                None => {
                    self.end_attempt();
                    request.notify_timeout(&self.key);
                    return Ok(AcquireOutcome::NotAcquired);
                }
            }
        }
    }

    /// Releases one level of reentrancy; at depth zero the store row is
    /// deleted and the handle returns to idle.
    ///
    /// A release by a thread whose lease was revoked by invalidation is a
    /// tolerated no-op. A release by a thread that never owned the handle is
    /// an ownership violation, surfaced as an error and never retried.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.lock_state();

        if state.owner == Some(me) {
            state.reentrancy -= 1;
            if state.reentrancy > 0 {
                return Ok(());
            }
            self.scheduler.unregister(&self.key);
            if let Err(err) = self.store.release(&self.key, &self.owner_token) {
                // The row expires on its own once renewals stop.
                warn!("Failed to release lease '{}' at the store: {err}", self.key);
            }
            state.owner = None;
            state.idle_since = Instant::now();
            drop(state);
            self.state_changed.notify_all();
            debug!("Released lease '{}'", self.key);
            return Ok(());
        }

        if state.invalidated_owner == Some(me) {
            state.invalidated_owner = None;
            debug!(
                "Ignoring release of lease '{}' already lost to invalidation",
                self.key
            );
            return Ok(());
        }

        Err(KagiError::OwnershipViolation {
            key: self.key.clone(),
            thread: format!("{me:?}"),
        })
    }

    /// Revokes local ownership without touching the store; another process
    /// may already own the row. Returns whether the handle was actually held,
    /// so a voluntary release racing the renewal tick does not produce a
    /// spurious lease-lost event.
    pub(crate) fn invalidate(&self) -> bool {
        let mut state = self.lock_state();
        if state.owner.is_none() {
            return false;
        }
        state.invalidated_owner = state.owner.take();
        state.reentrancy = 0;
        state.idle_since = Instant::now();
        drop(state);
        self.state_changed.notify_all();
        warn!("Lease '{}' was lost; local ownership revoked", self.key);
        true
    }

    fn end_attempt(&self) {
        let mut state = self.lock_state();
        state.attempt_in_flight = false;
        state.idle_since = Instant::now();
        drop(state);
        self.state_changed.notify_all();
    }

    fn cancelled_error(&self, request: &AcquireRequest<'_>) -> KagiError {
        KagiError::AcquireCancelled {
            key: self.key.clone(),
            waited_secs: request.elapsed().as_secs_f64(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("LeaseHandle")
            .field("key", &self.key)
            .field("owner_token", &self.owner_token)
            .field("reentrancy", &state.reentrancy)
            .field("attempt_in_flight", &state.attempt_in_flight)
            .finish()
    }
}
