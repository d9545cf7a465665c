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

use crate::locking::cancellation::CancellationToken;
use crate::locking::timeout::LeaseTimeoutValue;
use std::cmp;
use std::time::{Duration, Instant};

/// Indicates whether a lease request may block waiting for contention to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    Blocking,
    NonBlocking,
}

impl AcquireMode {
    pub fn is_blocking(self) -> bool {
        matches!(self, AcquireMode::Blocking)
    }

    pub fn is_non_blocking(self) -> bool {
        matches!(self, AcquireMode::NonBlocking)
    }
}

/// Final disposition of an acquisition attempt that did not error.
///
/// A bounded wait that reaches its deadline is a result, not an error;
/// cancellation, by contrast, surfaces as `KagiError::AcquireCancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    NotAcquired,
}

/// Exponential backoff configuration used while polling the lease store.
#[derive(Debug, Clone)]
pub struct PollingBackoff {
    initial: Duration,
    factor: u32,
    cap: Duration,
    current: Duration,
}

impl PollingBackoff {
    pub fn new(initial: Duration, factor: u32, cap: Duration) -> Self {
        Self {
            initial,
            factor: cmp::max(factor, 1),
            cap,
            current: initial,
        }
    }

    /// Returns the current delay and advances the backoff sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.saturating_mul(self.factor);
        self.current = cmp::min(next, self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn peek(&self) -> Duration {
        self.current
    }
}

impl Default for PollingBackoff {
    fn default() -> Self {
        // Cap low enough that a takeover after lease expiry lands within a
        // couple of hundred milliseconds of the row becoming free.
        Self::new(Duration::from_millis(10), 2, Duration::from_millis(200))
    }
}

/// Tracks elapsed and remaining time for an acquisition wait budget.
#[derive(Debug, Clone)]
pub struct LeaseTimeoutBudget {
    value: LeaseTimeoutValue,
    started_at: Instant,
}

impl LeaseTimeoutBudget {
    pub fn new(value: LeaseTimeoutValue) -> Self {
        Self {
            value,
            started_at: Instant::now(),
        }
    }

    pub fn value(&self) -> LeaseTimeoutValue {
        self.value
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self.value {
            LeaseTimeoutValue::Infinite => None,
            LeaseTimeoutValue::Finite(limit) => Some(limit.saturating_sub(self.elapsed())),
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.value, LeaseTimeoutValue::Finite(limit) if self.elapsed() >= limit)
    }
}

/// Observer hooks for lease wait events.
///
/// Decouples the handle's polling loop from user-facing feedback so callers
/// can surface contention without duplicating the loop.
pub trait LockWaitObserver: Send + Sync {
    fn on_wait_start(&self, _key: &str, _timeout: LeaseTimeoutValue) {}

    fn on_retry(
        &self,
        _key: &str,
        _attempt: usize,
        _elapsed: Duration,
        _remaining: Option<Duration>,
    ) {
    }

    fn on_acquired(&self, _key: &str, _waited: Duration) {}

    fn on_timeout(&self, _key: &str, _waited: Duration) {}

    fn on_cancelled(&self, _key: &str, _waited: Duration) {}
}

/// Observer implementation that performs no work.
#[derive(Debug, Default)]
pub struct NoopLockWaitObserver;

impl LockWaitObserver for NoopLockWaitObserver {}

/// Carries the configuration for a single acquisition attempt.
pub struct AcquireRequest<'a> {
    budget: LeaseTimeoutBudget,
    cancellation: CancellationToken,
    backoff: PollingBackoff,
    observer: Option<&'a dyn LockWaitObserver>,
    mode: AcquireMode,
    retries: usize,
    wait_started: bool,
}

impl<'a> AcquireRequest<'a> {
    pub fn new(timeout: LeaseTimeoutValue) -> Self {
        Self {
            budget: LeaseTimeoutBudget::new(timeout),
            cancellation: CancellationToken::new(),
            backoff: PollingBackoff::default(),
            observer: None,
            mode: AcquireMode::Blocking,
            retries: 0,
            wait_started: false,
        }
    }

    pub fn with_mode(mut self, mode: AcquireMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_backoff(mut self, backoff: PollingBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_observer(mut self, observer: Option<&'a dyn LockWaitObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    pub fn budget(&self) -> &LeaseTimeoutBudget {
        &self.budget
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn elapsed(&self) -> Duration {
        self.budget.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.budget.remaining()
    }

    pub fn timeout_value(&self) -> LeaseTimeoutValue {
        self.budget.value()
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Next sleep interval, clamped to the remaining budget. `None` means the
    /// budget is exhausted.
    pub fn next_sleep_interval(&mut self) -> Option<Duration> {
        let remaining = self.remaining();
        let mut delay = self.backoff.next_delay();
        if let Some(remaining_budget) = remaining {
            if remaining_budget < delay {
                delay = remaining_budget;
            }
            if delay.is_zero() {
                return None;
            }
        }
        Some(delay)
    }

    pub fn record_wait_start(&mut self, key: &str) {
        if !self.wait_started {
            if let Some(observer) = self.observer {
                observer.on_wait_start(key, self.timeout_value());
            }
            self.wait_started = true;
        }
    }

    pub fn record_retry(&mut self, key: &str) {
        self.retries = self.retries.saturating_add(1);
        if let Some(observer) = self.observer {
            observer.on_retry(key, self.retries, self.elapsed(), self.remaining());
        }
    }

    pub fn notify_acquired(&self, key: &str) {
        if let Some(observer) = self.observer {
            observer.on_acquired(key, self.elapsed());
        }
    }

    pub fn notify_timeout(&self, key: &str) {
        if let Some(observer) = self.observer {
            observer.on_timeout(key, self.elapsed());
        }
    }

    pub fn notify_cancelled(&self, key: &str) {
        if let Some(observer) = self.observer {
            observer.on_cancelled(key, self.elapsed());
        }
    }
}
