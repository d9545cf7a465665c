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

use crate::error::{KagiError, Result};
use crate::locking::handle::LeaseHandle;
use crate::locking::registry::LockRegistry;
use log::warn;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// RAII guard that releases its lease when dropped.
///
/// Release must happen on the acquiring thread, so the guard is `!Send`.
#[derive(Debug)]
pub struct LeaseGuard {
    handle: Arc<LeaseHandle>,
    released: bool,
    waited: Duration,
    _not_send: PhantomData<*const ()>,
}

impl LeaseGuard {
    fn new(handle: Arc<LeaseHandle>, waited: Duration) -> Self {
        Self {
            handle,
            released: false,
            waited,
            _not_send: PhantomData,
        }
    }

    /// Blocks until the lease for `key` is acquired.
    pub fn acquire(registry: &LockRegistry, key: &str) -> Result<Self> {
        let handle = registry.get_lock(key);
        let started = Instant::now();
        handle.acquire()?;
        Ok(Self::new(handle, started.elapsed()))
    }

    /// Bounded acquisition; fails with `AcquireTimeout` when the deadline
    /// passes without the lease.
    pub fn acquire_within(registry: &LockRegistry, key: &str, timeout: Duration) -> Result<Self> {
        let handle = registry.get_lock(key);
        let started = Instant::now();
        if handle.try_acquire_for(timeout)? {
            Ok(Self::new(handle, started.elapsed()))
        } else {
            Err(KagiError::AcquireTimeout {
                key: key.to_string(),
                waited_secs: started.elapsed().as_secs_f64(),
            })
        }
    }

    pub fn key(&self) -> &str {
        self.handle.key()
    }

    /// Time spent waiting for the lease.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.handle.release()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.handle.release() {
            warn!("Failed to release lease '{}': {err}", self.handle.key());
        }
    }
}
