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

pub mod acquisition;
pub mod cancellation;
pub mod guard;
pub mod handle;
pub mod invalidation;
pub mod registry;
pub mod renewal;
pub mod timeout;

pub use acquisition::{
    AcquireMode, AcquireOutcome, AcquireRequest, LockWaitObserver, NoopLockWaitObserver,
    PollingBackoff,
};
pub use cancellation::{CancellationToken, global_token};
pub use guard::LeaseGuard;
pub use handle::LeaseHandle;
pub use invalidation::{InvalidationHub, InvalidationListener, LeaseLostEvent};
pub use registry::{LockRegistry, SweepReport};
pub use renewal::RenewalScheduler;
pub use timeout::{
    LeaseTimeoutResolution, LeaseTimeoutResolver, LeaseTimeoutSource, LeaseTimeoutValue,
    parse_timeout_override,
};
