//! Event store behaviour settings.

use std::time::Duration;

use serde::Deserialize;

use crate::events::StreamIdentity;
use crate::storage::locks::LockWaitPolicy;
use crate::tenancy::{TenancyStyle, DEFAULT_TENANT};

/// Stream identity, creation and tenancy rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Guid or string-key stream identities.
    pub stream_identity: StreamIdentity,
    /// Let an append to a missing stream create it.
    pub implicit_stream_creation: bool,
    pub tenancy: TenancyStyle,
    /// Tenant used when none is requested.
    pub default_tenant: String,
    pub locking: LockingConfig,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            stream_identity: StreamIdentity::Guid,
            implicit_stream_creation: false,
            tenancy: TenancyStyle::Single,
            default_tenant: DEFAULT_TENANT.to_string(),
            locking: LockingConfig::default(),
        }
    }
}

/// What a writer does when another session holds a stream's exclusive lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicyKind {
    #[default]
    FailFast,
    Wait,
}

/// Exclusive lock settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub policy: LockPolicyKind,
    /// Upper bound on waiting under the `wait` policy.
    pub wait_timeout_ms: u64,
    /// Locks of a crashed holder expire after this long.
    pub lease_secs: u64,
}

impl LockingConfig {
    pub fn wait_policy(&self) -> LockWaitPolicy {
        match self.policy {
            LockPolicyKind::FailFast => LockWaitPolicy::FailFast,
            LockPolicyKind::Wait => LockWaitPolicy::Wait {
                timeout: Duration::from_millis(self.wait_timeout_ms),
            },
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            policy: LockPolicyKind::FailFast,
            wait_timeout_ms: 2_000,
            lease_secs: 30,
        }
    }
}
