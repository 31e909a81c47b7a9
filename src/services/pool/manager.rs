//! Credential pool manager
//!
//! Owns the in-memory slot list, loads it once from the credential store,
//! writes it back whole, and keeps the active count topped up by driving the
//! provisioner in the background.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use super::lock::{LockAttempt, ProvisioningGuard, ProvisioningLock};
use super::slots::{ActiveSlot, Slot, SlotPool};
use crate::services::provisioner::{ProvisionError, Provisioner};
use crate::services::tasks::TaskSupervisor;
use crate::store::{CredentialStore, StorageError};
use crate::utils::retry::{presets, retry_with_backoff, RetryConfig};
use crate::utils::{mask_secret, with_timeout, TimeoutError};

// ============================================================================
// Configuration
// ============================================================================

/// When the pool is written back to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Only when a provisioning round brings the pool up to its minimum
    #[default]
    OnTarget,
    /// After every placement and every exhaustion
    EveryChange,
}

impl fmt::Display for PersistPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistPolicy::OnTarget => write!(f, "on_target"),
            PersistPolicy::EveryChange => write!(f, "every_change"),
        }
    }
}

impl std::str::FromStr for PersistPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "on_target" => Ok(PersistPolicy::OnTarget),
            "every_change" => Ok(PersistPolicy::EveryChange),
            _ => anyhow::bail!("Invalid persist policy: {}. Expected: on_target or every_change", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Active credentials the pool tries to keep
    pub min_active: usize,
    /// Logical store key holding the persisted pool
    pub storage_key: String,
    /// Upper bound for one provisioner call
    pub provision_timeout: Duration,
    /// Age after which a held provisioning lock is taken over
    pub lock_stale_after: Duration,
    /// Pause before the next round while still below the minimum
    pub retry_delay: Duration,
    pub persist_policy: PersistPolicy,
    pub conflict_retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_active: 5,
            storage_key: "huggingface_api_keys".to_string(),
            provision_timeout: Duration::from_secs(300),
            lock_stale_after: Duration::from_secs(300),
            retry_delay: Duration::from_secs(1),
            persist_policy: PersistPolicy::OnTarget,
            conflict_retry: presets::store_conflict(2),
        }
    }
}

impl PoolConfig {
    pub fn new(min_active: usize) -> Self {
        Self {
            min_active,
            ..Self::default()
        }
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_persist_policy(mut self, policy: PersistPolicy) -> Self {
        self.persist_policy = policy;
        self
    }

    pub fn with_conflict_retry(mut self, retry: RetryConfig) -> Self {
        self.conflict_retry = retry;
        self
    }
}

// ============================================================================
// Errors & Outcomes
// ============================================================================

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Failed to encode credential pool: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of [`PoolManager::provision_if_needed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionTrigger {
    /// Already at or above the minimum
    Satisfied,
    /// Another round holds the lock
    InProgress,
    /// A new round was spawned
    Started,
}

/// Read-only view for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub initialized: bool,
    pub slots: usize,
    pub active: usize,
    pub min_active: usize,
    pub provisioning: bool,
    pub provisioning_for_ms: Option<u64>,
    pub persist_policy: PersistPolicy,
    pub background_failures: u64,
}

// ============================================================================
// Pool Manager
// ============================================================================

struct PoolInner {
    config: PoolConfig,
    store: Arc<dyn CredentialStore>,
    provisioner: Arc<dyn Provisioner>,
    slots: RwLock<SlotPool>,
    loaded: OnceCell<()>,
    lock: ProvisioningLock,
    persist_gate: Mutex<()>,
    tasks: TaskSupervisor,
}

/// Shared handle to the credential pool
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn CredentialStore>,
        provisioner: Arc<dyn Provisioner>,
        tasks: TaskSupervisor,
    ) -> Self {
        let lock = ProvisioningLock::new(config.lock_stale_after);
        Self {
            inner: Arc::new(PoolInner {
                config,
                store,
                provisioner,
                slots: RwLock::new(SlotPool::new()),
                loaded: OnceCell::new(),
                lock,
                persist_gate: Mutex::new(()),
                tasks,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn slots(&self) -> RwLockReadGuard<'_, SlotPool> {
        self.inner.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots_mut(&self) -> RwLockWriteGuard<'_, SlotPool> {
        self.inner.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the persisted pool. Only the first call reads the store; later
    /// and concurrent callers wait for that load.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        self.inner.loaded.get_or_try_init(|| self.load()).await?;
        Ok(())
    }

    async fn load(&self) -> Result<(), StorageError> {
        let key = &self.inner.config.storage_key;
        let pool = match self.inner.store.get(key).await? {
            Some(json) => SlotPool::from_persisted(&json).map_err(|e| StorageError::Corrupt(e.to_string()))?,
            None => {
                tracing::info!(key = %key, "No persisted credential pool; starting empty");
                SlotPool::new()
            }
        };

        tracing::info!(
            key = %key,
            backend = self.inner.store.backend(),
            slots = pool.len(),
            active = pool.active_count(),
            "Credential pool loaded"
        );

        *self.slots_mut() = pool;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.loaded.initialized()
    }

    pub fn active_count(&self) -> usize {
        self.slots().active_count()
    }

    /// Active credentials in slot order
    pub fn active_slots(&self) -> Vec<ActiveSlot> {
        self.slots().active_slots()
    }

    pub fn slot_list(&self) -> Vec<Slot> {
        self.slots().slots().to_vec()
    }

    /// Empty slot `index`. Does not persist or provision.
    pub fn deprecate(&self, index: usize) -> bool {
        self.slots_mut().deprecate(index)
    }

    /// Empty the slot of a credential the upstream reported as exhausted
    ///
    /// Only empties the slot while it still holds `token`, so a late report
    /// cannot evict a replacement placed in the meantime.
    pub fn record_exhausted(&self, index: usize, token: &str) -> bool {
        let (emptied, active) = {
            let mut slots = self.slots_mut();
            (slots.deprecate_token(index, token), slots.active_count())
        };

        if emptied {
            tracing::warn!(
                slot = index,
                credential = %mask_secret(token),
                active = active,
                "Credential exhausted; slot emptied"
            );

            if self.inner.config.persist_policy == PersistPolicy::EveryChange {
                let manager = self.clone();
                self.inner
                    .tasks
                    .spawn("persist", async move { manager.persist().await });
            }
        }

        emptied
    }

    /// Start a provisioning round unless the pool is full or one is running
    pub fn provision_if_needed(&self) -> ProvisionTrigger {
        if self.is_satisfied() {
            return ProvisionTrigger::Satisfied;
        }

        let guard = match self.inner.lock.try_acquire() {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Stolen { guard, held_for } => {
                tracing::warn!(
                    held_for_ms = held_for.as_millis() as u64,
                    stale_after_ms = self.inner.lock.stale_after().as_millis() as u64,
                    "Provisioning lock went stale; taking over"
                );
                guard
            }
            LockAttempt::Busy { held_for } => {
                tracing::debug!(held_for_ms = held_for.as_millis() as u64, "Provisioning already in progress");
                return ProvisionTrigger::InProgress;
            }
        };

        // A round may have finished between the first check and the lock.
        if self.is_satisfied() {
            return ProvisionTrigger::Satisfied;
        }

        let manager = self.clone();
        self.inner
            .tasks
            .spawn("provision", manager.provision_round(guard));
        ProvisionTrigger::Started
    }

    fn is_satisfied(&self) -> bool {
        self.is_initialized() && self.active_count() >= self.inner.config.min_active
    }

    async fn provision_round(self, guard: ProvisioningGuard) -> Result<(), PoolError> {
        self.initialize().await?;

        let config = &self.inner.config;
        if self.active_count() >= config.min_active {
            return Ok(());
        }

        tracing::info!(
            generation = guard.generation(),
            active = self.active_count(),
            min_active = config.min_active,
            provisioner = %self.inner.provisioner.describe(),
            "Provisioning a new credential"
        );

        let token = with_timeout(config.provision_timeout, self.inner.provisioner.acquire())
            .await
            .map_err(|err| match err {
                TimeoutError::Timeout(after) => ProvisionError::TimedOut(after),
                TimeoutError::Inner(inner) => inner,
            })?;

        let credential = mask_secret(&token);
        let (placement, active) = {
            let mut slots = self.slots_mut();
            (slots.place(token), slots.active_count())
        };
        drop(guard);

        if !placement.is_new() {
            tracing::warn!(
                slot = placement.index(),
                credential = %credential,
                "Provisioned credential is already pooled; discarded"
            );
        } else {
            tracing::info!(
                slot = placement.index(),
                credential = %credential,
                active = active,
                "Credential added to pool"
            );
        }

        let reached = active >= config.min_active;
        if !reached {
            let manager = self.clone();
            let delay = config.retry_delay;
            self.inner.tasks.spawn("provision-follow-up", async move {
                tokio::time::sleep(delay).await;
                manager.provision_if_needed();
                Ok::<(), Infallible>(())
            });
        }

        let persist = placement.is_new() && (reached || config.persist_policy == PersistPolicy::EveryChange);
        if persist {
            self.persist().await?;
        }

        Ok(())
    }

    /// Write the whole pool to the store
    ///
    /// Writes are serialized. A write that loses an optimistic-concurrency
    /// race is retried with backoff; any other failure is returned.
    pub async fn persist(&self) -> Result<(), PoolError> {
        let _gate = self.inner.persist_gate.lock().await;

        let (blob, slot_count, active) = {
            let slots = self.slots();
            (slots.to_persisted()?, slots.len(), slots.active_count())
        };

        let store = self.inner.store.as_ref();
        let key = self.inner.config.storage_key.as_str();
        let value = blob.as_str();

        let outcome = retry_with_backoff(&self.inner.config.conflict_retry, StorageError::is_conflict, move || {
            store.set(key, value)
        })
        .await;

        match outcome.result {
            Ok(()) => {
                tracing::info!(
                    key = %key,
                    slots = slot_count,
                    active = active,
                    attempts = outcome.attempts,
                    "Credential pool persisted"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    key = %key,
                    attempts = outcome.attempts,
                    error = %err,
                    "Failed to persist credential pool"
                );
                Err(err.into())
            }
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let (slot_count, active) = {
            let slots = self.slots();
            (slots.len(), slots.active_count())
        };
        let held_for = self.inner.lock.held_for();

        PoolSnapshot {
            initialized: self.is_initialized(),
            slots: slot_count,
            active,
            min_active: self.inner.config.min_active,
            provisioning: held_for.is_some(),
            provisioning_for_ms: held_for.map(|d| d.as_millis() as u64),
            persist_policy: self.inner.config.persist_policy,
            background_failures: self.inner.tasks.failure_count(),
        }
    }

    pub fn tasks(&self) -> &TaskSupervisor {
        &self.inner.tasks
    }
}
