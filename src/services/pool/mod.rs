//! Credential pool
//!
//! Slot storage, the provisioning lock, and the manager that ties them to the
//! credential store and the provisioner.

mod lock;
mod manager;
mod slots;

pub use lock::{LockAttempt, ProvisioningGuard, ProvisioningLock};
pub use manager::{PersistPolicy, PoolConfig, PoolError, PoolManager, PoolSnapshot, ProvisionTrigger};
pub use slots::{ActiveSlot, Placement, Slot, SlotPool};
