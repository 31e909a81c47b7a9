//! Services module
//!
//! Credential pool management, provisioning, and upstream dispatch.

pub mod dispatcher;
pub mod pool;
pub mod provisioner;
pub mod replay;
pub mod tasks;

pub use dispatcher::Dispatcher;
pub use pool::{PersistPolicy, PoolConfig, PoolError, PoolManager, PoolSnapshot, ProvisionTrigger};
pub use provisioner::{CommandProvisioner, DisabledProvisioner, ProvisionError, Provisioner};
pub use replay::{ReplayBody, ReplayError, ReplayReader};
pub use tasks::TaskSupervisor;
