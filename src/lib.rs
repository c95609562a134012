//! Volume lifecycle orchestration for database hosts.
//!
//! The crate provisions, resizes, snapshots, restores, moves, attaches and
//! deletes storage volumes on four backend families behind one
//! [`VolumeProvider`] trait: block-storage cloud volumes, virtual-machine
//! persistent disks, network file exports and container-orchestrator volume
//! claims. [`LifecycleOrchestrator`] loads records from a [`VolumeStore`],
//! delegates each step to the adapter resolved for the volume's provider and
//! environment, and persists the outcome only after the backend confirmed it.

pub mod config;
pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod naming;
pub mod provider;
pub mod script;
pub mod store;
pub mod team;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod wait;

pub use config::{ConfigError, EngineConfig};
pub use credential::{Credential, CredentialResolver, CredentialSet};
pub use error::{ErrorKind, LifecycleError};
pub use lifecycle::{
    CreateVolumeRequest, LifecycleOrchestrator, RestoreRequest, TakeSnapshotRequest,
};
pub use model::{Labels, Snapshot, SnapshotId, Volume, VolumeId};
pub use provider::{ProviderKind, ProviderRegistry, VolumeProvider};
pub use script::{MountOptions, MountTarget};
pub use store::{JsonFileStore, MemoryStore, VolumeStore};
pub use team::SnapshotTagger;
pub use wait::PollBudget;
