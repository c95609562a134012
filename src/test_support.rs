//! Test support utilities shared across unit and integration tests.
//!
//! [`RecordingProvider`] stands in for a backend: it keeps an in-memory view
//! of allocated resources, attachments, snapshots and grants, records every
//! effective call, and can be told to fail its next mutating call or the next
//! call of one operation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::credential::{Credential, CredentialSet};
use crate::error::LifecycleError;
use crate::model::{Snapshot, SnapshotPatch, Volume, VolumePatch};
use crate::naming::{next_slot, slot_name};
use crate::provider::{
    BackendFuture, CreateRequest, ProviderKind, ProviderRegistry, SnapshotSpec, VolumeProvider,
};
use crate::script::MountTarget;

/// Environment the recording registry resolves credentials for.
pub const TEST_ENVIRONMENT: &str = "test";

/// Backend-side state kept by [`RecordingProvider`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordingState {
    /// Effective calls in order, formatted as `operation:argument`.
    pub calls: Vec<String>,
    /// Allocated resources by identifier, with their size in kilobytes.
    pub resources: BTreeMap<String, u64>,
    /// Host holding each attached resource.
    pub attachments: BTreeMap<String, String>,
    /// Snapshot identifier to source resource identifier.
    pub snapshots: BTreeMap<String, String>,
    /// Granted (resource identifier, address) pairs.
    pub grants: BTreeSet<(String, String)>,
    /// Error returned by the next mutating call.
    pub fail_next: Option<LifecycleError>,
    /// Error returned by the next call of one named operation.
    pub fail_on: Option<(String, LifecycleError)>,
    counter: u32,
}

impl RecordingState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{}", self.counter)
    }

    fn take_failure(&mut self, operation: &str) -> Result<(), LifecycleError> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }
        if self
            .fail_on
            .as_ref()
            .is_some_and(|(target, _)| target == operation)
        {
            return self.fail_on.take().map_or(Ok(()), |(_, err)| Err(err));
        }
        Ok(())
    }

    fn allocate(&mut self, request: &CreateRequest<'_>, size_kb: u64) -> VolumePatch {
        let slot = next_slot(request.used_slots());
        let identifier = self.next_id("vol");
        self.resources.insert(identifier.clone(), size_kb);
        self.calls.push(format!("create:{identifier}"));
        let name = request
            .lineage()
            .map_or_else(|| slot_name(&request.volume.group, slot), str::to_owned);
        VolumePatch::allocated(name, identifier.clone(), format!("/dev/{identifier}"))
            .with_slot(slot)
    }
}

/// In-memory backend used to exercise the orchestrator.
#[derive(Debug)]
pub struct RecordingProvider {
    kind: ProviderKind,
    state: Mutex<RecordingState>,
}

impl RecordingProvider {
    /// Creates a provider answering as `kind`.
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            state: Mutex::new(RecordingState::default()),
        }
    }

    /// Runs `f` against the backend state.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut RecordingState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Copy of the backend state.
    #[must_use]
    pub fn state(&self) -> RecordingState {
        self.with_state(|state| state.clone())
    }

    /// Makes the next mutating call fail with `err`.
    pub fn fail_next(&self, err: LifecycleError) {
        self.with_state(|state| state.fail_next = Some(err));
    }

    /// Makes the next `operation` call fail with `err`, leaving other
    /// operations untouched. Operations use the names recorded in
    /// [`RecordingState::calls`].
    pub fn fail_on(&self, operation: &str, err: LifecycleError) {
        self.with_state(|state| state.fail_on = Some((operation.to_owned(), err)));
    }

    /// Number of recorded calls whose operation is `operation`.
    #[must_use]
    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.with_state(|state| {
            state
                .calls
                .iter()
                .filter(|call| call.starts_with(&prefix))
                .count()
        })
    }

    fn mutate<T: Send + 'static>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut RecordingState) -> Result<T, LifecycleError>,
    ) -> BackendFuture<'_, T> {
        let result = self.with_state(|state| {
            state.take_failure(operation)?;
            f(state)
        });
        Box::pin(async move { result })
    }
}

impl VolumeProvider for RecordingProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn create_volume<'a>(&'a self, request: CreateRequest<'a>) -> BackendFuture<'a, VolumePatch> {
        self.mutate("create", |state| {
            Ok(state.allocate(&request, request.volume.size_kb))
        })
    }

    fn delete_volume<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, ()> {
        self.mutate("delete", |state| {
            if state.attachments.contains_key(&volume.identifier)
                && state.attachments.get(&volume.identifier) != volume.vm_name.as_ref()
            {
                return Err(LifecycleError::Conflict(format!(
                    "{} is attached to another host",
                    volume.identifier
                )));
            }
            state.attachments.remove(&volume.identifier);
            if state.resources.remove(&volume.identifier).is_some() {
                state.calls.push(format!("delete:{}", volume.identifier));
            }
            Ok(())
        })
    }

    fn attach<'a>(&'a self, volume: &'a Volume, host: &'a str) -> BackendFuture<'a, VolumePatch> {
        self.mutate("attach", |state| {
            match state.attachments.get(&volume.identifier) {
                Some(current) if current == host => {}
                Some(current) => {
                    return Err(LifecycleError::Conflict(format!(
                        "{} is attached to {current}",
                        volume.identifier
                    )));
                }
                None => {
                    state
                        .attachments
                        .insert(volume.identifier.clone(), host.to_owned());
                    state.calls.push(format!("attach:{}", volume.identifier));
                }
            }
            Ok(VolumePatch::default().with_vm_name(host))
        })
    }

    fn detach<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, VolumePatch> {
        self.mutate("detach", |state| {
            if state.attachments.remove(&volume.identifier).is_some() {
                state.calls.push(format!("detach:{}", volume.identifier));
            }
            Ok(VolumePatch::detached())
        })
    }

    fn resize<'a>(
        &'a self,
        volume: &'a Volume,
        new_size_kb: u64,
    ) -> BackendFuture<'a, VolumePatch> {
        self.mutate("resize", move |state| {
            let size = state
                .resources
                .get_mut(&volume.identifier)
                .ok_or_else(|| LifecycleError::NotFound {
                    entity: String::from("resource"),
                    id: volume.identifier.clone(),
                })?;
            *size = new_size_kb;
            state.calls.push(format!("resize:{}", volume.identifier));
            Ok(VolumePatch {
                size_kb: Some(new_size_kb),
                ..VolumePatch::default()
            })
        })
    }

    fn take_snapshot<'a>(
        &'a self,
        volume: &'a Volume,
        spec: &'a SnapshotSpec,
    ) -> BackendFuture<'a, SnapshotPatch> {
        self.mutate("snapshot", |state| {
            let identifier = state.next_id("snap");
            state
                .snapshots
                .insert(identifier.clone(), volume.identifier.clone());
            state.calls.push(format!("snapshot:{}", volume.identifier));
            Ok(SnapshotPatch {
                identifier,
                description: spec.name.clone(),
                size_bytes: Some(volume.size_kb.saturating_mul(1024)),
                labels: spec.labels.clone(),
            })
        })
    }

    fn remove_snapshot<'a>(
        &'a self,
        _volume: &'a Volume,
        snapshot: &'a Snapshot,
    ) -> BackendFuture<'a, ()> {
        self.mutate("remove_snapshot", |state| {
            if state.snapshots.remove(&snapshot.identifier).is_some() {
                state
                    .calls
                    .push(format!("remove_snapshot:{}", snapshot.identifier));
            }
            Ok(())
        })
    }

    fn restore_snapshot<'a>(
        &'a self,
        _source: &'a Volume,
        snapshot: &'a Snapshot,
        request: CreateRequest<'a>,
    ) -> BackendFuture<'a, VolumePatch> {
        self.mutate("restore", move |state| {
            if !state.snapshots.contains_key(&snapshot.identifier) {
                return Err(LifecycleError::NotFound {
                    entity: String::from("snapshot"),
                    id: snapshot.identifier.clone(),
                });
            }
            let patch = state.allocate(&request, request.volume.size_kb);
            state.calls.push(format!("restore:{}", snapshot.identifier));
            Ok(patch)
        })
    }

    fn move_volume<'a>(
        &'a self,
        volume: &'a Volume,
        zone: &'a str,
    ) -> BackendFuture<'a, VolumePatch> {
        self.mutate("move", |state| {
            state.calls.push(format!("move:{}", volume.identifier));
            Ok(VolumePatch::default().with_zone(zone))
        })
    }

    fn add_access<'a>(&'a self, volume: &'a Volume, address: &'a str) -> BackendFuture<'a, ()> {
        self.mutate("grant", |state| {
            if state
                .grants
                .insert((volume.identifier.clone(), address.to_owned()))
            {
                state.calls.push(format!("grant:{address}"));
            }
            Ok(())
        })
    }

    fn remove_access<'a>(&'a self, volume: &'a Volume, address: &'a str) -> BackendFuture<'a, ()> {
        self.mutate("revoke", |state| {
            if state
                .grants
                .remove(&(volume.identifier.clone(), address.to_owned()))
            {
                state.calls.push(format!("revoke:{address}"));
            }
            Ok(())
        })
    }

    fn mount_target(&self, volume: &Volume) -> Result<MountTarget, LifecycleError> {
        Ok(MountTarget::BlockDevice {
            device: volume.path.clone(),
        })
    }
}

/// Credential for `kind` in [`TEST_ENVIRONMENT`] with every required field
/// set to a placeholder.
#[must_use]
pub fn placeholder_credential(kind: ProviderKind) -> Credential {
    let content: Map<String, Value> = kind
        .required_credential_fields()
        .iter()
        .map(|field| ((*field).to_owned(), Value::from("placeholder")))
        .collect();
    Credential::new(kind, TEST_ENVIRONMENT, content)
}

/// Registry that hands out `provider` for its kind in [`TEST_ENVIRONMENT`].
///
/// # Errors
///
/// Returns [`LifecycleError::Credential`] if the placeholder credential is
/// rejected.
pub fn recording_registry(
    provider: &Arc<RecordingProvider>,
    config: EngineConfig,
) -> Result<ProviderRegistry, LifecycleError> {
    let kind = provider.kind();
    let mut credentials = CredentialSet::new();
    credentials.insert(placeholder_credential(kind))?;
    let shared = Arc::clone(provider);
    Ok(
        ProviderRegistry::new(Arc::new(credentials), config).with_factory(
            kind,
            Arc::new(move |_credential: &Credential, _config: &EngineConfig| {
                Ok(Arc::clone(&shared) as Arc<dyn VolumeProvider>)
            }),
        ),
    )
}
