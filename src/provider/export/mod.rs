//! Network file exports mounted over NFS.
//!
//! Exports of one group share a lineage resource: the first export creates
//! it and later ones pass it back. Attach and detach have no meaning for a
//! network share and only record the host; access is governed by the export's
//! ACL, which is made idempotent by listing rules before changing them.

pub mod api;
pub mod client;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::credential::Credential;
use crate::error::LifecycleError;
use crate::model::{Snapshot, SnapshotPatch, Volume, VolumePatch};
use crate::script::MountTarget;
use crate::wait::{PollBudget, PollOutcome, poll_until};

use self::api::{Export, ExportApi, NewExport};
use self::client::ExportClient;

use super::{
    BackendFuture, CreateRequest, ProviderKind, SnapshotSpec, VolumeProvider, tolerate_missing,
};

/// NFS options used when the credential does not set `mount_options`.
pub const DEFAULT_MOUNT_OPTIONS: &str = "rw,hard,vers=3";
const JOB_FINISHED: &str = "finished";
const JOB_FAILURES: [&str; 2] = ["failed", "error"];

/// Builds the adapter from a `faas` credential.
///
/// # Errors
///
/// Returns [`LifecycleError::Credential`] when a required field is missing.
pub fn build(
    credential: &Credential,
    config: &EngineConfig,
) -> Result<Arc<dyn VolumeProvider>, LifecycleError> {
    let settings = ExportSettings::from_credential(credential)?;
    let client = ExportClient::new(
        credential.require("endpoint")?,
        credential.require("token")?,
    );
    Ok(Arc::new(NetworkExportProvider::new(
        client,
        settings,
        PollBudget::from_config(config),
    )))
}

/// Export defaults read from the credential.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportSettings {
    /// Service category for new exports.
    pub category_id: String,
    /// Access type granted to clients, for example `rw`.
    pub access_type: String,
    /// NFS mount options.
    pub mount_options: String,
}

impl ExportSettings {
    /// Reads settings from `credential`. `category_id` may be a number.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] when a required field is missing.
    pub fn from_credential(credential: &Credential) -> Result<Self, LifecycleError> {
        let category_id = match credential.get("category_id") {
            Some(serde_json::Value::Number(number)) => number.to_string(),
            _ => credential.require("category_id")?.to_owned(),
        };
        Ok(Self {
            category_id,
            access_type: credential.require("access_type")?.to_owned(),
            mount_options: credential
                .get_str("mount_options")
                .unwrap_or(DEFAULT_MOUNT_OPTIONS)
                .to_owned(),
        })
    }
}

/// Adapter over any [`ExportApi`].
pub struct NetworkExportProvider<A> {
    api: A,
    settings: ExportSettings,
    budget: PollBudget,
}

impl<A: ExportApi> NetworkExportProvider<A> {
    /// Wraps `api` with credential defaults and a polling budget.
    #[must_use]
    pub const fn new(api: A, settings: ExportSettings, budget: PollBudget) -> Self {
        Self {
            api,
            settings,
            budget,
        }
    }

    fn allocated(export: Export) -> VolumePatch {
        VolumePatch::allocated(export.resource_id, export.id, export.full_path)
    }

    async fn allocate(&self, request: CreateRequest<'_>) -> Result<VolumePatch, LifecycleError> {
        let new_export = NewExport {
            size_kb: request.volume.size_kb,
            category_id: self.settings.category_id.clone(),
            resource_id: request.lineage().map(str::to_owned),
        };
        let export = self.api.create_export(&new_export).await?;
        info!(
            export = %export.id,
            resource = %export.resource_id,
            group = %request.volume.group,
            "export created"
        );
        Ok(Self::allocated(export))
    }

    async fn grant(&self, export_id: &str, address: &str) -> Result<(), LifecycleError> {
        let rules = self.api.list_access(export_id).await?;
        if rules.iter().any(|rule| rule.host == address) {
            debug!(export = export_id, host = address, "access already granted");
            return Ok(());
        }
        self.api
            .create_access(export_id, address, &self.settings.access_type)
            .await?;
        info!(export = export_id, host = address, "access granted");
        Ok(())
    }

    async fn revoke(&self, export_id: &str, address: &str) -> Result<(), LifecycleError> {
        let rules = self.api.list_access(export_id).await?;
        let Some(rule) = rules.iter().find(|rule| rule.host == address) else {
            debug!(export = export_id, host = address, "no access to revoke");
            return Ok(());
        };
        tolerate_missing(
            self.api.delete_access(export_id, &rule.id).await,
            "access rule",
        )?;
        info!(export = export_id, host = address, "access revoked");
        Ok(())
    }

    async fn release(&self, volume: &Volume) -> Result<(), LifecycleError> {
        let id = volume.identifier.as_str();
        if !volume.owner_address.is_empty() {
            match self.grant(id, &volume.owner_address).await {
                Err(err) if err.is_backend_not_found() => {
                    debug!(export = id, "export already gone");
                    return Ok(());
                }
                other => other?,
            }
        }
        tolerate_missing(self.api.delete_export(id).await, "export")?;
        info!(export = id, "export deleted");
        Ok(())
    }

    async fn restore(
        &self,
        source: &Volume,
        snapshot: &Snapshot,
    ) -> Result<VolumePatch, LifecycleError> {
        let job_id = self
            .api
            .restore_snapshot(&source.identifier, &snapshot.identifier)
            .await?;
        let api = &self.api;
        let job = job_id.as_str();
        let export_id = poll_until(
            &self.budget,
            &format!("job {job}"),
            JOB_FINISHED,
            move || async move {
                let current = api.get_job(job).await?;
                if current.status == JOB_FINISHED {
                    return Ok(match current.result.filter(|result| !result.id.is_empty()) {
                        Some(result) => PollOutcome::Ready(result.id),
                        None => PollOutcome::Failed(format!(
                            "job {job} finished without an export"
                        )),
                    });
                }
                if JOB_FAILURES.contains(&current.status.as_str()) {
                    return Ok(PollOutcome::Failed(current.error.unwrap_or(current.status)));
                }
                Ok(PollOutcome::Pending(current.status))
            },
        )
        .await?;

        let export = self
            .api
            .get_export(&export_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: String::from("export"),
                id: export_id.clone(),
            })?;
        info!(export = %export.id, snapshot = %snapshot.identifier, "export restored");
        Ok(Self::allocated(export))
    }
}

impl<A: ExportApi> VolumeProvider for NetworkExportProvider<A> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::NetworkExport
    }

    fn create_volume<'a>(&'a self, request: CreateRequest<'a>) -> BackendFuture<'a, VolumePatch> {
        Box::pin(self.allocate(request))
    }

    fn delete_volume<'a>(&'a self, volume: &'a Volume) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if !volume.is_allocated() {
                return Ok(());
            }
            self.release(volume).await
        })
    }

    fn attach<'a>(&'a self, volume: &'a Volume, host: &'a str) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async move {
            match volume.vm_name.as_deref() {
                Some(current) if current != host => Err(LifecycleError::Conflict(format!(
                    "export {} is recorded on {current}; detach it before attaching to {host}",
                    volume.identifier
                ))),
                _ => Ok(VolumePatch::default().with_vm_name(host)),
            }
        })
    }

    fn detach<'a>(&'a self, _volume: &'a Volume) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async { Ok(VolumePatch::detached()) })
    }

    fn resize<'a>(
        &'a self,
        volume: &'a Volume,
        new_size_kb: u64,
    ) -> BackendFuture<'a, VolumePatch> {
        Box::pin(async move {
            self.api.set_quota(&volume.identifier, new_size_kb).await?;
            info!(export = %volume.identifier, size_kb = new_size_kb, "export quota raised");
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
        Box::pin(async move {
            let snapshot = self
                .api
                .create_snapshot(&volume.identifier, &spec.name)
                .await?;
            info!(export = %volume.identifier, snapshot = %snapshot.id, "export snapshot taken");
            let description = if snapshot.name.is_empty() {
                spec.name.clone()
            } else {
                snapshot.name
            };
            Ok(SnapshotPatch {
                identifier: snapshot.id,
                description,
                size_bytes: None,
                labels: spec.labels.clone(),
            })
        })
    }

    fn remove_snapshot<'a>(
        &'a self,
        volume: &'a Volume,
        snapshot: &'a Snapshot,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if snapshot.identifier.is_empty() {
                return Ok(());
            }
            tolerate_missing(
                self.api
                    .delete_snapshot(&volume.identifier, &snapshot.identifier)
                    .await,
                "export snapshot",
            )
        })
    }

    fn restore_snapshot<'a>(
        &'a self,
        source: &'a Volume,
        snapshot: &'a Snapshot,
        _request: CreateRequest<'a>,
    ) -> BackendFuture<'a, VolumePatch> {
        Box::pin(self.restore(source, snapshot))
    }

    fn add_access<'a>(&'a self, volume: &'a Volume, address: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.grant(&volume.identifier, address))
    }

    fn remove_access<'a>(&'a self, volume: &'a Volume, address: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.revoke(&volume.identifier, address))
    }

    fn mount_target(&self, volume: &Volume) -> Result<MountTarget, LifecycleError> {
        if volume.path.is_empty() {
            return Err(LifecycleError::Validation(format!(
                "export {} has no mount source",
                volume.id
            )));
        }
        Ok(MountTarget::NetworkShare {
            source: volume.path.clone(),
            options: self.settings.mount_options.clone(),
        })
    }
}
