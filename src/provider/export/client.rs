//! REST implementation of [`ExportApi`].

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::provider::http::{Auth, JsonApi};
use crate::provider::{BackendFuture, ProviderKind};

use super::api::{Access, Export, ExportApi, ExportSnapshot, Job, NewExport};

#[derive(Serialize)]
struct CreateExportBody<'a> {
    size_kb: u64,
    category_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct JobHandle {
    job: String,
}

/// Export service client authenticated with a service token.
#[derive(Clone)]
pub struct ExportClient {
    api: JsonApi,
}

impl ExportClient {
    /// Builds a client rooted at `endpoint`.
    #[must_use]
    pub fn new(endpoint: &str, token: &str) -> Self {
        Self {
            api: JsonApi::new(
                ProviderKind::NetworkExport,
                endpoint,
                Auth::AuthToken(token.to_owned()),
            ),
        }
    }
}

impl ExportApi for ExportClient {
    fn create_export<'a>(&'a self, request: &'a NewExport) -> BackendFuture<'a, Export> {
        Box::pin(async move {
            let body = CreateExportBody {
                size_kb: request.size_kb,
                category_id: &request.category_id,
                resource_id: request.resource_id.as_deref(),
            };
            self.api.post("exports", &body).await
        })
    }

    fn get_export<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Option<Export>> {
        Box::pin(async move { self.api.get_optional(&format!("exports/{id}")).await })
    }

    fn delete_export<'a>(&'a self, id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.api.delete(&format!("exports/{id}")).await })
    }

    fn list_access<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Vec<Access>> {
        Box::pin(async move { self.api.get(&format!("exports/{id}/access")).await })
    }

    fn create_access<'a>(
        &'a self,
        id: &'a str,
        host: &'a str,
        access_type: &'a str,
    ) -> BackendFuture<'a, Access> {
        Box::pin(async move {
            let body = json!({ "host": host, "access_type": access_type });
            self.api.post(&format!("exports/{id}/access"), &body).await
        })
    }

    fn delete_access<'a>(&'a self, id: &'a str, access_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.api
                .delete(&format!("exports/{id}/access/{access_id}"))
                .await
        })
    }

    fn set_quota<'a>(&'a self, id: &'a str, size_kb: u64) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let builder = self
                .api
                .request(reqwest::Method::POST, &format!("exports/{id}/quota"))
                .json(&json!({ "size_kb": size_kb }));
            self.api.send_unit(builder).await
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        id: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, ExportSnapshot> {
        Box::pin(async move {
            self.api
                .post(&format!("exports/{id}/snapshots"), &json!({ "name": name }))
                .await
        })
    }

    fn delete_snapshot<'a>(&'a self, id: &'a str, snapshot_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.api
                .delete(&format!("exports/{id}/snapshots/{snapshot_id}"))
                .await
        })
    }

    fn restore_snapshot<'a>(
        &'a self,
        id: &'a str,
        snapshot_id: &'a str,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            let handle: JobHandle = self
                .api
                .post(
                    &format!("exports/{id}/snapshots/{snapshot_id}/restore"),
                    &json!({}),
                )
                .await?;
            Ok(handle.job)
        })
    }

    fn get_job<'a>(&'a self, job_id: &'a str) -> BackendFuture<'a, Job> {
        Box::pin(async move { self.api.get(&format!("jobs/{job_id}")).await })
    }
}
