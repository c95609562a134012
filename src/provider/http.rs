//! Shared HTTP plumbing for the REST control planes.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::LifecycleError;

use super::ProviderKind;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// How requests authenticate against a control plane.
#[derive(Clone)]
pub(crate) enum Auth {
    /// `X-Auth-Token: <token>`.
    AuthToken(String),
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// No credentials.
    Anonymous,
}

/// JSON API rooted at `base`, answering errors as [`LifecycleError`].
#[derive(Clone)]
pub(crate) struct JsonApi {
    service: &'static str,
    base: String,
    auth: Auth,
}

impl JsonApi {
    pub(crate) fn new(provider: ProviderKind, base: &str, auth: Auth) -> Self {
        Self::named(provider.as_str(), base, auth)
    }

    /// API of a service that is not a storage backend; `service` names it in
    /// errors and logs.
    pub(crate) fn named(service: &'static str, base: &str, auth: Auth) -> Self {
        Self {
            service,
            base: base.trim_end_matches('/').to_owned(),
            auth,
        }
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base, path.trim_start_matches('/'));
        debug!(service = self.service, %method, %url, "control plane request");
        let builder = HTTP_CLIENT.request(method, url);
        match &self.auth {
            Auth::AuthToken(token) => builder.header("X-Auth-Token", token),
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Anonymous => builder,
        }
    }

    /// Sends `builder` and decodes a JSON body.
    pub(crate) async fn send<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, LifecycleError> {
        let body = self.send_raw(builder).await?;
        serde_json::from_slice(&body).map_err(|err| self.transport(err))
    }

    /// Sends `builder` and discards the body.
    pub(crate) async fn send_unit(&self, builder: RequestBuilder) -> Result<(), LifecycleError> {
        self.send_raw(builder).await.map(|_| ())
    }

    /// Sends `builder`, mapping a not-found answer to `None`.
    pub(crate) async fn send_optional<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<Option<T>, LifecycleError> {
        match self.send(builder).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_backend_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, LifecycleError> {
        self.send(self.request(Method::GET, path)).await
    }

    pub(crate) async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, LifecycleError> {
        self.send_optional(self.request(Method::GET, path)).await
    }

    pub(crate) async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, LifecycleError> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<(), LifecycleError> {
        self.send_unit(self.request(Method::DELETE, path)).await
    }

    async fn send_raw(&self, builder: RequestBuilder) -> Result<Vec<u8>, LifecycleError> {
        let response = builder.send().await.map_err(|err| self.transport(err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| self.transport(err))?;

        if status.is_success() {
            return Ok(body.to_vec());
        }

        Err(LifecycleError::Backend {
            provider: self.service.to_owned(),
            status: status.as_u16(),
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    fn transport(&self, err: impl std::fmt::Display) -> LifecycleError {
        LifecycleError::Transport {
            provider: self.service.to_owned(),
            message: err.to_string(),
        }
    }
}
