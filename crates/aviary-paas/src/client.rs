//! HTTP client for the PaaS deployment API.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{PaasError, PaasResult};
use crate::types::{
    AccountInfo, ApiErrorBody, AppInfo, BuildInfo, ConfigVars, CreateAppRequest,
    CreateBuildRequest, LogSession, SourceBlob,
};

/// HTTP client for the platform's deployment API.
///
/// The client holds the base URL and transport settings; the API token is
/// supplied per call because every deployment account carries its own.
#[derive(Debug, Clone)]
pub struct PaasClient {
    client: Client,
    base_url: String,
}

impl PaasClient {
    /// Create a new client against the given base URL.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> PaasResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PaasError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    fn request(&self, method: Method, credential: &str, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        self.client.request(method, url).bearer_auth(credential)
    }

    /// Create an application resource.
    pub async fn create_app(&self, credential: &str, name: &str) -> PaasResult<AppInfo> {
        let response = self
            .request(Method::POST, credential, "/apps")
            .json(&CreateAppRequest { name })
            .send()
            .await?;

        decode(response).await
    }

    /// Delete an application and everything attached to it.
    pub async fn delete_app(&self, credential: &str, app: &str) -> PaasResult<()> {
        let response = self
            .request(Method::DELETE, credential, &format!("/apps/{app}"))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(PaasError::AppNotFound(app.to_owned())),
            status => Err(api_error(status, response).await),
        }
    }

    /// Trigger a source build from a repository reference.
    pub async fn create_build(
        &self,
        credential: &str,
        app: &str,
        source_url: &str,
        branch: &str,
    ) -> PaasResult<BuildInfo> {
        let response = self
            .request(Method::POST, credential, &format!("/apps/{app}/builds"))
            .json(&CreateBuildRequest {
                source_blob: SourceBlob {
                    url: source_url,
                    version: branch,
                },
            })
            .send()
            .await?;

        decode(response).await
    }

    /// Replace the application's configuration variables.
    pub async fn set_config_vars(
        &self,
        credential: &str,
        app: &str,
        vars: &ConfigVars,
    ) -> PaasResult<()> {
        let response = self
            .request(Method::PATCH, credential, &format!("/apps/{app}/config-vars"))
            .json(vars)
            .send()
            .await?;

        expect_success(response).await
    }

    /// Restart the application.
    ///
    /// The platform implements this as deletion of all dynos, which are then
    /// recreated by its process supervisor.
    pub async fn restart_app(&self, credential: &str, app: &str) -> PaasResult<()> {
        let response = self
            .request(Method::DELETE, credential, &format!("/apps/{app}/dynos"))
            .send()
            .await?;

        expect_success(response).await
    }

    /// Validate a credential by looking up its account.
    pub async fn account_info(&self, credential: &str) -> PaasResult<AccountInfo> {
        let response = self
            .request(Method::GET, credential, "/account")
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => response.json().await.map_err(PaasError::Http),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(PaasError::InvalidCredential(read_message(response).await))
            }
            status => Err(api_error(status, response).await),
        }
    }

    /// List log sessions attached to an application.
    pub async fn list_log_sessions(
        &self,
        credential: &str,
        app: &str,
    ) -> PaasResult<Vec<LogSession>> {
        let response = self
            .request(Method::GET, credential, &format!("/apps/{app}/log-sessions"))
            .send()
            .await?;

        decode(response).await
    }

    /// Delete a log session.
    pub async fn delete_log_session(
        &self,
        credential: &str,
        app: &str,
        session_id: &str,
    ) -> PaasResult<()> {
        let response = self
            .request(
                Method::DELETE,
                credential,
                &format!("/apps/{app}/log-sessions/{session_id}"),
            )
            .send()
            .await?;

        expect_success(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> PaasResult<T> {
    let status = response.status();
    if status.is_success() {
        response.json().await.map_err(PaasError::Http)
    } else {
        Err(api_error(status, response).await)
    }
}

async fn expect_success(response: Response) -> PaasResult<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(api_error(status, response).await)
    }
}

async fn api_error(status: StatusCode, response: Response) -> PaasError {
    PaasError::api(status.as_u16(), read_message(response).await)
}

async fn read_message(response: Response) -> String {
    match response.json::<ApiErrorBody>().await {
        Ok(body) if !body.message.is_empty() => body.message,
        _ => "no error detail provided".to_owned(),
    }
}
