//! Wire types for the PaaS deployment API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration variables for an application.
pub type ConfigVars = BTreeMap<String, String>;

/// An application resource on the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInfo {
    /// Platform-assigned application identifier.
    pub id: String,
    /// Application name (unique per platform region).
    pub name: String,
    /// Public URL of the application, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    /// When the application was created.
    pub created_at: DateTime<Utc>,
}

/// A source build triggered on the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Platform-assigned build identifier.
    pub id: String,
    /// Build status as reported by the platform (e.g. "pending", "succeeded").
    pub status: String,
    /// When the build was created.
    pub created_at: DateTime<Utc>,
}

/// Account details returned by the credential validation lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Platform-assigned account identifier.
    pub id: String,
    /// Email address registered with the platform.
    pub email: String,
    /// Whether the platform considers the account verified.
    #[serde(default)]
    pub verified: bool,
}

/// A log session attached to an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSession {
    /// Platform-assigned session identifier.
    pub id: String,
    /// URL the session's log stream can be read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logplex_url: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

/// Request body for creating an application.
#[derive(Debug, Serialize)]
pub(crate) struct CreateAppRequest<'a> {
    pub name: &'a str,
}

/// Request body for triggering a source build.
#[derive(Debug, Serialize)]
pub(crate) struct CreateBuildRequest<'a> {
    pub source_blob: SourceBlob<'a>,
}

/// Source reference within a build request.
#[derive(Debug, Serialize)]
pub(crate) struct SourceBlob<'a> {
    /// URL of the source repository or tarball.
    pub url: &'a str,
    /// Branch or revision to build.
    pub version: &'a str,
}

/// Error body the platform returns on failed requests.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn build_request_wire_shape() {
        let request = CreateBuildRequest {
            source_blob: SourceBlob {
                url: "https://github.com/acme/echo-bot",
                version: "main",
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json["source_blob"]["url"],
            "https://github.com/acme/echo-bot"
        );
        assert_eq!(json["source_blob"]["version"], "main");
    }

    #[test]
    fn app_info_deserialises_without_web_url() {
        let json = r#"{
            "id": "app-123",
            "name": "avy-echo",
            "created_at": "2026-01-01T00:00:00Z"
        }"#;

        let app: AppInfo = serde_json::from_str(json).unwrap();
        assert_eq!(app.name, "avy-echo");
        assert!(app.web_url.is_none());
    }

    #[test]
    fn account_info_defaults_unverified() {
        let json = r#"{"id": "acc-1", "email": "ops@example.com"}"#;
        let account: AccountInfo = serde_json::from_str(json).unwrap();
        assert!(!account.verified);
    }
}
