//! Seam between the control plane and the external deployment platform.
//!
//! The lifecycle manager talks to [`PaasProvider`]; the production
//! implementation adapts the `aviary-paas` client, and [`MockPaas`] stands
//! in for tests with scripted failure injection.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use aviary_paas::{AccountInfo, PaasClient, PaasError};

use crate::config::{PaasBackend, PaasConfig};
use crate::error::{ControlError, ControlResult};

/// Operations the control plane consumes from the deployment platform.
#[async_trait]
pub trait PaasProvider: Send + Sync {
    /// Create an application resource. Returns the platform's application id.
    async fn create_app(&self, credential: &str, name: &str) -> ControlResult<String>;

    /// Trigger a source build. Returns the platform's build id.
    async fn create_build(
        &self,
        credential: &str,
        app: &str,
        source_url: &str,
        branch: &str,
    ) -> ControlResult<String>;

    /// Replace the application's configuration variables.
    async fn set_config_vars(
        &self,
        credential: &str,
        app: &str,
        vars: &BTreeMap<String, String>,
    ) -> ControlResult<()>;

    /// Restart the application.
    async fn restart_app(&self, credential: &str, app: &str) -> ControlResult<()>;

    /// Delete the application.
    async fn delete_app(&self, credential: &str, app: &str) -> ControlResult<()>;

    /// Delete any log sessions attached to the application.
    async fn purge_log_sessions(&self, credential: &str, app: &str) -> ControlResult<()>;

    /// Validate a credential by looking up its account.
    async fn account_info(&self, credential: &str) -> ControlResult<AccountInfo>;
}

/// Create a provider from configuration.
pub fn create_provider(config: &PaasConfig) -> ControlResult<Arc<dyn PaasProvider>> {
    match config.backend {
        PaasBackend::Http => {
            let client = PaasClient::new(
                config.base_url.clone(),
                Duration::from_secs(config.timeout_secs),
            )
            .map_err(|e| ControlError::paas(e.to_string()))?;
            Ok(Arc::new(HttpPaas::new(client)))
        }
        PaasBackend::Mock => Ok(Arc::new(MockPaas::default())),
    }
}

/// Production provider backed by the platform's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpPaas {
    client: PaasClient,
}

impl HttpPaas {
    /// Wrap an existing client.
    #[must_use]
    pub const fn new(client: PaasClient) -> Self {
        Self { client }
    }
}

fn map_err(error: PaasError) -> ControlError {
    ControlError::paas(error.to_string())
}

#[async_trait]
impl PaasProvider for HttpPaas {
    async fn create_app(&self, credential: &str, name: &str) -> ControlResult<String> {
        let app = self
            .client
            .create_app(credential, name)
            .await
            .map_err(map_err)?;
        Ok(app.id)
    }

    async fn create_build(
        &self,
        credential: &str,
        app: &str,
        source_url: &str,
        branch: &str,
    ) -> ControlResult<String> {
        let build = self
            .client
            .create_build(credential, app, source_url, branch)
            .await
            .map_err(map_err)?;
        Ok(build.id)
    }

    async fn set_config_vars(
        &self,
        credential: &str,
        app: &str,
        vars: &BTreeMap<String, String>,
    ) -> ControlResult<()> {
        self.client
            .set_config_vars(credential, app, vars)
            .await
            .map_err(map_err)
    }

    async fn restart_app(&self, credential: &str, app: &str) -> ControlResult<()> {
        self.client
            .restart_app(credential, app)
            .await
            .map_err(map_err)
    }

    async fn delete_app(&self, credential: &str, app: &str) -> ControlResult<()> {
        self.client
            .delete_app(credential, app)
            .await
            .map_err(map_err)
    }

    async fn purge_log_sessions(&self, credential: &str, app: &str) -> ControlResult<()> {
        let sessions = self
            .client
            .list_log_sessions(credential, app)
            .await
            .map_err(map_err)?;

        for session in sessions {
            self.client
                .delete_log_session(credential, app, &session.id)
                .await
                .map_err(map_err)?;
        }

        Ok(())
    }

    async fn account_info(&self, credential: &str) -> ControlResult<AccountInfo> {
        self.client.account_info(credential).await.map_err(map_err)
    }
}

/// Mock provider for testing.
///
/// Records created applications and applied config vars, and fails any
/// operation whose name was registered with [`MockPaas::fail_on`].
#[derive(Debug, Default)]
pub struct MockPaas {
    apps: RwLock<HashSet<String>>,
    config_vars: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
    failing_ops: RwLock<HashSet<&'static str>>,
}

impl MockPaas {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation fail from now on.
    pub fn fail_on(&self, op: &'static str) {
        if let Ok(mut ops) = self.failing_ops.write() {
            ops.insert(op);
        }
    }

    /// Whether an application with this name was created and not deleted.
    #[must_use]
    pub fn has_app(&self, name: &str) -> bool {
        self.apps.read().is_ok_and(|apps| apps.contains(name))
    }

    /// Config vars last applied to an application.
    #[must_use]
    pub fn vars_for(&self, app: &str) -> Option<BTreeMap<String, String>> {
        self.config_vars
            .read()
            .ok()
            .and_then(|vars| vars.get(app).cloned())
    }

    fn check(&self, op: &'static str) -> ControlResult<()> {
        let failing = self
            .failing_ops
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        if failing.contains(op) {
            return Err(ControlError::paas(format!("simulated {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl PaasProvider for MockPaas {
    async fn create_app(&self, _credential: &str, name: &str) -> ControlResult<String> {
        self.check("create_app")?;
        let mut apps = self
            .apps
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        apps.insert(name.to_owned());
        Ok(format!("app-{name}"))
    }

    async fn create_build(
        &self,
        _credential: &str,
        app: &str,
        _source_url: &str,
        _branch: &str,
    ) -> ControlResult<String> {
        self.check("create_build")?;
        Ok(format!("build-{app}"))
    }

    async fn set_config_vars(
        &self,
        _credential: &str,
        app: &str,
        vars: &BTreeMap<String, String>,
    ) -> ControlResult<()> {
        self.check("set_config_vars")?;
        let mut all = self
            .config_vars
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        all.insert(app.to_owned(), vars.clone());
        Ok(())
    }

    async fn restart_app(&self, _credential: &str, _app: &str) -> ControlResult<()> {
        self.check("restart_app")
    }

    async fn delete_app(&self, _credential: &str, app: &str) -> ControlResult<()> {
        self.check("delete_app")?;
        let mut apps = self
            .apps
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        apps.remove(app);
        Ok(())
    }

    async fn purge_log_sessions(&self, _credential: &str, _app: &str) -> ControlResult<()> {
        self.check("purge_log_sessions")
    }

    async fn account_info(&self, credential: &str) -> ControlResult<AccountInfo> {
        self.check("account_info")?;
        if credential.is_empty() {
            return Err(ControlError::paas("invalid credential: empty token"));
        }
        Ok(AccountInfo {
            id: format!("acc-{credential}"),
            email: "pool@example.com".to_owned(),
            verified: true,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_apps_and_vars() {
        let paas = MockPaas::new();

        paas.create_app("tok", "avy-echo").await.unwrap();
        assert!(paas.has_app("avy-echo"));

        let vars = BTreeMap::from([("TOKEN".to_owned(), "x".to_owned())]);
        paas.set_config_vars("tok", "avy-echo", &vars).await.unwrap();
        assert_eq!(paas.vars_for("avy-echo"), Some(vars));

        paas.delete_app("tok", "avy-echo").await.unwrap();
        assert!(!paas.has_app("avy-echo"));
    }

    #[tokio::test]
    async fn mock_failure_injection() {
        let paas = MockPaas::new();
        paas.fail_on("create_build");

        paas.create_app("tok", "avy-echo").await.unwrap();
        let result = paas
            .create_build("tok", "avy-echo", "https://github.com/acme/echo", "main")
            .await;
        assert!(matches!(result, Err(ControlError::Paas(_))));
    }

    #[tokio::test]
    async fn mock_rejects_empty_credential() {
        let paas = MockPaas::new();
        assert!(paas.account_info("").await.is_err());
        assert!(paas.account_info("token").await.is_ok());
    }
}
