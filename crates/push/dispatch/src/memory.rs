//! In-memory stores.

use std::collections::HashMap;

use push_core::{Application, Installation, InstallationQuery};
use tokio::sync::RwLock;

use crate::{ApplicationStore, InstallationStore};

/// Applications held in memory.
#[derive(Debug, Default)]
pub struct MemoryApplications {
    apps: RwLock<HashMap<String, Application>>,
}

impl MemoryApplications {
    pub fn new(apps: impl IntoIterator<Item = Application>) -> Self {
        Self {
            apps: RwLock::new(apps.into_iter().map(|a| (a.id.clone(), a)).collect()),
        }
    }

    /// Insert or replace an application.
    pub async fn upsert(&self, app: Application) {
        self.apps.write().await.insert(app.id.clone(), app);
    }

    /// Remove an application.
    pub async fn remove(&self, app_id: &str) -> Option<Application> {
        self.apps.write().await.remove(app_id)
    }
}

impl ApplicationStore for MemoryApplications {
    async fn find_by_id(&self, app_id: &str) -> color_eyre::eyre::Result<Option<Application>> {
        Ok(self.apps.read().await.get(app_id).cloned())
    }
}

/// Installations held in memory, in insertion order.
#[derive(Debug, Default)]
pub struct MemoryInstallations {
    installations: RwLock<Vec<Installation>>,
}

impl MemoryInstallations {
    pub fn new(installations: impl IntoIterator<Item = Installation>) -> Self {
        Self {
            installations: RwLock::new(installations.into_iter().collect()),
        }
    }

    /// Insert or replace an installation.
    pub async fn upsert(&self, installation: Installation) {
        let mut installations = self.installations.write().await;
        match installations.iter_mut().find(|i| i.id == installation.id) {
            Some(existing) => *existing = installation,
            None => installations.push(installation),
        }
    }

    /// Set the status of every installation whose token is listed, e.g. to
    /// deactivate devices reported gone. Returns how many were updated.
    pub async fn set_status_by_token(&self, tokens: &[String], status: &str) -> usize {
        let mut updated = 0;
        for installation in self.installations.write().await.iter_mut() {
            if tokens.contains(&installation.device_token) {
                installation.status = Some(status.to_string());
                updated += 1;
            }
        }
        updated
    }
}

impl InstallationStore for MemoryInstallations {
    async fn find_by_id(&self, id: &str) -> color_eyre::eyre::Result<Option<Installation>> {
        Ok(self
            .installations
            .read()
            .await
            .iter()
            .find(|i| i.id == id)
            .cloned())
    }

    async fn find(
        &self,
        query: &InstallationQuery,
    ) -> color_eyre::eyre::Result<Vec<Installation>> {
        Ok(self
            .installations
            .read()
            .await
            .iter()
            .filter(|i| query.matches(i))
            .cloned()
            .collect())
    }
}
