//! Store collaborator traits.

use push_core::{Application, Installation, InstallationQuery};

/// Application lookup.
#[trait_variant::make(Send)]
pub trait ApplicationStore: Send + Sync + 'static {
    /// Find an application by id.
    async fn find_by_id(&self, app_id: &str) -> color_eyre::eyre::Result<Option<Application>>;
}

/// Installation lookup.
#[trait_variant::make(Send)]
pub trait InstallationStore: Send + Sync + 'static {
    /// Find an installation by id.
    async fn find_by_id(&self, id: &str) -> color_eyre::eyre::Result<Option<Installation>>;

    /// Find every installation matching the query.
    async fn find(&self, query: &InstallationQuery)
    -> color_eyre::eyre::Result<Vec<Installation>>;
}
