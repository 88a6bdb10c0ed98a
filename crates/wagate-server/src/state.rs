//! Shared application state.

use crate::config::Config;
use std::sync::Arc;
use wagate_core::{
    BridgeClient, ConnectionRegistry, CredentialStore, FsCredentialStore, MessagingClient,
};

/// Shared application state.
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub config: Config,
}

impl AppState {
    /// Wire the registry to the bridge and the on-disk credential store.
    pub fn new(config: Config) -> wagate_core::Result<Self> {
        let store = FsCredentialStore::open(&config.credentials_dir)?;
        let client = BridgeClient::new(config.bridge_config());
        Ok(Self::with_parts(config, Arc::new(client), Arc::new(store)))
    }

    /// Build state around an arbitrary client and store.
    pub fn with_parts(
        config: Config,
        client: Arc<dyn MessagingClient>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let registry = ConnectionRegistry::new(config.registry_config(), client, store);
        Self { registry, config }
    }
}
