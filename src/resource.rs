//! In-memory, resource-versioned datastore for asset resources.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::contract::ResourceClient;
use crate::error::{AssetError, Result};
use crate::model::AssetResource;

type Key = (String, String);

#[derive(Default)]
pub struct MemoryResourceClient {
    objects: Mutex<HashMap<Key, AssetResource>>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

impl MemoryResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or edit a resource. An edited spec bumps the generation.
    pub async fn apply(&self, resource: AssetResource) -> AssetResource {
        let mut objects = self.objects.lock().await;
        let k = key(&resource.metadata.namespace, &resource.metadata.name);
        match objects.get_mut(&k) {
            Some(current) => {
                if current.spec != resource.spec {
                    current.spec = resource.spec;
                    current.metadata.generation += 1;
                    current.metadata.resource_version += 1;
                    debug!(generation = current.metadata.generation, "Spec edited");
                }
                current.clone()
            }
            None => {
                let mut created = resource;
                created.metadata.generation = created.metadata.generation.max(1);
                created.metadata.resource_version = 1;
                created.metadata.deletion_requested = false;
                objects.insert(k, created.clone());
                created
            }
        }
    }

    /// Mark a resource for deletion. It is removed once no finalizer is left.
    pub async fn request_deletion(&self, namespace: &str, name: &str) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let k = key(namespace, name);
        let Some(current) = objects.get_mut(&k) else {
            return Err(AssetError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        };
        current.metadata.deletion_requested = true;
        current.metadata.resource_version += 1;
        if current.metadata.finalizers.is_empty() {
            objects.remove(&k);
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<AssetResource>> {
        Ok(self.objects.lock().await.get(&key(namespace, name)).cloned())
    }

    /// Write finalizers and status. Spec and generation stay as stored.
    async fn update(&self, resource: &AssetResource) -> Result<AssetResource> {
        let mut objects = self.objects.lock().await;
        let meta = &resource.metadata;
        let k = key(&meta.namespace, &meta.name);
        let Some(current) = objects.get_mut(&k) else {
            return Err(AssetError::NotFound {
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            });
        };
        if current.metadata.resource_version != meta.resource_version {
            return Err(AssetError::Conflict {
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
                attempts: 1,
            });
        }

        current.metadata.finalizers = meta.finalizers.clone();
        current.status = resource.status.clone();
        current.metadata.resource_version += 1;
        let updated = current.clone();
        if updated.metadata.deletion_requested && updated.metadata.finalizers.is_empty() {
            objects.remove(&k);
            debug!(namespace = %meta.namespace, name = %meta.name, "Resource removed");
        }
        Ok(updated)
    }
}
