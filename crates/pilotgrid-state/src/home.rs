//! `InstanceHome` backed by the state store.

use async_trait::async_trait;
use pilotgrid_core::{HomeError, InstanceHome, InstanceResource, VmId};

use crate::error::StateError;
use crate::store::StateStore;

/// Persists instance resources in the `instances` table.
#[derive(Clone)]
pub struct StoreInstanceHome {
    store: StateStore,
}

impl StoreInstanceHome {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

fn storage(e: StateError) -> HomeError {
    HomeError::Storage(e.to_string())
}

#[async_trait]
impl InstanceHome for StoreInstanceHome {
    async fn create(&self, resource: &InstanceResource) -> Result<(), HomeError> {
        self.store.insert_instance(resource).map_err(|e| match e {
            StateError::Conflict(_) => HomeError::Exists(resource.id),
            other => storage(other),
        })
    }

    async fn update(&self, resource: &InstanceResource) -> Result<(), HomeError> {
        if self.store.get_instance(resource.id).map_err(storage)?.is_none() {
            return Err(HomeError::NotFound(resource.id));
        }
        self.store.put_instance(resource).map_err(storage)
    }

    async fn find(&self, id: VmId) -> Result<Option<InstanceResource>, HomeError> {
        self.store.get_instance(id).map_err(storage)
    }

    async fn find_by_group(&self, group_id: &str) -> Result<Vec<InstanceResource>, HomeError> {
        self.store.list_instances_for_group(group_id).map_err(storage)
    }

    async fn list(&self) -> Result<Vec<InstanceResource>, HomeError> {
        self.store.list_instances().map_err(storage)
    }

    async fn destroy(&self, id: VmId) -> Result<bool, HomeError> {
        self.store.delete_instance(id).map_err(storage)
    }
}
