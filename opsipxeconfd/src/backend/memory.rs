//! In-memory backend for testing.
//!
//! Not wired to any service; state is seeded by the test and mutated only
//! through [`Backend::update_products_on_clients`], which is also recorded
//! verbatim so tests can assert on the flushed batches.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use opsipxeconfd_shared::OpsipxeconfdResult;

use crate::types::{
    BootAction, HostId, HostRecord, NetbootProduct, ProductOnClient, ProductOnDepot,
    ProductPropertyState,
};

use super::{Backend, BackendOptions};

#[derive(Default)]
struct MemoryState {
    depot_clients: HashMap<String, Vec<HostId>>,
    hosts: HashMap<HostId, HostRecord>,
    products_on_clients: Vec<ProductOnClient>,
    products_on_depots: HashMap<String, Vec<ProductOnDepot>>,
    netboot_products: HashMap<(String, String, String), NetbootProduct>,
    config_states: HashMap<(HostId, String), Vec<String>>,
    property_states: HashMap<HostId, Vec<ProductPropertyState>>,
    update_calls: Vec<Vec<ProductOnClient>>,
    backend_options: Option<BackendOptions>,
}

/// In-memory stand-in for the opsi config service.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    pub fn add_depot_client(&self, depot_id: &str, host_id: HostId) {
        self.state
            .lock()
            .depot_clients
            .entry(depot_id.to_string())
            .or_default()
            .push(host_id);
    }

    pub fn add_host(&self, host_id: HostId, record: HostRecord) {
        self.state.lock().hosts.insert(host_id, record);
    }

    pub fn add_product_on_client(&self, product_on_client: ProductOnClient) {
        self.state
            .lock()
            .products_on_clients
            .push(product_on_client);
    }

    pub fn add_product_on_depot(&self, depot_id: &str, product_on_depot: ProductOnDepot) {
        self.state
            .lock()
            .products_on_depots
            .entry(depot_id.to_string())
            .or_default()
            .push(product_on_depot);
    }

    pub fn add_netboot_product(
        &self,
        product_id: &str,
        product_version: &str,
        package_version: &str,
        product: NetbootProduct,
    ) {
        self.state.lock().netboot_products.insert(
            (
                product_id.to_string(),
                product_version.to_string(),
                package_version.to_string(),
            ),
            product,
        );
    }

    pub fn set_config_state(&self, host_id: HostId, config_id: &str, values: Vec<String>) {
        self.state
            .lock()
            .config_states
            .insert((host_id, config_id.to_string()), values);
    }

    pub fn set_property_state(&self, host_id: HostId, property_id: &str, values: Vec<String>) {
        self.state
            .lock()
            .property_states
            .entry(host_id)
            .or_default()
            .push(ProductPropertyState {
                property_id: property_id.to_string(),
                values,
            });
    }

    // ========================================================================
    // Assertions
    // ========================================================================

    /// Every batch passed to `update_products_on_clients`, oldest first.
    pub fn update_calls(&self) -> Vec<Vec<ProductOnClient>> {
        self.state.lock().update_calls.clone()
    }

    pub fn backend_options(&self) -> Option<BackendOptions> {
        self.state.lock().backend_options
    }

    /// Drop the pending action for a product on a client, simulating that
    /// the action was consumed outside the daemon.
    pub fn clear_action_request(&self, host_id: &HostId, product_id: &str) {
        let mut state = self.state.lock();
        for poc in &mut state.products_on_clients {
            if &poc.host_id == host_id && poc.product_id == product_id {
                poc.action_request = BootAction::None;
            }
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn depot_clients(&self, depot_id: &str) -> OpsipxeconfdResult<Vec<HostId>> {
        Ok(self
            .state
            .lock()
            .depot_clients
            .get(depot_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn netboot_actions(
        &self,
        host_ids: &[HostId],
        actions: &[BootAction],
    ) -> OpsipxeconfdResult<Vec<ProductOnClient>> {
        Ok(self
            .state
            .lock()
            .products_on_clients
            .iter()
            .filter(|poc| host_ids.contains(&poc.host_id) && actions.contains(&poc.action_request))
            .cloned()
            .collect())
    }

    async fn host(&self, host_id: &HostId) -> OpsipxeconfdResult<Option<HostRecord>> {
        Ok(self.state.lock().hosts.get(host_id).cloned())
    }

    async fn products_on_depot(
        &self,
        depot_id: &str,
        product_ids: &[String],
    ) -> OpsipxeconfdResult<Vec<ProductOnDepot>> {
        Ok(self
            .state
            .lock()
            .products_on_depots
            .get(depot_id)
            .map(|pods| {
                pods.iter()
                    .filter(|pod| product_ids.contains(&pod.product_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn netboot_product(
        &self,
        product_id: &str,
        product_version: &str,
        package_version: &str,
    ) -> OpsipxeconfdResult<Option<NetbootProduct>> {
        Ok(self
            .state
            .lock()
            .netboot_products
            .get(&(
                product_id.to_string(),
                product_version.to_string(),
                package_version.to_string(),
            ))
            .cloned())
    }

    async fn config_state(
        &self,
        host_id: &HostId,
        config_id: &str,
    ) -> OpsipxeconfdResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .config_states
            .get(&(host_id.clone(), config_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn product_property_states(
        &self,
        host_id: &HostId,
        product_ids: &[String],
    ) -> OpsipxeconfdResult<Vec<ProductPropertyState>> {
        let _ = product_ids;
        Ok(self
            .state
            .lock()
            .property_states
            .get(host_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_products_on_clients(
        &self,
        products_on_clients: &[ProductOnClient],
    ) -> OpsipxeconfdResult<()> {
        let mut state = self.state.lock();
        for updated in products_on_clients {
            for poc in &mut state.products_on_clients {
                if poc.host_id == updated.host_id && poc.product_id == updated.product_id {
                    *poc = updated.clone();
                }
            }
        }
        state.update_calls.push(products_on_clients.to_vec());
        Ok(())
    }

    async fn set_backend_options(&self, options: &BackendOptions) -> OpsipxeconfdResult<()> {
        self.state.lock().backend_options = Some(*options);
        Ok(())
    }
}
