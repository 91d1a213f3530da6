//! The data-access port to the opsi backend.
//!
//! This trait is the only place where the daemon core talks to the
//! surrounding opsi ecosystem. The production implementation speaks JSON-RPC
//! to the config service; tests inject [`memory::MemoryBackend`].

use async_trait::async_trait;

use opsipxeconfd_shared::OpsipxeconfdResult;

use crate::types::{
    BootAction, HostId, HostRecord, NetbootProduct, ProductOnClient, ProductOnDepot,
    ProductPropertyState,
};

pub mod memory;
pub mod rpc;

pub use memory::MemoryBackend;
pub use rpc::JsonRpcBackend;

/// Config id carrying the config-service URL for a client.
pub const CONFIG_SERVICE_URL: &str = "clientconfig.configserver.url";
/// Config id carrying extra bootimage append parameters for a client.
pub const CONFIG_BOOTIMAGE_APPEND: &str = "opsi-linux-bootimage.append";

/// Options the supervisor pushes to the backend at (re)load.
#[derive(Debug, Clone, Copy)]
pub struct BackendOptions {
    pub add_product_property_state_defaults: bool,
    pub add_config_state_defaults: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            add_product_property_state_defaults: true,
            add_config_state_defaults: true,
        }
    }
}

/// Read-mostly access to hosts, products and config states.
///
/// Every operation is total and may fail with a transport error. The
/// implementation is assumed thread-safe; if the underlying service is not,
/// the implementation serialises.
#[async_trait]
pub trait Backend: Send + Sync {
    /// All clients assigned to the given depot.
    async fn depot_clients(&self, depot_id: &str) -> OpsipxeconfdResult<Vec<HostId>>;

    /// Netboot products with one of `actions` requested on one of `host_ids`.
    async fn netboot_actions(
        &self,
        host_ids: &[HostId],
        actions: &[BootAction],
    ) -> OpsipxeconfdResult<Vec<ProductOnClient>>;

    /// Address and key material for a host, `None` if unknown.
    async fn host(&self, host_id: &HostId) -> OpsipxeconfdResult<Option<HostRecord>>;

    /// Version pins of the given netboot products on a depot.
    async fn products_on_depot(
        &self,
        depot_id: &str,
        product_ids: &[String],
    ) -> OpsipxeconfdResult<Vec<ProductOnDepot>>;

    /// Metadata of one exact netboot product version.
    async fn netboot_product(
        &self,
        product_id: &str,
        product_version: &str,
        package_version: &str,
    ) -> OpsipxeconfdResult<Option<NetbootProduct>>;

    /// Values of one config state for a host (empty if unset).
    async fn config_state(
        &self,
        host_id: &HostId,
        config_id: &str,
    ) -> OpsipxeconfdResult<Vec<String>>;

    /// Product property values for a host, restricted to `product_ids`.
    async fn product_property_states(
        &self,
        host_id: &HostId,
        product_ids: &[String],
    ) -> OpsipxeconfdResult<Vec<ProductPropertyState>>;

    /// Write back modified product-on-client records.
    async fn update_products_on_clients(
        &self,
        products_on_clients: &[ProductOnClient],
    ) -> OpsipxeconfdResult<()>;

    async fn set_backend_options(&self, options: &BackendOptions) -> OpsipxeconfdResult<()>;
}
