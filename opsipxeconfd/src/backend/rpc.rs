//! JSON-RPC backend against the opsi config service.
//!
//! Credentials come from `<backend config dir>/jsonrpc.conf`, the same
//! `key = value` syntax as the daemon config file:
//!
//! ```text
//! address  = https://server.example.org:4447
//! username = opsipxeconfd
//! password = secret
//! ```

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult};

use crate::types::{
    BootAction, Confidential, HostId, HostRecord, NetbootProduct, ProductOnClient, ProductOnDepot,
    ProductPropertyState,
};

use super::{Backend, BackendOptions};

const RPC_PATH: &str = "/rpc";

/// Backend implementation speaking JSON-RPC 2.0 with HTTP basic auth.
pub struct JsonRpcBackend {
    client: reqwest::Client,
    address: String,
    username: String,
    password: Confidential,
    request_id: AtomicU64,
}

impl JsonRpcBackend {
    /// Build a backend from `<backend config dir>/jsonrpc.conf`.
    pub fn from_config_dir(backend_config_dir: &Path) -> OpsipxeconfdResult<Self> {
        let conf = backend_config_dir.join("jsonrpc.conf");
        let raw = std::fs::read_to_string(&conf).map_err(|err| {
            OpsipxeconfdError::Config(format!("cannot read '{}': {}", conf.display(), err))
        })?;

        let mut address = None;
        let mut username = None;
        let mut password = None;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some((option, value)) = line.split_once('=') {
                match option.trim() {
                    "address" => address = Some(value.trim().to_string()),
                    "username" => username = Some(value.trim().to_string()),
                    "password" => password = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }

        let address = address.ok_or_else(|| {
            OpsipxeconfdError::Config(format!("'{}' is missing 'address'", conf.display()))
        })?;
        Self::new(
            address,
            username.unwrap_or_default(),
            Confidential::new(password.unwrap_or_default()),
        )
    }

    pub fn new(
        address: String,
        username: String,
        password: Confidential,
    ) -> OpsipxeconfdResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| OpsipxeconfdError::Backend(format!("http client: {}", err)))?;
        let address = address.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            address,
            username,
            password,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call_raw<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> OpsipxeconfdResult<RpcResponse<T>> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(format!("{}{}", self.address, RPC_PATH))
            .basic_auth(&self.username, Some(self.password.expose()))
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                OpsipxeconfdError::Backend(format!("rpc transport for '{}': {}", method, err))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OpsipxeconfdError::Backend(format!(
                "rpc '{}' failed with HTTP {}",
                method, status
            )));
        }

        let envelope: RpcResponse<T> = response.json().await.map_err(|err| {
            OpsipxeconfdError::Backend(format!("rpc decode for '{}': {}", method, err))
        })?;
        if let Some(error) = envelope.error {
            return Err(OpsipxeconfdError::Backend(format!(
                "rpc '{}': {}",
                method, error.message
            )));
        }
        Ok(envelope)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> OpsipxeconfdResult<T> {
        self.call_raw(method, params).await?.result.ok_or_else(|| {
            OpsipxeconfdError::Backend(format!("rpc '{}' returned no result", method))
        })
    }

    /// Like [`Self::call`] for methods whose result is `null`.
    async fn call_void(&self, method: &str, params: Value) -> OpsipxeconfdResult<()> {
        self.call_raw::<Value>(method, params).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientToDepot {
    client_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProductOnClient {
    client_id: String,
    product_id: String,
    product_version: Option<String>,
    package_version: Option<String>,
    action_request: Option<String>,
    action_progress: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHost {
    hardware_address: Option<String>,
    ip_address: Option<String>,
    opsi_host_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProductOnDepot {
    product_id: String,
    product_version: String,
    package_version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProduct {
    pxe_config_template: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfigState {
    values: Option<Vec<Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPropertyState {
    property_id: String,
    values: Option<Vec<Value>>,
}

fn stringify(values: Vec<Value>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect()
}

#[async_trait]
impl Backend for JsonRpcBackend {
    async fn depot_clients(&self, depot_id: &str) -> OpsipxeconfdResult<Vec<HostId>> {
        let mappings: Vec<ClientToDepot> = self
            .call(
                "configState_getClientToDepotserver",
                json!([[depot_id]]),
            )
            .await?;
        let mut clients = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            clients.push(HostId::parse(&mapping.client_id)?);
        }
        Ok(clients)
    }

    async fn netboot_actions(
        &self,
        host_ids: &[HostId],
        actions: &[BootAction],
    ) -> OpsipxeconfdResult<Vec<ProductOnClient>> {
        let client_ids: Vec<&str> = host_ids.iter().map(|id| id.as_str()).collect();
        let action_names: Vec<&str> = actions.iter().map(|a| a.as_str()).collect();
        let raw: Vec<RawProductOnClient> = self
            .call(
                "productOnClient_getObjects",
                json!([[], {
                    "productType": "NetbootProduct",
                    "clientId": client_ids,
                    "actionRequest": action_names,
                }]),
            )
            .await?;

        let mut result = Vec::with_capacity(raw.len());
        for poc in raw {
            let action_request = poc
                .action_request
                .as_deref()
                .and_then(|a| a.parse().ok())
                .unwrap_or(BootAction::None);
            result.push(ProductOnClient {
                host_id: HostId::parse(&poc.client_id)?,
                product_id: poc.product_id,
                product_version: poc.product_version,
                package_version: poc.package_version,
                action_request,
                action_progress: poc.action_progress,
            });
        }
        Ok(result)
    }

    async fn host(&self, host_id: &HostId) -> OpsipxeconfdResult<Option<HostRecord>> {
        let mut hosts: Vec<RawHost> = self
            .call("host_getObjects", json!([[], {"id": host_id.as_str()}]))
            .await?;
        let Some(host) = hosts.pop() else {
            return Ok(None);
        };
        Ok(Some(HostRecord {
            mac: host.hardware_address,
            ipv4: host
                .ip_address
                .and_then(|addr| addr.parse::<Ipv4Addr>().ok()),
            host_key: host.opsi_host_key.map(Confidential::new),
        }))
    }

    async fn products_on_depot(
        &self,
        depot_id: &str,
        product_ids: &[String],
    ) -> OpsipxeconfdResult<Vec<ProductOnDepot>> {
        let raw: Vec<RawProductOnDepot> = self
            .call(
                "productOnDepot_getObjects",
                json!([[], {
                    "productType": "NetbootProduct",
                    "depotId": depot_id,
                    "productId": product_ids,
                }]),
            )
            .await?;
        Ok(raw
            .into_iter()
            .map(|pod| ProductOnDepot {
                product_id: pod.product_id,
                product_version: pod.product_version,
                package_version: pod.package_version,
            })
            .collect())
    }

    async fn netboot_product(
        &self,
        product_id: &str,
        product_version: &str,
        package_version: &str,
    ) -> OpsipxeconfdResult<Option<NetbootProduct>> {
        let mut raw: Vec<RawProduct> = self
            .call(
                "product_getObjects",
                json!([[], {
                    "type": "NetbootProduct",
                    "id": product_id,
                    "productVersion": product_version,
                    "packageVersion": package_version,
                }]),
            )
            .await?;
        Ok(raw.pop().map(|product| NetbootProduct {
            pxe_config_template: product.pxe_config_template.filter(|t| !t.is_empty()),
        }))
    }

    async fn config_state(
        &self,
        host_id: &HostId,
        config_id: &str,
    ) -> OpsipxeconfdResult<Vec<String>> {
        let raw: Vec<RawConfigState> = self
            .call(
                "configState_getObjects",
                json!([[], {
                    "configId": config_id,
                    "objectId": host_id.as_str(),
                }]),
            )
            .await?;
        Ok(raw
            .into_iter()
            .flat_map(|state| stringify(state.values.unwrap_or_default()))
            .collect())
    }

    async fn product_property_states(
        &self,
        host_id: &HostId,
        product_ids: &[String],
    ) -> OpsipxeconfdResult<Vec<ProductPropertyState>> {
        let raw: Vec<RawPropertyState> = self
            .call(
                "productPropertyState_getObjects",
                json!([[], {
                    "objectId": host_id.as_str(),
                    "productId": product_ids,
                }]),
            )
            .await?;
        Ok(raw
            .into_iter()
            .map(|state| ProductPropertyState {
                property_id: state.property_id,
                values: stringify(state.values.unwrap_or_default()),
            })
            .collect())
    }

    async fn update_products_on_clients(
        &self,
        products_on_clients: &[ProductOnClient],
    ) -> OpsipxeconfdResult<()> {
        let objects: Vec<Value> = products_on_clients
            .iter()
            .map(|poc| {
                json!({
                    "type": "ProductOnClient",
                    "productType": "NetbootProduct",
                    "clientId": poc.host_id.as_str(),
                    "productId": poc.product_id,
                    "productVersion": poc.product_version,
                    "packageVersion": poc.package_version,
                    "actionRequest": poc.action_request.as_str(),
                    "actionProgress": poc.action_progress,
                })
            })
            .collect();
        self.call_void("productOnClient_updateObjects", json!([objects]))
            .await
    }

    async fn set_backend_options(&self, options: &BackendOptions) -> OpsipxeconfdResult<()> {
        self.call_void(
            "backend_setOptions",
            json!([{
                "addProductPropertyStateDefaults": options.add_product_property_state_defaults,
                "addConfigStateDefaults": options.add_config_state_defaults,
            }]),
        )
        .await
    }
}
