//! Boot configuration updater.
//!
//! Runs the full pipeline for one host: query the backend, resolve template
//! and pipe path, compose the append parameters, evict any previous writer
//! and start a new one. All steps for a host run under its registry slot, so
//! concurrent updates for the same host are totally ordered.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult};

use crate::append::{AppendBag, AppendValue};
use crate::backend::{Backend, CONFIG_BOOTIMAGE_APPEND, CONFIG_SERVICE_URL};
use crate::config::DaemonConfig;
use crate::registry::WriterRegistry;
use crate::render::PropertyMap;
use crate::types::{pxe_config_name, BootAction, HostId, HostRecord, ProductOnClient};
use crate::writer::{PxeConfigWriter, WriterOutcome};

/// Reply for a successful (or no-op) update.
pub const RESULT_UPDATED: &str = "Boot configuration updated";
/// Retired template names still found on old products; declaring one of
/// these counts as declaring no template at all.
const OBSOLETE_TEMPLATES: [&str; 2] = ["install-x64", "install3264"];
/// Reply for a successful removal.
pub const RESULT_REMOVED: &str = "Boot configuration removed";
/// Progress marker written back after the pipe was read.
pub const PROGRESS_READ: &str = "pxe boot configuration read";

/// Per-host boot configuration pipeline.
pub struct BootConfigUpdater {
    depot_id: String,
    pxe_dir: PathBuf,
    default_template: PathBuf,
    template_dir: PathBuf,
    max_writers: usize,
    backend: Arc<dyn Backend>,
    registry: Arc<WriterRegistry>,
}

impl BootConfigUpdater {
    pub fn new(
        config: &DaemonConfig,
        backend: Arc<dyn Backend>,
        registry: Arc<WriterRegistry>,
    ) -> Self {
        Self {
            depot_id: config.depot_id.clone(),
            pxe_dir: config.pxe_dir.clone(),
            default_template: config.pxe_template.clone(),
            template_dir: config.template_dir().to_path_buf(),
            max_writers: config.max_pxe_config_writers,
            backend,
            registry,
        }
    }

    /// Update the PXE boot configuration of one host.
    ///
    /// `template_override` selects an alternate template source (the CLI's
    /// update-from-cache-file mode) instead of the backend-resolved one.
    // Boxed explicitly (rather than `async fn`) because this method is
    // reachable recursively via a spawned task in `writer_consumed`; an
    // `async fn` here would give rustc a self-referential opaque type to
    // resolve Send-ness for.
    pub fn update<'a>(
        self: &'a Arc<Self>,
        host_id: &'a str,
        template_override: Option<&'a Path>,
    ) -> Pin<Box<dyn Future<Output = OpsipxeconfdResult<String>> + Send + 'a>> {
        Box::pin(async move {
            let host_id = HostId::parse(host_id)?;
            info!(host_id = %host_id, "Updating PXE boot configuration");

            let slot = self.registry.host_slot(&host_id);
            let _slot_guard = slot.lock().await;
            self.update_in_slot(&host_id, template_override).await
        })
    }

    /// Evict the writer of one host and delete its pipe.
    pub async fn remove(self: &Arc<Self>, host_id: &str) -> OpsipxeconfdResult<String> {
        let host_id = HostId::parse(host_id)?;
        let slot = self.registry.host_slot(&host_id);
        let _slot_guard = slot.lock().await;

        if self.registry.evict(&host_id).await {
            info!(host_id = %host_id, "PXE boot configuration removed");
        }
        Ok(RESULT_REMOVED.to_string())
    }

    async fn update_in_slot(
        self: &Arc<Self>,
        host_id: &HostId,
        template_override: Option<&Path>,
    ) -> OpsipxeconfdResult<String> {
        self.registry.evict(host_id).await;

        let Some(host) = self.backend.host(host_id).await? else {
            info!(host_id = %host_id, "Host not found");
            return Ok(RESULT_UPDATED.to_string());
        };

        let actions = self
            .backend
            .netboot_actions(std::slice::from_ref(host_id), &BootAction::PENDING)
            .await?;
        if actions.is_empty() {
            info!(host_id = %host_id, "No netboot products with pending action requests");
            return Ok(RESULT_UPDATED.to_string());
        }

        let products_on_clients = self.resolve_versions(actions).await?;
        if products_on_clients.is_empty() {
            warn!(
                host_id = %host_id,
                depot_id = %self.depot_id,
                "No requested netboot product is available on this depot"
            );
            return Ok(RESULT_UPDATED.to_string());
        }

        let template_file = match template_override {
            Some(path) => path.to_path_buf(),
            None => self.resolve_template(host_id, &products_on_clients).await?,
        };
        debug!(template = %template_file.display(), "Using pxe config template");

        let pxefile = self.pxe_dir.join(pxe_config_name(host_id, &host)?);
        // Our own writer was already evicted under the host slot, so a
        // remaining owner can only be a different host.
        if let Some(owner) = self.registry.owner_of(&pxefile) {
            return Err(OpsipxeconfdError::AddressCollision(
                host_id.to_string(),
                owner.to_string(),
                pxefile.display().to_string(),
            ));
        }
        if pxefile.exists() {
            debug!(pxefile = %pxefile.display(), "Removing stale config file");
            std::fs::remove_file(&pxefile).map_err(|err| {
                OpsipxeconfdError::Pipe(pxefile.display().to_string(), err.to_string())
            })?;
        }

        if self.registry.len() >= self.max_writers {
            return Err(OpsipxeconfdError::Internal(format!(
                "maximum number of pxe config writers reached ({})",
                self.max_writers
            )));
        }

        let append = self
            .compose_append(host_id, &host, &products_on_clients[0].product_id)
            .await?;
        debug!(host_id = %host_id, append = %append, "Composed append parameters");

        let properties = self.property_map(host_id, &products_on_clients).await?;

        let writer = Arc::new(PxeConfigWriter::new(
            &template_file,
            host_id.clone(),
            products_on_clients,
            append,
            &properties,
            pxefile.clone(),
        )?);
        if let Err(err) = self.registry.insert(writer.clone()) {
            // The pipe was already created; it must not outlive the failure.
            let _ = std::fs::remove_file(&pxefile);
            return Err(err);
        }

        let updater = Arc::clone(self);
        let task_writer = writer.clone();
        let handle = tokio::spawn(async move { updater.run_writer(task_writer).await });
        self.registry.attach_handle(&writer, handle);

        info!(
            host_id = %host_id,
            pxefile = %pxefile.display(),
            "PXE boot configuration is now set"
        );
        Ok(RESULT_UPDATED.to_string())
    }

    /// Fill product/package versions from the depot; drop products the depot
    /// does not carry.
    async fn resolve_versions(
        &self,
        actions: Vec<ProductOnClient>,
    ) -> OpsipxeconfdResult<Vec<ProductOnClient>> {
        let product_ids: Vec<String> = actions
            .iter()
            .map(|poc| poc.product_id.clone())
            .collect();
        let on_depot = self
            .backend
            .products_on_depot(&self.depot_id, &product_ids)
            .await?;

        let mut resolved = Vec::with_capacity(actions.len());
        for mut poc in actions {
            match on_depot.iter().find(|pod| pod.product_id == poc.product_id) {
                Some(pod) => {
                    poc.product_version = Some(pod.product_version.clone());
                    poc.package_version = Some(pod.package_version.clone());
                    resolved.push(poc);
                }
                None => {
                    warn!(
                        product_id = %poc.product_id,
                        depot_id = %self.depot_id,
                        "Product not available on depot, skipping"
                    );
                }
            }
        }
        Ok(resolved)
    }

    /// Pick the template: a product-specific one if declared, the configured
    /// default otherwise. Obsolete template names count as no declaration.
    /// Conflicting declarations are an error condition; the last one seen
    /// wins. Relative paths resolve against the directory of the default
    /// template.
    async fn resolve_template(
        &self,
        host_id: &HostId,
        products_on_clients: &[ProductOnClient],
    ) -> OpsipxeconfdResult<PathBuf> {
        let mut chosen: Option<String> = None;
        for poc in products_on_clients {
            let (Some(product_version), Some(package_version)) =
                (&poc.product_version, &poc.package_version)
            else {
                continue;
            };
            let Some(product) = self
                .backend
                .netboot_product(&poc.product_id, product_version, package_version)
                .await?
            else {
                continue;
            };
            if let Some(template) = product.pxe_config_template.filter(|t| !t.is_empty()) {
                if OBSOLETE_TEMPLATES.contains(&template.as_str()) {
                    warn!(
                        product_id = %poc.product_id,
                        template = %template,
                        "Product uses obsolete pxe config template, using default"
                    );
                    continue;
                }
                if let Some(previous) = &chosen {
                    if previous != &template {
                        error!(
                            host_id = %host_id,
                            previous = %previous,
                            template = %template,
                            "Conflicting pxe config templates, using the latter"
                        );
                    }
                } else {
                    info!(
                        host_id = %host_id,
                        product_id = %poc.product_id,
                        template = %template,
                        "Special pxe config template will be used"
                    );
                }
                chosen = Some(template);
            }
        }

        Ok(match chosen {
            Some(template) => {
                let path = PathBuf::from(template);
                if path.is_absolute() {
                    path
                } else {
                    self.template_dir.join(path)
                }
            }
            None => self.default_template.clone(),
        })
    }

    /// Compose the append bag: host key, hostname parts and product id, then
    /// the config-service URL, then the tokenised
    /// `opsi-linux-bootimage.append` config state (later entries win).
    async fn compose_append(
        &self,
        host_id: &HostId,
        host: &HostRecord,
        product_id: &str,
    ) -> OpsipxeconfdResult<AppendBag> {
        let mut append = AppendBag::new();
        if let Some(host_key) = &host.host_key {
            append.insert("pckey", AppendValue::confidential(host_key.clone()));
        }
        append.insert_plain("hn", host_id.short_name());
        append.insert_plain("dn", host_id.domain());
        append.insert_plain("product", product_id);

        let mut service = self
            .backend
            .config_state(host_id, CONFIG_SERVICE_URL)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        if !service.is_empty() && !service.ends_with("/rpc") {
            service.push_str("/rpc");
        }
        append.insert_plain("service", service);

        for value in self
            .backend
            .config_state(host_id, CONFIG_BOOTIMAGE_APPEND)
            .await?
        {
            append.merge(&AppendBag::parse_tokens(&value, true));
        }

        Ok(append)
    }

    async fn property_map(
        &self,
        host_id: &HostId,
        products_on_clients: &[ProductOnClient],
    ) -> OpsipxeconfdResult<PropertyMap> {
        let product_ids: Vec<String> = products_on_clients
            .iter()
            .map(|poc| poc.product_id.clone())
            .collect();
        let states = self
            .backend
            .product_property_states(host_id, &product_ids)
            .await?;

        let mut properties = PropertyMap::new();
        for state in states {
            properties.insert(state.property_id, state.values.join(","));
        }
        Ok(properties)
    }

    /// Drive one writer to completion and perform its completion callback.
    async fn run_writer(self: Arc<Self>, writer: Arc<PxeConfigWriter>) {
        let result = writer.run().await;
        self.registry.remove_if_same(&writer);

        match result {
            Ok(WriterOutcome::Consumed) => {
                if let Err(err) = self.writer_consumed(&writer).await {
                    error!(
                        host_id = %writer.host_id(),
                        error = %err,
                        "Post-read backend update failed"
                    );
                }
            }
            Ok(WriterOutcome::Cancelled) => {
                debug!(host_id = %writer.host_id(), "Config writer cancelled");
            }
            Err(err) => {
                error!(
                    host_id = %writer.host_id(),
                    error = %err,
                    "Config writer failed"
                );
            }
        }
    }

    /// The reader consumed the pipe: record progress on every carried
    /// product, clear the request where a non-default template was used,
    /// and re-materialise the pipe for `always` actions.
    async fn writer_consumed(
        self: &Arc<Self>,
        writer: &Arc<PxeConfigWriter>,
    ) -> OpsipxeconfdResult<()> {
        let used_default_template = writer.template_file() == self.default_template;
        let reschedule = writer
            .products_on_clients()
            .iter()
            .any(|poc| poc.action_request == BootAction::Always);

        let mut batch = writer.products_on_clients().to_vec();
        for poc in &mut batch {
            poc.action_progress = Some(PROGRESS_READ.to_string());
            if !used_default_template {
                poc.action_request = BootAction::None;
            }
        }
        self.backend.update_products_on_clients(&batch).await?;

        if reschedule {
            info!(
                host_id = %writer.host_id(),
                "Action request 'always': re-materialising boot configuration"
            );
            // Spawned, not awaited: an eviction may be waiting for this task
            // while holding the host slot the update needs. Boxed to keep
            // the writer -> update -> writer future types acyclic.
            let updater = Arc::clone(self);
            let host_id = writer.host_id().as_str().to_string();
            let reupdate: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                Box::pin(async move {
                    if let Err(err) = updater.update(&host_id, None).await {
                        error!(
                            host_id = %host_id,
                            error = %err,
                            "Re-materialising boot configuration failed"
                        );
                    }
                });
            tokio::spawn(reupdate);
        }
        Ok(())
    }
}
