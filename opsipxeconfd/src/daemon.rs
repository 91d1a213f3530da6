//! The supervisor: owns the backend, the writer registry, the updater, the
//! startup task and the control socket, and drives the accept loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult, ERROR_MARKER};

use crate::backend::{Backend, BackendOptions};
use crate::config::DaemonConfig;
use crate::control::{self, AfterReply};
use crate::registry::WriterRegistry;
use crate::startup::StartupTask;
use crate::updater::BootConfigUpdater;

/// Interval at which the accept loop re-checks the running flag.
const ACCEPT_TICK: Duration = Duration::from_millis(100);

/// Builds (and on reload rebuilds) the backend instance from configuration.
pub type BackendFactory =
    Box<dyn Fn(&DaemonConfig) -> OpsipxeconfdResult<Arc<dyn Backend>> + Send + Sync>;

/// The opsi PXE configuration service.
pub struct Opsipxeconfd {
    backend_factory: BackendFactory,
    config: RwLock<DaemonConfig>,
    backend: RwLock<Arc<dyn Backend>>,
    registry: Arc<WriterRegistry>,
    updater: RwLock<Arc<BootConfigUpdater>>,
    connections: Mutex<BTreeMap<u64, DateTime<Utc>>>,
    next_connection_id: AtomicU64,
    running: AtomicBool,
    rebind_requested: AtomicBool,
    startup_task: Mutex<Option<StartupTask>>,
}

impl Opsipxeconfd {
    pub fn new(
        config: DaemonConfig,
        backend_factory: BackendFactory,
    ) -> OpsipxeconfdResult<Arc<Self>> {
        let backend = backend_factory(&config)?;
        let registry = Arc::new(WriterRegistry::new());
        let updater = Arc::new(BootConfigUpdater::new(
            &config,
            backend.clone(),
            registry.clone(),
        ));

        Ok(Arc::new(Self {
            backend_factory,
            config: RwLock::new(config),
            backend: RwLock::new(backend),
            registry,
            updater: RwLock::new(updater),
            connections: Mutex::new(BTreeMap::new()),
            next_connection_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            rebind_requested: AtomicBool::new(false),
            startup_task: Mutex::new(None),
        }))
    }

    pub fn updater(&self) -> Arc<BootConfigUpdater> {
        self.updater.read().clone()
    }

    pub fn registry(&self) -> Arc<WriterRegistry> {
        self.registry.clone()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.read().socket_path.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the accept loop to wind the daemon down.
    pub fn request_stop(&self) {
        info!("Stopping opsipxeconfd");
        self.running.store(false, Ordering::SeqCst);
    }

    // ========================================================================
    // MAIN LOOP
    // ========================================================================

    /// Run the daemon until [`Self::request_stop`].
    ///
    /// Failures before the control socket is up are fatal; afterwards errors
    /// are logged or reported to the control client, never crash the loop.
    pub async fn run(self: &Arc<Self>) -> OpsipxeconfdResult<()> {
        info!("Starting opsipxeconfd main loop");
        self.running.store(true, Ordering::SeqCst);

        let backend = self.backend.read().clone();
        backend
            .set_backend_options(&BackendOptions::default())
            .await?;

        let (pxe_dir, depot_id, mut socket_path, max_connections) = {
            let config = self.config.read();
            (
                config.pxe_dir.clone(),
                config.depot_id.clone(),
                config.socket_path.clone(),
                config.max_connections,
            )
        };
        std::fs::create_dir_all(&pxe_dir)?;

        info!("Setting needed boot configurations");
        *self.startup_task.lock() = Some(StartupTask::spawn(
            backend,
            self.updater(),
            depot_id,
        ));

        let mut listener = control::bind(&socket_path)?;
        let mut gate = Arc::new(Semaphore::new(max_connections));

        while self.running.load(Ordering::SeqCst) {
            if self.rebind_requested.swap(false, Ordering::SeqCst) {
                let (new_path, new_max) = {
                    let config = self.config.read();
                    (config.socket_path.clone(), config.max_connections)
                };
                match control::bind(&new_path) {
                    Ok(new_listener) => {
                        if new_path != socket_path {
                            let _ = std::fs::remove_file(&socket_path);
                        }
                        listener = new_listener;
                        socket_path = new_path;
                        gate = Arc::new(Semaphore::new(new_max));
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to rebind control socket, keeping old one")
                    }
                }
            }

            // Accept gate: take a connection slot before accepting, so
            // excess clients queue in the kernel backlog.
            let permit = match tokio::time::timeout(ACCEPT_TICK, gate.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                _ => continue,
            };

            match tokio::time::timeout(ACCEPT_TICK, listener.accept()).await {
                Ok(Ok((stream, _))) => {
                    tokio::spawn(control::handle_connection(self.clone(), stream, permit));
                }
                Ok(Err(err)) => {
                    if self.running.load(Ordering::SeqCst) {
                        debug!(error = %err, "Control socket accept error");
                    }
                }
                Err(_) => {} // tick, re-check running
            }
        }

        info!("Opsipxeconfd main loop exiting");
        self.shutdown().await;
        drop(listener);
        let _ = std::fs::remove_file(&socket_path);
        Ok(())
    }

    async fn shutdown(&self) {
        let startup_task = self.startup_task.lock().take();
        if let Some(task) = startup_task {
            task.stop().await;
        }

        info!("Stopping pxe config writers");
        self.registry.shutdown().await;
    }

    // ========================================================================
    // RELOAD
    // ========================================================================

    /// Apply a re-read configuration: reconfigure logging, rebuild the
    /// backend and updater, rebind the control socket. Active writers and
    /// in-flight control connections are untouched.
    pub async fn reload(&self, new_config: DaemonConfig) -> OpsipxeconfdResult<()> {
        info!("Reloading opsipxeconfd");
        crate::logging::init_logging(&new_config)?;

        let backend = (self.backend_factory)(&new_config)?;
        backend
            .set_backend_options(&BackendOptions::default())
            .await?;

        let updater = Arc::new(BootConfigUpdater::new(
            &new_config,
            backend.clone(),
            self.registry.clone(),
        ));
        *self.backend.write() = backend;
        *self.updater.write() = updater;
        *self.config.write() = new_config;
        self.rebind_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    // ========================================================================
    // CONTROL COMMANDS
    // ========================================================================

    /// Dispatch one control command; the reply is always delivered to the
    /// client before any requested shutdown begins.
    pub(crate) async fn process_command(&self, command: &str) -> (String, AfterReply) {
        let parts: Vec<&str> = command.split_whitespace().collect();

        let result: OpsipxeconfdResult<(String, AfterReply)> = match parts.as_slice() {
            [] => Err(OpsipxeconfdError::Control(
                "no command given".into(),
            )),
            ["stop"] => Ok(("opsipxeconfd is going down".to_string(), AfterReply::Stop)),
            ["status"] => Ok((self.status(), AfterReply::Nothing)),
            ["update", host_id] => self
                .updater()
                .update(host_id, None)
                .await
                .map(|reply| (reply, AfterReply::Nothing)),
            ["update", host_id, cache_path] => self
                .updater()
                .update(host_id, Some(std::path::Path::new(cache_path)))
                .await
                .map(|reply| (reply, AfterReply::Nothing)),
            ["remove", host_id] => self
                .updater()
                .remove(host_id)
                .await
                .map(|reply| (reply, AfterReply::Nothing)),
            ["update", ..] => Err(OpsipxeconfdError::Control(
                "bad arguments for command 'update', needs <hostId>".into(),
            )),
            ["remove", ..] => Err(OpsipxeconfdError::Control(
                "bad arguments for command 'remove', needs <hostId>".into(),
            )),
            _ => Err(OpsipxeconfdError::Control(format!(
                "command '{}' not supported",
                command
            ))),
        };

        match result {
            Ok(reply) => reply,
            Err(err) => {
                error!(command = %command, error = %err, "Processing command failed");
                (format!("{}: {}", ERROR_MARKER, err), AfterReply::Nothing)
            }
        }
    }

    /// Human-readable report on connections and active writers.
    pub fn status(&self) -> String {
        info!("Getting opsipxeconfd status");
        let mut result = String::from("opsipxeconfd status:\n");

        {
            let connections = self.connections.lock();
            result.push_str(&format!(
                "{} control connection(s) established\n",
                connections.len()
            ));
            for (index, started) in connections.values().enumerate() {
                result.push_str(&format!(
                    "    Connection {} established at: {}\n",
                    index + 1,
                    format_timestamp(*started)
                ));
            }
        }

        let writers = self.registry.snapshot();
        result.push_str(&format!("\n{} boot configuration(s) set\n", writers.len()));
        for writer in writers {
            result.push_str(&format!(
                "Boot config for client '{}' (path: {}; configuration: {}) set since {}\n",
                writer.host_id,
                writer.pxefile.display(),
                writer.append,
                format_timestamp(writer.started_at)
            ));
        }

        result
    }

    // ========================================================================
    // CONNECTION BOOKKEEPING
    // ========================================================================

    pub(crate) fn register_connection(&self) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(id, Utc::now());
        id
    }

    pub(crate) fn unregister_connection(&self, id: u64) {
        self.connections.lock().remove(&id);
    }
}

fn format_timestamp(when: DateTime<Utc>) -> String {
    when.with_timezone(&Local)
        .format("%a %b %e %H:%M:%S %Y")
        .to_string()
}
