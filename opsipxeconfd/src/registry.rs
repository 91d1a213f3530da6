//! The set of active PXE config writers.
//!
//! Shared between the updater, the control server and the supervisor. All
//! mutation happens under one mutex which is never held across I/O or an
//! await point; eviction takes the entry out first and awaits termination
//! outside the lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult};

use crate::types::HostId;
use crate::writer::PxeConfigWriter;

struct ActiveWriter {
    writer: Arc<PxeConfigWriter>,
    handle: Option<JoinHandle<()>>,
}

/// Row of the `status` report for one active writer.
#[derive(Debug, Clone)]
pub struct WriterStatus {
    pub host_id: HostId,
    pub pxefile: PathBuf,
    pub append: String,
    pub started_at: DateTime<Utc>,
}

/// Concurrent set of active writers with at most one entry per host.
#[derive(Default)]
pub struct WriterRegistry {
    writers: Mutex<HashMap<HostId, ActiveWriter>>,
    // Serialises scheduling per host: two concurrent updates for the same
    // host must not both produce writers.
    slots: Mutex<HashMap<HostId, Arc<tokio::sync::Mutex<()>>>>,
    // Set during shutdown; rejects late registrations from completion paths.
    closed: AtomicBool,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.writers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.lock().is_empty()
    }

    /// The scheduling slot for a host; hold its lock across evict + create.
    pub fn host_slot(&self, host_id: &HostId) -> Arc<tokio::sync::Mutex<()>> {
        self.slots
            .lock()
            .entry(host_id.clone())
            .or_default()
            .clone()
    }

    /// Register a writer under its host id. The host must be vacant.
    pub fn insert(&self, writer: Arc<PxeConfigWriter>) -> OpsipxeconfdResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OpsipxeconfdError::Internal(
                "writer registry is shut down".into(),
            ));
        }
        let mut writers = self.writers.lock();
        if writers.contains_key(writer.host_id()) {
            return Err(OpsipxeconfdError::Internal(format!(
                "writer for host '{}' already registered",
                writer.host_id()
            )));
        }
        writers.insert(
            writer.host_id().clone(),
            ActiveWriter {
                writer,
                handle: None,
            },
        );
        Ok(())
    }

    /// Attach the spawned task handle to a registered writer.
    ///
    /// A writer that already finished (and removed itself) is left alone.
    pub fn attach_handle(&self, writer: &Arc<PxeConfigWriter>, handle: JoinHandle<()>) {
        let mut writers = self.writers.lock();
        match writers.get_mut(writer.host_id()) {
            Some(active) if Arc::ptr_eq(&active.writer, writer) => {
                active.handle = Some(handle);
            }
            _ => debug!(
                host_id = %writer.host_id(),
                "Writer finished before its handle was attached"
            ),
        }
    }

    /// The host whose active writer owns the given pipe path, if any.
    pub fn owner_of(&self, pxefile: &Path) -> Option<HostId> {
        self.writers
            .lock()
            .values()
            .find(|active| active.writer.pxefile() == pxefile)
            .map(|active| active.writer.host_id().clone())
    }

    /// Remove the entry for this exact writer instance, if still present.
    pub fn remove_if_same(&self, writer: &Arc<PxeConfigWriter>) {
        let mut writers = self.writers.lock();
        if let Some(active) = writers.get(writer.host_id()) {
            if Arc::ptr_eq(&active.writer, writer) {
                writers.remove(writer.host_id());
            }
        }
    }

    /// Cancel and await the writer of a host. Returns whether one existed.
    pub async fn evict(&self, host_id: &HostId) -> bool {
        let Some(active) = self.writers.lock().remove(host_id) else {
            return false;
        };

        debug!(host_id = %host_id, "Evicting existing config writer");
        active.writer.stop();
        if let Some(handle) = active.handle {
            if let Err(err) = handle.await {
                warn!(host_id = %host_id, error = %err, "Writer task failed during eviction");
            }
        }
        true
    }

    /// Cancel all writers and await their termination. No new writer can be
    /// registered afterwards.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(HostId, ActiveWriter)> = self.writers.lock().drain().collect();
        for (_, active) in &drained {
            active.writer.stop();
        }
        for (host_id, active) in drained {
            if let Some(handle) = active.handle {
                if let Err(err) = handle.await {
                    warn!(host_id = %host_id, error = %err, "Writer task failed during shutdown");
                }
            }
        }
    }

    /// Consistent snapshot for the status report.
    pub fn snapshot(&self) -> Vec<WriterStatus> {
        let mut rows: Vec<WriterStatus> = self
            .writers
            .lock()
            .values()
            .map(|active| WriterStatus {
                host_id: active.writer.host_id().clone(),
                pxefile: active.writer.pxefile().to_path_buf(),
                append: active.writer.append().to_string(),
                started_at: active.writer.started_at(),
            })
            .collect();
        rows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        rows
    }
}
