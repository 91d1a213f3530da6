//! The PXE config writer: one named pipe, one reader, one payload.
//!
//! A writer owns a FIFO in the pxe config directory. The PXE bootloader of
//! the client eventually opens it for reading; until then, opening the write
//! end non-blockingly fails with ENXIO and the writer backs off. After the
//! single successful write the FIFO is unlinked, so a second reader can
//! never observe the payload.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::libc;
use nix::sys::stat::Mode;
use tracing::{debug, info};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult};

use crate::append::AppendBag;
use crate::render::{render_template, PropertyMap};
use crate::types::{HostId, ProductOnClient};

/// Backoff between attempts to open the pipe for writing.
pub const OPEN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// How a writer terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterOutcome {
    /// The reader consumed the payload.
    Consumed,
    /// A stop request ended the wait before any reader appeared.
    Cancelled,
}

/// Worker owning one FIFO and its rendered payload.
///
/// Construction renders the payload and creates the FIFO, so template and
/// filesystem failures surface before a reader can exist. `run` then waits
/// for the reader; on every exit path the FIFO is removed from disk.
pub struct PxeConfigWriter {
    host_id: HostId,
    pxefile: PathBuf,
    template_file: PathBuf,
    append: AppendBag,
    products_on_clients: Vec<ProductOnClient>,
    content: String,
    started_at: DateTime<Utc>,
    should_stop: AtomicBool,
}

impl PxeConfigWriter {
    pub fn new(
        template_file: &Path,
        host_id: HostId,
        products_on_clients: Vec<ProductOnClient>,
        append: AppendBag,
        properties: &PropertyMap,
        pxefile: PathBuf,
    ) -> OpsipxeconfdResult<Self> {
        info!(
            host_id = %host_id,
            template = %template_file.display(),
            pxefile = %pxefile.display(),
            append = %append,
            "Initialising PXE config writer"
        );

        let content = render_template(template_file, properties, &append)?;

        // The key is in the rendered payload; the retained snapshot feeds
        // logs and status output only.
        let mut append = append;
        append.remove("pckey");

        if pxefile.exists() {
            debug!(pxefile = %pxefile.display(), "Removing old config file");
            std::fs::remove_file(&pxefile).map_err(|err| {
                OpsipxeconfdError::Pipe(pxefile.display().to_string(), err.to_string())
            })?;
        }

        nix::unistd::mkfifo(&pxefile, Mode::from_bits_truncate(0o644)).map_err(|err| {
            OpsipxeconfdError::Pipe(pxefile.display().to_string(), err.to_string())
        })?;
        // mkfifo is subject to the process umask; the pipe must be
        // world-readable for the tftp server.
        std::fs::set_permissions(&pxefile, std::fs::Permissions::from_mode(0o644)).map_err(
            |err| OpsipxeconfdError::Pipe(pxefile.display().to_string(), err.to_string()),
        )?;

        Ok(Self {
            host_id,
            pxefile,
            template_file: template_file.to_path_buf(),
            append,
            products_on_clients,
            content,
            started_at: Utc::now(),
            should_stop: AtomicBool::new(false),
        })
    }

    pub fn host_id(&self) -> &HostId {
        &self.host_id
    }

    pub fn pxefile(&self) -> &Path {
        &self.pxefile
    }

    pub fn template_file(&self) -> &Path {
        &self.template_file
    }

    /// Append snapshot with the host key already stripped.
    pub fn append(&self) -> &AppendBag {
        &self.append
    }

    pub fn products_on_clients(&self) -> &[ProductOnClient] {
        &self.products_on_clients
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Request cooperative termination; takes effect on the next retry tick.
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the reader, deliver the payload once, tear down the pipe.
    pub async fn run(&self) -> OpsipxeconfdResult<WriterOutcome> {
        info!(
            host_id = %self.host_id,
            pxefile = %self.pxefile.display(),
            "Created boot config pipe, waiting for reader"
        );
        let result = self.wait_and_write().await;

        // The FIFO must not remain on disk on any exit path.
        if self.pxefile.exists() {
            if let Err(err) = std::fs::remove_file(&self.pxefile) {
                debug!(
                    pxefile = %self.pxefile.display(),
                    error = %err,
                    "Failed to remove pipe during teardown"
                );
            }
        }

        result
    }

    async fn wait_and_write(&self) -> OpsipxeconfdResult<WriterOutcome> {
        loop {
            if self.should_stop.load(Ordering::SeqCst) {
                debug!(host_id = %self.host_id, "Writer stopped before a reader appeared");
                return Ok(WriterOutcome::Cancelled);
            }

            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.pxefile)
            {
                Ok(mut pipe) => {
                    pipe.write_all(self.content.as_bytes()).map_err(|err| {
                        OpsipxeconfdError::Pipe(
                            self.pxefile.display().to_string(),
                            err.to_string(),
                        )
                    })?;
                    drop(pipe);
                    std::fs::remove_file(&self.pxefile).map_err(|err| {
                        OpsipxeconfdError::Pipe(
                            self.pxefile.display().to_string(),
                            err.to_string(),
                        )
                    })?;
                    info!(
                        host_id = %self.host_id,
                        pxefile = %self.pxefile.display(),
                        "Boot config pipe was read, pipe removed"
                    );
                    return Ok(WriterOutcome::Consumed);
                }
                // No reader on the other end yet.
                Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                    tokio::time::sleep(OPEN_RETRY_INTERVAL).await;
                }
                Err(err) => {
                    return Err(OpsipxeconfdError::Pipe(
                        self.pxefile.display().to_string(),
                        err.to_string(),
                    ));
                }
            }
        }
    }
}
