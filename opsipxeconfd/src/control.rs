//! Control channel: a filesystem stream socket taking one textual command
//! per connection.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult, ERROR_MARKER};

use crate::daemon::Opsipxeconfd;

/// Maximum size of one control request.
const MAX_REQUEST: usize = 4096;
/// One read per connection, bounded.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// What a connection asked the supervisor to do after the reply went out.
pub(crate) enum AfterReply {
    Nothing,
    Stop,
}

/// Bind the control socket, replacing a leftover socket file.
///
/// The socket is opened up to world read+write so that cooperating local
/// processes can connect; everything else stays filesystem permissions.
pub(crate) fn bind(path: &Path) -> OpsipxeconfdResult<UnixListener> {
    info!(path = %path.display(), "Creating unix control socket");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            OpsipxeconfdError::Config(format!(
                "cannot create socket directory '{}': {}",
                parent.display(),
                err
            ))
        })?;
    }
    if path.exists() {
        std::fs::remove_file(path).map_err(|err| {
            OpsipxeconfdError::Config(format!(
                "cannot remove stale socket '{}': {}",
                path.display(),
                err
            ))
        })?;
    }

    let listener = UnixListener::bind(path).map_err(|err| {
        OpsipxeconfdError::Config(format!("failed to bind '{}': {}", path.display(), err))
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).map_err(|err| {
        OpsipxeconfdError::Config(format!(
            "failed to set permissions on '{}': {}",
            path.display(),
            err
        ))
    })?;

    Ok(listener)
}

/// Serve one control connection: read a command, dispatch, reply, close.
pub(crate) async fn handle_connection(
    daemon: Arc<Opsipxeconfd>,
    mut stream: UnixStream,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = daemon.register_connection();
    let started = std::time::Instant::now();
    debug!(connection_id, "Control connection established");

    let (reply, after) = match read_command(&mut stream).await {
        Ok(command) => {
            info!(connection_id, command = %command, "Got command");
            daemon.process_command(&command).await
        }
        Err(err) => (format!("{}: {}", ERROR_MARKER, err), AfterReply::Nothing),
    };

    debug!(connection_id, reply = %reply, "Returning result");
    if let Err(err) = stream.write_all(reply.as_bytes()).await {
        warn!(connection_id, error = %err, "Sending result over socket failed");
    }
    let _ = stream.shutdown().await;

    daemon.unregister_connection(connection_id);
    debug!(
        connection_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Control connection finished"
    );

    if let AfterReply::Stop = after {
        daemon.request_stop();
    }
}

async fn read_command(stream: &mut UnixStream) -> OpsipxeconfdResult<String> {
    let mut buffer = vec![0u8; MAX_REQUEST];
    let read = tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buffer))
        .await
        .map_err(|_| OpsipxeconfdError::Control("timeout reading command".into()))?
        .map_err(|err| OpsipxeconfdError::Control(format!("receive failed: {}", err)))?;

    Ok(String::from_utf8_lossy(&buffer[..read]).trim().to_string())
}
