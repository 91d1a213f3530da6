//! One-shot client for the daemon's control socket.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};

use opsipxeconfd_shared::ERROR_MARKER;

/// Connection to a running opsipxeconfd instance.
pub struct ServerConnection {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ServerConnection {
    pub fn new(socket_path: &Path, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            timeout,
        }
    }

    /// Send one command and collect the full reply.
    ///
    /// An `(ERROR)`-prefixed reply is turned into an `Err`, so callers exit
    /// non-zero on daemon-side failures.
    pub fn send_command(&self, command: &str) -> anyhow::Result<String> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "failed to connect to socket '{}'",
                self.socket_path.display()
            )
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        stream
            .write_all(command.as_bytes())
            .context("failed to send command")?;
        stream.shutdown(Shutdown::Write)?;

        let mut reply = String::new();
        stream
            .read_to_string(&mut reply)
            .context("failed to receive reply")?;

        if reply.starts_with(ERROR_MARKER) {
            bail!("command '{}' failed: {}", command, reply);
        }
        Ok(reply)
    }
}
