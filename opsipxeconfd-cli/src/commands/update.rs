use std::path::Path;

use opsipxeconfd::DaemonConfig;

use crate::client::ServerConnection;

use super::CLIENT_TIMEOUT;

pub fn execute(
    config: &DaemonConfig,
    client_id: &str,
    cache_path: Option<&Path>,
) -> anyhow::Result<()> {
    let command = match cache_path {
        Some(path) => format!("update {} {}", client_id, path.display()),
        None => format!("update {}", client_id),
    };

    let connection = ServerConnection::new(&config.socket_path, CLIENT_TIMEOUT);
    let reply = connection.send_command(&command)?;
    println!("{}", reply);
    Ok(())
}
