use opsipxeconfd::DaemonConfig;

use crate::client::ServerConnection;

use super::CLIENT_TIMEOUT;

pub fn execute(config: &DaemonConfig) -> anyhow::Result<()> {
    let connection = ServerConnection::new(&config.socket_path, CLIENT_TIMEOUT);
    let reply = connection.send_command("status")?;
    println!("{}", reply);
    Ok(())
}
