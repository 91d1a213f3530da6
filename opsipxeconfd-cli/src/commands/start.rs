//! The `start` command: daemonise, claim the PID file, wire signals and run
//! the supervisor on a fresh runtime.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use nix::libc;
use nix::unistd::{chdir, fork, setsid, ForkResult};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use opsipxeconfd::backend::{Backend, JsonRpcBackend};
use opsipxeconfd::{DaemonConfig, Opsipxeconfd};

use crate::cli::Cli;
use crate::pidfile::PidFile;

pub fn execute(cli: &Cli, config: DaemonConfig) -> anyhow::Result<()> {
    if !cli.no_fork {
        daemonize()?;
    }

    // Logging starts its writer thread, so it must come after the forks.
    opsipxeconfd::logging::init_logging(&config)?;
    let _pid_file = PidFile::create(&config.pid_file)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    let conffile = cli.conffile.clone();
    let log_level_override = cli.log_level;

    runtime.block_on(async move {
        let daemon = Opsipxeconfd::new(
            config,
            Box::new(|config| {
                Ok(Arc::new(JsonRpcBackend::from_config_dir(&config.backend_config_dir)?)
                    as Arc<dyn Backend>)
            }),
        )?;

        spawn_signal_task(daemon.clone(), conffile, log_level_override)?;
        daemon.run().await?;
        Ok::<(), anyhow::Error>(())
    })?;

    info!("opsipxeconfd exited cleanly");
    Ok(())
}

/// Dispatch signals to the supervisor: SIGHUP reloads, SIGTERM/SIGINT stop.
///
/// No application logic runs in signal context; the streams are drained on a
/// dedicated task which posts to the supervisor.
fn spawn_signal_task(
    daemon: Arc<Opsipxeconfd>,
    conffile: PathBuf,
    log_level_override: Option<u8>,
) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("cannot install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    match reload_config(&conffile, log_level_override) {
                        Ok(config) => {
                            if let Err(err) = daemon.reload(config).await {
                                error!(error = %err, "Reload failed");
                            }
                        }
                        Err(err) => error!(error = %err, "Re-reading configuration failed"),
                    }
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    daemon.request_stop();
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT");
                    daemon.request_stop();
                }
            }
        }
    });

    Ok(())
}

fn reload_config(
    conffile: &std::path::Path,
    log_level_override: Option<u8>,
) -> anyhow::Result<DaemonConfig> {
    let mut config = DaemonConfig::load(conffile)?;
    if let Some(log_level) = log_level_override {
        config.log_level = log_level;
    }
    Ok(config)
}

/// Classic double fork: detach from the controlling terminal, drop session
/// leadership, redirect stdio to /dev/null.
fn daemonize() -> anyhow::Result<()> {
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    // Do not hinder umounts.
    chdir("/").context("chdir to / failed")?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("cannot open /dev/null")?;
    for stdio_fd in 0..=2 {
        let rc = unsafe { libc::dup2(devnull.as_raw_fd(), stdio_fd) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("cannot redirect fd {}", stdio_fd));
        }
    }

    Ok(())
}
