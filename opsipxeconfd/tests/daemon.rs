//! End-to-end tests against an in-memory backend and a scratch pxe
//! directory: pipe lifecycle, uniqueness invariants, control protocol and
//! shutdown behaviour.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use opsipxeconfd::backend::{Backend, MemoryBackend, CONFIG_BOOTIMAGE_APPEND, CONFIG_SERVICE_URL};
use opsipxeconfd::types::{
    BootAction, Confidential, HostId, HostRecord, NetbootProduct, ProductOnClient, ProductOnDepot,
};
use opsipxeconfd::{DaemonConfig, Opsipxeconfd};

const DEPOT: &str = "depot.example.org";
const MAC_H1: &str = "00:11:22:33:44:55";

struct TestDaemon {
    daemon: Arc<Opsipxeconfd>,
    backend: Arc<MemoryBackend>,
    config: DaemonConfig,
    pxe_dir: PathBuf,
    template_dir: PathBuf,
    socket_path: PathBuf,
    _dir: TempDir,
}

fn test_daemon(seed: impl FnOnce(&MemoryBackend)) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let template_dir = dir.path().join("templates");
    std::fs::create_dir_all(&template_dir).unwrap();
    std::fs::write(
        template_dir.join("install"),
        "default opsi\nappend initrd=opsi root=/dev/ram0\n",
    )
    .unwrap();
    let pxe_dir = dir.path().join("pxe");
    std::fs::create_dir_all(&pxe_dir).unwrap();
    let socket_path = dir.path().join("opsipxeconfd.socket");

    let mut config = DaemonConfig::default();
    config.pxe_dir = pxe_dir.clone();
    config.pxe_template = template_dir.join("install");
    config.socket_path = socket_path.clone();
    config.depot_id = DEPOT.to_string();

    let backend = Arc::new(MemoryBackend::new());
    seed(&backend);

    let factory_backend = backend.clone();
    let daemon = Opsipxeconfd::new(
        config.clone(),
        Box::new(move |_| {
            let backend: Arc<dyn Backend> = factory_backend.clone();
            Ok(backend)
        }),
    )
    .unwrap();

    TestDaemon {
        daemon,
        backend,
        config,
        pxe_dir,
        template_dir,
        socket_path,
        _dir: dir,
    }
}

fn seed_client(backend: &MemoryBackend, host: &str, mac: Option<&str>, action: BootAction) {
    let host_id = HostId::parse(host).unwrap();
    backend.add_depot_client(DEPOT, host_id.clone());
    backend.add_host(
        host_id.clone(),
        HostRecord {
            mac: mac.map(str::to_string),
            ipv4: None,
            host_key: Some(Confidential::new("deadbeef")),
        },
    );
    backend.add_product_on_client(ProductOnClient {
        host_id: host_id.clone(),
        product_id: "win10".to_string(),
        product_version: None,
        package_version: None,
        action_request: action,
        action_progress: None,
    });
    backend.add_product_on_depot(
        DEPOT,
        ProductOnDepot {
            product_id: "win10".to_string(),
            product_version: "21h2".to_string(),
            package_version: "3".to_string(),
        },
    );
    backend.add_netboot_product("win10", "21h2", "3", NetbootProduct::default());
    backend.set_config_state(
        host_id,
        CONFIG_SERVICE_URL,
        vec!["https://s.example.org:4447".to_string()],
    );
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn read_pipe(path: &Path) -> String {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::read_to_string(path))
        .await
        .unwrap()
        .unwrap()
}

// ============================================================================
// Updater-level scenarios
// ============================================================================

#[tokio::test]
async fn happy_path_renders_pipe_and_records_read() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup)
    });

    let reply = bed
        .daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();
    assert_eq!(reply, "Boot configuration updated");

    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    assert!(pxefile.exists());

    let content = read_pipe(&pxefile).await;
    assert!(content.contains("default opsi\n"));
    assert!(content.contains(
        "append initrd=opsi root=/dev/ram0 pckey=deadbeef hn=h1 dn=example.org \
         product=win10 service=https://s.example.org:4447/rpc"
    ));

    wait_until("pipe removal", || !pxefile.exists()).await;
    wait_until("backend write-back", || !bed.backend.update_calls().is_empty()).await;

    let calls = bed.backend.update_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 1);
    assert_eq!(
        calls[0][0].action_progress.as_deref(),
        Some("pxe boot configuration read")
    );
    // Default template: the action request is left alone.
    assert_eq!(calls[0][0].action_request, BootAction::Setup);
}

#[tokio::test]
async fn bootimage_append_config_state_wins() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        backend.set_config_state(
            HostId::parse("h1.example.org").unwrap(),
            CONFIG_BOOTIMAGE_APPEND,
            vec!["lang=de acpi=off".to_string()],
        );
    });

    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();

    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    let content = read_pipe(&pxefile).await;
    assert!(content.contains("lang=de acpi=off"));

    bed.daemon.registry().shutdown().await;
}

#[tokio::test]
async fn template_override_clears_action_request() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        backend.add_netboot_product(
            "win10",
            "21h2",
            "3",
            NetbootProduct {
                pxe_config_template: Some("altinstall".to_string()),
            },
        );
    });
    std::fs::write(
        bed.template_dir.join("altinstall"),
        "append initrd=alt root=/dev/ram0\n",
    )
    .unwrap();

    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();

    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    let content = read_pipe(&pxefile).await;
    assert!(content.contains("initrd=alt"));

    wait_until("backend write-back", || !bed.backend.update_calls().is_empty()).await;
    let calls = bed.backend.update_calls();
    assert_eq!(calls[0][0].action_request, BootAction::None);
}

#[tokio::test]
async fn address_collision_is_rejected_and_pipe_untouched() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        seed_client(backend, "h2.example.org", Some(MAC_H1), BootAction::Setup);
    });

    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();
    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    assert!(pxefile.exists());

    let err = bed
        .daemon
        .updater()
        .update("h2.example.org", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("address collision"));

    assert!(pxefile.exists());
    assert_eq!(bed.daemon.registry().len(), 1);

    bed.daemon.registry().shutdown().await;
}

#[tokio::test]
async fn ipv4_name_derivation_without_mac() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", None, BootAction::Setup);
        backend.add_host(
            HostId::parse("h1.example.org").unwrap(),
            HostRecord {
                mac: None,
                ipv4: Some("192.168.1.10".parse().unwrap()),
                host_key: None,
            },
        );
    });

    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();
    assert!(bed.pxe_dir.join("C0A8010A").exists());

    bed.daemon.registry().shutdown().await;
}

#[tokio::test]
async fn host_without_address_fails() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", None, BootAction::Setup);
    });

    let err = bed
        .daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no address for host"));
    assert_eq!(bed.daemon.registry().len(), 0);
}

#[tokio::test]
async fn update_without_pending_action_is_a_noop_success() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        backend.clear_action_request(&HostId::parse("h1.example.org").unwrap(), "win10");
    });

    let reply = bed
        .daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();
    assert_eq!(reply, "Boot configuration updated");
    assert!(bed.daemon.registry().is_empty());
    assert!(std::fs::read_dir(&bed.pxe_dir).unwrap().next().is_none());
}

#[tokio::test]
async fn repeated_update_keeps_one_writer_and_same_content() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup)
    });
    let updater = bed.daemon.updater();

    updater.update("h1.example.org", None).await.unwrap();
    let first_content = {
        let writers = bed.daemon.registry().snapshot();
        assert_eq!(writers.len(), 1);
        writers[0].append.clone()
    };

    updater.update("h1.example.org", None).await.unwrap();
    let writers = bed.daemon.registry().snapshot();
    assert_eq!(writers.len(), 1);
    assert_eq!(writers[0].append, first_content);

    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    let content = read_pipe(&pxefile).await;
    assert!(content.contains("pckey=deadbeef hn=h1"));
    wait_until("pipe removal", || !pxefile.exists()).await;
}

#[tokio::test]
async fn concurrent_updates_for_one_host_produce_one_writer() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup)
    });
    let updater = bed.daemon.updater();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let updater = updater.clone();
        tasks.push(tokio::spawn(async move {
            updater.update("h1.example.org", None).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(bed.daemon.registry().len(), 1);
    bed.daemon.registry().shutdown().await;
}

#[tokio::test]
async fn always_action_rematerialises_the_pipe() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Always)
    });

    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();

    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    let content = read_pipe(&pxefile).await;
    assert!(content.contains("pckey=deadbeef"));

    // Without any further control command a fresh pipe appears.
    wait_until("re-materialised pipe", || pxefile.exists()).await;
    let registry = bed.daemon.registry();
    wait_until("re-registered writer", || registry.len() == 1).await;

    wait_until("backend write-back", || !bed.backend.update_calls().is_empty()).await;
    let calls = bed.backend.update_calls();
    assert_eq!(calls[0][0].action_request, BootAction::Always);

    bed.daemon.registry().shutdown().await;
}

#[tokio::test]
async fn writer_limit_is_enforced() {
    let bed = {
        let dir = tempfile::tempdir().unwrap();
        let template_dir = dir.path().join("templates");
        std::fs::create_dir_all(&template_dir).unwrap();
        std::fs::write(template_dir.join("install"), "append initrd=opsi\n").unwrap();
        let pxe_dir = dir.path().join("pxe");
        std::fs::create_dir_all(&pxe_dir).unwrap();

        let mut config = DaemonConfig::default();
        config.pxe_dir = pxe_dir.clone();
        config.pxe_template = template_dir.join("install");
        config.socket_path = dir.path().join("opsipxeconfd.socket");
        config.depot_id = DEPOT.to_string();
        config.max_pxe_config_writers = 1;

        let backend = Arc::new(MemoryBackend::new());
        seed_client(&backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        seed_client(
            &backend,
            "h2.example.org",
            Some("00:11:22:33:44:66"),
            BootAction::Setup,
        );

        let factory_backend = backend.clone();
        let daemon = Opsipxeconfd::new(
            config.clone(),
            Box::new(move |_| {
                let backend: Arc<dyn Backend> = factory_backend.clone();
                Ok(backend)
            }),
        )
        .unwrap();
        TestDaemon {
            daemon,
            backend,
            config,
            pxe_dir,
            template_dir,
            socket_path: dir.path().join("opsipxeconfd.socket"),
            _dir: dir,
        }
    };

    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();
    let err = bed
        .daemon
        .updater()
        .update("h2.example.org", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("maximum number"));

    bed.daemon.registry().shutdown().await;
}

#[tokio::test]
async fn remove_evicts_writer_and_deletes_pipe() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup)
    });
    let updater = bed.daemon.updater();

    updater.update("h1.example.org", None).await.unwrap();
    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    assert!(pxefile.exists());

    let reply = updater.remove("h1.example.org").await.unwrap();
    assert_eq!(reply, "Boot configuration removed");
    assert_eq!(bed.daemon.registry().len(), 0);
    wait_until("pipe removal", || !pxefile.exists()).await;
}

#[tokio::test]
async fn status_lists_active_writers_with_masked_append() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        seed_client(
            backend,
            "h2.example.org",
            Some("00:11:22:33:44:66"),
            BootAction::Setup,
        );
    });
    let updater = bed.daemon.updater();

    updater.update("h1.example.org", None).await.unwrap();
    updater.update("h2.example.org", None).await.unwrap();

    let status = bed.daemon.status();
    assert!(status.contains("2 boot configuration(s) set"));
    assert!(status.contains("Boot config for client 'h1.example.org'"));
    assert!(status.contains("Boot config for client 'h2.example.org'"));
    assert!(!status.contains("deadbeef"));

    bed.daemon.registry().shutdown().await;
}

#[tokio::test]
async fn obsolete_template_name_falls_back_to_default() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        backend.add_netboot_product(
            "win10",
            "21h2",
            "3",
            NetbootProduct {
                pxe_config_template: Some("install-x64".to_string()),
            },
        );
    });

    // No install-x64 file exists anywhere; the default template is used.
    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();

    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    let content = read_pipe(&pxefile).await;
    assert!(content.contains("initrd=opsi root=/dev/ram0"));

    // Counts as the default template: the action request is left alone.
    wait_until("backend write-back", || !bed.backend.update_calls().is_empty()).await;
    assert_eq!(
        bed.backend.update_calls()[0][0].action_request,
        BootAction::Setup
    );
}

#[tokio::test]
async fn conflicting_product_templates_last_one_wins() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        backend.add_netboot_product(
            "win10",
            "21h2",
            "3",
            NetbootProduct {
                pxe_config_template: Some("altinstall".to_string()),
            },
        );
        // A second product with a different template declaration.
        let host_id = HostId::parse("h1.example.org").unwrap();
        backend.add_product_on_client(ProductOnClient {
            host_id,
            product_id: "win11".to_string(),
            product_version: None,
            package_version: None,
            action_request: BootAction::Setup,
            action_progress: None,
        });
        backend.add_product_on_depot(
            DEPOT,
            ProductOnDepot {
                product_id: "win11".to_string(),
                product_version: "23h2".to_string(),
                package_version: "1".to_string(),
            },
        );
        backend.add_netboot_product(
            "win11",
            "23h2",
            "1",
            NetbootProduct {
                pxe_config_template: Some("otherinstall".to_string()),
            },
        );
    });
    std::fs::write(bed.template_dir.join("altinstall"), "append initrd=alt\n").unwrap();
    std::fs::write(bed.template_dir.join("otherinstall"), "append initrd=other\n").unwrap();

    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();

    let pxefile = bed.pxe_dir.join("01-00-11-22-33-44-55");
    let content = read_pipe(&pxefile).await;
    assert!(content.contains("initrd=other"));

    bed.daemon.registry().shutdown().await;
}

#[tokio::test]
async fn reload_preserves_active_writers() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup)
    });

    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();
    assert_eq!(bed.daemon.registry().len(), 1);

    let mut new_config = bed.config.clone();
    new_config.max_connections = 7;
    bed.daemon.reload(new_config).await.unwrap();

    // The writer survives and the rebuilt updater shares the registry.
    assert_eq!(bed.daemon.registry().len(), 1);
    bed.daemon
        .updater()
        .update("h1.example.org", None)
        .await
        .unwrap();
    assert_eq!(bed.daemon.registry().len(), 1);

    bed.daemon.registry().shutdown().await;
}

// ============================================================================
// Full daemon with control socket
// ============================================================================

async fn send_command(socket_path: &Path, command: &str) -> String {
    let mut stream = UnixStream::connect(socket_path).await.unwrap();
    stream.write_all(command.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn daemon_serves_control_commands_and_stops_cleanly() {
    let bed = test_daemon(|backend| {
        seed_client(backend, "h1.example.org", Some(MAC_H1), BootAction::Setup);
        seed_client(
            backend,
            "h2.example.org",
            Some("00:11:22:33:44:66"),
            BootAction::Setup,
        );
        seed_client(
            backend,
            "h3.example.org",
            Some("00:11:22:33:44:77"),
            BootAction::Setup,
        );
    });

    let daemon = bed.daemon.clone();
    let run_task = tokio::spawn(async move { daemon.run().await });

    let socket_path = bed.socket_path.clone();
    wait_until("control socket", || socket_path.exists()).await;

    // Startup reconciliation materialises one pipe per seeded client.
    let pxe_dir = bed.pxe_dir.clone();
    wait_until("startup reconciliation", || {
        std::fs::read_dir(&pxe_dir).unwrap().count() == 3
    })
    .await;

    let status = send_command(&bed.socket_path, "status").await;
    assert!(status.starts_with("opsipxeconfd status:"));
    assert!(status.contains("3 boot configuration(s) set"));

    let reply = send_command(&bed.socket_path, "update h1.example.org").await;
    assert_eq!(reply, "Boot configuration updated");

    let reply = send_command(&bed.socket_path, "frobnicate").await;
    assert!(reply.starts_with("(ERROR)"));

    let reply = send_command(&bed.socket_path, "update").await;
    assert!(reply.starts_with("(ERROR)"));

    let reply = send_command(&bed.socket_path, "stop").await;
    assert_eq!(reply, "opsipxeconfd is going down");

    tokio::time::timeout(Duration::from_secs(5), run_task)
        .await
        .expect("daemon did not stop in time")
        .unwrap()
        .unwrap();

    assert!(!bed.socket_path.exists());
    assert_eq!(std::fs::read_dir(&bed.pxe_dir).unwrap().count(), 0);
    assert!(!bed.daemon.is_running());
}
