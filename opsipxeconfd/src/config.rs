//! Daemon configuration: defaults, config-file parsing, validation.

use std::path::{Path, PathBuf};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/opsi/opsipxeconfd.conf";
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/opsipxeconfd/opsipxeconfd.socket";

/// Runtime configuration of the daemon.
///
/// Values come from built-in defaults, then the config file, then command
/// line overrides. All keys take effect on `SIGHUP` except `pid file`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub backend_config_dir: PathBuf,
    pub dispatch_config_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
    pub log_level: u8,
    pub pxe_dir: PathBuf,
    pub pxe_template: PathBuf,
    pub uefi_template_x86: PathBuf,
    pub uefi_template_x64: PathBuf,
    pub max_connections: usize,
    pub max_pxe_config_writers: usize,
    pub socket_path: PathBuf,
    pub depot_id: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backend_config_dir: PathBuf::from("/etc/opsi/backends"),
            dispatch_config_file: PathBuf::from("/etc/opsi/backendManager/dispatch.conf"),
            pid_file: PathBuf::from("/var/run/opsipxeconfd/opsipxeconfd.pid"),
            log_file: None,
            log_format: None,
            log_level: 5,
            pxe_dir: PathBuf::from("/tftpboot/linux/pxelinux.cfg"),
            pxe_template: PathBuf::from("/tftpboot/linux/pxelinux.cfg/install"),
            uefi_template_x86: PathBuf::from("/tftpboot/linux/pxelinux.cfg/install-elilo-x86"),
            uefi_template_x64: PathBuf::from("/tftpboot/linux/pxelinux.cfg/install-grub-x64"),
            max_connections: 5,
            max_pxe_config_writers: 100,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            depot_id: String::new(),
        }
    }
}

impl DaemonConfig {
    /// Load defaults and apply the given config file if it exists.
    pub fn load(config_file: &Path) -> OpsipxeconfdResult<Self> {
        let mut config = Self::default();
        if config_file.exists() {
            config.apply_file(config_file)?;
        }
        if config.depot_id.is_empty() {
            config.depot_id = local_fqdn()?;
        }
        Ok(config)
    }

    /// Parse an ini-like `key = value` file, `#` and `;` start comments.
    pub fn apply_file(&mut self, path: &Path) -> OpsipxeconfdResult<()> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            OpsipxeconfdError::Config(format!("cannot read '{}': {}", path.display(), err))
        })?;

        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let (option, value) = line.split_once('=').ok_or_else(|| {
                OpsipxeconfdError::Config(format!(
                    "unexpected line {} in '{}': {}",
                    lineno + 1,
                    path.display(),
                    line
                ))
            })?;
            let option = option.trim();
            let value = value.trim();

            match option {
                "backend config dir" => self.backend_config_dir = PathBuf::from(value),
                "dispatch config file" => self.dispatch_config_file = PathBuf::from(value),
                "pid file" => self.pid_file = PathBuf::from(value),
                "log file" => self.log_file = Some(PathBuf::from(value)),
                "log format" => self.log_format = Some(value.to_string()),
                "log level" => self.log_level = parse_log_level(option, value)?,
                "pxe config dir" => self.pxe_dir = PathBuf::from(value),
                "pxe config template" => self.pxe_template = PathBuf::from(value),
                "uefi netboot config template x86" => {
                    self.uefi_template_x86 = PathBuf::from(value)
                }
                "uefi netboot config template x64" => {
                    self.uefi_template_x64 = PathBuf::from(value)
                }
                "max control connections" => {
                    self.max_connections = parse_positive(option, value)?
                }
                "max pxe config writers" => {
                    self.max_pxe_config_writers = parse_positive(option, value)?
                }
                "depot id" => self.depot_id = value.to_ascii_lowercase(),
                _ => {
                    return Err(OpsipxeconfdError::Config(format!(
                        "unexpected option in line {} of '{}': {}",
                        lineno + 1,
                        path.display(),
                        option
                    )));
                }
            }
        }

        Ok(())
    }

    /// Directory that relative `pxeConfigTemplate` values resolve against.
    pub fn template_dir(&self) -> &Path {
        self.pxe_template.parent().unwrap_or(Path::new("/"))
    }
}

fn parse_positive(option: &str, value: &str) -> OpsipxeconfdResult<usize> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(OpsipxeconfdError::Config(format!(
            "'{}' must be a positive integer, got '{}'",
            option, value
        ))),
    }
}

fn parse_log_level(option: &str, value: &str) -> OpsipxeconfdResult<u8> {
    match value.parse::<u8>() {
        Ok(n) if n <= 9 => Ok(n),
        _ => Err(OpsipxeconfdError::Config(format!(
            "'{}' must be in 0..9, got '{}'",
            option, value
        ))),
    }
}

/// The fully-qualified lower-cased name of this machine, which doubles as
/// the default depot id.
pub fn local_fqdn() -> OpsipxeconfdResult<String> {
    let hostname = nix::unistd::gethostname()
        .map_err(|err| OpsipxeconfdError::Config(format!("cannot resolve hostname: {}", err)))?;
    let hostname = hostname.to_string_lossy().to_ascii_lowercase();
    if hostname.is_empty() {
        return Err(OpsipxeconfdError::Config("empty hostname".into()));
    }
    Ok(hostname)
}
