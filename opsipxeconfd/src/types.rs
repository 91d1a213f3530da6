//! Core data types for PXE boot configuration management.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use opsipxeconfd_shared::{OpsipxeconfdError, OpsipxeconfdResult};

// ============================================================================
// HOST ID
// ============================================================================

/// Fully-qualified client identifier in canonical (lower-case) form.
///
/// All equality and map lookups operate on the canonical form; construction
/// goes through [`HostId::parse`], which lower-cases the input and validates
/// DNS-label shape.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    /// Canonicalise and validate a host id.
    ///
    /// Lower-cases the input and checks that every dot-separated label is a
    /// valid DNS label (1..=63 chars of `[a-z0-9-]`, no leading or trailing
    /// hyphen). Empty input is rejected.
    pub fn parse(raw: &str) -> OpsipxeconfdResult<Self> {
        let canonical = raw.trim().to_ascii_lowercase();
        if canonical.is_empty() {
            return Err(OpsipxeconfdError::InvalidHostId(raw.to_string()));
        }
        for label in canonical.split('.') {
            let valid = !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
                && !label.starts_with('-')
                && !label.ends_with('-');
            if !valid {
                return Err(OpsipxeconfdError::InvalidHostId(raw.to_string()));
            }
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first DNS label (`h1` for `h1.example.org`).
    pub fn short_name(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// Everything after the first label (`example.org` for `h1.example.org`),
    /// empty if the id has a single label.
    pub fn domain(&self) -> &str {
        match self.0.split_once('.') {
            Some((_, domain)) => domain,
            None => "",
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({})", self.0)
    }
}

impl AsRef<str> for HostId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// BOOT ACTION
// ============================================================================

/// Action requested for a netboot product on a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootAction {
    Setup,
    Uninstall,
    Update,
    Always,
    Once,
    Custom,
    None,
}

impl BootAction {
    /// The actions that cause a boot configuration pipe to be materialised.
    pub const PENDING: [BootAction; 6] = [
        BootAction::Setup,
        BootAction::Uninstall,
        BootAction::Update,
        BootAction::Always,
        BootAction::Once,
        BootAction::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BootAction::Setup => "setup",
            BootAction::Uninstall => "uninstall",
            BootAction::Update => "update",
            BootAction::Always => "always",
            BootAction::Once => "once",
            BootAction::Custom => "custom",
            BootAction::None => "none",
        }
    }
}

impl std::str::FromStr for BootAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(BootAction::Setup),
            "uninstall" => Ok(BootAction::Uninstall),
            "update" => Ok(BootAction::Update),
            "always" => Ok(BootAction::Always),
            "once" => Ok(BootAction::Once),
            "custom" => Ok(BootAction::Custom),
            "none" => Ok(BootAction::None),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BootAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// BACKEND RECORDS
// ============================================================================

/// Outstanding netboot action for a product on a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductOnClient {
    pub host_id: HostId,
    pub product_id: String,
    pub product_version: Option<String>,
    pub package_version: Option<String>,
    pub action_request: BootAction,
    pub action_progress: Option<String>,
}

/// Address and key material the backend knows about a host.
#[derive(Debug, Clone, Default)]
pub struct HostRecord {
    pub mac: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
    pub host_key: Option<Confidential>,
}

/// Version pin of a netboot product on a depot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductOnDepot {
    pub product_id: String,
    pub product_version: String,
    pub package_version: String,
}

/// Netboot product metadata relevant to boot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetbootProduct {
    pub pxe_config_template: Option<String>,
}

/// Values of one product property for one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductPropertyState {
    pub property_id: String,
    pub values: Vec<String>,
}

// ============================================================================
// PXE CONFIG NAME
// ============================================================================

/// Derive the PXE config file name for a host.
///
/// A known MAC address wins: `01-` followed by the address with colons
/// replaced by dashes, lower-cased. Otherwise the IPv4 address is encoded as
/// four upper-case two-digit hex octets. A host with neither fails.
pub fn pxe_config_name(host_id: &HostId, host: &HostRecord) -> OpsipxeconfdResult<String> {
    if let Some(mac) = &host.mac {
        return Ok(format!("01-{}", mac.to_ascii_lowercase().replace(':', "-")));
    }
    if let Some(ipv4) = &host.ipv4 {
        let octets = ipv4.octets();
        return Ok(format!(
            "{:02X}{:02X}{:02X}{:02X}",
            octets[0], octets[1], octets[2], octets[3]
        ));
    }
    Err(OpsipxeconfdError::NoAddress(host_id.to_string()))
}

// ============================================================================
// CONFIDENTIAL
// ============================================================================

/// A string whose default formatting is redacted.
///
/// Host keys travel through rendering as plaintext but must never reach a
/// log line or status report; extraction of the raw value is explicit.
#[derive(Clone, PartialEq, Eq)]
pub struct Confidential(String);

impl Confidential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Confidential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***confidential***")
    }
}

impl fmt::Debug for Confidential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Confidential(***)")
    }
}
