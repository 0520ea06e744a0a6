//! Kestrel application settings
use std::collections::HashMap;

use crate::controller::Role;
use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_OPENFLOW: u16 = 6633;
pub const DEFAULT_PORT_OPENFLOW: &str = "6633";

/// Timeout for a switch to complete the OpenFlow handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;
/// Idle timeout after which a silent switch connection is dropped
pub const DEFAULT_READ_IDLE_TIMEOUT_SECS: u64 = 30;
/// Window within which repeated role changes are dampened
pub const DEFAULT_ROLE_FLAP_DAMPEN_MS: u64 = 2_000;
/// How long we wait for a switch to answer a role request
pub const DEFAULT_ROLE_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Property key consulted in the `rolepath` file
const ROLE_FILE_PROPERTY: &str = "floodlight.role";

#[derive(Clone, Debug)]
pub struct Settings {
    // Server listen address
    pub listen_address: String,

    // OpenFlow listen port for switch connections
    pub openflow_port: u16,

    // Worker thread count for the runtime; 0 means the runtime default
    pub worker_threads: usize,

    // Initial HA role, if configured directly
    pub role: Option<Role>,

    // Path to a property file holding `floodlight.role=...`; consulted only
    // when `role` is absent
    pub role_path: Option<String>,

    // Clear flow-mods on every switch add (HA reconnect hygiene)
    pub flush_switches_on_reconnect: bool,

    // Handshake and idle timeouts for switch channels
    pub handshake_timeout_secs: u64,
    pub read_idle_timeout_secs: u64,

    // Role flap dampening window
    pub role_flap_dampen_ms: u64,

    // Per-batch role request timeout
    pub role_request_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            openflow_port: STANDARD_PORT_OPENFLOW,
            worker_threads: 0,
            role: None,
            role_path: None,
            flush_switches_on_reconnect: false,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            read_idle_timeout_secs: DEFAULT_READ_IDLE_TIMEOUT_SECS,
            role_flap_dampen_ms: DEFAULT_ROLE_FLAP_DAMPEN_MS,
            role_request_timeout_ms: DEFAULT_ROLE_REQUEST_TIMEOUT_MS,
        }
    }
}

impl Settings {
    /// Build settings from the string map handed to the controller at
    /// startup. Unknown keys are ignored so callers can share one map
    /// across modules.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(port) = config.get("openflowport") {
            settings.openflow_port = port
                .parse()
                .map_err(|_| config_error!("invalid openflowport: {}", port))?;
        }
        if let Some(threads) = config.get("workerthreads") {
            settings.worker_threads = threads
                .parse()
                .map_err(|_| config_error!("invalid workerthreads: {}", threads))?;
        }
        if let Some(role) = config.get("role") {
            settings.role = Some(
                role.parse()
                    .map_err(|_| config_error!("invalid role: {}", role))?,
            );
        }
        settings.role_path = config.get("rolepath").cloned();
        if let Some(flush) = config.get("flushSwitchesOnReconnect") {
            settings.flush_switches_on_reconnect = flush.eq_ignore_ascii_case("true");
        }

        Ok(settings)
    }

    /// Resolve the initial HA role.
    ///
    /// The `role` setting wins. Otherwise the `rolepath` property file is
    /// consulted for a `floodlight.role=` line; a missing file is not an
    /// error, so an external election component can create the file later
    /// without kestrel configuration changes. An unparsable value is logged
    /// and the default of MASTER is kept.
    pub fn initial_role(&self) -> Role {
        let mut role = Role::Master;

        let role_string = match &self.role {
            Some(role) => Some(role.to_string()),
            None => self
                .role_path
                .as_ref()
                .and_then(|path| read_role_property(path)),
        };

        if let Some(role_string) = role_string {
            match role_string.trim().parse() {
                Ok(parsed) => role = parsed,
                Err(_) => {
                    tracing::error!("Invalid current role value: {}", role_string);
                }
            }
        }

        tracing::info!("Controller role set to {}", role);
        role
    }
}

/// Read `floodlight.role` from a java-style property file.
fn read_role_property(path: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == ROLE_FILE_PROPERTY {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}
