//! CLI for this application
//!
use crate::controller::Role;
use crate::settings::{self, Settings};

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, clap::Parser)]
pub struct Cli {
    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("KESTREL_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // OpenFlow listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_OPENFLOW,
        env("KESTREL_OPENFLOW_PORT"),
        help = "Port to accept OpenFlow switch connections on"
    )]
    pub openflow_port: u16,

    // Worker threads for the runtime
    #[clap(
        long,
        default_value = "0",
        env("KESTREL_WORKER_THREADS"),
        help = "Worker thread count; 0 uses the runtime default"
    )]
    pub worker_threads: usize,

    // Initial HA role
    #[clap(
        long,
        env("KESTREL_ROLE"),
        help = "Initial HA role: 'EQUAL', 'MASTER', or 'SLAVE'"
    )]
    pub role: Option<Role>,

    // Role property file consulted when --role is absent
    #[clap(
        long,
        env("KESTREL_ROLE_PATH"),
        help = "Path to a property file with 'floodlight.role=...' (used when --role is absent)"
    )]
    pub role_path: Option<String>,

    // Flush flows whenever a switch (re)connects
    #[clap(
        long,
        env("KESTREL_FLUSH_SWITCHES_ON_RECONNECT"),
        help = "Clear flow-mods on every switch add"
    )]
    pub flush_switches_on_reconnect: bool,

    #[clap(
        long,
        default_value = "15",
        env("KESTREL_HANDSHAKE_TIMEOUT_SECS"),
        help = "Seconds a switch may take to complete the handshake"
    )]
    pub handshake_timeout_secs: u64,

    #[clap(
        long,
        default_value = "30",
        env("KESTREL_READ_IDLE_TIMEOUT_SECS"),
        help = "Seconds of silence before a switch connection is dropped"
    )]
    pub read_idle_timeout_secs: u64,

    #[clap(
        long,
        default_value = "2000",
        env("KESTREL_ROLE_FLAP_DAMPEN_MS"),
        help = "Dampening window for rapid role changes in milliseconds"
    )]
    pub role_flap_dampen_ms: u64,

    #[clap(
        long,
        default_value = "5000",
        env("KESTREL_ROLE_REQUEST_TIMEOUT_MS"),
        help = "How long to wait for a switch to answer a role request"
    )]
    pub role_request_timeout_ms: u64,
}

impl Cli {
    pub fn into_settings(self) -> Settings {
        Settings {
            listen_address: self.listen_address,
            openflow_port: self.openflow_port,
            worker_threads: self.worker_threads,
            role: self.role,
            role_path: self.role_path,
            flush_switches_on_reconnect: self.flush_switches_on_reconnect,
            handshake_timeout_secs: self.handshake_timeout_secs,
            read_idle_timeout_secs: self.read_idle_timeout_secs,
            role_flap_dampen_ms: self.role_flap_dampen_ms,
            role_request_timeout_ms: self.role_request_timeout_ms,
        }
    }
}
