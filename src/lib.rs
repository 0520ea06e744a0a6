//! Kestrel: the core of an OpenFlow 1.0 SDN controller.
//!
//! The crate accepts long-lived switch connections, coordinates the
//! controller's HA role (MASTER / EQUAL / SLAVE) across every connected
//! switch with Nicira vendor role requests, dispatches received OpenFlow
//! messages to registered listeners under role-aware admission control, and
//! maintains the authoritative in-memory view of active switches.
//!
//! REST frontends, flow programming modules, topology/routing, and the
//! cluster sync store are external collaborators; they plug in through the
//! listener traits and the big-sync/node-IP entry points on
//! [`controller::Controller`].
#[macro_use]
pub mod error;

pub mod channel;
pub mod cli;
pub mod controller;
pub mod packet;
pub mod protocol;
pub mod settings;
pub mod switch;

pub use controller::{Controller, Role};
pub use error::{KestrelError, Result};
