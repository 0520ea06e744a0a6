//! Connected-switch entity.
//!
//! An [`OfSwitch`] is created by the channel handler once the handshake has
//! produced a datapath id and description. The handler owns it exclusively
//! until activation, after which the registry shares it with listeners.
pub mod dpid;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::controller::Role;
use crate::error::Result;
use crate::protocol::{DescriptionStats, FeaturesReply, OfMessage, PhyPort, StatsReply};
pub use dpid::{dpid_from_string, dpid_to_string, Dpid};

/// A switch connected over an OpenFlow channel.
///
/// All mutable state uses interior mutability so the channel handler, the
/// role-changer worker, and registry readers can share one handle. None of
/// the locks are held across await points.
pub struct OfSwitch {
    // Unique per TCP connection; distinguishes reconnects that reuse a DPID
    connection_id: u64,
    datapath_id: Dpid,
    remote_addr: SocketAddr,
    connected_since: DateTime<Utc>,
    features: FeaturesReply,
    description: DescriptionStats,

    next_xid: AtomicU32,
    supports_nx_role: Mutex<Option<bool>>,
    ha_role: Mutex<Option<Role>>,

    // Output path to the connection's writer task. None once the output
    // stream has been disconnected.
    outbox: Mutex<Option<mpsc::UnboundedSender<OfMessage>>>,
    // Close signal observed by the connection's reader task
    closed_tx: watch::Sender<bool>,

    // Outstanding statistics requests awaiting replies
    pending_stats: Mutex<HashMap<u32, oneshot::Sender<StatsReply>>>,
    // Cookies of flow-mods this controller has pushed (opaque bookkeeping)
    issued_flow_mods: Mutex<HashSet<u64>>,
}

impl OfSwitch {
    pub fn new(
        connection_id: u64,
        features: FeaturesReply,
        description: DescriptionStats,
        remote_addr: SocketAddr,
        outbox: mpsc::UnboundedSender<OfMessage>,
        closed_tx: watch::Sender<bool>,
    ) -> Self {
        OfSwitch {
            connection_id,
            datapath_id: features.datapath_id,
            remote_addr,
            connected_since: Utc::now(),
            features,
            description,
            next_xid: AtomicU32::new(1),
            supports_nx_role: Mutex::new(None),
            ha_role: Mutex::new(None),
            outbox: Mutex::new(Some(outbox)),
            closed_tx,
            pending_stats: Mutex::new(HashMap::new()),
            issued_flow_mods: Mutex::new(HashSet::new()),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn datapath_id(&self) -> Dpid {
        self.datapath_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_since(&self) -> DateTime<Utc> {
        self.connected_since
    }

    pub fn description(&self) -> &DescriptionStats {
        &self.description
    }

    pub fn ports(&self) -> &[PhyPort] {
        &self.features.ports
    }

    /// Allocate the next per-connection OpenFlow transaction id.
    pub fn next_transaction_id(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Write messages to the switch's output stream.
    pub fn write(&self, msgs: Vec<OfMessage>) -> Result<()> {
        let outbox = self.outbox.lock().expect("outbox lock poisoned");
        let tx = outbox
            .as_ref()
            .ok_or_else(|| transport_error!("output stream for {} is disconnected", self))?;
        for msg in msgs {
            tx.send(msg)
                .map_err(|_| transport_error!("connection to {} is closed", self))?;
        }
        Ok(())
    }

    /// Sever the connection starting from the output stream: no further
    /// writes are accepted, already queued messages may still drain, and
    /// the reader task is signalled to shut the channel down.
    pub fn disconnect_output_stream(&self) {
        let dropped = self.outbox.lock().expect("outbox lock poisoned").take();
        if dropped.is_some() {
            debug!("Disconnected output stream for {}", self);
        }
        self.closed_tx.send_replace(true);
    }

    /// Tear down the channel.
    pub fn close_channel(&self) {
        self.disconnect_output_stream();
    }

    /// Whether the channel has been asked to close.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Subscribe to the channel close signal.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn ha_role(&self) -> Option<Role> {
        *self.ha_role.lock().expect("role lock poisoned")
    }

    /// Set the switch's HA role as seen by this controller.
    ///
    /// `reply_received` is false when the role is being forced without a
    /// confirming reply from the switch. Setting the role to `None` is the
    /// give-up path and closes the channel. A forced SLAVE to MASTER flip
    /// flushes the flow table since its contents are unknown to us.
    pub fn set_ha_role(&self, role: Option<Role>, reply_received: bool) {
        let old = {
            let mut guard = self.ha_role.lock().expect("role lock poisoned");
            std::mem::replace(&mut *guard, role)
        };

        match role {
            None => {
                warn!("Clearing HA role for {}; disconnecting", self);
                self.close_channel();
            }
            Some(Role::Master) if old == Some(Role::Slave) && !reply_received => {
                debug!("Forced SLAVE to MASTER reset for {}; flushing flows", self);
                self.clear_all_flow_mods();
            }
            _ => {}
        }
    }

    pub fn supports_nx_role(&self) -> Option<bool> {
        *self
            .supports_nx_role
            .lock()
            .expect("nx role lock poisoned")
    }

    pub fn set_supports_nx_role(&self, value: Option<bool>) {
        *self
            .supports_nx_role
            .lock()
            .expect("nx role lock poisoned") = value;
    }

    /// Track an outstanding statistics request.
    pub fn register_stats_request(&self, xid: u32, reply_tx: oneshot::Sender<StatsReply>) {
        self.pending_stats
            .lock()
            .expect("stats lock poisoned")
            .insert(xid, reply_tx);
    }

    /// Route a statistics reply to its waiter, if any. Returns true when a
    /// waiter consumed the reply.
    pub fn deliver_stats_reply(&self, xid: u32, reply: StatsReply) -> bool {
        let waiter = self
            .pending_stats
            .lock()
            .expect("stats lock poisoned")
            .remove(&xid);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop every outstanding statistics waiter. Called when the switch
    /// leaves the active registry.
    pub fn cancel_all_statistics_replies(&self) {
        let mut pending = self.pending_stats.lock().expect("stats lock poisoned");
        if !pending.is_empty() {
            debug!(
                "Cancelling {} outstanding statistics requests for {}",
                pending.len(),
                self
            );
        }
        pending.clear();
    }

    /// Record a flow-mod cookie this controller pushed to the switch.
    pub fn note_flow_mod(&self, cookie: u64) {
        self.issued_flow_mods
            .lock()
            .expect("flow mod lock poisoned")
            .insert(cookie);
    }

    pub fn issued_flow_mod_count(&self) -> usize {
        self.issued_flow_mods
            .lock()
            .expect("flow mod lock poisoned")
            .len()
    }

    /// Push a delete-all flow-mod and forget everything we issued.
    pub fn clear_all_flow_mods(&self) {
        let xid = self.next_transaction_id();
        if let Err(e) = self.write(vec![OfMessage::flow_mod_delete_all(xid)]) {
            debug!("Failed to flush flows on {}: {}", self, e);
        }
        self.issued_flow_mods
            .lock()
            .expect("flow mod lock poisoned")
            .clear();
    }
}

impl std::fmt::Display for OfSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "switch {} [{}]",
            dpid_to_string(self.datapath_id),
            self.remote_addr
        )
    }
}

impl std::fmt::Debug for OfSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfSwitch")
            .field("datapath_id", &dpid_to_string(self.datapath_id))
            .field("remote_addr", &self.remote_addr)
            .field("connection_id", &self.connection_id)
            .field("ha_role", &self.ha_role())
            .field("supports_nx_role", &self.supports_nx_role())
            .finish()
    }
}

impl PartialEq for OfSwitch {
    fn eq(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id
    }
}

impl Eq for OfSwitch {}

impl std::hash::Hash for OfSwitch {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.connection_id.hash(state);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;

    /// Build a switch wired to in-memory channels, returning the receiving
    /// ends so tests can observe writes and close signals.
    pub fn test_switch(
        connection_id: u64,
        datapath_id: Dpid,
    ) -> (
        Arc<OfSwitch>,
        mpsc::UnboundedReceiver<OfMessage>,
        watch::Receiver<bool>,
    ) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let features = FeaturesReply {
            datapath_id,
            n_buffers: 256,
            n_tables: 1,
            capabilities: 0,
            actions: 0,
            ports: vec![],
        };
        let sw = Arc::new(OfSwitch::new(
            connection_id,
            features,
            DescriptionStats::default(),
            "127.0.0.1:6633".parse().unwrap(),
            outbox_tx,
            closed_tx,
        ));
        (sw, outbox_rx, closed_rx)
    }
}
