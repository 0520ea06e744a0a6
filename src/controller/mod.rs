//! Controller core: switch registry, listener dispatch, HA role state.
//!
//! One `Controller` owns the authoritative view of active switches, the
//! per-message-type listener registries, the update queue drained by
//! [`Controller::run`], and the role machinery that keeps every connected
//! switch aligned with the controller's HA role.
pub mod context;
pub mod dispatch_guard;
pub mod listeners;
pub mod role_changer;
pub mod role_manager;
pub mod updates;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channel::acceptor::ConnectionAcceptor;
use crate::error::Result;
use crate::packet::Ethernet;
use crate::protocol::nicira::{NX_ROLE_MASTER, NX_ROLE_OTHER, NX_ROLE_SLAVE};
use crate::protocol::{OfMessage, OfPayload, OfType};
use crate::settings::Settings;
use crate::switch::{Dpid, OfSwitch};

pub use context::{MessageContext, CONTEXT_PI_PAYLOAD};
pub use dispatch_guard::MessageDispatchGuard;
pub use listeners::{Command, HaListener, ListenerDispatcher, OfMessageListener, SwitchListener};
pub use role_changer::{PendingRoleRequestEntry, RoleChangeTask, RoleChanger, TaskType};
pub use role_manager::{RoleInfo, RoleManager, RoleRecipient};
pub use updates::Update;

const INITIAL_ROLE_CHANGE_DESCRIPTION: &str = "Controller startup.";
const UPDATE_QUEUE_CAPACITY: usize = 16_384;

/// HA role of the controller (and, per switch, its last requested role).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Equal,
    Master,
    Slave,
}

impl Role {
    /// Map to the Nicira role-request wire value.
    pub fn to_nx_role(self) -> u32 {
        match self {
            Role::Equal => NX_ROLE_OTHER,
            Role::Master => NX_ROLE_MASTER,
            Role::Slave => NX_ROLE_SLAVE,
        }
    }

    pub fn from_nx_role(value: u32) -> Option<Role> {
        match value {
            NX_ROLE_OTHER => Some(Role::Equal),
            NX_ROLE_MASTER => Some(Role::Master),
            NX_ROLE_SLAVE => Some(Role::Slave),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Equal => write!(f, "EQUAL"),
            Role::Master => write!(f, "MASTER"),
            Role::Slave => write!(f, "SLAVE"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EQUAL" => Ok(Role::Equal),
            "MASTER" => Ok(Role::Master),
            "SLAVE" => Ok(Role::Slave),
            other => Err(format!("invalid role: {}", other)),
        }
    }
}

/// The controller core.
pub struct Controller {
    settings: Settings,

    // Per message type, the ordered listeners
    message_listeners: DashMap<OfType, ListenerDispatcher>,
    switch_listeners: RwLock<Arc<Vec<Arc<dyn SwitchListener>>>>,
    ha_listeners: RwLock<Arc<Vec<Arc<dyn HaListener>>>>,

    // Switches actively controlled by this instance
    active_switches: DashMap<Dpid, Arc<OfSwitch>>,
    // Switches owned by the cluster peer, fed by the external sync subsystem
    big_sync_switches: DashMap<Dpid, Arc<OfSwitch>>,

    controller_node_ips: Mutex<HashMap<String, String>>,

    updates_tx: tokio::sync::mpsc::Sender<Update>,
    updates_rx: tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<Update>>>,

    dispatch_guard: MessageDispatchGuard,
    // The role modules have been notified about; lags the role manager's
    // role until the HA update is dispatched
    notified_role: RwLock<Role>,

    role_manager: Arc<RoleManager>,
    role_changer: Arc<RoleChanger>,

    always_clear_flows_on_sw_add: AtomicBool,
    connection_counter: AtomicU64,
}

impl Controller {
    pub fn new(settings: Settings) -> Arc<Self> {
        let initial_role = settings.initial_role();
        let (updates_tx, updates_rx) = tokio::sync::mpsc::channel(UPDATE_QUEUE_CAPACITY);

        let role_manager = Arc::new(RoleManager::new(
            initial_role,
            INITIAL_ROLE_CHANGE_DESCRIPTION,
            updates_tx.clone(),
            Duration::from_millis(settings.role_flap_dampen_ms),
        ));
        let role_changer = Arc::new(RoleChanger::new(Duration::from_millis(
            settings.role_request_timeout_ms,
        )));

        if settings.flush_switches_on_reconnect {
            info!("Flush switches on reconnect -- Enabled");
        } else {
            info!("Flush switches on reconnect -- Disabled");
        }
        let always_clear = settings.flush_switches_on_reconnect;

        Arc::new(Controller {
            settings,
            message_listeners: DashMap::new(),
            switch_listeners: RwLock::new(Arc::new(Vec::new())),
            ha_listeners: RwLock::new(Arc::new(Vec::new())),
            active_switches: DashMap::new(),
            big_sync_switches: DashMap::new(),
            controller_node_ips: Mutex::new(HashMap::new()),
            updates_tx,
            updates_rx: tokio::sync::Mutex::new(Some(updates_rx)),
            dispatch_guard: MessageDispatchGuard::new(initial_role != Role::Slave),
            notified_role: RwLock::new(initial_role),
            role_manager,
            role_changer,
            always_clear_flows_on_sw_add: AtomicBool::new(always_clear),
            connection_counter: AtomicU64::new(1),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn role_changer(&self) -> &Arc<RoleChanger> {
        &self.role_changer
    }

    pub(crate) fn dispatch_guard(&self) -> &MessageDispatchGuard {
        &self.dispatch_guard
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed)
    }

    // ***************
    // Role handling
    // ***************

    /// The role modules have been notified about.
    pub fn get_role(&self) -> Role {
        *self.notified_role.read().expect("role lock poisoned")
    }

    pub(crate) fn set_notified_role(&self, role: Role) {
        *self.notified_role.write().expect("role lock poisoned") = role;
    }

    pub fn get_role_info(&self) -> RoleInfo {
        self.role_manager.get_role_info()
    }

    /// Set the controller's HA role; called by the external election
    /// component.
    pub fn set_role(&self, role: Role, description: &str) {
        self.role_manager.set_role(role, description);
    }

    /// Register a handshaked channel with the role manager and push the
    /// current role to it.
    pub(crate) fn add_switch_channel_and_send_initial_role(&self, channel: Arc<dyn RoleRecipient>) {
        self.role_manager.add_channel_and_send_initial_role(channel);
    }

    pub(crate) fn remove_switch_channel(&self, channel_id: u64) {
        self.role_manager.remove_channel(channel_id);
    }

    pub(crate) fn reassert_role(&self, channel: &dyn RoleRecipient, role: Role) {
        self.role_manager.reassert_role(channel, role);
    }

    // ***************
    // Listener registration
    // ***************

    pub fn add_of_message_listener(&self, msg_type: OfType, listener: Arc<dyn OfMessageListener>) {
        self.message_listeners
            .entry(msg_type)
            .or_insert_with(|| ListenerDispatcher::new(msg_type))
            .add_listener(listener);
    }

    pub fn remove_of_message_listener(&self, msg_type: OfType, name: &str) {
        if let Some(dispatcher) = self.message_listeners.get(&msg_type) {
            dispatcher.remove_listener(name);
        }
    }

    /// Snapshot of all registered message listeners in dispatch order.
    pub fn get_listeners(&self) -> HashMap<OfType, Vec<Arc<dyn OfMessageListener>>> {
        self.message_listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().ordered_listeners().as_ref().clone()))
            .collect()
    }

    pub fn add_switch_listener(&self, listener: Arc<dyn SwitchListener>) {
        let mut guard = self.switch_listeners.write().expect("listener lock poisoned");
        let mut all = guard.as_ref().clone();
        all.push(listener);
        *guard = Arc::new(all);
    }

    pub fn remove_switch_listener(&self, name: &str) {
        let mut guard = self.switch_listeners.write().expect("listener lock poisoned");
        let mut all = guard.as_ref().clone();
        all.retain(|l| l.name() != name);
        *guard = Arc::new(all);
    }

    pub fn add_ha_listener(&self, listener: Arc<dyn HaListener>) {
        let mut guard = self.ha_listeners.write().expect("listener lock poisoned");
        let mut all = guard.as_ref().clone();
        all.push(listener);
        *guard = Arc::new(all);
    }

    pub fn remove_ha_listener(&self, name: &str) {
        let mut guard = self.ha_listeners.write().expect("listener lock poisoned");
        let mut all = guard.as_ref().clone();
        all.retain(|l| l.name() != name);
        *guard = Arc::new(all);
    }

    pub(crate) fn switch_listeners_snapshot(&self) -> Arc<Vec<Arc<dyn SwitchListener>>> {
        self.switch_listeners
            .read()
            .expect("listener lock poisoned")
            .clone()
    }

    pub(crate) fn ha_listeners_snapshot(&self) -> Arc<Vec<Arc<dyn HaListener>>> {
        self.ha_listeners
            .read()
            .expect("listener lock poisoned")
            .clone()
    }

    // ***************
    // Message dispatch
    // ***************

    /// Dispatch a message to the registered listeners under the dispatch
    /// guard. Messages are silently dropped while dispatch is disabled
    /// (i.e. while the controller is, or is becoming, a slave).
    pub async fn handle_message(
        &self,
        sw: &Arc<OfSwitch>,
        msg: &OfMessage,
        ctx: Option<&mut MessageContext>,
    ) -> Result<()> {
        let permit = self.dispatch_guard.acquire().await;
        if permit.dispatch_enabled() {
            self.handle_message_unprotected(sw, msg, ctx)?;
        }
        Ok(())
    }

    /// Dispatch backend; the caller must hold the dispatch guard.
    fn handle_message_unprotected(
        &self,
        sw: &Arc<OfSwitch>,
        msg: &OfMessage,
        ctx: Option<&mut MessageContext>,
    ) -> Result<()> {
        let mut ethernet = None;
        if let OfPayload::PacketIn(pi) = &msg.body {
            if pi.data.is_empty() {
                error!(
                    "Ignoring PacketIn (Xid = {}) because the data field is empty",
                    msg.xid
                );
                return Ok(());
            }
            match Ethernet::parse(pi.data.clone()) {
                Ok(eth) => ethernet = Some(eth),
                Err(e) => debug!("Undecodable PacketIn payload from {}: {}", sw, e),
            }
        }

        let listeners = self
            .message_listeners
            .get(&msg.msg_type())
            .map(|dispatcher| dispatcher.ordered_listeners());
        let listeners = match listeners {
            Some(listeners) if !listeners.is_empty() => listeners,
            _ => {
                if msg.msg_type() == OfType::BarrierReply {
                    debug!("Received a Barrier Reply, no listeners for it");
                } else {
                    warn!("Unhandled OF Message: {} from {}", msg.msg_type(), sw);
                }
                return Ok(());
            }
        };

        // Use the caller's context when supplied, otherwise borrow one from
        // the thread's free list.
        let mut pooled = None;
        let bc = match ctx {
            Some(ctx) => ctx,
            None => pooled.insert(context::alloc_context()),
        };
        if let Some(eth) = ethernet {
            bc.put(CONTEXT_PI_PAYLOAD, eth);
        }

        for listener in listeners.iter() {
            if !listener.is_interested(sw) {
                continue;
            }
            match listener.receive(sw, msg, bc) {
                Ok(Command::Stop) => break,
                Ok(Command::Continue) => {}
                Err(e) => {
                    // Listener failures never propagate to other listeners
                    warn!(
                        "Listener {} failed handling {} from {}: {}",
                        listener.name(),
                        msg.msg_type(),
                        sw,
                        e
                    );
                }
            }
        }

        if let Some(ctx) = pooled {
            context::free_context(ctx);
        }
        Ok(())
    }

    /// Run the listener chain over a controller-originated message.
    pub fn handle_outgoing_message(
        &self,
        sw: &Arc<OfSwitch>,
        msg: &OfMessage,
        ctx: &mut MessageContext,
    ) {
        let Some(listeners) = self
            .message_listeners
            .get(&msg.msg_type())
            .map(|dispatcher| dispatcher.ordered_listeners())
        else {
            return;
        };
        for listener in listeners.iter() {
            if !listener.is_interested(sw) {
                continue;
            }
            match listener.receive(sw, msg, ctx) {
                Ok(Command::Stop) => break,
                Ok(Command::Continue) => {}
                Err(e) => {
                    warn!(
                        "Listener {} failed on outgoing {}: {}",
                        listener.name(),
                        msg.msg_type(),
                        e
                    );
                }
            }
        }
    }

    /// Feed a synthetic message through the normal dispatch path. Refused
    /// for switches that are not active.
    pub async fn inject_of_message(&self, sw: &Arc<OfSwitch>, msg: &OfMessage) -> bool {
        if !self.active_switches.contains_key(&sw.datapath_id()) {
            info!("Failed to inject OFMessage {} onto inactive switch", msg.msg_type());
            return false;
        }
        match self.handle_message(sw, msg, None).await {
            Ok(()) => true,
            Err(e) => {
                error!("Error injecting OFMessage on {}: {}", sw, e);
                false
            }
        }
    }

    // ***************
    // Switch registry
    // ***************

    /// Insert an activated switch into the registry, handling DPID
    /// collisions: a re-add of the same object is a no-op; a different
    /// object with the same DPID evicts and disconnects the old one.
    pub(crate) async fn add_switch(&self, sw: Arc<OfSwitch>) {
        let old = self.active_switches.insert(sw.datapath_id(), sw.clone());
        if let Some(old) = old {
            if Arc::ptr_eq(&old, &sw) {
                info!("New add switch for pre-existing switch {}", sw);
                return;
            }
            error!("New switch added {} for already-added switch {}", sw, old);
            old.cancel_all_statistics_replies();
            self.add_update_to_queue(Update::SwitchRemoved(old.clone()))
                .await;
            old.disconnect_output_stream();
        }
        self.add_update_to_queue(Update::SwitchAdded(sw)).await;
    }

    /// Remove a switch from the registry, ignoring the call when a
    /// different object holds the DPID (e.g. after a fast reconnect).
    pub(crate) async fn remove_switch(&self, sw: Arc<OfSwitch>) {
        let removed = self
            .active_switches
            .remove_if(&sw.datapath_id(), |_, current| Arc::ptr_eq(current, &sw));
        if removed.is_none() {
            debug!(
                "removeSwitch called for {} but a different object is registered; ignoring",
                sw
            );
            return;
        }
        debug!("removeSwitch: {}", sw);
        sw.cancel_all_statistics_replies();
        self.add_update_to_queue(Update::SwitchRemoved(sw)).await;
    }

    pub(crate) async fn switch_activated(&self, sw: Arc<OfSwitch>) {
        if self.always_clear_flows_on_sw_add.load(Ordering::Relaxed) {
            sw.clear_all_flow_mods();
        }
        self.add_switch(sw).await;
    }

    pub(crate) async fn switch_deactivated(&self, sw: Arc<OfSwitch>) {
        self.remove_switch(sw).await;
    }

    pub fn set_always_clear_flows_on_sw_add(&self, value: bool) {
        self.always_clear_flows_on_sw_add
            .store(value, Ordering::Relaxed);
    }

    /// Look up a switch. Slaves only see the big-sync view; masters see
    /// active switches first, then the (soon empty) big-sync leftovers.
    pub fn get_switch(&self, dpid: Dpid) -> Option<Arc<OfSwitch>> {
        if self.get_role() == Role::Slave {
            return self.big_sync_switches.get(&dpid).map(|e| e.value().clone());
        }
        self.active_switches
            .get(&dpid)
            .map(|e| e.value().clone())
            .or_else(|| self.big_sync_switches.get(&dpid).map(|e| e.value().clone()))
    }

    pub fn get_all_switch_dpids(&self) -> std::collections::HashSet<Dpid> {
        let mut dpids: std::collections::HashSet<Dpid> =
            self.big_sync_switches.iter().map(|e| *e.key()).collect();
        if self.get_role() != Role::Slave {
            dpids.extend(self.active_switches.iter().map(|e| *e.key()));
        }
        dpids
    }

    pub fn get_all_switch_map(&self) -> HashMap<Dpid, Arc<OfSwitch>> {
        let mut switches: HashMap<Dpid, Arc<OfSwitch>> = self
            .big_sync_switches
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        if self.get_role() != Role::Slave {
            switches.extend(
                self.active_switches
                    .iter()
                    .map(|e| (*e.key(), e.value().clone())),
            );
        }
        switches
    }

    // External sync subsystem interface for the big-sync view.

    pub fn load_big_sync_switch(&self, sw: Arc<OfSwitch>) {
        self.big_sync_switches.insert(sw.datapath_id(), sw);
    }

    pub fn remove_big_sync_switch(&self, dpid: Dpid) -> Option<Arc<OfSwitch>> {
        self.big_sync_switches.remove(&dpid).map(|(_, sw)| sw)
    }

    pub fn clear_big_sync_switches(&self) {
        self.big_sync_switches.clear();
    }

    /// Enqueue a port-change update for the switch.
    pub(crate) async fn notify_port_changed(&self, sw: &Arc<OfSwitch>) {
        self.add_update_to_queue(Update::SwitchPortChanged(sw.datapath_id()))
            .await;
    }

    // ***************
    // Controller node IPs
    // ***************

    /// Take a fresh controller-id to IP mapping from the external cluster
    /// store, diff it against the cache, and enqueue an update when
    /// anything changed.
    pub async fn notify_controller_node_ips(&self, current: HashMap<String, String>) {
        let update = {
            let mut cache = self
                .controller_node_ips
                .lock()
                .expect("node ip cache poisoned");
            let mut added = HashMap::new();
            let mut removed = HashMap::new();
            for (controller_id, ip) in &current {
                match cache.get(controller_id) {
                    None => {
                        added.insert(controller_id.clone(), ip.clone());
                    }
                    Some(old_ip) if old_ip != ip => {
                        removed.insert(controller_id.clone(), old_ip.clone());
                        added.insert(controller_id.clone(), ip.clone());
                    }
                    _ => {}
                }
            }
            for (controller_id, ip) in cache.iter() {
                if !current.contains_key(controller_id) {
                    removed.insert(controller_id.clone(), ip.clone());
                }
            }
            *cache = current.clone();
            if added.is_empty() && removed.is_empty() {
                None
            } else {
                Some(Update::ControllerNodeIpsChanged {
                    current,
                    added,
                    removed,
                })
            }
        };
        if let Some(update) = update {
            self.add_update_to_queue(update).await;
        }
    }

    /// Copy of the mapping, guaranteed to match what has been (or will be)
    /// dispatched to HA listeners.
    pub fn get_controller_node_ips(&self) -> HashMap<String, String> {
        self.controller_node_ips
            .lock()
            .expect("node ip cache poisoned")
            .clone()
    }

    // ***************
    // Update queue
    // ***************

    pub(crate) async fn add_update_to_queue(&self, update: Update) {
        // A closed queue is not fatal to the enqueuing side
        if let Err(e) = self.updates_tx.send(update).await {
            error!("Failure adding update to queue: {}", e);
        }
    }

    /// Synchronously drain and dispatch whatever is queued. Testing hook.
    pub async fn process_update_queue_for_testing(&self) {
        let mut guard = self.updates_rx.lock().await;
        if let Some(rx) = guard.as_mut() {
            while let Ok(update) = rx.try_recv() {
                if let Err(e) = update.dispatch(self).await {
                    error!("Exception in controller updates loop: {}", e);
                }
            }
        }
    }

    /// Bind the OpenFlow port and run the controller: accept switch
    /// connections and drain the update queue until the process dies.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let acceptor = ConnectionAcceptor::bind(Arc::clone(self)).await?;
        self.run_with_acceptor(acceptor).await
    }

    /// Like [`Controller::run`] with a pre-bound acceptor; lets callers pick
    /// an ephemeral port first.
    pub async fn run_with_acceptor(self: &Arc<Self>, acceptor: ConnectionAcceptor) -> Result<()> {
        self.role_changer.start();
        tokio::spawn(acceptor.accept_loop());

        let mut updates_rx = self
            .updates_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| {
                crate::error::KestrelError::Concurrency(
                    "controller update loop already running".to_string(),
                )
            })?;

        // main loop
        while let Some(update) = updates_rx.recv().await {
            if let Err(e) = update.dispatch(self).await {
                if e.is_fatal() {
                    error!(
                        "Storage exception in controller updates loop; terminating process: {}",
                        e
                    );
                    self.terminate();
                }
                error!("Exception in controller updates loop: {}", e);
            }
        }
        error!("Controller update queue closed; terminating process");
        self.terminate();
    }

    /// Terminate the process with the unrecoverable-failure exit code.
    pub fn terminate(&self) -> ! {
        info!("Calling process exit");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Ethernet;
    use crate::protocol::PacketIn;
    use crate::switch::testing::test_switch;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn controller() -> Arc<Controller> {
        Controller::new(Settings::default())
    }

    fn packet_in(xid: u32) -> OfMessage {
        let mut frame = vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55,
        ];
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 20]);
        OfMessage {
            xid,
            body: OfPayload::PacketIn(PacketIn {
                buffer_id: u32::MAX,
                total_len: frame.len() as u16,
                in_port: 1,
                reason: 0,
                data: Bytes::from(frame),
            }),
        }
    }

    struct RecordingListener {
        received: AtomicUsize,
        saw_ethernet: AtomicBool,
        verdict: Mutex<Command>,
    }

    impl RecordingListener {
        fn new() -> Self {
            RecordingListener {
                received: AtomicUsize::new(0),
                saw_ethernet: AtomicBool::new(false),
                verdict: Mutex::new(Command::Continue),
            }
        }
    }

    impl OfMessageListener for RecordingListener {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn receive(
            &self,
            _sw: &Arc<OfSwitch>,
            _msg: &OfMessage,
            ctx: &mut MessageContext,
        ) -> Result<Command> {
            self.received.fetch_add(1, Ordering::SeqCst);
            if ctx.get::<Ethernet>(CONTEXT_PI_PAYLOAD).is_some() {
                self.saw_ethernet.store(true, Ordering::SeqCst);
            }
            Ok(*self.verdict.lock().unwrap())
        }
    }

    struct RecordingSwitchListener {
        events: Mutex<Vec<String>>,
    }

    impl SwitchListener for RecordingSwitchListener {
        fn name(&self) -> &'static str {
            "recording-switch"
        }

        fn switch_added(&self, sw: &Arc<OfSwitch>) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("added:{}", sw.connection_id()));
            Ok(())
        }

        fn switch_removed(&self, sw: &Arc<OfSwitch>) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("removed:{}", sw.connection_id()));
            Ok(())
        }

        fn switch_port_changed(&self, dpid: Dpid) -> Result<()> {
            self.events.lock().unwrap().push(format!("port:{:#x}", dpid));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_packet_in_with_parsed_ethernet() {
        let controller = controller();
        let listener = Arc::new(RecordingListener::new());
        controller.add_of_message_listener(OfType::PacketIn, listener.clone());

        let (sw, _rx, _closed) = test_switch(1, 0x2a);
        controller
            .handle_message(&sw, &packet_in(1), None)
            .await
            .unwrap();

        assert_eq!(listener.received.load(Ordering::SeqCst), 1);
        assert!(listener.saw_ethernet.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dispatch_stop_halts_chain() {
        let controller = controller();
        let first = Arc::new(RecordingListener::new());
        *first.verdict.lock().unwrap() = Command::Stop;
        let second = Arc::new(RecordingListener::new());

        struct Named(Arc<RecordingListener>, &'static str);
        impl OfMessageListener for Named {
            fn name(&self) -> &'static str {
                self.1
            }
            fn receive(
                &self,
                sw: &Arc<OfSwitch>,
                msg: &OfMessage,
                ctx: &mut MessageContext,
            ) -> Result<Command> {
                self.0.receive(sw, msg, ctx)
            }
        }

        controller.add_of_message_listener(OfType::PacketIn, Arc::new(Named(first.clone(), "a")));
        controller.add_of_message_listener(OfType::PacketIn, Arc::new(Named(second.clone(), "b")));

        let (sw, _rx, _closed) = test_switch(1, 0x2a);
        controller
            .handle_message(&sw, &packet_in(1), None)
            .await
            .unwrap();

        assert_eq!(first.received.load(Ordering::SeqCst), 1);
        assert_eq!(second.received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_packet_in_is_dropped() {
        let controller = controller();
        let listener = Arc::new(RecordingListener::new());
        controller.add_of_message_listener(OfType::PacketIn, listener.clone());

        let msg = OfMessage {
            xid: 1,
            body: OfPayload::PacketIn(PacketIn {
                buffer_id: u32::MAX,
                total_len: 0,
                in_port: 1,
                reason: 0,
                data: Bytes::new(),
            }),
        };
        let (sw, _rx, _closed) = test_switch(1, 0x2a);
        controller.handle_message(&sw, &msg, None).await.unwrap();
        assert_eq!(listener.received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slave_transition_gates_dispatch() {
        let controller = controller();
        let listener = Arc::new(RecordingListener::new());
        controller.add_of_message_listener(OfType::PacketIn, listener.clone());
        let (sw, _rx, _closed) = test_switch(1, 0x2a);

        // Dispatch works as master
        controller
            .handle_message(&sw, &packet_in(1), None)
            .await
            .unwrap();
        assert_eq!(listener.received.load(Ordering::SeqCst), 1);

        // A SLAVE HA update disables dispatch before returning
        Update::HaRoleChanged(Role::Slave)
            .dispatch(&controller)
            .await
            .unwrap();
        assert_eq!(controller.get_role(), Role::Slave);

        controller
            .handle_message(&sw, &packet_in(2), None)
            .await
            .unwrap();
        assert_eq!(listener.received.load(Ordering::SeqCst), 1);

        // And the reverse transition re-enables it
        Update::HaRoleChanged(Role::Master)
            .dispatch(&controller)
            .await
            .unwrap();
        controller
            .handle_message(&sw, &packet_in(3), None)
            .await
            .unwrap();
        assert_eq!(listener.received.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_add_switch_same_object_is_noop() {
        let controller = controller();
        let listener = Arc::new(RecordingSwitchListener {
            events: Mutex::new(Vec::new()),
        });
        controller.add_switch_listener(listener.clone());

        let (sw, _rx, _closed) = test_switch(1, 0x2a);
        controller.add_switch(sw.clone()).await;
        controller.add_switch(sw.clone()).await;
        controller.process_update_queue_for_testing().await;

        assert_eq!(listener.events.lock().unwrap().as_slice(), ["added:1"]);
    }

    #[tokio::test]
    async fn test_add_switch_dpid_collision_evicts_old() {
        let controller = controller();
        let listener = Arc::new(RecordingSwitchListener {
            events: Mutex::new(Vec::new()),
        });
        controller.add_switch_listener(listener.clone());

        let (old, _old_rx, _c1) = test_switch(1, 0x2a);
        let (new, _rx2, _c2) = test_switch(2, 0x2a);
        controller.add_switch(old.clone()).await;
        controller.add_switch(new.clone()).await;
        controller.process_update_queue_for_testing().await;

        assert_eq!(
            listener.events.lock().unwrap().as_slice(),
            ["added:1", "removed:1", "added:2"]
        );
        // Old switch's output stream was disconnected
        assert!(old.write(vec![OfMessage::hello(1)]).is_err());
        assert!(Arc::ptr_eq(
            &controller.get_switch(0x2a).unwrap(),
            &new
        ));
    }

    #[tokio::test]
    async fn test_remove_switch_ignores_stale_object() {
        let controller = controller();
        let (current, _rx1, _c1) = test_switch(1, 0x2a);
        let (stale, _rx2, _c2) = test_switch(2, 0x2a);
        controller.add_switch(current.clone()).await;

        controller.remove_switch(stale).await;
        assert!(controller.get_switch(0x2a).is_some());

        controller.remove_switch(current).await;
        assert!(controller.get_switch(0x2a).is_none());
    }

    #[tokio::test]
    async fn test_registry_reads_merge_big_sync_by_role() {
        let controller = controller();
        let (active, _rx1, _c1) = test_switch(1, 0x01);
        let (peer, _rx2, _c2) = test_switch(2, 0x02);
        controller.add_switch(active.clone()).await;
        controller.load_big_sync_switch(peer.clone());

        // As master: both visible, active map wins lookups
        let map = controller.get_all_switch_map();
        assert_eq!(map.len(), 2);
        assert!(controller.get_all_switch_dpids().contains(&0x01));

        // As slave: only the big-sync view remains visible
        controller.set_notified_role(Role::Slave);
        assert!(controller.get_switch(0x01).is_none());
        assert!(controller.get_switch(0x02).is_some());
        assert_eq!(controller.get_all_switch_map().len(), 1);
    }

    #[tokio::test]
    async fn test_controller_node_ip_diffing() {
        let controller = controller();
        let mut ips = HashMap::new();
        ips.insert("c1".to_string(), "10.0.0.1".to_string());
        ips.insert("c2".to_string(), "10.0.0.2".to_string());
        controller.notify_controller_node_ips(ips.clone()).await;
        assert_eq!(controller.get_controller_node_ips(), ips);

        // c2 changes IP, c1 disappears
        let mut next = HashMap::new();
        next.insert("c2".to_string(), "10.0.0.9".to_string());
        controller.notify_controller_node_ips(next.clone()).await;
        assert_eq!(controller.get_controller_node_ips(), next);

        // Unchanged map enqueues nothing further; drain proves no panic
        controller.notify_controller_node_ips(next).await;
        controller.process_update_queue_for_testing().await;
    }

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("master".parse::<Role>().unwrap(), Role::Master);
        assert_eq!(" SLAVE ".parse::<Role>().unwrap(), Role::Slave);
        assert_eq!("Equal".parse::<Role>().unwrap(), Role::Equal);
        assert!("primary".parse::<Role>().is_err());
        assert_eq!(Role::Master.to_string(), "MASTER");
    }

    #[test]
    fn test_role_nx_mapping() {
        assert_eq!(Role::Master.to_nx_role(), 1);
        assert_eq!(Role::Slave.to_nx_role(), 2);
        assert_eq!(Role::Equal.to_nx_role(), 0);
        assert_eq!(Role::from_nx_role(1), Some(Role::Master));
        assert_eq!(Role::from_nx_role(7), None);
    }
}
