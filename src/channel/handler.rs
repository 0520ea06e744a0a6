//! Per-connection OpenFlow channel handler.
//!
//! Drives the handshake state machine for one switch connection, answers
//! protocol-class messages itself, and forwards application-class messages
//! to the controller's dispatcher once the switch is active. Transitions
//! are driven strictly by the type of the next received message; anything
//! out of order before ACTIVE is a protocol error that closes the channel.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::controller::{Controller, Role, RoleRecipient};
use crate::error::Result;
use crate::protocol::nicira::NiciraMessage;
use crate::protocol::{
    ErrorMsg, FeaturesReply, OfCodec, OfMessage, OfPayload, StatsReplyBody, VendorData,
};
use crate::switch::OfSwitch;

/// Advertised miss_send_len: ship us the whole packet on table miss.
const MISS_SEND_LEN: u16 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    WaitHello,
    WaitFeaturesReply,
    WaitConfigReply,
    WaitDescriptionStatsReply,
    WaitInitialRole,
    Active,
    Slave,
}

pub struct ChannelHandler {
    id: u64,
    controller: Arc<Controller>,
    remote_addr: SocketAddr,
    state: Mutex<HandshakeState>,
    sw: Mutex<Option<Arc<OfSwitch>>>,
    // Features reply stashed until the description stats complete the
    // switch construction
    features: Mutex<Option<FeaturesReply>>,
    outbox_tx: mpsc::UnboundedSender<OfMessage>,
    // Close signal; handed to the switch once it exists
    pre_switch_closed_tx: Mutex<Option<watch::Sender<bool>>>,
    handshake_xid: AtomicU32,
    self_ref: Weak<ChannelHandler>,
}

/// Run one switch connection to completion.
pub async fn handle_connection(controller: Arc<Controller>, stream: TcpStream, peer: SocketAddr) {
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<OfMessage>();
    let (closed_tx, closed_rx) = watch::channel(false);

    let handler = Arc::new_cyclic(|weak| ChannelHandler {
        id: controller.next_connection_id(),
        controller: controller.clone(),
        remote_addr: peer,
        state: Mutex::new(HandshakeState::WaitHello),
        sw: Mutex::new(None),
        features: Mutex::new(None),
        outbox_tx,
        pre_switch_closed_tx: Mutex::new(Some(closed_tx)),
        handshake_xid: AtomicU32::new(1),
        self_ref: weak.clone(),
    });

    let framed = Framed::new(stream, OfCodec);
    let (mut sink, of_stream) = framed.split();

    // Writer task: drains the outbox until the channel closes or every
    // sender is gone.
    let mut writer_closed = closed_rx.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbox_rx.recv() => match maybe {
                    Some(msg) => {
                        if let Err(e) = sink.send(msg).await {
                            debug!("Write to switch failed: {}", e);
                            break;
                        }
                    }
                    None => {
                        let _ = sink.flush().await;
                        break;
                    }
                },
                changed = writer_closed.changed() => {
                    if changed.is_err() || *writer_closed.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // The controller opens the conversation
    let hello = OfMessage::hello(handler.next_handshake_xid());
    if handler.send_message(hello).is_ok() {
        if let Err(e) = handler.read_loop(of_stream, closed_rx).await {
            warn!("Channel to {} closed: {}", peer, e);
        }
    }

    handler.cleanup().await;
    writer.abort();
}

impl ChannelHandler {
    fn next_handshake_xid(&self) -> u32 {
        self.handshake_xid.fetch_add(1, Ordering::Relaxed)
    }

    fn send_message(&self, msg: OfMessage) -> Result<()> {
        self.outbox_tx
            .send(msg)
            .map_err(|_| transport_error!("connection to {} is closed", self.remote_addr))
    }

    fn switch(&self) -> Option<Arc<OfSwitch>> {
        self.sw.lock().expect("switch lock poisoned").clone()
    }

    fn state(&self) -> HandshakeState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: HandshakeState) -> HandshakeState {
        std::mem::replace(&mut *self.state.lock().expect("state lock poisoned"), state)
    }

    fn is_handshaking(&self) -> bool {
        !matches!(self.state(), HandshakeState::Active | HandshakeState::Slave)
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<Framed<TcpStream, OfCodec>>,
        mut closed_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let settings = self.controller.settings();
        let idle_timeout = Duration::from_secs(settings.read_idle_timeout_secs);
        let handshake_deadline =
            Instant::now() + Duration::from_secs(settings.handshake_timeout_secs);

        loop {
            if *closed_rx.borrow() {
                return Ok(());
            }
            let wait = if self.is_handshaking() {
                let remaining = handshake_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(handshake_error!(
                        "switch {} did not complete handshake in time",
                        self.remote_addr
                    ));
                }
                remaining.min(idle_timeout)
            } else {
                idle_timeout
            };

            tokio::select! {
                changed = closed_rx.changed() => {
                    if changed.is_err() || *closed_rx.borrow() {
                        return Ok(());
                    }
                }
                next = tokio::time::timeout(wait, stream.next()) => match next {
                    Err(_) => {
                        if self.is_handshaking() {
                            return Err(handshake_error!(
                                "switch {} did not complete handshake in time",
                                self.remote_addr
                            ));
                        }
                        return Err(transport_error!(
                            "read idle timeout on channel to {}",
                            self.remote_addr
                        ));
                    }
                    Ok(None) => {
                        debug!("Switch {} disconnected", self.remote_addr);
                        return Ok(());
                    }
                    Ok(Some(Err(e))) => return Err(e),
                    Ok(Some(Ok(msg))) => self.process_message(msg).await?,
                }
            }
        }
    }

    async fn process_message(&self, msg: OfMessage) -> Result<()> {
        // Echo is answered locally in every state and never dispatched
        match &msg.body {
            OfPayload::EchoRequest(payload) => {
                return self.send_message(OfMessage::echo_reply(msg.xid, payload.clone()));
            }
            OfPayload::EchoReply(_) => return Ok(()),
            _ => {}
        }

        match self.state() {
            HandshakeState::WaitHello => match &msg.body {
                OfPayload::Hello => {
                    let request = OfMessage::features_request(self.next_handshake_xid());
                    self.send_message(request)?;
                    self.set_state(HandshakeState::WaitFeaturesReply);
                    Ok(())
                }
                _ => self.handshake_violation(&msg),
            },
            HandshakeState::WaitFeaturesReply => match msg.body {
                OfPayload::FeaturesReply(features) => {
                    debug!(
                        "Features reply from {}: dpid {:#018x}, {} ports",
                        self.remote_addr,
                        features.datapath_id,
                        features.ports.len()
                    );
                    *self.features.lock().expect("features lock poisoned") = Some(features);
                    self.send_message(OfMessage::set_config(
                        self.next_handshake_xid(),
                        MISS_SEND_LEN,
                    ))?;
                    self.send_message(OfMessage::get_config_request(self.next_handshake_xid()))?;
                    self.set_state(HandshakeState::WaitConfigReply);
                    Ok(())
                }
                _ => self.handshake_violation(&msg),
            },
            HandshakeState::WaitConfigReply => match &msg.body {
                OfPayload::GetConfigReply(config) => {
                    if config.miss_send_len != MISS_SEND_LEN {
                        warn!(
                            "Switch {} did not accept miss_send_len {} (got {})",
                            self.remote_addr, MISS_SEND_LEN, config.miss_send_len
                        );
                    }
                    self.send_message(OfMessage::desc_stats_request(self.next_handshake_xid()))?;
                    self.set_state(HandshakeState::WaitDescriptionStatsReply);
                    Ok(())
                }
                _ => self.handshake_violation(&msg),
            },
            HandshakeState::WaitDescriptionStatsReply => match &msg.body {
                OfPayload::StatsReply(reply) => match &reply.body {
                    StatsReplyBody::Desc(description) => {
                        let description = description.clone();
                        let features = self
                            .features
                            .lock()
                            .expect("features lock poisoned")
                            .take()
                            .ok_or_else(|| {
                                protocol_error!("description stats arrived before features reply")
                            })?;
                        let closed_tx = self
                            .pre_switch_closed_tx
                            .lock()
                            .expect("close signal lock poisoned")
                            .take()
                            .ok_or_else(|| {
                                protocol_error!("switch constructed twice on one channel")
                            })?;
                        let sw = Arc::new(OfSwitch::new(
                            self.id,
                            features,
                            description,
                            self.remote_addr,
                            self.outbox_tx.clone(),
                            closed_tx,
                        ));
                        info!("Handshake with {} complete", sw);
                        *self.sw.lock().expect("switch lock poisoned") = Some(sw);

                        self.set_state(HandshakeState::WaitInitialRole);
                        let handler = self
                            .self_ref
                            .upgrade()
                            .expect("channel handler dropped while running");
                        self.controller
                            .add_switch_channel_and_send_initial_role(handler);
                        Ok(())
                    }
                    _ => self.handshake_violation(&msg),
                },
                _ => self.handshake_violation(&msg),
            },
            HandshakeState::WaitInitialRole => match &msg.body {
                OfPayload::Vendor(VendorData::Nicira(NiciraMessage::RoleReply { role })) => {
                    self.handle_role_reply(msg.xid, *role).await
                }
                OfPayload::Error(err) => self.handle_role_wait_error(msg.xid, err).await,
                _ => self.handshake_violation(&msg),
            },
            HandshakeState::Active => self.handle_active_message(msg).await,
            HandshakeState::Slave => self.handle_slave_message(msg).await,
        }
    }

    fn handshake_violation(&self, msg: &OfMessage) -> Result<()> {
        Err(handshake_error!(
            "unexpected {} from {} in state {:?}",
            msg.msg_type(),
            self.remote_addr,
            self.state()
        ))
    }

    /// Route a role reply through the role changer and track the resulting
    /// role in the handshake state machine.
    async fn handle_role_reply(&self, xid: u32, nx_role: u32) -> Result<()> {
        let sw = self
            .switch()
            .ok_or_else(|| protocol_error!("role reply before handshake completed"))?;
        let role = Role::from_nx_role(nx_role)
            .ok_or_else(|| protocol_error!("invalid NX role value {}", nx_role))?;

        self.controller
            .role_changer()
            .deliver_role_reply(&sw, xid, role);
        if sw.is_closed() {
            return Err(protocol_error!("role reply rejected by {}", sw));
        }
        self.apply_role_outcome(&sw).await;
        Ok(())
    }

    /// An OpenFlow error during role wait means the switch rejected the
    /// vendor role request; anything not matching the pending request is a
    /// handshake violation.
    async fn handle_role_wait_error(&self, xid: u32, err: &ErrorMsg) -> Result<()> {
        let sw = self
            .switch()
            .ok_or_else(|| protocol_error!("error reply before handshake completed"))?;
        if !self
            .controller
            .role_changer()
            .check_first_pending_role_request_xid(&sw, xid)
        {
            return Err(handshake_error!(
                "unexpected error {}/{} from {} during role wait",
                err.err_type,
                err.code,
                sw
            ));
        }
        self.controller
            .role_changer()
            .deliver_role_request_not_supported(&sw, xid);
        if sw.is_closed() {
            return Err(protocol_error!("role request error rejected by {}", sw));
        }
        self.apply_role_outcome(&sw).await;
        Ok(())
    }

    /// Move the channel to ACTIVE or SLAVE based on the switch's role,
    /// activating or deactivating the switch in the registry as needed.
    async fn apply_role_outcome(&self, sw: &Arc<OfSwitch>) {
        let new_state = match sw.ha_role() {
            Some(Role::Slave) => HandshakeState::Slave,
            Some(_) => HandshakeState::Active,
            // Role was cleared; the channel is on its way down
            None => return,
        };
        let old_state = self.set_state(new_state);
        match (old_state, new_state) {
            (HandshakeState::Active, HandshakeState::Slave) => {
                info!("{} moved to SLAVE; deactivating", sw);
                self.controller.switch_deactivated(sw.clone()).await;
            }
            (old, HandshakeState::Active) if old != HandshakeState::Active => {
                info!("{} is now active", sw);
                self.controller.switch_activated(sw.clone()).await;
            }
            _ => {}
        }
    }

    async fn handle_active_message(&self, msg: OfMessage) -> Result<()> {
        let sw = self
            .switch()
            .ok_or_else(|| protocol_error!("active channel without a switch"))?;
        match &msg.body {
            OfPayload::Vendor(VendorData::Nicira(NiciraMessage::RoleReply { role })) => {
                self.handle_role_reply(msg.xid, *role).await
            }
            OfPayload::Error(_)
                if self
                    .controller
                    .role_changer()
                    .check_first_pending_role_request_xid(&sw, msg.xid) =>
            {
                self.controller
                    .role_changer()
                    .deliver_role_request_not_supported(&sw, msg.xid);
                if sw.is_closed() {
                    return Err(protocol_error!("role request error rejected by {}", sw));
                }
                self.apply_role_outcome(&sw).await;
                Ok(())
            }
            OfPayload::Error(err) if err.is_permission_error() => {
                // The switch thinks we are a slave; reassert our role
                warn!("{} reports a permission error; reasserting role", sw);
                self.controller
                    .reassert_role(self, self.controller.get_role());
                Ok(())
            }
            OfPayload::StatsReply(reply) => {
                if sw.deliver_stats_reply(msg.xid, reply.clone()) {
                    return Ok(());
                }
                self.controller.handle_message(&sw, &msg, None).await
            }
            OfPayload::PortStatus(_) => {
                self.controller.notify_port_changed(&sw).await;
                self.controller.handle_message(&sw, &msg, None).await
            }
            _ => self.controller.handle_message(&sw, &msg, None).await,
        }
    }

    async fn handle_slave_message(&self, msg: OfMessage) -> Result<()> {
        let sw = self
            .switch()
            .ok_or_else(|| protocol_error!("slave channel without a switch"))?;
        match &msg.body {
            OfPayload::Vendor(VendorData::Nicira(NiciraMessage::RoleReply { role })) => {
                self.handle_role_reply(msg.xid, *role).await
            }
            OfPayload::Error(_)
                if self
                    .controller
                    .role_changer()
                    .check_first_pending_role_request_xid(&sw, msg.xid) =>
            {
                self.controller
                    .role_changer()
                    .deliver_role_request_not_supported(&sw, msg.xid);
                if sw.is_closed() {
                    return Err(protocol_error!("role request error rejected by {}", sw));
                }
                self.apply_role_outcome(&sw).await;
                Ok(())
            }
            OfPayload::PacketIn(_) | OfPayload::FlowRemoved(_) => {
                // The switch clearly believes we are master
                debug!("{} sent {} while we are slave; reasserting SLAVE", sw, msg.msg_type());
                self.controller.reassert_role(self, Role::Slave);
                Ok(())
            }
            _ => {
                debug!("Ignoring {} from {} while slave", msg.msg_type(), sw);
                Ok(())
            }
        }
    }

    /// Tear down everything this channel registered elsewhere.
    async fn cleanup(&self) {
        self.controller.remove_switch_channel(self.id);
        let sw = self.sw.lock().expect("switch lock poisoned").take();
        if let Some(sw) = sw {
            self.controller.role_changer().remove_switch(&sw);
            sw.cancel_all_statistics_replies();
            self.controller.switch_deactivated(sw.clone()).await;
            sw.close_channel();
        }
        if let Some(closed_tx) = self
            .pre_switch_closed_tx
            .lock()
            .expect("close signal lock poisoned")
            .take()
        {
            let _ = closed_tx.send(true);
        }
    }
}

impl RoleRecipient for ChannelHandler {
    fn channel_id(&self) -> u64 {
        self.id
    }

    fn send_role_request(&self, role: Role) {
        let Some(sw) = self.switch() else {
            warn!(
                "Role request for {} before handshake completed on channel to {}",
                role, self.remote_addr
            );
            return;
        };
        match sw.supports_nx_role() {
            Some(false) => {
                if role == Role::Slave {
                    // A switch that ignores role requests cannot be demoted;
                    // the only safe behavior is to sever the connection.
                    warn!(
                        "{} does not support role requests; cannot enforce SLAVE, closing channel",
                        sw
                    );
                    sw.close_channel();
                } else {
                    sw.set_ha_role(Some(role), false);
                    if let Some(handler) = self.self_ref.upgrade() {
                        tokio::spawn(async move {
                            let sw = handler.switch();
                            if let Some(sw) = sw {
                                handler.apply_role_outcome(&sw).await;
                            }
                        });
                    }
                }
            }
            _ => self.controller.role_changer().submit_request(&[sw], role),
        }
    }

    fn send_role_request_if_not_pending(&self, role: Role) {
        let Some(sw) = self.switch() else { return };
        if !self
            .controller
            .role_changer()
            .has_pending_request_for(&sw, role)
        {
            self.send_role_request(role);
        }
    }
}
