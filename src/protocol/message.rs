//! OpenFlow 1.0 message types.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::nicira::{self, NiciraMessage};
use super::{OFP_HEADER_LEN, OFP_VERSION};
use crate::error::Result;

/// OFPT_* message type codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OfType {
    Hello = 0,
    Error = 1,
    EchoRequest = 2,
    EchoReply = 3,
    Vendor = 4,
    FeaturesRequest = 5,
    FeaturesReply = 6,
    GetConfigRequest = 7,
    GetConfigReply = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    PortMod = 15,
    StatsRequest = 16,
    StatsReply = 17,
    BarrierRequest = 18,
    BarrierReply = 19,
    QueueGetConfigRequest = 20,
    QueueGetConfigReply = 21,
}

impl OfType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OfType::Hello),
            1 => Some(OfType::Error),
            2 => Some(OfType::EchoRequest),
            3 => Some(OfType::EchoReply),
            4 => Some(OfType::Vendor),
            5 => Some(OfType::FeaturesRequest),
            6 => Some(OfType::FeaturesReply),
            7 => Some(OfType::GetConfigRequest),
            8 => Some(OfType::GetConfigReply),
            9 => Some(OfType::SetConfig),
            10 => Some(OfType::PacketIn),
            11 => Some(OfType::FlowRemoved),
            12 => Some(OfType::PortStatus),
            13 => Some(OfType::PacketOut),
            14 => Some(OfType::FlowMod),
            15 => Some(OfType::PortMod),
            16 => Some(OfType::StatsRequest),
            17 => Some(OfType::StatsReply),
            18 => Some(OfType::BarrierRequest),
            19 => Some(OfType::BarrierReply),
            20 => Some(OfType::QueueGetConfigRequest),
            21 => Some(OfType::QueueGetConfigReply),
            _ => None,
        }
    }
}

impl std::fmt::Display for OfType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// OFPET_* error types
pub const OFPET_HELLO_FAILED: u16 = 0;
pub const OFPET_BAD_REQUEST: u16 = 1;
pub const OFPET_BAD_ACTION: u16 = 2;
pub const OFPET_FLOW_MOD_FAILED: u16 = 3;

// OFPBRC_* bad-request codes
pub const OFPBRC_BAD_VENDOR: u16 = 3;
pub const OFPBRC_BAD_SUBTYPE: u16 = 4;
pub const OFPBRC_EPERM: u16 = 5;

// Flow-mod commands and helpers
pub const OFPFC_DELETE: u16 = 3;
pub const OFPFW_ALL: u32 = 0x003f_ffff;
pub const OFPP_NONE: u16 = 0xffff;

// Desc statistics type
pub const OFPST_DESC: u16 = 0;

/// A decoded OpenFlow message: the transaction id plus a typed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct OfMessage {
    pub xid: u32,
    pub body: OfPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OfPayload {
    Hello,
    Error(ErrorMsg),
    EchoRequest(Bytes),
    EchoReply(Bytes),
    Vendor(VendorData),
    FeaturesRequest,
    FeaturesReply(FeaturesReply),
    GetConfigRequest,
    GetConfigReply(SwitchConfig),
    SetConfig(SwitchConfig),
    PacketIn(PacketIn),
    FlowRemoved(Bytes),
    PortStatus(PortStatus),
    PacketOut(Bytes),
    FlowMod(FlowModMsg),
    PortMod(Bytes),
    StatsRequest(StatsRequest),
    StatsReply(StatsReply),
    BarrierRequest,
    BarrierReply,
    QueueGetConfigRequest(Bytes),
    QueueGetConfigReply(Bytes),
}

/// OFPT_ERROR body. The data field carries (at least) the header of the
/// offending request.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorMsg {
    pub err_type: u16,
    pub code: u16,
    pub data: Bytes,
}

impl ErrorMsg {
    /// True for the permission errors a switch emits when it believes we
    /// are a slave controller.
    pub fn is_permission_error(&self) -> bool {
        self.err_type == OFPET_BAD_REQUEST && self.code == OFPBRC_EPERM
    }

    /// True for the errors a switch emits for an unrecognized vendor
    /// extension, i.e. the NX role request shortcut.
    pub fn is_vendor_unsupported(&self) -> bool {
        self.err_type == OFPET_BAD_REQUEST
            && (self.code == OFPBRC_BAD_VENDOR || self.code == OFPBRC_BAD_SUBTYPE)
    }
}

/// OFPT_VENDOR body
#[derive(Clone, Debug, PartialEq)]
pub enum VendorData {
    Nicira(NiciraMessage),
    Unknown { vendor: u32, data: Bytes },
}

/// OFPT_FEATURES_REPLY body
#[derive(Clone, Debug, PartialEq)]
pub struct FeaturesReply {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: u32,
    pub actions: u32,
    pub ports: Vec<PhyPort>,
}

/// ofp_phy_port (48 bytes on the wire)
#[derive(Clone, Debug, PartialEq)]
pub struct PhyPort {
    pub port_no: u16,
    pub hw_addr: [u8; 6],
    pub name: String,
    pub config: u32,
    pub state: u32,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
}

const PHY_PORT_LEN: usize = 48;
const PORT_NAME_LEN: usize = 16;

impl PhyPort {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < PHY_PORT_LEN {
            return Err(protocol_error!("truncated ofp_phy_port"));
        }
        let port_no = buf.get_u16();
        let mut hw_addr = [0u8; 6];
        buf.copy_to_slice(&mut hw_addr);
        let mut name_raw = [0u8; PORT_NAME_LEN];
        buf.copy_to_slice(&mut name_raw);
        let name = fixed_string(&name_raw);
        Ok(PhyPort {
            port_no,
            hw_addr,
            name,
            config: buf.get_u32(),
            state: buf.get_u32(),
            curr: buf.get_u32(),
            advertised: buf.get_u32(),
            supported: buf.get_u32(),
            peer: buf.get_u32(),
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.port_no);
        dst.put_slice(&self.hw_addr);
        put_fixed_string(dst, &self.name, PORT_NAME_LEN);
        dst.put_u32(self.config);
        dst.put_u32(self.state);
        dst.put_u32(self.curr);
        dst.put_u32(self.advertised);
        dst.put_u32(self.supported);
        dst.put_u32(self.peer);
    }
}

/// OFPT_GET_CONFIG_REPLY / OFPT_SET_CONFIG body
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwitchConfig {
    pub flags: u16,
    pub miss_send_len: u16,
}

/// OFPT_PACKET_IN body
#[derive(Clone, Debug, PartialEq)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub in_port: u16,
    pub reason: u8,
    pub data: Bytes,
}

/// OFPT_PORT_STATUS body
#[derive(Clone, Debug, PartialEq)]
pub struct PortStatus {
    pub reason: u8,
    pub desc: PhyPort,
}

/// OFPT_FLOW_MOD body. The core only originates these (table flushes); the
/// action list stays raw.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowModMsg {
    pub wildcards: u32,
    pub match_fields: [u8; 36],
    pub cookie: u64,
    pub command: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: u16,
    pub flags: u16,
    pub actions: Bytes,
}

impl FlowModMsg {
    /// A delete of every flow in every table, as used when flushing a
    /// reconnected switch.
    pub fn delete_all() -> Self {
        FlowModMsg {
            wildcards: OFPFW_ALL,
            match_fields: [0u8; 36],
            cookie: 0,
            command: OFPFC_DELETE,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0,
            buffer_id: u32::MAX,
            out_port: OFPP_NONE,
            flags: 0,
            actions: Bytes::new(),
        }
    }
}

/// OFPT_STATS_REQUEST body
#[derive(Clone, Debug, PartialEq)]
pub struct StatsRequest {
    pub stats_type: u16,
    pub flags: u16,
    pub body: Bytes,
}

/// OFPT_STATS_REPLY body
#[derive(Clone, Debug, PartialEq)]
pub struct StatsReply {
    pub stats_type: u16,
    pub flags: u16,
    pub body: StatsReplyBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatsReplyBody {
    Desc(DescriptionStats),
    Raw(Bytes),
}

/// OFPST_DESC reply payload: the switch's self-description.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DescriptionStats {
    pub manufacturer: String,
    pub hardware: String,
    pub software: String,
    pub serial_number: String,
    pub datapath: String,
}

const DESC_STR_LEN: usize = 256;
const SERIAL_NUM_LEN: usize = 32;

impl DescriptionStats {
    fn decode(buf: &mut Bytes) -> Result<Self> {
        let expected = DESC_STR_LEN * 4 + SERIAL_NUM_LEN;
        if buf.remaining() < expected {
            return Err(protocol_error!("truncated description stats"));
        }
        let manufacturer = take_fixed_string(buf, DESC_STR_LEN);
        let hardware = take_fixed_string(buf, DESC_STR_LEN);
        let software = take_fixed_string(buf, DESC_STR_LEN);
        let serial_number = take_fixed_string(buf, SERIAL_NUM_LEN);
        let datapath = take_fixed_string(buf, DESC_STR_LEN);
        Ok(DescriptionStats {
            manufacturer,
            hardware,
            software,
            serial_number,
            datapath,
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        put_fixed_string(dst, &self.manufacturer, DESC_STR_LEN);
        put_fixed_string(dst, &self.hardware, DESC_STR_LEN);
        put_fixed_string(dst, &self.software, DESC_STR_LEN);
        put_fixed_string(dst, &self.serial_number, SERIAL_NUM_LEN);
        put_fixed_string(dst, &self.datapath, DESC_STR_LEN);
    }
}

impl OfMessage {
    pub fn msg_type(&self) -> OfType {
        match &self.body {
            OfPayload::Hello => OfType::Hello,
            OfPayload::Error(_) => OfType::Error,
            OfPayload::EchoRequest(_) => OfType::EchoRequest,
            OfPayload::EchoReply(_) => OfType::EchoReply,
            OfPayload::Vendor(_) => OfType::Vendor,
            OfPayload::FeaturesRequest => OfType::FeaturesRequest,
            OfPayload::FeaturesReply(_) => OfType::FeaturesReply,
            OfPayload::GetConfigRequest => OfType::GetConfigRequest,
            OfPayload::GetConfigReply(_) => OfType::GetConfigReply,
            OfPayload::SetConfig(_) => OfType::SetConfig,
            OfPayload::PacketIn(_) => OfType::PacketIn,
            OfPayload::FlowRemoved(_) => OfType::FlowRemoved,
            OfPayload::PortStatus(_) => OfType::PortStatus,
            OfPayload::PacketOut(_) => OfType::PacketOut,
            OfPayload::FlowMod(_) => OfType::FlowMod,
            OfPayload::PortMod(_) => OfType::PortMod,
            OfPayload::StatsRequest(_) => OfType::StatsRequest,
            OfPayload::StatsReply(_) => OfType::StatsReply,
            OfPayload::BarrierRequest => OfType::BarrierRequest,
            OfPayload::BarrierReply => OfType::BarrierReply,
            OfPayload::QueueGetConfigRequest(_) => OfType::QueueGetConfigRequest,
            OfPayload::QueueGetConfigReply(_) => OfType::QueueGetConfigReply,
        }
    }

    /// Encode the full message including the OpenFlow header.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.put_u8(OFP_VERSION);
        dst.put_u8(self.msg_type() as u8);
        dst.put_u16(0); // length, patched below
        dst.put_u32(self.xid);
        self.encode_body(dst);
        let length = (dst.len() - start) as u16;
        dst[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
    }

    fn encode_body(&self, dst: &mut BytesMut) {
        match &self.body {
            OfPayload::Hello
            | OfPayload::FeaturesRequest
            | OfPayload::GetConfigRequest
            | OfPayload::BarrierRequest
            | OfPayload::BarrierReply => {}
            OfPayload::Error(err) => {
                dst.put_u16(err.err_type);
                dst.put_u16(err.code);
                dst.put_slice(&err.data);
            }
            OfPayload::EchoRequest(payload) | OfPayload::EchoReply(payload) => {
                dst.put_slice(payload);
            }
            OfPayload::Vendor(VendorData::Nicira(msg)) => {
                dst.put_u32(nicira::NX_VENDOR_ID);
                msg.encode(dst);
            }
            OfPayload::Vendor(VendorData::Unknown { vendor, data }) => {
                dst.put_u32(*vendor);
                dst.put_slice(data);
            }
            OfPayload::FeaturesReply(reply) => {
                dst.put_u64(reply.datapath_id);
                dst.put_u32(reply.n_buffers);
                dst.put_u8(reply.n_tables);
                dst.put_slice(&[0u8; 3]);
                dst.put_u32(reply.capabilities);
                dst.put_u32(reply.actions);
                for port in &reply.ports {
                    port.encode(dst);
                }
            }
            OfPayload::GetConfigReply(config) | OfPayload::SetConfig(config) => {
                dst.put_u16(config.flags);
                dst.put_u16(config.miss_send_len);
            }
            OfPayload::PacketIn(pi) => {
                dst.put_u32(pi.buffer_id);
                dst.put_u16(pi.total_len);
                dst.put_u16(pi.in_port);
                dst.put_u8(pi.reason);
                dst.put_u8(0);
                dst.put_slice(&pi.data);
            }
            OfPayload::PortStatus(ps) => {
                dst.put_u8(ps.reason);
                dst.put_slice(&[0u8; 7]);
                ps.desc.encode(dst);
            }
            OfPayload::FlowMod(fm) => {
                dst.put_u32(fm.wildcards);
                dst.put_slice(&fm.match_fields);
                dst.put_u64(fm.cookie);
                dst.put_u16(fm.command);
                dst.put_u16(fm.idle_timeout);
                dst.put_u16(fm.hard_timeout);
                dst.put_u16(fm.priority);
                dst.put_u32(fm.buffer_id);
                dst.put_u16(fm.out_port);
                dst.put_u16(fm.flags);
                dst.put_slice(&fm.actions);
            }
            OfPayload::StatsRequest(req) => {
                dst.put_u16(req.stats_type);
                dst.put_u16(req.flags);
                dst.put_slice(&req.body);
            }
            OfPayload::StatsReply(reply) => {
                dst.put_u16(reply.stats_type);
                dst.put_u16(reply.flags);
                match &reply.body {
                    StatsReplyBody::Desc(desc) => desc.encode(dst),
                    StatsReplyBody::Raw(raw) => dst.put_slice(raw),
                }
            }
            OfPayload::FlowRemoved(raw)
            | OfPayload::PacketOut(raw)
            | OfPayload::PortMod(raw)
            | OfPayload::QueueGetConfigRequest(raw)
            | OfPayload::QueueGetConfigReply(raw) => {
                dst.put_slice(raw);
            }
        }
    }

    /// Decode a message body. The caller has already split the frame and
    /// parsed the header fields.
    pub fn decode(msg_type: OfType, xid: u32, mut body: Bytes) -> Result<Self> {
        let payload = match msg_type {
            OfType::Hello => OfPayload::Hello,
            OfType::Error => {
                if body.remaining() < 4 {
                    return Err(protocol_error!("truncated error message"));
                }
                let err_type = body.get_u16();
                let code = body.get_u16();
                OfPayload::Error(ErrorMsg {
                    err_type,
                    code,
                    data: body,
                })
            }
            OfType::EchoRequest => OfPayload::EchoRequest(body),
            OfType::EchoReply => OfPayload::EchoReply(body),
            OfType::Vendor => {
                if body.remaining() < 4 {
                    return Err(protocol_error!("truncated vendor message"));
                }
                let vendor = body.get_u32();
                if vendor == nicira::NX_VENDOR_ID {
                    OfPayload::Vendor(VendorData::Nicira(NiciraMessage::decode(body)?))
                } else {
                    OfPayload::Vendor(VendorData::Unknown { vendor, data: body })
                }
            }
            OfType::FeaturesRequest => OfPayload::FeaturesRequest,
            OfType::FeaturesReply => {
                if body.remaining() < 24 {
                    return Err(protocol_error!("truncated features reply"));
                }
                let datapath_id = body.get_u64();
                let n_buffers = body.get_u32();
                let n_tables = body.get_u8();
                body.advance(3);
                let capabilities = body.get_u32();
                let actions = body.get_u32();
                let mut ports = Vec::with_capacity(body.remaining() / PHY_PORT_LEN);
                while body.has_remaining() {
                    ports.push(PhyPort::decode(&mut body)?);
                }
                OfPayload::FeaturesReply(FeaturesReply {
                    datapath_id,
                    n_buffers,
                    n_tables,
                    capabilities,
                    actions,
                    ports,
                })
            }
            OfType::GetConfigRequest => OfPayload::GetConfigRequest,
            OfType::GetConfigReply | OfType::SetConfig => {
                if body.remaining() < 4 {
                    return Err(protocol_error!("truncated switch config"));
                }
                let config = SwitchConfig {
                    flags: body.get_u16(),
                    miss_send_len: body.get_u16(),
                };
                if msg_type == OfType::SetConfig {
                    OfPayload::SetConfig(config)
                } else {
                    OfPayload::GetConfigReply(config)
                }
            }
            OfType::PacketIn => {
                if body.remaining() < 10 {
                    return Err(protocol_error!("truncated packet-in"));
                }
                let buffer_id = body.get_u32();
                let total_len = body.get_u16();
                let in_port = body.get_u16();
                let reason = body.get_u8();
                body.advance(1);
                OfPayload::PacketIn(PacketIn {
                    buffer_id,
                    total_len,
                    in_port,
                    reason,
                    data: body,
                })
            }
            OfType::FlowRemoved => OfPayload::FlowRemoved(body),
            OfType::PortStatus => {
                if body.remaining() < 8 + PHY_PORT_LEN {
                    return Err(protocol_error!("truncated port status"));
                }
                let reason = body.get_u8();
                body.advance(7);
                OfPayload::PortStatus(PortStatus {
                    reason,
                    desc: PhyPort::decode(&mut body)?,
                })
            }
            OfType::PacketOut => OfPayload::PacketOut(body),
            OfType::FlowMod => {
                if body.remaining() < 64 {
                    return Err(protocol_error!("truncated flow mod"));
                }
                let wildcards = body.get_u32();
                let mut match_fields = [0u8; 36];
                body.copy_to_slice(&mut match_fields);
                OfPayload::FlowMod(FlowModMsg {
                    wildcards,
                    match_fields,
                    cookie: body.get_u64(),
                    command: body.get_u16(),
                    idle_timeout: body.get_u16(),
                    hard_timeout: body.get_u16(),
                    priority: body.get_u16(),
                    buffer_id: body.get_u32(),
                    out_port: body.get_u16(),
                    flags: body.get_u16(),
                    actions: body,
                })
            }
            OfType::PortMod => OfPayload::PortMod(body),
            OfType::StatsRequest => {
                if body.remaining() < 4 {
                    return Err(protocol_error!("truncated stats request"));
                }
                let stats_type = body.get_u16();
                let flags = body.get_u16();
                OfPayload::StatsRequest(StatsRequest {
                    stats_type,
                    flags,
                    body,
                })
            }
            OfType::StatsReply => {
                if body.remaining() < 4 {
                    return Err(protocol_error!("truncated stats reply"));
                }
                let stats_type = body.get_u16();
                let flags = body.get_u16();
                let reply_body = if stats_type == OFPST_DESC {
                    StatsReplyBody::Desc(DescriptionStats::decode(&mut body)?)
                } else {
                    StatsReplyBody::Raw(body)
                };
                OfPayload::StatsReply(StatsReply {
                    stats_type,
                    flags,
                    body: reply_body,
                })
            }
            OfType::BarrierRequest => OfPayload::BarrierRequest,
            OfType::BarrierReply => OfPayload::BarrierReply,
            OfType::QueueGetConfigRequest => OfPayload::QueueGetConfigRequest(body),
            OfType::QueueGetConfigReply => OfPayload::QueueGetConfigReply(body),
        };
        Ok(OfMessage { xid, body: payload })
    }

    // Constructors for the messages the controller originates.

    pub fn hello(xid: u32) -> Self {
        OfMessage {
            xid,
            body: OfPayload::Hello,
        }
    }

    pub fn echo_reply(xid: u32, payload: Bytes) -> Self {
        OfMessage {
            xid,
            body: OfPayload::EchoReply(payload),
        }
    }

    pub fn features_request(xid: u32) -> Self {
        OfMessage {
            xid,
            body: OfPayload::FeaturesRequest,
        }
    }

    pub fn set_config(xid: u32, miss_send_len: u16) -> Self {
        OfMessage {
            xid,
            body: OfPayload::SetConfig(SwitchConfig {
                flags: 0,
                miss_send_len,
            }),
        }
    }

    pub fn get_config_request(xid: u32) -> Self {
        OfMessage {
            xid,
            body: OfPayload::GetConfigRequest,
        }
    }

    pub fn desc_stats_request(xid: u32) -> Self {
        OfMessage {
            xid,
            body: OfPayload::StatsRequest(StatsRequest {
                stats_type: OFPST_DESC,
                flags: 0,
                body: Bytes::new(),
            }),
        }
    }

    pub fn nicira_role_request(xid: u32, nx_role: u32) -> Self {
        OfMessage {
            xid,
            body: OfPayload::Vendor(VendorData::Nicira(NiciraMessage::RoleRequest {
                role: nx_role,
            })),
        }
    }

    pub fn flow_mod_delete_all(xid: u32) -> Self {
        OfMessage {
            xid,
            body: OfPayload::FlowMod(FlowModMsg::delete_all()),
        }
    }
}

fn fixed_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

fn take_fixed_string(buf: &mut Bytes, len: usize) -> String {
    let raw = buf.split_to(len);
    fixed_string(&raw)
}

fn put_fixed_string(dst: &mut BytesMut, value: &str, len: usize) {
    let bytes = value.as_bytes();
    let copy = bytes.len().min(len);
    dst.put_slice(&bytes[..copy]);
    dst.put_bytes(0, len - copy);
}

/// Header length sanity bound used by the framing layer.
pub(crate) fn minimum_length_for(msg_type: OfType) -> usize {
    match msg_type {
        OfType::Error => OFP_HEADER_LEN + 4,
        OfType::Vendor => OFP_HEADER_LEN + 4,
        OfType::FeaturesReply => OFP_HEADER_LEN + 24,
        OfType::GetConfigReply | OfType::SetConfig => OFP_HEADER_LEN + 4,
        OfType::PacketIn => OFP_HEADER_LEN + 10,
        OfType::PortStatus => OFP_HEADER_LEN + 8 + PHY_PORT_LEN,
        OfType::FlowMod => OFP_HEADER_LEN + 64,
        OfType::StatsRequest | OfType::StatsReply => OFP_HEADER_LEN + 4,
        _ => OFP_HEADER_LEN,
    }
}
