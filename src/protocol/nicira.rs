//! Nicira vendor extension payloads.
//!
//! The NX role request/reply pair predates the OpenFlow 1.2 role machinery
//! and is the only vendor extension the core itself speaks.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Result;

/// Nicira vendor identifier carried in OFPT_VENDOR messages
pub const NX_VENDOR_ID: u32 = 0x0000_2320;

/// Vendor message subtypes
pub const NXT_ROLE_REQUEST: u32 = 10;
pub const NXT_ROLE_REPLY: u32 = 11;

/// Role values carried in NX role request/reply bodies
pub const NX_ROLE_OTHER: u32 = 0;
pub const NX_ROLE_MASTER: u32 = 1;
pub const NX_ROLE_SLAVE: u32 = 2;

/// Decoded Nicira vendor payload (everything after the vendor id)
#[derive(Clone, Debug, PartialEq)]
pub enum NiciraMessage {
    RoleRequest { role: u32 },
    RoleReply { role: u32 },
    Other { subtype: u32, data: Bytes },
}

impl NiciraMessage {
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.remaining() < 4 {
            return Err(protocol_error!("truncated Nicira vendor payload"));
        }
        let subtype = data.get_u32();
        match subtype {
            NXT_ROLE_REQUEST | NXT_ROLE_REPLY => {
                if data.remaining() < 4 {
                    return Err(protocol_error!(
                        "truncated NX role message (subtype {})",
                        subtype
                    ));
                }
                let role = data.get_u32();
                if subtype == NXT_ROLE_REQUEST {
                    Ok(NiciraMessage::RoleRequest { role })
                } else {
                    Ok(NiciraMessage::RoleReply { role })
                }
            }
            _ => Ok(NiciraMessage::Other { subtype, data }),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            NiciraMessage::RoleRequest { role } => {
                dst.put_u32(NXT_ROLE_REQUEST);
                dst.put_u32(*role);
            }
            NiciraMessage::RoleReply { role } => {
                dst.put_u32(NXT_ROLE_REPLY);
                dst.put_u32(*role);
            }
            NiciraMessage::Other { subtype, data } => {
                dst.put_u32(*subtype);
                dst.put_slice(data);
            }
        }
    }
}
