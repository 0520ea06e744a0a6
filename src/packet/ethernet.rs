//! Ethernet frame header parsing.
//!
//! PACKET_IN payloads are decoded once per message and stashed in the
//! dispatch context so listeners share a single parse.
use bytes::{Buf, Bytes};

use crate::error::Result;

pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_LLDP: u16 = 0x88cc;

/// Untagged VLAN marker, matching the OpenFlow convention
pub const VLAN_UNTAGGED: u16 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A parsed Ethernet II header plus the remaining payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Ethernet {
    pub destination: MacAddress,
    pub source: MacAddress,
    pub vlan_id: u16,
    pub vlan_priority: u8,
    pub ethertype: u16,
    pub payload: Bytes,
}

impl Ethernet {
    /// Parse an Ethernet header, unwrapping a single 802.1Q tag if present.
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.remaining() < 14 {
            return Err(protocol_error!(
                "ethernet frame too short: {} bytes",
                data.remaining()
            ));
        }

        let mut destination = [0u8; 6];
        let mut source = [0u8; 6];
        data.copy_to_slice(&mut destination);
        data.copy_to_slice(&mut source);
        let mut ethertype = data.get_u16();

        let mut vlan_id = VLAN_UNTAGGED;
        let mut vlan_priority = 0;
        if ethertype == ETHERTYPE_VLAN {
            if data.remaining() < 4 {
                return Err(protocol_error!("truncated 802.1Q tag"));
            }
            let tci = data.get_u16();
            vlan_id = tci & 0x0fff;
            vlan_priority = (tci >> 13) as u8;
            ethertype = data.get_u16();
        }

        Ok(Ethernet {
            destination: MacAddress(destination),
            source: MacAddress(source),
            vlan_id,
            vlan_priority,
            ethertype,
            payload: data,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }
}
