//! OpenFlow 1.0 wire model and framing.
//!
//! The controller core treats this module as its message factory: channel
//! handlers decode frames into [`message::OfMessage`] values and encode
//! replies through the same types. Only the message families the core
//! exchanges during handshake, role coordination, and dispatch are modeled
//! with full structure; everything else round-trips as raw bytes.

pub mod codec;
pub mod message;
pub mod nicira;

pub use codec::OfCodec;
pub use message::{
    DescriptionStats, ErrorMsg, FeaturesReply, FlowModMsg, OfMessage, OfPayload, OfType, PacketIn,
    PhyPort, PortStatus, StatsReply, StatsReplyBody, StatsRequest, SwitchConfig, VendorData,
    OFPBRC_BAD_SUBTYPE, OFPBRC_BAD_VENDOR, OFPBRC_EPERM, OFPET_BAD_REQUEST, OFPST_DESC,
};
pub use nicira::NiciraMessage;

/// OpenFlow protocol version spoken by this controller
pub const OFP_VERSION: u8 = 0x01;

/// Fixed size of the OpenFlow header
pub const OFP_HEADER_LEN: usize = 8;
