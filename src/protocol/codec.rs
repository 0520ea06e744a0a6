//! Length-delimited framing for OpenFlow 1.0 messages.
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{minimum_length_for, OfMessage, OfType};
use super::OFP_HEADER_LEN;
use crate::error::KestrelError;

/// Codec translating between raw TCP bytes and [`OfMessage`] frames.
///
/// OpenFlow carries its own length in the header, so framing is a peek at
/// bytes 2..4 followed by a split once the frame is complete.
#[derive(Debug, Default)]
pub struct OfCodec;

impl Decoder for OfCodec {
    type Item = OfMessage;
    type Error = KestrelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<OfMessage>, KestrelError> {
        if src.len() < OFP_HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if length < OFP_HEADER_LEN {
            return Err(protocol_error!(
                "frame length {} below OpenFlow header size",
                length
            ));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length).freeze();
        let _version = frame.get_u8();
        let type_byte = frame.get_u8();
        let _length = frame.get_u16();
        let xid = frame.get_u32();

        let msg_type = OfType::from_u8(type_byte)
            .ok_or_else(|| protocol_error!("unknown OpenFlow message type {}", type_byte))?;
        if length < minimum_length_for(msg_type) {
            return Err(protocol_error!(
                "frame length {} too short for {}",
                length,
                msg_type
            ));
        }

        OfMessage::decode(msg_type, xid, frame).map(Some)
    }
}

impl Encoder<OfMessage> for OfCodec {
    type Error = KestrelError;

    fn encode(&mut self, msg: OfMessage, dst: &mut BytesMut) -> Result<(), KestrelError> {
        msg.encode(dst);
        Ok(())
    }
}
