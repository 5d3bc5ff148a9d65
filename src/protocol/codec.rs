use std::io::Cursor;

use bytes::{Buf, BytesMut};
use mavlink::common::{MavAutopilot, MavMessage, MavType};
use mavlink::peek_reader::PeekReader;
use mavlink::MavHeader;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::{Error, ParamType, ParamValue, Result};
use super::message::{DecodedPacket, Endpoint, Outbound};
use super::MAX_FRAME_SIZE;

/// MAVLink 1 start byte
pub const STX_V1: u8 = 0xFE;

/// MAVLink 2 start byte
pub const STX_V2: u8 = 0xFD;

const HEADER_V1: usize = 6;
const HEADER_V2: usize = 10;
const CHECKSUM_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const INCOMPAT_SIGNED: u8 = 0x01;

/// Header fields we stamp on outgoing frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u8,
    pub source: Endpoint,
}

impl From<FrameHeader> for MavHeader {
    fn from(header: FrameHeader) -> Self {
        MavHeader {
            system_id: header.source.system_id,
            component_id: header.source.component_id,
            sequence: header.sequence,
        }
    }
}

/// Result of looking at the bytes after a start marker
enum FrameParse {
    /// More bytes are needed
    Incomplete,
    /// Not a valid frame; the marker byte must be skipped
    Invalid,
    /// A complete frame of `len` bytes, which may carry a packet we ignore
    Frame { len: usize, packet: Option<DecodedPacket> },
}

/// Decodes at most one frame from the front of `buffer`.
///
/// Returns how many bytes the caller may drop and the packet, if any. A zero
/// count means the buffer holds only the start of a frame. Garbage before a
/// start marker is consumed; a frame with a bad checksum consumes only its
/// marker byte so the next call rescans from the following byte.
pub fn decode(buffer: &[u8]) -> (usize, Option<DecodedPacket>) {
    let start = match buffer.iter().position(|&b| b == STX_V1 || b == STX_V2) {
        Some(start) => start,
        None => return (buffer.len(), None),
    };

    match parse_frame(&buffer[start..]) {
        FrameParse::Incomplete => (start, None),
        FrameParse::Invalid => {
            trace!(offset = start, "dropping invalid frame, resyncing");
            (start + 1, None)
        }
        FrameParse::Frame { len, packet } => (start + len, packet),
    }
}

/// Sizes the frame from its header, then hands exactly those bytes to the
/// mavlink reader for checksum and payload parsing
fn parse_frame(frame: &[u8]) -> FrameParse {
    let is_v2 = frame[0] == STX_V2;
    let header_len = if is_v2 { HEADER_V2 } else { HEADER_V1 };
    if frame.len() < header_len {
        return FrameParse::Incomplete;
    }

    let signature_len = if is_v2 {
        let incompat = frame[2];
        if incompat & !INCOMPAT_SIGNED != 0 {
            return FrameParse::Invalid;
        }
        if incompat & INCOMPAT_SIGNED != 0 { SIGNATURE_LEN } else { 0 }
    } else {
        0
    };

    let total_len = header_len + frame[1] as usize + CHECKSUM_LEN + signature_len;
    if frame.len() < total_len {
        return FrameParse::Incomplete;
    }

    let mut reader = PeekReader::new(Cursor::new(&frame[..total_len]));
    let parsed = if is_v2 {
        mavlink::read_v2_msg::<MavMessage, _>(&mut reader)
    } else {
        mavlink::read_v1_msg::<MavMessage, _>(&mut reader)
    };

    match parsed {
        Ok((header, message)) => FrameParse::Frame {
            len: total_len,
            packet: DecodedPacket::from_message(&header, message),
        },
        // Bad checksum, or a message outside the common dialect
        Err(_) => FrameParse::Invalid,
    }
}

/// Encodes a message as a MAVLink 2 frame
pub fn encode_frame(header: FrameHeader, message: &Outbound) -> Result<Vec<u8>> {
    let message = message.to_message()?;
    let mut buf = Cursor::new(Vec::with_capacity(MAX_FRAME_SIZE));
    mavlink::write_v2_msg(&mut buf, header.into(), &message)
        .map_err(|e| Error::protocol(format!("failed to write frame: {:?}", e)))?;
    Ok(buf.into_inner())
}

/// PARAM_REQUEST_LIST frame
pub fn encode_param_request_list(header: FrameHeader, target: Endpoint) -> Vec<u8> {
    // Carries no name or value, so it cannot fail to encode
    encode_frame(header, &Outbound::ParamRequestList { target }).unwrap_or_default()
}

/// PARAM_REQUEST_READ frame addressed by name
pub fn encode_param_request_single(header: FrameHeader, target: Endpoint, name: &str) -> Result<Vec<u8>> {
    encode_frame(header, &Outbound::ParamRequestRead { target, name: name.to_string() })
}

/// PARAM_SET frame
pub fn encode_param_set(
    header: FrameHeader,
    target: Endpoint,
    name: &str,
    value: ParamValue,
    param_type: ParamType,
) -> Result<Vec<u8>> {
    encode_frame(header, &Outbound::ParamSet {
        target,
        name: name.to_string(),
        value,
        param_type,
    })
}

/// PARAM_VALUE frame, as sent by a vehicle
pub fn encode_param_value(
    header: FrameHeader,
    name: &str,
    value: ParamValue,
    param_type: ParamType,
    index: u16,
    count: u16,
) -> Result<Vec<u8>> {
    encode_frame(header, &Outbound::ParamValue {
        name: name.to_string(),
        value,
        param_type,
        index,
        count,
    })
}

/// HEARTBEAT frame
pub fn encode_heartbeat(header: FrameHeader, mav_type: MavType, autopilot: MavAutopilot) -> Vec<u8> {
    encode_frame(header, &Outbound::Heartbeat { mav_type, autopilot }).unwrap_or_default()
}

/// Stream codec for a MAVLink byte stream
///
/// Decoding is stateless; encoding stamps our endpoint and a rolling sequence
/// number on every frame.
#[derive(Debug, Clone)]
pub struct MavlinkCodec {
    source: Endpoint,
    sequence: u8,
}

impl MavlinkCodec {
    /// Creates a codec that sends as `source`
    pub fn new(source: Endpoint) -> Self {
        MavlinkCodec { source, sequence: 0 }
    }

    fn next_header(&mut self) -> FrameHeader {
        let header = FrameHeader { sequence: self.sequence, source: self.source };
        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

impl Decoder for MavlinkCodec {
    type Item = DecodedPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let (consumed, packet) = decode(&src[..]);
            if consumed == 0 {
                // Need more data to complete the frame
                return Ok(None);
            }
            src.advance(consumed);
            if packet.is_some() {
                return Ok(packet);
            }
        }
    }
}

impl Encoder<Outbound> for MavlinkCodec {
    type Error = Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<()> {
        let frame = encode_frame(self.next_header(), &item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::INDEX_UNLISTED;
    use mavlink::common::{HEARTBEAT_DATA, MavModeFlag, MavState, SYSTEM_TIME_DATA};

    fn vehicle() -> FrameHeader {
        FrameHeader { sequence: 7, source: Endpoint::new(1, 1) }
    }

    fn gcs() -> FrameHeader {
        FrameHeader { sequence: 0, source: Endpoint::new(255, 190) }
    }

    /// MAVLink 1 heartbeat, as older autopilots send
    fn heartbeat_v1() -> Vec<u8> {
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        });
        let mut buf = Cursor::new(Vec::new());
        mavlink::write_v1_msg(&mut buf, vehicle().into(), &msg).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_set_echo_roundtrip() {
        let frame = encode_param_set(gcs(), Endpoint::new(1, 1), "MPC_XY_VEL_MAX", ParamValue::Float(12.5), ParamType::Real32).unwrap();
        assert_eq!(frame[0], STX_V2);
        let (consumed, packet) = decode(&frame);
        assert_eq!(consumed, frame.len());

        let (name, value, param_type) = match packet {
            Some(DecodedPacket::ParamSet { name, value, param_type, target }) => {
                assert_eq!(target, Endpoint::new(1, 1));
                (name, value, param_type)
            }
            other => panic!("Expected ParamSet, got {:?}", other),
        };

        // The vehicle echoes the set back as a PARAM_VALUE
        let echo = encode_param_value(vehicle(), &name, value, param_type, INDEX_UNLISTED, 900).unwrap();
        match decode(&echo) {
            (n, Some(DecodedPacket::ParamValue { name, value, param_type, index, count })) => {
                assert_eq!(n, echo.len());
                assert_eq!(name, "MPC_XY_VEL_MAX");
                assert_eq!(value, ParamValue::Float(12.5));
                assert_eq!(param_type, ParamType::Real32);
                assert_eq!((index, count), (INDEX_UNLISTED, 900));
            }
            other => panic!("Expected ParamValue, got {:?}", other),
        }
    }

    #[test]
    fn test_v1_heartbeat() {
        let frame = heartbeat_v1();
        assert_eq!(frame[0], STX_V1);
        match decode(&frame) {
            (n, Some(DecodedPacket::Heartbeat { source, mav_type, autopilot })) => {
                assert_eq!(n, frame.len());
                assert_eq!(source, Endpoint::new(1, 1));
                assert_eq!(mav_type, MavType::MAV_TYPE_QUADROTOR);
                assert_eq!(autopilot, MavAutopilot::MAV_AUTOPILOT_PX4);
            }
            other => panic!("Expected Heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_component_target() {
        // Request list to system 1 component 0; v2 may drop the trailing zero
        let frame = encode_param_request_list(gcs(), Endpoint::new(1, 0));
        match decode(&frame) {
            (n, Some(DecodedPacket::ParamRequestList { target })) => {
                assert_eq!(n, frame.len());
                assert_eq!(target, Endpoint::new(1, 0));
            }
            other => panic!("Expected ParamRequestList, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_waits() {
        let frame = encode_param_request_single(gcs(), Endpoint::new(1, 1), "SYS_AUTOSTART").unwrap();
        for cut in 0..frame.len() {
            assert_eq!(decode(&frame[..cut]).0, 0, "cut at {}", cut);
        }
    }

    #[test]
    fn test_garbage_is_skipped() {
        let mut buf = vec![0x00, 0x42, 0x13];
        buf.extend_from_slice(&heartbeat_v1());

        let (consumed, packet) = decode(&buf);
        assert_eq!(consumed, buf.len());
        assert!(matches!(packet, Some(DecodedPacket::Heartbeat { .. })));

        let (consumed, packet) = decode(&[0x01, 0x02, 0x03]);
        assert_eq!(consumed, 3);
        assert!(packet.is_none());
    }

    #[test]
    fn test_bad_checksum_resyncs() {
        let mut corrupt = heartbeat_v1();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x55;
        let good = encode_heartbeat(vehicle(), MavType::MAV_TYPE_QUADROTOR, MavAutopilot::MAV_AUTOPILOT_PX4);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&corrupt);
        buf.extend_from_slice(&good);

        // Bad frame only consumes its marker
        assert_eq!(decode(&buf), (1, None));

        let mut codec = MavlinkCodec::new(Endpoint::new(255, 190));
        let packet = codec.decode(&mut buf).unwrap();
        assert!(matches!(packet, Some(DecodedPacket::Heartbeat { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_other_message_skipped_whole() {
        let msg = MavMessage::SYSTEM_TIME(SYSTEM_TIME_DATA { time_unix_usec: 1_700_000_000_000_000, time_boot_ms: 5000 });
        let mut buf = Cursor::new(Vec::new());
        mavlink::write_v2_msg(&mut buf, vehicle().into(), &msg).unwrap();
        let mut frame = buf.into_inner();
        let len = frame.len();
        frame.extend_from_slice(&heartbeat_v1());

        assert_eq!(decode(&frame), (len, None));
        assert!(matches!(decode(&frame[len..]).1, Some(DecodedPacket::Heartbeat { .. })));
    }

    #[test]
    fn test_signed_frame_waits_for_signature() {
        let mut frame = encode_heartbeat(vehicle(), MavType::MAV_TYPE_QUADROTOR, MavAutopilot::MAV_AUTOPILOT_PX4);
        frame[2] = INCOMPAT_SIGNED;
        assert_eq!(decode(&frame), (0, None));

        // The flag is covered by the checksum, so the completed frame is rejected
        frame.extend_from_slice(&[0u8; SIGNATURE_LEN]);
        assert_eq!(decode(&frame), (1, None));
    }

    #[test]
    fn test_unknown_incompat_flags_rejected() {
        let mut frame = encode_heartbeat(vehicle(), MavType::MAV_TYPE_QUADROTOR, MavAutopilot::MAV_AUTOPILOT_PX4);
        frame[2] = 0x02;
        assert_eq!(decode(&frame), (1, None));
    }

    #[test]
    fn test_codec_sequence_and_stream() {
        let mut codec = MavlinkCodec::new(Endpoint::new(255, 190));
        let mut wire = BytesMut::new();
        codec.encode(Outbound::ParamRequestList { target: Endpoint::new(1, 1) }, &mut wire).unwrap();
        let first_len = wire.len();
        codec.encode(Outbound::ParamRequestRead { target: Endpoint::new(1, 1), name: "BAT1_N_CELLS".into() }, &mut wire).unwrap();

        assert_eq!(wire[4], 0);
        assert_eq!(wire[first_len + 4], 1);

        let mut received = Vec::new();
        // Feed the stream in small fragments
        let mut rx = BytesMut::new();
        for chunk in wire.chunks(5) {
            rx.extend_from_slice(chunk);
            while let Some(packet) = codec.decode(&mut rx).unwrap() {
                received.push(packet);
            }
        }

        assert_eq!(received.len(), 2);
        assert!(matches!(&received[1], DecodedPacket::ParamRequestRead { name, .. } if name == "BAT1_N_CELLS"));
    }
}
