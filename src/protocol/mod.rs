//! Protocol implementation module
//!
//! This module defines the MAVLink parameter-subprotocol messages, the frame
//! codec, and the link state machine.

pub mod codec;
pub mod message;
pub mod state;

pub use self::codec::{
    decode, encode_heartbeat, encode_param_request_list, encode_param_request_single,
    encode_param_set, encode_param_value, FrameHeader, MavlinkCodec,
};
pub use self::message::{DecodedPacket, Endpoint, Outbound};
pub use self::state::{ConnectionEvent, LinkState, LinkStateMachine};

/// Largest MAVLink 2 frame (signed, full payload)
pub const MAX_FRAME_SIZE: usize = 280;

/// Our default system id (ground station range)
pub const DEFAULT_SYSTEM_ID: u8 = 255;

/// Our default component id (MAV_COMP_ID_MISSIONPLANNER)
pub const DEFAULT_COMPONENT_ID: u8 = 190;
