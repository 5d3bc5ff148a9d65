use mavlink::common::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
    PARAM_REQUEST_LIST_DATA, PARAM_REQUEST_READ_DATA, PARAM_SET_DATA, PARAM_VALUE_DATA,
};
use mavlink::MavHeader;

use crate::core::{Error, ParamType, ParamValue, Result, PARAM_NAME_LEN, validate_param_name};

/// Index the vehicle reports for values outside a list transfer
pub const INDEX_UNLISTED: u16 = u16::MAX;

/// Sender identity carried in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub system_id: u8,
    pub component_id: u8,
}

impl Endpoint {
    pub fn new(system_id: u8, component_id: u8) -> Self {
        Endpoint { system_id, component_id }
    }
}

impl Default for Endpoint {
    /// The autopilot of system 1, the usual target before a heartbeat is seen
    fn default() -> Self {
        Endpoint::new(1, 1)
    }
}

impl From<&MavHeader> for Endpoint {
    fn from(header: &MavHeader) -> Self {
        Endpoint::new(header.system_id, header.component_id)
    }
}

/// A decoded parameter-subprotocol packet
///
/// PARAM_VALUE doubles as the acknowledgement of a PARAM_SET; there is no
/// separate ack packet.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPacket {
    Heartbeat {
        source: Endpoint,
        mav_type: MavType,
        autopilot: MavAutopilot,
    },
    ParamValue {
        name: String,
        value: ParamValue,
        param_type: ParamType,
        index: u16,
        count: u16,
    },
    ParamRequestList {
        target: Endpoint,
    },
    ParamRequestRead {
        target: Endpoint,
        name: String,
        index: i16,
    },
    ParamSet {
        target: Endpoint,
        name: String,
        value: ParamValue,
        param_type: ParamType,
    },
}

impl DecodedPacket {
    /// Picks the parameter-subprotocol messages out of a parsed frame.
    ///
    /// Returns `None` for other messages and for values this client cannot
    /// represent (64-bit types, empty names).
    pub fn from_message(header: &MavHeader, message: MavMessage) -> Option<Self> {
        match message {
            MavMessage::HEARTBEAT(data) => Some(DecodedPacket::Heartbeat {
                source: Endpoint::from(header),
                mav_type: data.mavtype,
                autopilot: data.autopilot,
            }),
            MavMessage::PARAM_REQUEST_LIST(data) => Some(DecodedPacket::ParamRequestList {
                target: Endpoint::new(data.target_system, data.target_component),
            }),
            MavMessage::PARAM_REQUEST_READ(data) => Some(DecodedPacket::ParamRequestRead {
                target: Endpoint::new(data.target_system, data.target_component),
                // Empty when the request is by index
                name: decode_name(&data.param_id).unwrap_or_default(),
                index: data.param_index,
            }),
            MavMessage::PARAM_VALUE(data) => {
                let param_type = ParamType::from_mav(data.param_type)?;
                Some(DecodedPacket::ParamValue {
                    name: decode_name(&data.param_id)?,
                    value: decode_value(data.param_value.to_le_bytes(), param_type),
                    param_type,
                    index: data.param_index,
                    count: data.param_count,
                })
            }
            MavMessage::PARAM_SET(data) => {
                let param_type = ParamType::from_mav(data.param_type)?;
                Some(DecodedPacket::ParamSet {
                    target: Endpoint::new(data.target_system, data.target_component),
                    name: decode_name(&data.param_id)?,
                    value: decode_value(data.param_value.to_le_bytes(), param_type),
                    param_type,
                })
            }
            _ => None,
        }
    }
}

/// Outbound message, encoded by the frame codec
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Heartbeat {
        mav_type: MavType,
        autopilot: MavAutopilot,
    },
    ParamRequestList {
        target: Endpoint,
    },
    ParamRequestRead {
        target: Endpoint,
        name: String,
    },
    ParamSet {
        target: Endpoint,
        name: String,
        value: ParamValue,
        param_type: ParamType,
    },
    ParamValue {
        name: String,
        value: ParamValue,
        param_type: ParamType,
        index: u16,
        count: u16,
    },
}

impl Outbound {
    /// Builds the MAVLink message, validating names and value ranges
    pub fn to_message(&self) -> Result<MavMessage> {
        let message = match self {
            Outbound::Heartbeat { mav_type, autopilot } => MavMessage::HEARTBEAT(HEARTBEAT_DATA {
                custom_mode: 0,
                mavtype: *mav_type,
                autopilot: *autopilot,
                base_mode: MavModeFlag::empty(),
                system_status: MavState::MAV_STATE_ACTIVE,
                mavlink_version: 3,
            }),
            Outbound::ParamRequestList { target } => {
                MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
                    target_system: target.system_id,
                    target_component: target.component_id,
                })
            }
            Outbound::ParamRequestRead { target, name } => {
                MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
                    // -1 selects by name
                    param_index: -1,
                    target_system: target.system_id,
                    target_component: target.component_id,
                    param_id: encode_name(name)?,
                })
            }
            Outbound::ParamSet { target, name, value, param_type } => {
                MavMessage::PARAM_SET(PARAM_SET_DATA {
                    param_value: f32::from_le_bytes(encode_value(*value, *param_type)?),
                    target_system: target.system_id,
                    target_component: target.component_id,
                    param_id: encode_name(name)?,
                    param_type: (*param_type).into(),
                })
            }
            Outbound::ParamValue { name, value, param_type, index, count } => {
                MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
                    param_value: f32::from_le_bytes(encode_value(*value, *param_type)?),
                    param_count: *count,
                    param_index: *index,
                    param_id: encode_name(name)?,
                    param_type: (*param_type).into(),
                })
            }
        };
        Ok(message)
    }
}

/// Null-pads a name into the 16-byte param_id field
fn encode_name(name: &str) -> Result<[u8; PARAM_NAME_LEN]> {
    validate_param_name(name)?;
    let mut field = [0u8; PARAM_NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    Ok(field)
}

/// Reads a param_id field; it is not null-terminated when the name uses all 16 bytes
fn decode_name(field: &[u8]) -> Option<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let name = std::str::from_utf8(&field[..end]).ok()?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Packs a value into the 4-byte float field.
///
/// Integer types are stored byte-wise (little-endian, zero-padded), REAL32 is
/// the IEEE-754 float itself.
pub fn encode_value(value: ParamValue, param_type: ParamType) -> Result<[u8; 4]> {
    let value = value.coerce(param_type).ok_or_else(|| {
        Error::invalid_request(format!("value {} does not fit {:?}", value, param_type))
    })?;

    let bytes = match (value, param_type) {
        (ParamValue::Float(f), _) => f.to_le_bytes(),
        (ParamValue::Int(v), ParamType::Uint8) => [v as u8, 0, 0, 0],
        (ParamValue::Int(v), ParamType::Int8) => [v as i8 as u8, 0, 0, 0],
        (ParamValue::Int(v), ParamType::Uint16) => {
            let b = (v as u16).to_le_bytes();
            [b[0], b[1], 0, 0]
        }
        (ParamValue::Int(v), ParamType::Int16) => {
            let b = (v as i16).to_le_bytes();
            [b[0], b[1], 0, 0]
        }
        (ParamValue::Int(v), ParamType::Uint32) => (v as u32).to_le_bytes(),
        (ParamValue::Int(v), _) => (v as i32).to_le_bytes(),
    };
    Ok(bytes)
}

/// Inverse of [`encode_value`]
pub fn decode_value(bytes: [u8; 4], param_type: ParamType) -> ParamValue {
    match param_type {
        ParamType::Real32 => ParamValue::Float(f32::from_le_bytes(bytes)),
        ParamType::Uint8 => ParamValue::Int(bytes[0] as i64),
        ParamType::Int8 => ParamValue::Int(bytes[0] as i8 as i64),
        ParamType::Uint16 => ParamValue::Int(u16::from_le_bytes([bytes[0], bytes[1]]) as i64),
        ParamType::Int16 => ParamValue::Int(i16::from_le_bytes([bytes[0], bytes[1]]) as i64),
        ParamType::Uint32 => ParamValue::Int(u32::from_le_bytes(bytes) as i64),
        ParamType::Int32 => ParamValue::Int(i32::from_le_bytes(bytes) as i64),
    }
}
