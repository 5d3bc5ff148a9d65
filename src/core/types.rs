use std::fmt;
use std::time::Duration;
use chrono::{DateTime, Utc};
use mavlink::common::MavParamType;

use serde::{Serialize, Deserialize};

use super::error::ErrorKind;

/// Wire type tag of a parameter (MAV_PARAM_TYPE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Real32,
}

impl From<ParamType> for MavParamType {
    fn from(param_type: ParamType) -> Self {
        match param_type {
            ParamType::Uint8 => MavParamType::MAV_PARAM_TYPE_UINT8,
            ParamType::Int8 => MavParamType::MAV_PARAM_TYPE_INT8,
            ParamType::Uint16 => MavParamType::MAV_PARAM_TYPE_UINT16,
            ParamType::Int16 => MavParamType::MAV_PARAM_TYPE_INT16,
            ParamType::Uint32 => MavParamType::MAV_PARAM_TYPE_UINT32,
            ParamType::Int32 => MavParamType::MAV_PARAM_TYPE_INT32,
            ParamType::Real32 => MavParamType::MAV_PARAM_TYPE_REAL32,
        }
    }
}

impl ParamType {
    /// Maps a wire type. 64-bit types do not fit the float field and are not
    /// supported.
    pub fn from_mav(param_type: MavParamType) -> Option<Self> {
        match param_type {
            MavParamType::MAV_PARAM_TYPE_UINT8 => Some(ParamType::Uint8),
            MavParamType::MAV_PARAM_TYPE_INT8 => Some(ParamType::Int8),
            MavParamType::MAV_PARAM_TYPE_UINT16 => Some(ParamType::Uint16),
            MavParamType::MAV_PARAM_TYPE_INT16 => Some(ParamType::Int16),
            MavParamType::MAV_PARAM_TYPE_UINT32 => Some(ParamType::Uint32),
            MavParamType::MAV_PARAM_TYPE_INT32 => Some(ParamType::Int32),
            MavParamType::MAV_PARAM_TYPE_REAL32 => Some(ParamType::Real32),
            _ => None,
        }
    }

    /// Whether values of this type are integers
    pub fn is_integer(self) -> bool {
        !matches!(self, ParamType::Real32)
    }

    fn int_range(self) -> Option<(i64, i64)> {
        match self {
            ParamType::Uint8 => Some((u8::MIN as i64, u8::MAX as i64)),
            ParamType::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            ParamType::Uint16 => Some((u16::MIN as i64, u16::MAX as i64)),
            ParamType::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            ParamType::Uint32 => Some((u32::MIN as i64, u32::MAX as i64)),
            ParamType::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            ParamType::Real32 => None,
        }
    }
}

/// Parameter value as stored on the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Any of the 8/16/32-bit integer types
    Int(i64),
    /// REAL32
    Float(f32),
}

impl ParamValue {
    /// The type a value maps to when the vehicle's declared type is unknown
    pub fn natural_type(&self) -> ParamType {
        match self {
            ParamValue::Int(_) => ParamType::Int32,
            ParamValue::Float(_) => ParamType::Real32,
        }
    }

    /// Converts the value into the representation of `ty`, returning `None` when
    /// it cannot be represented (out of range, fractional, or not finite).
    pub fn coerce(self, ty: ParamType) -> Option<ParamValue> {
        match (self, ty.int_range()) {
            (ParamValue::Int(v), Some((min, max))) => {
                (min..=max).contains(&v).then_some(ParamValue::Int(v))
            }
            (ParamValue::Float(f), Some((min, max))) => {
                if !f.is_finite() || f.fract() != 0.0 {
                    return None;
                }
                let v = f as i64;
                (min..=max).contains(&v).then_some(ParamValue::Int(v))
            }
            (ParamValue::Int(v), None) => Some(ParamValue::Float(v as f32)),
            (ParamValue::Float(f), None) => f.is_finite().then_some(ParamValue::Float(f)),
        }
    }

    /// Value as f64, for display and loose comparisons
    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Int(v) => *v as f64,
            ParamValue::Float(f) => *f as f64,
        }
    }

    /// Attribute-equality check used when verifying a set.
    ///
    /// Integers must match exactly. Floats match within `increment` when one is
    /// declared, otherwise they must be bit-for-bit equal as f32.
    pub fn matches(&self, echoed: &ParamValue, increment: Option<f32>) -> bool {
        match (self, echoed) {
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (ParamValue::Float(a), ParamValue::Float(b)) => match increment {
                Some(step) if step > 0.0 => (a - b).abs() <= step,
                _ => a == b,
            },
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v as f32)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Last-known state of one vehicle parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    /// Parameter name, case-sensitive, at most 16 bytes
    pub name: String,
    /// Current value
    pub value: ParamValue,
    /// Declared wire type
    pub param_type: ParamType,
    /// Index reported by the vehicle (65535 for out-of-list echoes)
    pub index: u16,
    /// Total parameter count reported by the vehicle
    pub count: u16,
    /// When the value last arrived
    pub updated_at: DateTime<Utc>,
}

/// Kind of parameter operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Get,
    Set,
    RefreshAll,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Get => f.write_str("get"),
            OperationKind::Set => f.write_str("set"),
            OperationKind::RefreshAll => f.write_str("refresh"),
        }
    }
}

/// Outcome of a parameter operation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub kind: OperationKind,
    /// Target parameter; absent for RefreshAll
    pub name: Option<String>,
    /// Value read, or value echoed by the vehicle after a set
    pub value: Option<ParamValue>,
    pub error: Option<ErrorKind>,
    /// Human-readable detail for failures
    pub message: Option<String>,
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub elapsed: Duration,
}

impl OperationResult {
    /// Builds a successful result
    pub fn succeeded(
        kind: OperationKind,
        name: Option<String>,
        value: Option<ParamValue>,
        elapsed: Duration,
    ) -> Self {
        OperationResult {
            success: true,
            kind,
            name,
            value,
            error: None,
            message: None,
            elapsed,
        }
    }

    /// Builds a failed result
    pub fn failed(
        kind: OperationKind,
        name: Option<String>,
        error: ErrorKind,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        OperationResult {
            success: false,
            kind,
            name,
            value: None,
            error: Some(error),
            message: Some(message.into()),
            elapsed,
        }
    }

    /// Attaches the echoed value to a result
    pub fn with_value(mut self, value: ParamValue) -> Self {
        self.value = Some(value);
        self
    }
}
